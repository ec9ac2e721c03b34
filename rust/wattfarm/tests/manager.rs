// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! End-to-end manager scenarios against a synthetic machine and a
//! deterministic farm double.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, FakeMachine, MachineSpec, MockFarm, MockNode};
use wattfarm::{
    AdaptiveFarmManager, AdaptivityParameters, ConfigError, CpuFreq, Energy, Error,
    FrequencyStrategy, Governor, ManagerState, MappingStrategy, NodeSample, Topology,
    UnusedVcStrategy, VoltageTable,
};

const TICK: Duration = Duration::from_millis(50);
const PATIENCE: Duration = Duration::from_secs(10);

fn sample(load_percent: f64, tasks_count: u64) -> NodeSample {
    NodeSample {
        load_percent,
        tasks_count,
    }
}

struct Setup {
    machine: FakeMachine,
    farm: Arc<MockFarm>,
    manager: AdaptiveFarmManager,
}

fn setup(spec: MachineSpec, farm: Arc<MockFarm>, params: AdaptivityParameters) -> Setup {
    let machine = FakeMachine::build(spec);
    let manager = AdaptiveFarmManager::new(
        farm.clone(),
        Arc::new(Topology::with_root(machine.root()).unwrap()),
        Arc::new(CpuFreq::with_root(machine.root()).unwrap()),
        Arc::new(Energy::with_root(machine.root()).unwrap()),
        params,
    )
    .unwrap();
    Setup {
        machine,
        farm,
        manager,
    }
}

fn validation_error(spec: MachineSpec, params: AdaptivityParameters) -> ConfigError {
    let machine = FakeMachine::build(spec);
    let farm = MockFarm::workers_only(vec![MockNode::constant(85.0, 10)]);
    match AdaptiveFarmManager::new(
        farm,
        Arc::new(Topology::with_root(machine.root()).unwrap()),
        Arc::new(CpuFreq::with_root(machine.root()).unwrap()),
        Arc::new(Energy::with_root(machine.root()).unwrap()),
        params,
    ) {
        Err(Error::ConfigInvalid(code)) => code,
        other => panic!("expected a validation error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn deterministic_samples_produce_exact_averages() {
    let workers = vec![MockNode::constant(50.0, 20), MockNode::constant(50.0, 20)];
    let farm = MockFarm::workers_only(workers);
    let params = AdaptivityParameters {
        sampling_interval: Duration::from_millis(100),
        num_samples: 3,
        samples_to_discard: 1,
        underload_threshold_farm: 40.0,
        overload_threshold_farm: 60.0,
        ..Default::default()
    };
    let mut s = setup(
        MachineSpec {
            cores_per_package: 4,
            ..Default::default()
        },
        farm,
        params,
    );

    s.manager.start().unwrap();
    assert!(wait_until(PATIENCE, || s.manager.stats().samples >= 5));
    let stats = s.manager.stats();
    assert!((stats.average_utilization - 50.0).abs() < 1e-9);
    // 2 workers * 20 tasks / 0.1 s.
    assert!((stats.average_bandwidth - 400.0).abs() < 1e-9);
    assert_eq!(stats.reconfiguration_attempts, 0);
    s.manager.stop().unwrap();
}

// Overloaded at every worker count: exactly one reconfiguration attempt
// per window, and the farm stays at its maximum size.
#[test]
fn overload_with_no_better_configuration_logs_and_stays() {
    let workers: Vec<Arc<MockNode>> = (0..4)
        .map(|_| MockNode::scripted(vec![sample(95.0, 10); 4], None))
        .collect();
    let farm = MockFarm::workers_only(workers);
    let params = AdaptivityParameters {
        sampling_interval: Duration::from_millis(30),
        num_samples: 3,
        samples_to_discard: 1,
        ..Default::default()
    };
    let mut s = setup(
        MachineSpec {
            cores_per_package: 4,
            ..Default::default()
        },
        farm,
        params,
    );

    s.manager.start().unwrap();
    // The workers terminate after four samples, ending the loop.
    assert!(wait_until(PATIENCE, || s.manager.state()
        == ManagerState::Stopped));

    let stats = s.manager.stats();
    assert_eq!(stats.samples, 4);
    assert_eq!(stats.discarded_samples, 1);
    assert_eq!(stats.reconfiguration_attempts, 1);
    assert_eq!(stats.reconfigurations, 0);
    assert_eq!(stats.current_workers, 4);
    assert!(s.farm.run_calls.lock().unwrap().is_empty());
    s.manager.stop().unwrap();
}

// The bandwidth estimator doubles throughput when doubling the workers:
// 500 tasks/s at n = 2 predicts the required 1000 at n = 4.
#[test]
fn bandwidth_contract_scales_the_worker_count() {
    let mk_worker = |fallback: u64| {
        MockNode::scripted(vec![sample(85.0, 50); 3], Some(sample(85.0, fallback)))
    };
    let workers = vec![mk_worker(12), mk_worker(13), mk_worker(12), mk_worker(12)];
    let farm = MockFarm::workers_only(workers);
    let params = AdaptivityParameters {
        sampling_interval: TICK,
        num_samples: 2,
        samples_to_discard: 0,
        required_bandwidth: 1000.0,
        max_bandwidth_variation: 5.0,
        ..Default::default()
    };
    let mut s = setup(
        MachineSpec {
            cores_per_package: 4,
            ..Default::default()
        },
        farm,
        params,
    );

    s.manager.start().unwrap();
    assert!(wait_until(PATIENCE, || s.manager.stats().reconfigurations == 2));

    // 2000 tasks/s at n = 4 scales down to 2, then 500 tasks/s at n = 2
    // scales back up to 4.
    assert_eq!(*s.farm.run_calls.lock().unwrap(), vec![2, 4]);
    let stats = s.manager.stats();
    assert_eq!(stats.current_workers, 4);
    // Only nodes of the new configuration heard about each change.
    let w0_notes = s.farm.workers[0].notifications.lock().unwrap().clone();
    assert_eq!(w0_notes, vec![(4, 2), (2, 4)]);
    let w3_notes = s.farm.workers[3].notifications.lock().unwrap().clone();
    assert_eq!(w3_notes, vec![(2, 4)]);
    s.manager.stop().unwrap();
}

// Two domains of two cores each under the power-conservative strategy:
// among the feasible points, 2 workers at the low frequency burn the
// least n * f * V^2.
#[test]
fn power_conservative_selects_the_cheapest_feasible_point() {
    let mut table = VoltageTable::new();
    table.insert(1, 1_000_000, 0.75);
    table.insert(1, 2_000_000, 1.2);
    table.insert(2, 1_000_000, 0.8);
    table.insert(2, 2_000_000, 1.25);
    table.insert(3, 1_000_000, 0.85);
    table.insert(3, 2_000_000, 1.3);
    table.insert(4, 1_000_000, 0.9);
    table.insert(4, 2_000_000, 1.35);

    let workers: Vec<Arc<MockNode>> = (0..4).map(|_| MockNode::constant(85.0, 25)).collect();
    let farm = MockFarm::workers_only(workers);
    let params = AdaptivityParameters {
        frequency_strategy: FrequencyStrategy::PowerConservative,
        voltage_table: Some(table),
        sampling_interval: TICK,
        num_samples: 2,
        samples_to_discard: 0,
        required_bandwidth: 1000.0,
        max_bandwidth_variation: 60.0,
        ..Default::default()
    };
    let mut s = setup(
        MachineSpec {
            packages: 2,
            cores_per_package: 2,
            threads_per_core: 1,
            vcs_per_domain: 2,
            frequencies: vec![1_000_000, 2_000_000],
            ..Default::default()
        },
        farm,
        params,
    );

    s.manager.start().unwrap();
    assert!(wait_until(PATIENCE, || s.manager.stats().reconfigurations == 1));

    let stats = s.manager.stats();
    assert_eq!(stats.current_workers, 2);
    assert_eq!(stats.current_frequency, 1_000_000);
    // The surviving workers' domain runs userspace at the low step.
    assert_eq!(
        s.machine
            .read(&s.machine.cpu_file(0, "cpufreq/scaling_setspeed")),
        "1000000"
    );
    s.manager.stop().unwrap();
}

// With two workers on an eight-core machine and the off strategy, the six
// remaining cores are unplugged.
#[test]
fn unused_cores_are_turned_off() {
    let workers = vec![MockNode::constant(85.0, 10), MockNode::constant(85.0, 10)];
    let farm = MockFarm::workers_only(workers);
    let params = AdaptivityParameters {
        unused_vc_strategy: UnusedVcStrategy::Off,
        sampling_interval: TICK,
        ..Default::default()
    };
    let mut s = setup(
        MachineSpec {
            cores_per_package: 4,
            threads_per_core: 2,
            vcs_per_domain: 8,
            ..Default::default()
        },
        farm,
        params,
    );

    s.manager.start().unwrap();
    assert!(wait_until(PATIENCE, || s.manager.state()
        == ManagerState::Sampling));

    let online: Vec<String> = (0..8)
        .map(|vc| s.machine.read(&s.machine.cpu_file(vc, "online")))
        .collect();
    // Workers sit on the first virtual core of the first two physical
    // cores; everything else is off.
    assert_eq!(online.iter().filter(|v| v.as_str() == "0").count(), 6);
    assert_eq!(online[0], "1");
    assert_eq!(online[1], "1");
    s.manager.stop().unwrap();
}

// A sensitive emitter lands on a frequency domain disjoint from the
// workers', pinned to the performance governor.
#[test]
fn sensitive_emitter_gets_a_separated_domain() {
    let emitter = MockNode::constant(50.0, 0);
    let workers = vec![MockNode::constant(85.0, 10), MockNode::constant(85.0, 10)];
    let farm = MockFarm::with_emitter(emitter, workers);
    let params = AdaptivityParameters {
        frequency_strategy: FrequencyStrategy::CoresConservative,
        sensitive_emitter: true,
        sampling_interval: TICK,
        ..Default::default()
    };
    let mut s = setup(
        MachineSpec {
            packages: 2,
            cores_per_package: 2,
            threads_per_core: 1,
            vcs_per_domain: 2,
            ..Default::default()
        },
        farm,
        params,
    );

    s.manager.start().unwrap();
    assert!(wait_until(PATIENCE, || s.manager.state()
        == ManagerState::Sampling));

    // Domain 0 hosts the emitter at the performance governor; the workers
    // live on domain 1.
    assert_eq!(
        s.machine
            .read(&s.machine.cpu_file(0, "cpufreq/scaling_governor")),
        "performance"
    );
    let emitter_vc = s.farm.emitter.as_ref().unwrap().task().last_move().unwrap();
    assert!(emitter_vc < 2);
    let mut worker_vcs: Vec<u32> = s
        .farm
        .workers
        .iter()
        .map(|w| w.task().last_move().unwrap())
        .collect();
    worker_vcs.sort_unstable();
    assert_eq!(worker_vcs, vec![2, 3]);
    // The workers' own domain is driven in userspace.
    assert_eq!(
        s.machine
            .read(&s.machine.cpu_file(2, "cpufreq/scaling_governor")),
        "userspace"
    );
    s.manager.stop().unwrap();
}

// Fast reconfiguration raises the scalable domain to its top step for the
// duration of the restart, then restores the chosen frequency.
#[test]
fn fast_reconfiguration_transiently_runs_at_the_maximum() {
    let mk_worker = |fallback: u64| {
        MockNode::scripted(vec![sample(85.0, 30); 3], Some(sample(85.0, fallback)))
    };
    let workers = vec![mk_worker(12), mk_worker(13), mk_worker(12), mk_worker(12)];
    let farm = MockFarm::workers_only(workers);
    let params = AdaptivityParameters {
        frequency_strategy: FrequencyStrategy::CoresConservative,
        fast_reconfiguration: true,
        sampling_interval: TICK,
        num_samples: 2,
        samples_to_discard: 0,
        required_bandwidth: 1000.0,
        max_bandwidth_variation: 5.0,
        ..Default::default()
    };
    let machine = FakeMachine::build(MachineSpec {
        cores_per_package: 4,
        threads_per_core: 1,
        frequencies: vec![1_000_000, 1_200_000],
        governors: vec!["userspace"],
        initial_governor: "userspace",
        ..Default::default()
    });

    // Record what the domain runs at while the farm restarts.
    let setspeed = machine.dir.path().join("sys/devices/system/cpu/cpu0/cpufreq/scaling_setspeed");
    let observed: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(vec![]));
    let observed_hook = observed.clone();
    farm.set_run_hook(Box::new(move |_n| {
        let value = std::fs::read_to_string(&setspeed).unwrap().trim().to_string();
        observed_hook.lock().unwrap().push(value);
    }));

    let mut manager = AdaptiveFarmManager::new(
        farm.clone(),
        Arc::new(Topology::with_root(machine.root()).unwrap()),
        Arc::new(CpuFreq::with_root(machine.root()).unwrap()),
        Arc::new(Energy::with_root(machine.root()).unwrap()),
        params,
    )
    .unwrap();
    manager.start().unwrap();
    assert!(wait_until(PATIENCE, || manager.stats().reconfigurations == 2));
    manager.stop().unwrap();

    // (4, 1.2 GHz) -> (2, 1.0 GHz) -> (4, 1.0 GHz); both restarts observed
    // the domain at its maximum, and the chosen step came back afterwards.
    assert_eq!(*farm.run_calls.lock().unwrap(), vec![2, 4]);
    assert_eq!(*observed.lock().unwrap(), vec!["1200000", "1200000"]);
    assert_eq!(
        machine.read(&machine.cpu_file(0, "cpufreq/scaling_setspeed")),
        "1000000"
    );
}

#[test]
fn drain_uses_the_emitter_sentinel() {
    let emitter = MockNode::constant(50.0, 0);
    let mk_worker =
        || MockNode::scripted(vec![sample(85.0, 60); 3], Some(sample(85.0, 30)));
    let workers = vec![mk_worker(), mk_worker()];
    let farm = MockFarm::with_emitter(emitter, workers);
    let params = AdaptivityParameters {
        sampling_interval: TICK,
        num_samples: 2,
        samples_to_discard: 0,
        required_bandwidth: 1200.0,
        max_bandwidth_variation: 5.0,
        ..Default::default()
    };
    // 2400 tasks/s at n = 2, required 1200: scales down to one worker.
    let mut s = setup(
        MachineSpec {
            cores_per_package: 4,
            ..Default::default()
        },
        farm,
        params,
    );

    s.manager.start().unwrap();
    assert!(wait_until(PATIENCE, || s.manager.stats().reconfigurations >= 1));
    assert!(
        s.farm.emitter.as_ref().unwrap().produce_null_calls.load(std::sync::atomic::Ordering::Relaxed) >= 1
    );
    assert!(s.farm.wait_calls.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    let emitter_notes = s.farm.emitter.as_ref().unwrap().notifications.lock().unwrap().clone();
    assert!(emitter_notes.contains(&(2, 1)));
    s.manager.stop().unwrap();
}

#[test]
fn validation_rejects_each_bad_configuration() {
    let base = || MachineSpec {
        cores_per_package: 4,
        ..Default::default()
    };

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                underload_threshold_farm: 95.0,
                overload_threshold_farm: 90.0,
                ..Default::default()
            }
        ),
        ConfigError::ThresholdsInvalid
    );

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                mapping_strategy: MappingStrategy::None,
                frequency_strategy: FrequencyStrategy::Os,
                ..Default::default()
            }
        ),
        ConfigError::FreqStrategyRequiresMapping
    );

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                mapping_strategy: MappingStrategy::CacheEfficient,
                ..Default::default()
            }
        ),
        ConfigError::MappingUnsupported
    );

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                sensitive_emitter: true,
                ..Default::default()
            }
        ),
        ConfigError::SensitiveWithoutFreqStrategy
    );

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                frequency_lower_bound: Some(1_200_000),
                ..Default::default()
            }
        ),
        ConfigError::InvalidFrequencyBounds
    );

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                frequency_strategy: FrequencyStrategy::Os,
                frequency_lower_bound: Some(999),
                ..Default::default()
            }
        ),
        ConfigError::InvalidFrequencyBounds
    );

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                required_bandwidth: 100.0,
                max_bandwidth_variation: 150.0,
                ..Default::default()
            }
        ),
        ConfigError::BandwidthParamsInvalid
    );

    assert_eq!(
        validation_error(
            base(),
            AdaptivityParameters {
                frequency_strategy: FrequencyStrategy::PowerConservative,
                ..Default::default()
            }
        ),
        ConfigError::VoltageFileNeeded
    );

    assert_eq!(
        validation_error(
            MachineSpec {
                hot_pluggable: false,
                ..base()
            },
            AdaptivityParameters {
                unused_vc_strategy: UnusedVcStrategy::Off,
                ..Default::default()
            }
        ),
        ConfigError::UnusedNoOff
    );

    assert_eq!(
        validation_error(
            MachineSpec {
                governors: vec!["ondemand"],
                ..base()
            },
            AdaptivityParameters {
                inactive_vc_strategy: UnusedVcStrategy::LowestFrequency,
                ..Default::default()
            }
        ),
        ConfigError::UnusedNoFrequencies
    );

    assert_eq!(
        validation_error(
            MachineSpec {
                governors: vec!["userspace", "ondemand"],
                ..base()
            },
            AdaptivityParameters {
                frequency_strategy: FrequencyStrategy::Os,
                governor: Governor::Performance,
                ..Default::default()
            }
        ),
        ConfigError::GovernorUnsupported
    );

    assert_eq!(
        validation_error(
            MachineSpec {
                governors: vec!["ondemand"],
                ..base()
            },
            AdaptivityParameters {
                frequency_strategy: FrequencyStrategy::CoresConservative,
                ..Default::default()
            }
        ),
        ConfigError::FreqStrategyUnsupported
    );

    assert_eq!(
        validation_error(
            MachineSpec {
                governors: vec!["ondemand"],
                ..base()
            },
            AdaptivityParameters {
                frequency_strategy: FrequencyStrategy::Os,
                governor: Governor::Ondemand,
                fast_reconfiguration: true,
                ..Default::default()
            }
        ),
        ConfigError::NoFastReconf
    );

    assert_eq!(
        validation_error(
            MachineSpec {
                governors: vec!["ondemand"],
                ..base()
            },
            AdaptivityParameters {
                frequency_strategy: FrequencyStrategy::Os,
                governor: Governor::Ondemand,
                sensitive_collector: true,
                ..Default::default()
            }
        ),
        ConfigError::SensitiveMissingGovernors
    );
}

#[test]
fn validated_bounds_default_to_the_available_extremes() {
    let machine = FakeMachine::build(MachineSpec::default());
    let topology = Topology::with_root(machine.root()).unwrap();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    let mut params = AdaptivityParameters {
        frequency_strategy: FrequencyStrategy::Os,
        governor: Governor::Ondemand,
        frequency_lower_bound: Some(1_200_000),
        ..Default::default()
    };
    params.validate(&topology, &cpufreq).unwrap();
    assert_eq!(params.frequency_upper_bound, Some(2_400_000));
}
