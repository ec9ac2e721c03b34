// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod common;

use common::{FakeMachine, MachineSpec};
use wattfarm::{CpuFreq, Error, Governor};

fn two_domain_machine() -> FakeMachine {
    FakeMachine::build(MachineSpec {
        packages: 1,
        cores_per_package: 4,
        threads_per_core: 1,
        vcs_per_domain: 2,
        frequencies: vec![800_000, 1_200_000, 2_400_000],
        ..Default::default()
    })
}

#[test]
fn domains_group_related_cpus() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();

    assert_eq!(cpufreq.domains().len(), 2);
    assert_eq!(cpufreq.domains()[0].virtual_core_ids(), &[0, 1]);
    assert_eq!(cpufreq.domains()[1].virtual_core_ids(), &[2, 3]);
    assert_eq!(cpufreq.domain_for(3).unwrap().id(), 1);
    assert!(cpufreq.domain(9).is_err());

    // Complete containment: domain 0 is fully inside {0, 1, 2}, domain 1
    // is not.
    let complete = cpufreq.domains_complete_for(&[0, 1, 2]);
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].id(), 0);
}

#[test]
fn available_frequencies_are_ascending() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    let freqs = cpufreq.domains()[0].available_frequencies().unwrap();
    assert_eq!(freqs, vec![800_000, 1_200_000, 2_400_000]);
    let (lb, ub) = cpufreq.domains()[0].hardware_frequency_bounds().unwrap();
    assert_eq!((lb, ub), (800_000, 2_400_000));
    assert_eq!(
        cpufreq.domains()[0].transition_latency_ns().unwrap(),
        10_000
    );
}

#[test]
fn userspace_set_get_round_trips() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    let domain = &cpufreq.domains()[0];

    domain.set_governor(Governor::Userspace).unwrap();
    assert_eq!(domain.current_governor().unwrap(), Governor::Userspace);
    domain.set_frequency_userspace(1_200_000).unwrap();
    assert_eq!(domain.current_frequency_userspace().unwrap(), 1_200_000);

    // Not one of the available steps.
    assert!(matches!(
        domain.set_frequency_userspace(1_000_000).unwrap_err(),
        Error::InvalidArgument(_)
    ));

    // Helpers hit the extremes; the lowest helper really goes to the
    // smallest step.
    domain.set_highest_frequency_userspace().unwrap();
    assert_eq!(domain.current_frequency_userspace().unwrap(), 2_400_000);
    domain.set_lowest_frequency_userspace().unwrap();
    assert_eq!(domain.current_frequency_userspace().unwrap(), 800_000);
}

#[test]
fn governor_acceptance_matches_availability() {
    let machine = FakeMachine::build(MachineSpec {
        governors: vec!["userspace", "ondemand"],
        ..Default::default()
    });
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    let domain = &cpufreq.domains()[0];

    for governor in domain.available_governors().unwrap() {
        domain.set_governor(governor).unwrap();
        assert_eq!(domain.current_governor().unwrap(), governor);
    }
    assert!(matches!(
        domain.set_governor(Governor::Performance).unwrap_err(),
        Error::InvalidArgument(_)
    ));
    assert!(matches!(
        "notagovernor".parse::<Governor>().unwrap_err(),
        Error::InvalidArgument(_)
    ));
    assert!(cpufreq.is_governor_available(Governor::Ondemand).unwrap());
    assert!(!cpufreq.is_governor_available(Governor::Powersave).unwrap());
}

#[test]
fn governor_bounds_require_a_non_userspace_governor() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    let domain = &cpufreq.domains()[0];

    domain.set_governor(Governor::Ondemand).unwrap();
    domain.set_governor_bounds(800_000, 1_200_000).unwrap();
    assert_eq!(
        domain.current_governor_bounds().unwrap(),
        (800_000, 1_200_000)
    );

    // Outside the hardware range.
    assert!(matches!(
        domain.set_governor_bounds(400_000, 1_200_000).unwrap_err(),
        Error::InvalidArgument(_)
    ));
    assert!(matches!(
        domain.set_governor_bounds(1_200_000, 800_000).unwrap_err(),
        Error::InvalidArgument(_)
    ));

    domain.set_governor(Governor::Userspace).unwrap();
    assert!(matches!(
        domain.set_governor_bounds(800_000, 1_200_000).unwrap_err(),
        Error::InvalidArgument(_)
    ));
}

#[test]
fn rollback_of_a_fresh_snapshot_is_a_no_op() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    let domain = &cpufreq.domains()[0];

    domain.set_governor(Governor::Userspace).unwrap();
    domain.set_frequency_userspace(1_200_000).unwrap();

    let rp = domain.rollback_point().unwrap();
    domain.rollback(&rp).unwrap();
    assert_eq!(domain.current_governor().unwrap(), Governor::Userspace);
    assert_eq!(domain.current_frequency_userspace().unwrap(), 1_200_000);
}

#[test]
fn rollback_restores_userspace_frequency_and_governor_bounds() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    let domain = &cpufreq.domains()[0];

    // Userspace-captured: governor and explicit frequency come back.
    domain.set_governor(Governor::Userspace).unwrap();
    domain.set_frequency_userspace(800_000).unwrap();
    let rp = domain.rollback_point().unwrap();
    domain.set_frequency_userspace(2_400_000).unwrap();
    domain.set_governor(Governor::Ondemand).unwrap();
    domain.rollback(&rp).unwrap();
    assert_eq!(domain.current_governor().unwrap(), Governor::Userspace);
    assert_eq!(domain.current_frequency_userspace().unwrap(), 800_000);

    // Bounds-captured: governor and [lb, ub] come back.
    domain.set_governor(Governor::Ondemand).unwrap();
    domain.set_governor_bounds(800_000, 1_200_000).unwrap();
    let rp = domain.rollback_point().unwrap();
    domain.set_governor_bounds(1_200_000, 2_400_000).unwrap();
    domain.rollback(&rp).unwrap();
    assert_eq!(
        domain.current_governor_bounds().unwrap(),
        (800_000, 1_200_000)
    );

    // A rollback point of another domain is rejected.
    let other = &cpufreq.domains()[1];
    assert!(other.rollback(&rp).is_err());
}

#[test]
fn rollback_points_cover_every_domain() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    for domain in cpufreq.domains() {
        domain.set_governor(Governor::Userspace).unwrap();
        domain.set_frequency_userspace(1_200_000).unwrap();
    }

    let points = cpufreq.rollback_points().unwrap();
    assert_eq!(points.len(), 2);
    for domain in cpufreq.domains() {
        domain.set_frequency_userspace(800_000).unwrap();
    }
    cpufreq.rollback_all(&points).unwrap();
    for domain in cpufreq.domains() {
        assert_eq!(domain.current_frequency_userspace().unwrap(), 1_200_000);
    }
}

#[test]
fn boost_toggle_is_observable() {
    let machine = FakeMachine::build(MachineSpec {
        boost_file: true,
        ..Default::default()
    });
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();

    assert!(cpufreq.is_boosting_supported().unwrap());
    assert!(cpufreq.is_boosting_enabled().unwrap());
    cpufreq.disable_boosting().unwrap();
    assert!(!cpufreq.is_boosting_enabled().unwrap());
    cpufreq.enable_boosting().unwrap();
    assert!(cpufreq.is_boosting_enabled().unwrap());
}

#[test]
fn boost_is_unsupported_without_the_control_files() {
    let machine = two_domain_machine();
    let cpufreq = CpuFreq::with_root(machine.root()).unwrap();
    assert!(!cpufreq.is_boosting_supported().unwrap());
    assert!(matches!(
        cpufreq.enable_boosting().unwrap_err(),
        Error::Unsupported(_)
    ));
}
