// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared test fixtures: a synthetic sysfs machine, deterministic farm
//! doubles and a loopback communicator.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wattfarm::remote::{Agent, Communicator};
use wattfarm::{Cpumask, Farm, FarmNode, NodeSample, Result, Task, VirtualCoreId};

/// Shape of a synthetic machine written into a temp directory.
pub struct MachineSpec {
    pub packages: usize,
    pub cores_per_package: usize,
    pub threads_per_core: usize,
    /// kHz, ascending.
    pub frequencies: Vec<u32>,
    pub governors: Vec<&'static str>,
    pub initial_governor: &'static str,
    /// Contiguous virtual-core ids per frequency domain.
    pub vcs_per_domain: usize,
    pub hot_pluggable: bool,
    pub boost_file: bool,
    /// (name, desc) per cpuidle state.
    pub idle_levels: Vec<(&'static str, &'static str)>,
    /// RAPL package zones with these sub-zones (of "core", "uncore",
    /// "dram").
    pub rapl: bool,
    pub rapl_subzones: Vec<&'static str>,
    pub max_energy_range_uj: u64,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            packages: 1,
            cores_per_package: 4,
            threads_per_core: 1,
            frequencies: vec![1_200_000, 2_400_000],
            governors: vec!["userspace", "ondemand", "powersave", "performance"],
            initial_governor: "ondemand",
            vcs_per_domain: 4,
            hot_pluggable: true,
            boost_file: false,
            idle_levels: vec![],
            rapl: false,
            rapl_subzones: vec![],
            max_energy_range_uj: 262_143_328_850,
        }
    }
}

impl MachineSpec {
    pub fn total_vcs(&self) -> usize {
        self.packages * self.cores_per_package * self.threads_per_core
    }
}

pub struct FakeMachine {
    pub dir: tempfile::TempDir,
    pub spec: MachineSpec,
}

impl FakeMachine {
    pub fn build(spec: MachineSpec) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine { dir, spec };
        machine.populate();
        machine
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(rel))
            .unwrap()
            .trim()
            .to_string()
    }

    pub fn cpu_file(&self, vc: usize, rel: &str) -> String {
        format!("sys/devices/system/cpu/cpu{}/{}", vc, rel)
    }

    pub fn rapl_file(&self, package: usize, rel: &str) -> String {
        format!(
            "sys/devices/virtual/powercap/intel-rapl/intel-rapl:{}/{}",
            package, rel
        )
    }

    pub fn rapl_subzone_file(&self, package: usize, index: usize, rel: &str) -> String {
        format!(
            "sys/devices/virtual/powercap/intel-rapl/intel-rapl:{0}/intel-rapl:{0}:{1}/{2}",
            package, index, rel
        )
    }

    /// Rewrites one raw energy counter, µJ.
    pub fn set_energy_uj(&self, package: usize, subzone: Option<usize>, value: u64) {
        let rel = match subzone {
            Some(index) => self.rapl_subzone_file(package, index, "energy_uj"),
            None => self.rapl_file(package, "energy_uj"),
        };
        self.write(&rel, &value.to_string());
    }

    fn populate(&self) {
        let spec = &self.spec;
        let total_cores = spec.packages * spec.cores_per_package;
        let freqs: Vec<String> = spec.frequencies.iter().map(|f| f.to_string()).collect();
        let fmin = *spec.frequencies.first().unwrap();
        let fmax = *spec.frequencies.last().unwrap();

        for vc in 0..spec.total_vcs() {
            let core_index = vc % total_cores;
            let package = core_index / spec.cores_per_package;
            let core_id = core_index % spec.cores_per_package;
            self.write(
                &self.cpu_file(vc, "topology/physical_package_id"),
                &package.to_string(),
            );
            self.write(&self.cpu_file(vc, "topology/core_id"), &core_id.to_string());
            if spec.hot_pluggable {
                self.write(&self.cpu_file(vc, "online"), "1");
            }

            let domain = vc / spec.vcs_per_domain;
            let first = domain * spec.vcs_per_domain;
            let members: Vec<String> = (first..first + spec.vcs_per_domain)
                .filter(|&m| m < spec.total_vcs())
                .map(|m| m.to_string())
                .collect();
            self.write(&self.cpu_file(vc, "cpufreq/related_cpus"), &members.join(" "));
            self.write(
                &self.cpu_file(vc, "cpufreq/scaling_available_frequencies"),
                &freqs.join(" "),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/scaling_available_governors"),
                &spec.governors.join(" "),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/scaling_governor"),
                spec.initial_governor,
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/scaling_cur_freq"),
                &fmax.to_string(),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/scaling_setspeed"),
                &fmax.to_string(),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/scaling_min_freq"),
                &fmin.to_string(),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/scaling_max_freq"),
                &fmax.to_string(),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/cpuinfo_min_freq"),
                &fmin.to_string(),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/cpuinfo_max_freq"),
                &fmax.to_string(),
            );
            self.write(
                &self.cpu_file(vc, "cpufreq/cpuinfo_transition_latency"),
                "10000",
            );

            for (index, (name, desc)) in spec.idle_levels.iter().enumerate() {
                let state = |file: &str| self.cpu_file(vc, &format!("cpuidle/state{}/{}", index, file));
                self.write(&state("name"), name);
                self.write(&state("desc"), desc);
                self.write(&state("latency"), &(index * 10).to_string());
                self.write(&state("power"), &(100 - index * 10).to_string());
                self.write(&state("time"), "0");
                self.write(&state("usage"), "0");
                self.write(&state("disable"), "0");
            }
        }

        if spec.boost_file {
            self.write("sys/devices/system/cpu/cpufreq/boost", "1");
        }

        if spec.rapl {
            for package in 0..spec.packages {
                self.write(&self.rapl_file(package, "name"), &format!("package-{}", package));
                self.write(&self.rapl_file(package, "energy_uj"), "0");
                self.write(
                    &self.rapl_file(package, "max_energy_range_uj"),
                    &spec.max_energy_range_uj.to_string(),
                );
                for window in 0..2 {
                    self.write(
                        &self.rapl_file(package, &format!("constraint_{}_power_limit_uw", window)),
                        "100000000",
                    );
                    self.write(
                        &self.rapl_file(package, &format!("constraint_{}_time_window_us", window)),
                        "976",
                    );
                    self.write(
                        &self.rapl_file(package, &format!("constraint_{}_max_power_uw", window)),
                        "200000000",
                    );
                }
                for (index, name) in spec.rapl_subzones.iter().enumerate() {
                    self.write(&self.rapl_subzone_file(package, index, "name"), name);
                    self.write(&self.rapl_subzone_file(package, index, "energy_uj"), "0");
                    self.write(
                        &self.rapl_subzone_file(package, index, "max_energy_range_uj"),
                        &spec.max_energy_range_uj.to_string(),
                    );
                }
            }
        }

        // A minimal cpuinfo so vendor lookups have something to parse.
        let mut cpuinfo = String::new();
        for vc in 0..spec.total_vcs() {
            let package = (vc % total_cores) / spec.cores_per_package;
            cpuinfo.push_str(&format!(
                "processor\t: {}\nvendor_id\t: GenuineIntel\ncpu family\t: 6\nmodel\t: 85\nphysical id\t: {}\n\n",
                vc, package
            ));
        }
        self.write("proc/cpuinfo", &cpuinfo);
    }
}

/// A [`Task`] that records placements instead of applying them.
pub struct MockTask {
    pub moves: Mutex<Vec<VirtualCoreId>>,
    pub priorities: Mutex<Vec<u32>>,
}

impl MockTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            moves: Mutex::new(vec![]),
            priorities: Mutex::new(vec![]),
        })
    }

    pub fn last_move(&self) -> Option<VirtualCoreId> {
        self.moves.lock().unwrap().last().copied()
    }
}

impl Task for MockTask {
    fn move_to(&self, vc: VirtualCoreId) -> Result<()> {
        self.moves.lock().unwrap().push(vc);
        Ok(())
    }

    fn move_to_set(&self, mask: &Cpumask) -> Result<()> {
        let mut moves = self.moves.lock().unwrap();
        moves.extend(mask.iter().map(|id| id as VirtualCoreId));
        Ok(())
    }

    fn affinity(&self) -> Result<Cpumask> {
        Ok(self
            .last_move()
            .into_iter()
            .map(|vc| vc as usize)
            .collect())
    }

    fn virtual_core_id(&self) -> Result<VirtualCoreId> {
        Ok(self.last_move().unwrap_or(0))
    }

    fn priority(&self) -> Result<u32> {
        Ok(self.priorities.lock().unwrap().last().copied().unwrap_or(19))
    }

    fn set_priority(&self, priority: u32) -> Result<()> {
        self.priorities.lock().unwrap().push(priority);
        Ok(())
    }

    fn is_active(&self) -> bool {
        true
    }
}

/// A farm node with a scripted sample sequence. Once the script runs out
/// the node keeps returning `fallback`; a `None` fallback means the node
/// terminates.
pub struct MockNode {
    task: Arc<MockTask>,
    script: Mutex<VecDeque<NodeSample>>,
    fallback: Option<NodeSample>,
    pub produce_null_calls: AtomicUsize,
    pub notifications: Mutex<Vec<(usize, usize)>>,
}

impl MockNode {
    pub fn constant(load_percent: f64, tasks_count: u64) -> Arc<Self> {
        Self::scripted(
            vec![],
            Some(NodeSample {
                load_percent,
                tasks_count,
            }),
        )
    }

    pub fn scripted(script: Vec<NodeSample>, fallback: Option<NodeSample>) -> Arc<Self> {
        Arc::new(Self {
            task: MockTask::new(),
            script: Mutex::new(script.into()),
            fallback,
            produce_null_calls: AtomicUsize::new(0),
            notifications: Mutex::new(vec![]),
        })
    }

    pub fn task(&self) -> Arc<MockTask> {
        self.task.clone()
    }
}

impl FarmNode for MockNode {
    fn thread_handle(&self) -> Option<Arc<dyn Task>> {
        Some(self.task.clone())
    }

    fn get_and_reset_sample(&self) -> Option<NodeSample> {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(sample) => Some(sample),
            None => self.fallback,
        }
    }

    fn produce_null(&self) {
        self.produce_null_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_workers_change(&self, old_workers: usize, new_workers: usize) {
        self.notifications
            .lock()
            .unwrap()
            .push((old_workers, new_workers));
    }
}

type RunHook = Box<dyn Fn(usize) + Send + Sync>;

/// A farm double recording the drain/restart protocol.
pub struct MockFarm {
    pub emitter: Option<Arc<MockNode>>,
    pub workers: Vec<Arc<MockNode>>,
    pub collector: Option<Arc<MockNode>>,
    pub run_calls: Mutex<Vec<usize>>,
    pub wait_calls: AtomicUsize,
    pub on_run: Mutex<Option<RunHook>>,
}

impl MockFarm {
    pub fn workers_only(workers: Vec<Arc<MockNode>>) -> Arc<Self> {
        Arc::new(Self {
            emitter: None,
            workers,
            collector: None,
            run_calls: Mutex::new(vec![]),
            wait_calls: AtomicUsize::new(0),
            on_run: Mutex::new(None),
        })
    }

    pub fn with_emitter(emitter: Arc<MockNode>, workers: Vec<Arc<MockNode>>) -> Arc<Self> {
        Arc::new(Self {
            emitter: Some(emitter),
            workers,
            collector: None,
            run_calls: Mutex::new(vec![]),
            wait_calls: AtomicUsize::new(0),
            on_run: Mutex::new(None),
        })
    }

    pub fn set_run_hook(&self, hook: RunHook) {
        *self.on_run.lock().unwrap() = Some(hook);
    }
}

impl Farm for MockFarm {
    fn emitter(&self) -> Option<Arc<dyn FarmNode>> {
        self.emitter.clone().map(|n| n as Arc<dyn FarmNode>)
    }

    fn workers(&self) -> Vec<Arc<dyn FarmNode>> {
        self.workers
            .iter()
            .map(|n| n.clone() as Arc<dyn FarmNode>)
            .collect()
    }

    fn collector(&self) -> Option<Arc<dyn FarmNode>> {
        self.collector.clone().map(|n| n as Arc<dyn FarmNode>)
    }

    fn run_then_freeze(&self, num_workers: usize) -> Result<()> {
        if let Some(hook) = self.on_run.lock().unwrap().as_ref() {
            hook(num_workers);
        }
        self.run_calls.lock().unwrap().push(num_workers);
        Ok(())
    }

    fn wait_freezing(&self) -> Result<()> {
        self.wait_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A communicator whose remote end is an in-process [`Agent`], with the
/// single-channel lock the contract requires.
pub struct LoopbackCommunicator {
    agent: Agent,
    channel: Mutex<()>,
}

impl LoopbackCommunicator {
    pub fn new(agent: Agent) -> Arc<Self> {
        Arc::new(Self {
            agent,
            channel: Mutex::new(()),
        })
    }
}

impl Communicator for LoopbackCommunicator {
    fn round_trip(&self, message_id: &str, payload: &[u8]) -> Result<(String, Vec<u8>)> {
        let _guard = self.channel.lock().unwrap();
        self.agent.dispatch(message_id, payload)
    }
}

/// Polls `predicate` until it holds or the timeout expires.
pub fn wait_until(timeout: std::time::Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    predicate()
}
