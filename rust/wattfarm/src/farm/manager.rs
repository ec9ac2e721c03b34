// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The adaptive farm manager.
//!
//! The manager runs on its own thread. After pinning the farm's threads
//! according to the mapping strategy, it samples the active workers and
//! the energy counters at a fixed cadence, maintains sliding-window
//! averages of bandwidth and utilization, and whenever the user contract
//! is violated searches for a better `(workers, frequency)` operating
//! point and applies it through a drain-reconfigure-resume cycle.
//!
//! States: `Initialized -> MappingApplied -> Sampling <-> Reconfiguring ->
//! Stopped`. [`AdaptiveFarmManager::stop`] unblocks the sampler from any
//! state and joins it.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::cpufreq::{CpuFreq, Domain, DomainId, Frequency, Governor, RollbackPoint};
use crate::energy::{Energy, JoulesCpu};
use crate::farm::params::{
    AdaptivityParameters, FrequencyStrategy, MappingStrategy, UnusedVcStrategy,
};
use crate::farm::{Farm, FarmConfiguration, FarmNode, Observer, ObserverSample};
use crate::task::Task;
use crate::topology::{CpuId, Topology, VirtualCoreId};
use crate::voltage::VoltageTable;
use crate::{Error, Result};

/// Where the manager currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Initialized,
    MappingApplied,
    Sampling,
    Reconfiguring,
    Stopped,
}

/// A snapshot of what the manager has done so far, readable while it runs.
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Sampling iterations since start.
    pub samples: u64,
    /// Iterations dropped by the discard window.
    pub discarded_samples: u64,
    /// Times the contract was found violated and a search ran.
    pub reconfiguration_attempts: u64,
    /// Times a new configuration was actually applied.
    pub reconfigurations: u64,
    pub average_bandwidth: f64,
    pub average_utilization: f64,
    pub current_workers: usize,
    pub current_frequency: Frequency,
    /// Joules consumed by the CPUs hosting farm threads since start.
    pub used_joules: JoulesCpu,
    /// Joules consumed by the remaining CPUs since start.
    pub unused_joules: JoulesCpu,
    /// True once energy sampling failed and was disabled for the session.
    pub energy_degraded: bool,
}

/// The user's contract: either a utilization band or a bandwidth window.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Contract {
    Utilization { underload: f64, overload: f64 },
    Bandwidth { required: f64, variation: f64 },
}

impl Contract {
    fn from_params(params: &AdaptivityParameters) -> Self {
        if params.uses_bandwidth_contract() {
            Contract::Bandwidth {
                required: params.required_bandwidth,
                variation: params.max_bandwidth_variation,
            }
        } else {
            Contract::Utilization {
                underload: params.underload_threshold_farm,
                overload: params.overload_threshold_farm,
            }
        }
    }

    fn is_violated(&self, value: f64) -> bool {
        match *self {
            Contract::Utilization {
                underload,
                overload,
            } => value < underload || value > overload,
            Contract::Bandwidth {
                required,
                variation,
            } => {
                let slack = required * variation / 100.0;
                value < required - slack || value > required + slack
            }
        }
    }

    /// The reference point of the best-suboptimal tie-break: the required
    /// bandwidth, or the lower edge of the utilization band.
    fn target(&self) -> f64 {
        match *self {
            Contract::Utilization { underload, .. } => underload,
            Contract::Bandwidth { required, .. } => required,
        }
    }
}

/// The monotone scaling model: throughput scales with the worker count,
/// and with frequency too when the manager drives DVFS.
fn scaling_factor(
    strategy: FrequencyStrategy,
    current: FarmConfiguration,
    candidate: FarmConfiguration,
) -> f64 {
    match strategy {
        FrequencyStrategy::None | FrequencyStrategy::Os => {
            candidate.num_workers as f64 / current.num_workers as f64
        }
        _ => {
            (candidate.num_workers as f64 * candidate.frequency as f64)
                / (current.num_workers as f64 * current.frequency as f64)
        }
    }
}

fn estimate(contract: Contract, monitored: f64, scale: f64) -> f64 {
    match contract {
        Contract::Bandwidth { .. } => monitored * scale,
        Contract::Utilization { .. } => monitored / scale,
    }
}

/// True when suboptimal value `x` beats suboptimal value `y`: a value
/// above the target beats one below it, otherwise the closer one wins.
fn is_best_suboptimal(target: f64, x: f64, y: f64) -> bool {
    let dx = x - target;
    let dy = y - target;
    if (dx >= 0.0) != (dy >= 0.0) {
        dx >= 0.0
    } else {
        dx.abs() < dy.abs()
    }
}

/// Estimated power at a candidate, `n * f * V(n, f)^2`. A missing table
/// entry during a scan is a fatal misconfiguration.
fn estimated_power(table: &VoltageTable, candidate: FarmConfiguration) -> Result<f64> {
    let voltage = table
        .voltage(candidate.num_workers as u32, candidate.frequency)
        .ok_or_else(|| {
            Error::Fatal(format!(
                "no voltage table entry for {} cores at {} kHz",
                candidate.num_workers, candidate.frequency
            ))
        })?;
    Ok(candidate.num_workers as f64 * candidate.frequency as f64 * voltage * voltage)
}

/// Picks the next configuration after a contract violation: the first
/// feasible candidate in the strategy's enumeration order, the cheapest
/// feasible one for the power-conservative strategy, or the
/// best-suboptimal candidate when nothing is feasible.
fn select_configuration(
    strategy: FrequencyStrategy,
    contract: Contract,
    monitored: f64,
    current: FarmConfiguration,
    max_workers: usize,
    frequencies: &[Frequency],
    voltage_table: Option<&VoltageTable>,
) -> Result<FarmConfiguration> {
    let estimate_at = |candidate: FarmConfiguration| {
        estimate(
            contract,
            monitored,
            scaling_factor(strategy, current, candidate),
        )
    };
    let target = contract.target();
    let mut best_suboptimal: Option<(FarmConfiguration, f64)> = None;
    let track_suboptimal =
        |best: &mut Option<(FarmConfiguration, f64)>, cand: FarmConfiguration, est: f64| {
            if best
                .map(|(_, best_est)| is_best_suboptimal(target, est, best_est))
                .unwrap_or(true)
            {
                *best = Some((cand, est));
            }
        };

    match strategy {
        FrequencyStrategy::None | FrequencyStrategy::Os => {
            for n in 1..=max_workers {
                let cand = FarmConfiguration::new(n, current.frequency);
                let est = estimate_at(cand);
                if !contract.is_violated(est) {
                    return Ok(cand);
                }
                track_suboptimal(&mut best_suboptimal, cand, est);
            }
        }
        FrequencyStrategy::CoresConservative => {
            for n in 1..=max_workers {
                for &f in frequencies {
                    let cand = FarmConfiguration::new(n, f);
                    let est = estimate_at(cand);
                    if !contract.is_violated(est) {
                        return Ok(cand);
                    }
                    track_suboptimal(&mut best_suboptimal, cand, est);
                }
            }
        }
        FrequencyStrategy::PowerConservative => {
            let table = voltage_table.ok_or_else(|| {
                Error::Fatal("power conservative strategy without a voltage table".into())
            })?;
            let mut best_feasible: Option<(FarmConfiguration, f64)> = None;
            for n in 1..=max_workers {
                for &f in frequencies {
                    let cand = FarmConfiguration::new(n, f);
                    let est = estimate_at(cand);
                    if !contract.is_violated(est) {
                        let power = estimated_power(table, cand)?;
                        if best_feasible.map(|(_, p)| power < p).unwrap_or(true) {
                            best_feasible = Some((cand, power));
                        }
                    } else {
                        track_suboptimal(&mut best_suboptimal, cand, est);
                    }
                }
            }
            if let Some((cand, _)) = best_feasible {
                return Ok(cand);
            }
        }
    }

    best_suboptimal
        .map(|(cand, _)| cand)
        .ok_or_else(|| Error::Fatal("no candidate configurations to choose from".into()))
}

struct Shared {
    stop: Mutex<bool>,
    cond: Condvar,
    state: Mutex<ManagerState>,
    stats: Mutex<ManagerStats>,
    error: Mutex<Option<Error>>,
}

impl Shared {
    fn set_state(&self, state: ManagerState) {
        *self.state.lock().unwrap() = state;
    }

    fn stopped(&self) -> bool {
        *self.stop.lock().unwrap()
    }
}

struct NodeSlot {
    node: Arc<dyn FarmNode>,
    handle: Arc<dyn Task>,
    vc: Option<VirtualCoreId>,
}

struct WindowEntry {
    total_tasks: u64,
    avg_load: f64,
}

struct ControlSeed {
    farm: Arc<dyn Farm>,
    topology: Arc<Topology>,
    cpufreq: Arc<CpuFreq>,
    energy: Arc<Energy>,
    params: AdaptivityParameters,
    observer: Option<Box<dyn Observer>>,
}

/// Drives a running farm towards the user's contract by adjusting the
/// worker count and the CPU frequency.
pub struct AdaptiveFarmManager {
    shared: Arc<Shared>,
    seed: Option<ControlSeed>,
    thread: Option<JoinHandle<()>>,
}

impl AdaptiveFarmManager {
    /// Validates `params` against the machine and prepares a manager for
    /// `farm`. Validation failures surface here, synchronously.
    pub fn new(
        farm: Arc<dyn Farm>,
        topology: Arc<Topology>,
        cpufreq: Arc<CpuFreq>,
        energy: Arc<Energy>,
        mut params: AdaptivityParameters,
    ) -> Result<Self> {
        params.validate(&topology, &cpufreq)?;
        if farm.workers().is_empty() {
            return Err(Error::InvalidArgument("the farm has no workers".into()));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                stop: Mutex::new(false),
                cond: Condvar::new(),
                state: Mutex::new(ManagerState::Initialized),
                stats: Mutex::new(ManagerStats::default()),
                error: Mutex::new(None),
            }),
            seed: Some(ControlSeed {
                farm,
                topology,
                cpufreq,
                energy,
                params,
                observer: None,
            }),
            thread: None,
        })
    }

    /// Installs an observer called once per sampling iteration. Must be
    /// called before [`AdaptiveFarmManager::start`].
    pub fn set_observer(&mut self, observer: Box<dyn Observer>) -> Result<()> {
        match &mut self.seed {
            Some(seed) => {
                seed.observer = Some(observer);
                Ok(())
            }
            None => Err(Error::InvalidArgument(
                "the manager has already been started".into(),
            )),
        }
    }

    /// Spawns the control thread. The farm must already be running and
    /// must keep its thread handles stable.
    pub fn start(&mut self) -> Result<()> {
        let seed = self
            .seed
            .take()
            .ok_or_else(|| Error::InvalidArgument("the manager has already been started".into()))?;
        let shared = self.shared.clone();
        let thread = std::thread::Builder::new()
            .name("wattfarm-manager".into())
            .spawn(move || control_loop(seed, shared))
            .map_err(|e| Error::Fatal(format!("cannot spawn the manager thread: {}", e)))?;
        self.thread = Some(thread);
        Ok(())
    }

    pub fn state(&self) -> ManagerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn stats(&self) -> ManagerStats {
        self.shared.stats.lock().unwrap().clone()
    }

    /// Unblocks the sampler, joins the control thread and reports the
    /// fatal error that aborted it, if any.
    pub fn stop(mut self) -> Result<()> {
        {
            let mut stop = self.shared.stop.lock().unwrap();
            *stop = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Fatal("the manager thread panicked".into()))?;
        }
        self.shared.set_state(ManagerState::Stopped);
        match self.shared.error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn control_loop(seed: ControlSeed, shared: Arc<Shared>) {
    let interval = seed.params.sampling_interval;
    let mut ctl = match ControlCtx::init(seed, shared.clone()) {
        Ok(Some(ctl)) => ctl,
        Ok(None) => {
            shared.set_state(ManagerState::Stopped);
            return;
        }
        Err(e) => {
            warn!("manager initialization failed: {}", e);
            *shared.error.lock().unwrap() = Some(e);
            shared.set_state(ManagerState::Stopped);
            return;
        }
    };

    shared.set_state(ManagerState::Sampling);
    loop {
        {
            let stopped = shared.stop.lock().unwrap();
            let (stopped, _) = shared.cond.wait_timeout(stopped, interval).unwrap();
            if *stopped {
                break;
            }
        }
        match ctl.iteration() {
            Ok(true) => {}
            Ok(false) => {
                info!("a worker terminated, leaving the sampling loop");
                break;
            }
            Err(e) if e.is_fatal() => {
                warn!("manager aborting: {}", e);
                *shared.error.lock().unwrap() = Some(e);
                break;
            }
            Err(e) => warn!("sampling iteration failed: {}", e),
        }
    }
    shared.set_state(ManagerState::Stopped);
}

struct ControlCtx {
    farm: Arc<dyn Farm>,
    topology: Arc<Topology>,
    cpufreq: Arc<CpuFreq>,
    energy: Arc<Energy>,
    params: AdaptivityParameters,
    observer: Option<Box<dyn Observer>>,
    shared: Arc<Shared>,
    contract: Contract,
    max_workers: usize,
    emitter: Option<NodeSlot>,
    collector: Option<NodeSlot>,
    active: Vec<NodeSlot>,
    inactive: Vec<NodeSlot>,
    current: FarmConfiguration,
    available_frequencies: Vec<Frequency>,
    scalable_domains: Vec<DomainId>,
    emitter_sensitive_ok: bool,
    collector_sensitive_ok: bool,
    /// Virtual cores of separated domains claimed for sensitive nodes but
    /// not yet assigned, one per physical core.
    sensitive_spares: Vec<VirtualCoreId>,
    used_cpus: Vec<CpuId>,
    unused_cpus: Vec<CpuId>,
    window: VecDeque<WindowEntry>,
    elapsed_samples: usize,
    discard_left: usize,
    energy_ok: bool,
    avg_bandwidth: f64,
    avg_utilization: f64,
    used_joules: JoulesCpu,
    unused_joules: JoulesCpu,
}

impl ControlCtx {
    fn init(seed: ControlSeed, shared: Arc<Shared>) -> Result<Option<Self>> {
        let ControlSeed {
            farm,
            topology,
            cpufreq,
            energy,
            params,
            observer,
        } = seed;

        let worker_nodes = farm.workers();
        let max_workers = worker_nodes.len();

        // Thread handles appear once every node has run its first service
        // call; wait for all of them.
        let mut all_nodes: Vec<Arc<dyn FarmNode>> = vec![];
        if let Some(em) = farm.emitter() {
            all_nodes.push(em);
        }
        all_nodes.extend(worker_nodes.iter().cloned());
        if let Some(col) = farm.collector() {
            all_nodes.push(col);
        }
        loop {
            if all_nodes.iter().all(|n| n.thread_handle().is_some()) {
                break;
            }
            if shared.stopped() {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let slot = |node: Arc<dyn FarmNode>| -> NodeSlot {
            let handle = node.thread_handle().unwrap();
            NodeSlot {
                node,
                handle,
                vc: None,
            }
        };
        let emitter = farm.emitter().map(slot);
        let collector = farm.collector().map(slot);
        let active: Vec<NodeSlot> = worker_nodes.into_iter().map(slot).collect();

        let available_frequencies = cpufreq
            .domains()
            .first()
            .and_then(|d| d.available_frequencies().ok())
            .unwrap_or_default();
        let contract = Contract::from_params(&params);
        let energy_ok = energy.counter_cpus().is_some();
        if !energy_ok {
            shared.stats.lock().unwrap().energy_degraded = true;
        }

        let discard = params.samples_to_discard;
        let mut ctl = ControlCtx {
            farm,
            topology,
            cpufreq,
            energy,
            params,
            observer,
            shared,
            contract,
            max_workers,
            emitter,
            collector,
            active,
            inactive: vec![],
            current: FarmConfiguration::new(max_workers, 0),
            available_frequencies,
            scalable_domains: vec![],
            emitter_sensitive_ok: false,
            collector_sensitive_ok: false,
            sensitive_spares: vec![],
            used_cpus: vec![],
            unused_cpus: vec![],
            window: VecDeque::new(),
            elapsed_samples: 0,
            discard_left: discard,
            energy_ok,
            avg_bandwidth: 0.0,
            avg_utilization: 0.0,
            used_joules: JoulesCpu::default(),
            unused_joules: JoulesCpu::default(),
        };
        ctl.map_and_set_frequencies()?;
        ctl.shared.set_state(ManagerState::MappingApplied);
        ctl.publish_stats();
        Ok(Some(ctl))
    }

    /// The target virtual cores in mapping order: one virtual core per
    /// physical core first, grouped by CPU in id order, then the second
    /// core of each sibling set, and so on. Small worker counts spread
    /// over distinct physical cores; SMT siblings fill last.
    fn linear_order(&self) -> Vec<VirtualCoreId> {
        let mut order = vec![];
        let mut level = 0;
        loop {
            let mut any = false;
            for cpu in self.topology.cpus() {
                for core in cpu.physical_cores() {
                    if let Some(vc) = core.virtual_cores().get(level) {
                        order.push(vc.id());
                        any = true;
                    }
                }
            }
            if !any {
                break;
            }
            level += 1;
        }
        order
    }

    fn map_and_set_frequencies(&mut self) -> Result<()> {
        if self.cpufreq.is_boosting_supported().unwrap_or(false) {
            let res = if self.params.turbo_boost {
                self.cpufreq.enable_boosting()
            } else {
                self.cpufreq.disable_boosting()
            };
            if let Err(e) = res {
                warn!("cannot toggle boosting: {}", e);
            }
        }

        if self.params.mapping_strategy == MappingStrategy::None {
            // No pinning: the OS owns placement and every CPU counts as
            // used.
            self.current = FarmConfiguration::new(self.max_workers, 0);
            self.used_cpus = self.topology.cpus().iter().map(|c| c.id()).collect();
            self.unused_cpus = vec![];
            return Ok(());
        }

        let mut pool = self.linear_order();
        self.place_sensitive_nodes(&mut pool)?;
        if pool.is_empty() {
            return Err(Error::Fatal("no virtual cores left to host the farm".into()));
        }

        // EWC layout: emitter first, workers next, collector last.
        let mut index = 0;
        let next_vc = |index: &mut usize| -> VirtualCoreId {
            let vc = pool[*index % pool.len()];
            *index += 1;
            vc
        };
        if let Some(em) = &mut self.emitter {
            if em.vc.is_none() {
                em.vc = Some(next_vc(&mut index));
            }
        }
        for slot in self.active.iter_mut() {
            slot.vc = Some(next_vc(&mut index));
        }
        if let Some(col) = &mut self.collector {
            if col.vc.is_none() {
                col.vc = Some(next_vc(&mut index));
            }
        }

        self.repin_all_nodes()?;
        self.update_used_cpus();
        self.update_scalable_domains();

        match self.params.frequency_strategy {
            FrequencyStrategy::None => {
                self.current = FarmConfiguration::new(self.max_workers, 0);
            }
            FrequencyStrategy::Os => {
                self.current = FarmConfiguration::new(self.max_workers, 0);
                self.apply_frequency(0)?;
            }
            _ => {
                let fmax = *self.available_frequencies.last().ok_or_else(|| {
                    Error::Fatal("no frequency steps for a scaling strategy".into())
                })?;
                self.current = FarmConfiguration::new(self.max_workers, fmax);
                self.apply_frequency(fmax)?;
            }
        }

        self.apply_unused_policies()?;
        Ok(())
    }

    /// Looks for a frequency domain none of whose cores the farm needs,
    /// so a sensitive node can sit there at full speed regardless of what
    /// the workers' domains do. Returns one virtual core per physical core
    /// of the claimed domain and removes the domain from the pool.
    fn claim_separated_domain(
        &self,
        pool: &mut Vec<VirtualCoreId>,
        needed_ewc: usize,
    ) -> Result<Option<Vec<VirtualCoreId>>> {
        for domain in self.cpufreq.domains() {
            let members: Vec<VirtualCoreId> = pool
                .iter()
                .copied()
                .filter(|&vc| domain.contains(vc))
                .collect();
            if members.is_empty() {
                continue;
            }
            if pool.len() - members.len() < needed_ewc {
                continue;
            }
            self.raise_domain(domain)?;
            pool.retain(|vc| !domain.contains(*vc));
            // One virtual core per physical core, to give each sensitive
            // node a core of its own.
            let mut per_core: Vec<VirtualCoreId> = vec![];
            let mut seen = BTreeSet::new();
            for vc in members {
                let pc = self.topology.virtual_core(vc)?.physical_core_id();
                if seen.insert(pc) {
                    per_core.push(vc);
                }
            }
            return Ok(Some(per_core));
        }
        Ok(None)
    }

    fn place_sensitive_nodes(&mut self, pool: &mut Vec<VirtualCoreId>) -> Result<()> {
        if !self.params.sensitive_emitter && !self.params.sensitive_collector {
            return Ok(());
        }
        let needed_ewc = self.max_workers
            + usize::from(self.emitter.is_some() && !self.params.sensitive_emitter)
            + usize::from(self.collector.is_some() && !self.params.sensitive_collector);

        if self.params.sensitive_emitter && self.emitter.is_some() {
            match self.claim_separated_domain(pool, needed_ewc)? {
                Some(mut per_core) => {
                    let vc = per_core.remove(0);
                    self.emitter.as_mut().unwrap().vc = Some(vc);
                    self.sensitive_spares = per_core;
                    self.emitter_sensitive_ok = true;
                }
                None => {
                    // Silently dropped; the emitter re-joins the EWC
                    // layout.
                    debug!("no separated domain for the sensitive emitter");
                }
            }
        }
        if self.params.sensitive_collector && self.collector.is_some() {
            let vc = if !self.sensitive_spares.is_empty() {
                Some(self.sensitive_spares.remove(0))
            } else {
                match self.claim_separated_domain(pool, needed_ewc)? {
                    Some(mut per_core) => {
                        let vc = per_core.remove(0);
                        self.sensitive_spares = per_core;
                        Some(vc)
                    }
                    None => None,
                }
            };
            match vc {
                Some(vc) => {
                    self.collector.as_mut().unwrap().vc = Some(vc);
                    self.collector_sensitive_ok = true;
                }
                None => debug!("no separated domain for the sensitive collector"),
            }
        }
        Ok(())
    }

    /// Performance governor, or userspace at the top step.
    fn raise_domain(&self, domain: &Domain) -> Result<()> {
        if domain.is_governor_available(Governor::Performance)? {
            domain.set_governor(Governor::Performance)
        } else {
            domain.set_governor(Governor::Userspace)?;
            domain.set_highest_frequency_userspace()
        }
    }

    /// Powersave governor, or userspace at the bottom step.
    fn lower_domain(&self, domain: &Domain) -> Result<()> {
        if domain.is_governor_available(Governor::Powersave)? {
            domain.set_governor(Governor::Powersave)
        } else {
            domain.set_governor(Governor::Userspace)?;
            domain.set_lowest_frequency_userspace()
        }
    }

    /// Pins every node with an assigned core, replugging cores a prior
    /// `off` policy disabled. A failed move aborts the manager.
    fn repin_all_nodes(&self) -> Result<()> {
        let mut slots: Vec<&NodeSlot> = vec![];
        if let Some(em) = &self.emitter {
            slots.push(em);
        }
        slots.extend(self.active.iter());
        slots.extend(self.inactive.iter());
        if let Some(col) = &self.collector {
            slots.push(col);
        }
        for slot in slots {
            let vc = match slot.vc {
                Some(vc) => vc,
                None => continue,
            };
            let core = self.topology.virtual_core(vc)?;
            if !core.is_hot_plugged().unwrap_or(true) {
                core.hot_plug()
                    .map_err(|e| Error::Fatal(format!("cannot replug vc {}: {}", vc, e)))?;
            }
            slot.handle
                .move_to(vc)
                .map_err(|e| Error::Fatal(format!("cannot move a thread to vc {}: {}", vc, e)))?;
        }
        Ok(())
    }

    fn update_used_cpus(&mut self) {
        let mut used = BTreeSet::new();
        let mut used_vcs: Vec<VirtualCoreId> = self.active.iter().filter_map(|s| s.vc).collect();
        if let Some(em) = &self.emitter {
            used_vcs.extend(em.vc);
        }
        if let Some(col) = &self.collector {
            used_vcs.extend(col.vc);
        }
        for vc in used_vcs {
            if let Ok(core) = self.topology.virtual_core(vc) {
                used.insert(core.cpu_id());
            }
        }
        self.used_cpus = used.iter().copied().collect();
        self.unused_cpus = self
            .topology
            .cpus()
            .iter()
            .map(|c| c.id())
            .filter(|id| !used.contains(id))
            .collect();
    }

    /// The domains the manager scales: those hosting active workers, plus
    /// the emitter's/collector's unless they sit on a separated domain.
    fn update_scalable_domains(&mut self) {
        let mut vcs: Vec<VirtualCoreId> = self.active.iter().filter_map(|s| s.vc).collect();
        if !self.emitter_sensitive_ok {
            if let Some(em) = &self.emitter {
                vcs.extend(em.vc);
            }
        }
        if !self.collector_sensitive_ok {
            if let Some(col) = &self.collector {
                vcs.extend(col.vc);
            }
        }
        self.scalable_domains = self
            .cpufreq
            .domains_for(&vcs)
            .into_iter()
            .map(|d| d.id())
            .collect();
    }

    /// Applies the frequency strategy to every scalable domain. Failure
    /// here is fatal: the machine is in a state the manager no longer
    /// understands.
    fn apply_frequency(&self, frequency: Frequency) -> Result<()> {
        for &did in self.scalable_domains.iter() {
            let domain = self.cpufreq.domain(did)?;
            match self.params.frequency_strategy {
                FrequencyStrategy::None => {}
                FrequencyStrategy::Os => {
                    domain
                        .set_governor(self.params.governor)
                        .map_err(|e| Error::Fatal(format!("cannot apply the governor: {}", e)))?;
                    if let (Some(lb), Some(ub)) = (
                        self.params.frequency_lower_bound,
                        self.params.frequency_upper_bound,
                    ) {
                        domain
                            .set_governor_bounds(lb, ub)
                            .map_err(|e| Error::Fatal(format!("cannot apply bounds: {}", e)))?;
                    }
                }
                _ => {
                    domain
                        .set_governor(Governor::Userspace)
                        .map_err(|e| Error::Fatal(format!("cannot apply userspace: {}", e)))?;
                    domain.set_frequency_userspace(frequency).map_err(|e| {
                        Error::Fatal(format!("cannot apply {} kHz: {}", frequency, e))
                    })?;
                }
            }
        }
        Ok(())
    }

    fn resolve_auto(&self, strategy: UnusedVcStrategy, vcs: &[VirtualCoreId]) -> UnusedVcStrategy {
        if strategy != UnusedVcStrategy::Auto {
            return strategy;
        }
        let any_pluggable = vcs.iter().any(|&vc| {
            self.topology
                .virtual_core(vc)
                .map(|c| c.is_hot_pluggable())
                .unwrap_or(false)
        });
        if any_pluggable {
            return UnusedVcStrategy::Off;
        }
        let scaling = self
            .cpufreq
            .is_governor_available(Governor::Powersave)
            .unwrap_or(false)
            || self
                .cpufreq
                .is_governor_available(Governor::Userspace)
                .unwrap_or(false);
        if scaling {
            UnusedVcStrategy::LowestFrequency
        } else {
            UnusedVcStrategy::None
        }
    }

    fn apply_vc_strategy(&self, strategy: UnusedVcStrategy, vcs: &[VirtualCoreId]) -> Result<()> {
        if vcs.is_empty() {
            return Ok(());
        }
        match self.resolve_auto(strategy, vcs) {
            UnusedVcStrategy::None | UnusedVcStrategy::Auto => {}
            UnusedVcStrategy::Off => {
                for &vc in vcs {
                    let core = self.topology.virtual_core(vc)?;
                    if core.is_hot_pluggable() {
                        if let Err(e) = core.hot_unplug() {
                            warn!("cannot unplug vc {}: {}", vc, e);
                        }
                    }
                }
                // A fully quiesced domain also drops to its minimum.
                for domain in self.cpufreq.domains_complete_for(vcs) {
                    if let Err(e) = self.lower_domain(domain) {
                        debug!("cannot lower quiesced domain {}: {}", domain.id(), e);
                    }
                }
            }
            UnusedVcStrategy::LowestFrequency => {
                for domain in self.cpufreq.domains_complete_for(vcs) {
                    if let Err(e) = self.lower_domain(domain) {
                        warn!("cannot lower domain {}: {}", domain.id(), e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Classifies every core not hosting the emitter, the collector or an
    /// active worker as inactive (its worker may come back) or unused,
    /// and applies the respective strategies. Inactive first: turning
    /// cores off subsumes lowering their frequency.
    fn apply_unused_policies(&self) -> Result<()> {
        if self.params.mapping_strategy == MappingStrategy::None {
            return Ok(());
        }
        let mut assigned: BTreeSet<VirtualCoreId> =
            self.active.iter().filter_map(|s| s.vc).collect();
        if let Some(em) = &self.emitter {
            assigned.extend(em.vc);
        }
        if let Some(col) = &self.collector {
            assigned.extend(col.vc);
        }
        let inactive_vcs: Vec<VirtualCoreId> = self
            .inactive
            .iter()
            .filter_map(|s| s.vc)
            .filter(|vc| !assigned.contains(vc))
            .collect();
        let unused_vcs: Vec<VirtualCoreId> = self
            .topology
            .virtual_cores()
            .iter()
            .map(|c| c.id())
            .filter(|vc| !assigned.contains(vc) && !inactive_vcs.contains(vc))
            .collect();
        self.apply_vc_strategy(self.params.inactive_vc_strategy, &inactive_vcs)?;
        self.apply_vc_strategy(self.params.unused_vc_strategy, &unused_vcs)?;
        Ok(())
    }

    fn sample_energy(&mut self) {
        if !self.energy_ok {
            return;
        }
        let counter = match self.energy.counter_cpus() {
            Some(counter) => counter.clone(),
            None => {
                self.energy_ok = false;
                return;
            }
        };
        let res = (|| -> Result<(JoulesCpu, JoulesCpu)> {
            let mut used = JoulesCpu::default();
            let mut unused = JoulesCpu::default();
            for &cpu in self.used_cpus.iter() {
                used += counter.read_components(cpu)?;
            }
            for &cpu in self.unused_cpus.iter() {
                unused += counter.read_components(cpu)?;
            }
            counter.reset()?;
            Ok((used, unused))
        })();
        match res {
            Ok((used, unused)) => {
                self.used_joules += used;
                self.unused_joules += unused;
            }
            Err(e) => {
                // One bad counter degrades energy accounting for the
                // session; the manager keeps running.
                warn!("energy sampling disabled: {}", e);
                self.energy_ok = false;
                self.shared.stats.lock().unwrap().energy_degraded = true;
            }
        }
    }

    fn publish_stats(&self) {
        let mut stats = self.shared.stats.lock().unwrap();
        stats.average_bandwidth = self.avg_bandwidth;
        stats.average_utilization = self.avg_utilization;
        stats.current_workers = self.current.num_workers;
        stats.current_frequency = self.current.frequency;
        stats.used_joules = self.used_joules;
        stats.unused_joules = self.unused_joules;
    }

    fn notify_observer(&mut self) {
        if let Some(observer) = &mut self.observer {
            let sample = ObserverSample {
                num_workers: self.current.num_workers,
                frequency: self.current.frequency,
                emitter_core: self.emitter.as_ref().and_then(|s| s.vc),
                worker_cores: self.active.iter().filter_map(|s| s.vc).collect(),
                collector_core: self.collector.as_ref().and_then(|s| s.vc),
                bandwidth: self.avg_bandwidth,
                utilization: self.avg_utilization,
                used_joules: self.used_joules,
                unused_joules: self.unused_joules,
            };
            observer.observe(&sample);
        }
    }

    /// One sampling iteration. `Ok(false)` means a worker terminated and
    /// the loop must end.
    fn iteration(&mut self) -> Result<bool> {
        let mut samples = vec![];
        for slot in self.active.iter() {
            match slot.node.get_and_reset_sample() {
                Some(sample) => samples.push(sample),
                None => return Ok(false),
            }
        }

        self.sample_energy();
        self.elapsed_samples += 1;
        {
            let mut stats = self.shared.stats.lock().unwrap();
            stats.samples += 1;
            if self.discard_left > 0 {
                stats.discarded_samples += 1;
            }
        }

        if self.discard_left > 0 {
            self.discard_left -= 1;
            self.publish_stats();
            self.notify_observer();
            return Ok(true);
        }

        let total_tasks: u64 = samples.iter().map(|s| s.tasks_count).sum();
        let avg_load =
            samples.iter().map(|s| s.load_percent).sum::<f64>() / samples.len() as f64;
        if self.window.len() == self.params.num_samples {
            self.window.pop_front();
        }
        self.window.push_back(WindowEntry {
            total_tasks,
            avg_load,
        });

        let interval = self.params.sampling_interval.as_secs_f64();
        let n = self.window.len() as f64;
        self.avg_bandwidth = self
            .window
            .iter()
            .map(|e| e.total_tasks as f64 / interval)
            .sum::<f64>()
            / n;
        self.avg_utilization = self.window.iter().map(|e| e.avg_load).sum::<f64>() / n;

        self.publish_stats();
        self.notify_observer();

        if self.elapsed_samples > self.params.num_samples {
            let monitored = match self.contract {
                Contract::Bandwidth { .. } => self.avg_bandwidth,
                Contract::Utilization { .. } => self.avg_utilization,
            };
            if self.contract.is_violated(monitored) {
                self.shared.stats.lock().unwrap().reconfiguration_attempts += 1;
                self.shared.set_state(ManagerState::Reconfiguring);
                let new = select_configuration(
                    self.params.frequency_strategy,
                    self.contract,
                    monitored,
                    self.current,
                    self.max_workers,
                    &self.available_frequencies,
                    self.params.voltage_table.as_ref(),
                );
                let result = match new {
                    Ok(new) if new != self.current => {
                        info!(
                            "reconfiguring: {} workers @ {} kHz -> {} workers @ {} kHz \
                             (monitored {:.2})",
                            self.current.num_workers,
                            self.current.frequency,
                            new.num_workers,
                            new.frequency,
                            monitored
                        );
                        let applied = self.change_configuration(new);
                        if applied.is_ok() {
                            self.shared.stats.lock().unwrap().reconfigurations += 1;
                        }
                        applied
                    }
                    Ok(_) => {
                        warn!(
                            "contract violated (monitored {:.2}) but the best configuration \
                             is already active",
                            monitored
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                self.shared.set_state(ManagerState::Sampling);
                self.window.clear();
                self.elapsed_samples = 0;
                self.discard_left = self.params.samples_to_discard;
                self.publish_stats();
                result?;
            }
        }
        Ok(true)
    }

    /// The drain-reconfigure-resume cycle: adjust the worker lists, drain
    /// the pipeline through a sentinel, notify the surviving nodes,
    /// restart with the new worker count, reapply the core policies and
    /// finally the new frequency.
    fn change_configuration(&mut self, new: FarmConfiguration) -> Result<()> {
        let mut rollback_points: Vec<RollbackPoint> = vec![];
        if self.params.fast_reconfiguration {
            for &did in self.scalable_domains.iter() {
                let domain = self.cpufreq.domain(did)?;
                let rp = domain
                    .rollback_point()
                    .map_err(|e| Error::Fatal(format!("cannot snapshot domain {}: {}", did, e)))?;
                rollback_points.push(rp);
                self.raise_domain(domain)
                    .map_err(|e| Error::Fatal(format!("cannot raise domain {}: {}", did, e)))?;
            }
        }

        let old_workers = self.current.num_workers;
        let new_workers = new.num_workers;
        if new_workers < old_workers {
            for _ in 0..(old_workers - new_workers) {
                let slot = self.active.pop().unwrap();
                self.inactive.push(slot);
            }
        } else if new_workers > old_workers {
            // Threads may have migrated off cores that were unplugged, so
            // re-establish the whole placement before reactivating.
            self.repin_all_nodes()?;
            for _ in 0..(new_workers - old_workers) {
                let slot = self.inactive.remove(0);
                self.active.push(slot);
            }
        }

        self.update_used_cpus();

        // Drain: a sentinel from the emitter empties the pipeline, then
        // every active worker freezes. Not cancellable; it must complete.
        if let Some(em) = &self.emitter {
            em.node.produce_null();
        }
        self.farm
            .wait_freezing()
            .map_err(|e| Error::Fatal(format!("the farm did not freeze: {}", e)))?;

        // Only nodes of the new configuration learn about the change.
        if let Some(em) = &self.emitter {
            em.node.notify_workers_change(old_workers, new_workers);
        }
        for slot in self.active.iter() {
            slot.node.notify_workers_change(old_workers, new_workers);
        }
        if let Some(col) = &self.collector {
            col.node.notify_workers_change(old_workers, new_workers);
        }

        self.farm
            .run_then_freeze(new_workers)
            .map_err(|e| Error::Fatal(format!("the farm did not restart: {}", e)))?;

        self.apply_unused_policies()?;

        if self.params.frequency_strategy != FrequencyStrategy::None {
            if !rollback_points.is_empty() {
                self.cpufreq.rollback_all(&rollback_points)?;
            }
            self.update_scalable_domains();
            self.apply_frequency(new.frequency)?;
        } else if !rollback_points.is_empty() {
            self.cpufreq.rollback_all(&rollback_points)?;
        }

        self.current = new;
        self.publish_stats();
        Ok(())
    }
}
