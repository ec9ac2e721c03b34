// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Machine topology
//!
//! A [`Topology`] is a three-level tree of Cpu -> PhysicalCore ->
//! VirtualCore objects built from sysfs:
//!
//!```rust,ignore
//!                         Topology
//!                             |
//!      o----------------o    ...    o----------------o
//!      |      Cpu       |           |      Cpu       |
//!      | id   0         |           | id   1         |
//!      o----------------o           o----------------o
//!              |
//!      o----------------o    ...    o----------------o
//!      | PhysicalCore   |           | PhysicalCore   |
//!      | id   0         |           | id   7         |
//!      o----------------o           o----------------o
//!              |
//!      o----------------o    ...    o----------------o
//!      | VirtualCore    |           | VirtualCore    |
//!      | id   0         |           | id   15        |
//!      o----------------o           o----------------o
//!```
//!
//! A virtual core is a single OS-schedulable execution context (an SMT
//! thread); a physical core owns one or more of them; a Cpu is a package.
//! Identifiers are dense, stable for the lifetime of the `Topology` object
//! and globally unique across the machine. Comparing units from different
//! `Topology` instances is meaningless.
//!
//! Beyond enumeration, virtual cores expose hot-plugging, cpuidle levels,
//! idle-time accounting and a utilization spinner used to bias power
//! measurements and to verify governors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use glob::glob;
use log::warn;
use serde::{Deserialize, Serialize};
use sscanf::sscanf;

use crate::misc::{default_root, file_exists, read_file_string, read_from_file, write_to_file};
use crate::remote::{call, msg, Communicator};
use crate::task::pin_current_thread;
use crate::{Error, Result};

pub type CpuId = u32;
pub type PhysicalCoreId = u32;
pub type VirtualCoreId = u32;

/// Microseconds per USER_HZ tick in /proc/stat.
const JIFFY_US: u64 = 10_000;

#[derive(Clone)]
pub(crate) enum Backing {
    Local { root: PathBuf },
    Remote { comm: Arc<dyn Communicator> },
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Backing::Local { root } => write!(f, "Local({})", root.display()),
            Backing::Remote { .. } => write!(f, "Remote"),
        }
    }
}

pub(crate) fn unexpected_response(module: &str) -> Error {
    Error::Transport(format!("unexpected response variant from {} agent", module))
}

/// The topology of the machine. Exclusively owns its Cpu, PhysicalCore and
/// VirtualCore nodes; accessors hand out borrows, and the ids are the
/// stable way to refer to a node from elsewhere.
#[derive(Debug)]
pub struct Topology {
    cpus: Vec<Cpu>,
    nr_cpu_ids: usize,
}

#[derive(Debug)]
pub struct Cpu {
    id: CpuId,
    physical_cores: Vec<PhysicalCore>,
    backing: Backing,
}

#[derive(Debug)]
pub struct PhysicalCore {
    cpu_id: CpuId,
    id: PhysicalCoreId,
    /// core_id as reported by the kernel, unique only within the package.
    kernel_id: u32,
    virtual_cores: Vec<VirtualCore>,
}

pub struct VirtualCore {
    cpu_id: CpuId,
    physical_core_id: PhysicalCoreId,
    id: VirtualCoreId,
    hot_pluggable: bool,
    idle_levels: Vec<IdleLevel>,
    backing: Backing,
    spinner: Mutex<Option<Spinner>>,
    idle_baseline_us: AtomicU64,
}

impl fmt::Debug for VirtualCore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VirtualCore")
            .field("cpu_id", &self.cpu_id)
            .field("physical_core_id", &self.physical_core_id)
            .field("id", &self.id)
            .field("hot_pluggable", &self.hot_pluggable)
            .finish()
    }
}

/// One cpuidle state (C-state) of a virtual core. Time and count are
/// cumulative hardware values; `reset_time`/`reset_count` establish a
/// baseline so subsequent reads report deltas.
pub struct IdleLevel {
    vc_id: VirtualCoreId,
    level_id: u32,
    name: String,
    desc: String,
    enableable: bool,
    backing: Backing,
    time_baseline_us: AtomicU64,
    count_baseline: AtomicU64,
}

impl fmt::Debug for IdleLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IdleLevel")
            .field("vc_id", &self.vc_id)
            .field("level_id", &self.level_id)
            .field("name", &self.name)
            .finish()
    }
}

struct Spinner {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

fn start_spinner(vc_id: VirtualCoreId) -> Spinner {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let thread = std::thread::spawn(move || {
        if let Err(e) = pin_current_thread(vc_id) {
            warn!("utilization spinner could not pin to vc {}: {}", vc_id, e);
        }
        while !thread_stop.load(Ordering::Relaxed) {
            std::hint::spin_loop();
        }
    });
    Spinner { stop, thread }
}

fn cpu_dir(root: &PathBuf, vc: VirtualCoreId) -> PathBuf {
    PathBuf::from(format!(
        "{}/sys/devices/system/cpu/cpu{}",
        root.display(),
        vc
    ))
}

impl Topology {
    /// Builds the topology of this machine.
    pub fn new() -> Result<Self> {
        Self::with_root(default_root())
    }

    /// Builds a topology rooted at `root` instead of `/`.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let base = format!("{}/sys/devices/system/cpu", root.display());
        if !file_exists(std::path::Path::new(&base)) {
            return Err(Error::Unsupported(format!("{} not found", base)));
        }

        let mut vc_ids = vec![];
        let pattern = format!("{}/cpu[0-9]*", base);
        for path in glob(&pattern)
            .map_err(|e| Error::Fatal(format!("bad glob {}: {}", pattern, e)))?
            .filter_map(std::result::Result::ok)
        {
            let path_str = path.to_string_lossy();
            match sscanf!(&*path_str, "{str}/cpu{u32}") {
                Ok((_, id)) => vc_ids.push(id),
                Err(_) => {
                    return Err(Error::Fatal(format!("failed to parse cpu id {}", path_str)))
                }
            }
        }
        vc_ids.sort_unstable();
        if vc_ids.is_empty() {
            return Err(Error::Unsupported(format!("no cpus under {}", base)));
        }

        // (package, kernel core id) -> vcs, plus a dense physical core id
        // assigned in discovery order.
        let mut packages: BTreeMap<CpuId, BTreeMap<u32, Vec<VirtualCoreId>>> = BTreeMap::new();
        for &vc in vc_ids.iter() {
            let topo = cpu_dir(&root, vc).join("topology");
            let package_id: CpuId = match read_from_file(&topo.join("physical_package_id")) {
                Ok(id) => id,
                Err(e) => {
                    warn!("skipping cpu{}: {}", vc, e);
                    continue;
                }
            };
            let core_kernel_id: u32 = read_from_file(&topo.join("core_id"))?;
            packages
                .entry(package_id)
                .or_default()
                .entry(core_kernel_id)
                .or_default()
                .push(vc);
        }

        let backing = Backing::Local { root: root.clone() };
        let mut cpus = vec![];
        let mut next_core_id: PhysicalCoreId = 0;
        for (&package_id, cores) in packages.iter() {
            let mut physical_cores = vec![];
            for (&kernel_id, vcs) in cores.iter() {
                let virtual_cores = vcs
                    .iter()
                    .map(|&vc| VirtualCore::discover(package_id, next_core_id, vc, &root))
                    .collect::<Result<Vec<_>>>()?;
                physical_cores.push(PhysicalCore {
                    cpu_id: package_id,
                    id: next_core_id,
                    kernel_id,
                    virtual_cores,
                });
                next_core_id += 1;
            }
            cpus.push(Cpu {
                id: package_id,
                physical_cores,
                backing: backing.clone(),
            });
        }

        let nr_cpu_ids = *vc_ids.last().unwrap() as usize + 1;
        Ok(Topology { cpus, nr_cpu_ids })
    }

    /// Builds a topology that forwards every operation to a remote agent.
    pub fn remote(comm: Arc<dyn Communicator>) -> Result<Self> {
        let descs = match topology_call(comm.as_ref(), &TopologyRequest::Enumerate)? {
            TopologyResponse::Machine(descs) => descs,
            _ => return Err(unexpected_response("topology")),
        };
        let backing = Backing::Remote { comm };
        let mut nr_cpu_ids = 0;
        let mut cpus = vec![];
        for cpu_desc in descs {
            let mut physical_cores = vec![];
            for core_desc in cpu_desc.cores {
                let mut virtual_cores = vec![];
                for vc_desc in core_desc.vcs {
                    nr_cpu_ids = nr_cpu_ids.max(vc_desc.id as usize + 1);
                    let idle_levels = vc_desc
                        .idle_levels
                        .into_iter()
                        .map(|l| IdleLevel {
                            vc_id: vc_desc.id,
                            level_id: l.level_id,
                            name: l.name,
                            desc: l.desc,
                            enableable: l.enableable,
                            backing: backing.clone(),
                            time_baseline_us: AtomicU64::new(0),
                            count_baseline: AtomicU64::new(0),
                        })
                        .collect();
                    virtual_cores.push(VirtualCore {
                        cpu_id: cpu_desc.id,
                        physical_core_id: core_desc.id,
                        id: vc_desc.id,
                        hot_pluggable: vc_desc.hot_pluggable,
                        idle_levels,
                        backing: backing.clone(),
                        spinner: Mutex::new(None),
                        idle_baseline_us: AtomicU64::new(0),
                    });
                }
                physical_cores.push(PhysicalCore {
                    cpu_id: cpu_desc.id,
                    id: core_desc.id,
                    kernel_id: core_desc.id,
                    virtual_cores,
                });
            }
            cpus.push(Cpu {
                id: cpu_desc.id,
                physical_cores,
                backing: backing.clone(),
            });
        }
        Ok(Topology { cpus, nr_cpu_ids })
    }

    /// One past the highest virtual-core id; the width affinity masks for
    /// this machine need.
    pub fn nr_cpu_ids(&self) -> usize {
        self.nr_cpu_ids
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub fn cpu(&self, id: CpuId) -> Result<&Cpu> {
        self.cpus
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("no cpu {}", id)))
    }

    pub fn physical_cores(&self) -> Vec<&PhysicalCore> {
        self.cpus
            .iter()
            .flat_map(|c| c.physical_cores.iter())
            .collect()
    }

    pub fn physical_core(&self, id: PhysicalCoreId) -> Result<&PhysicalCore> {
        self.physical_cores()
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("no physical core {}", id)))
    }

    pub fn virtual_cores(&self) -> Vec<&VirtualCore> {
        self.cpus
            .iter()
            .flat_map(|c| c.physical_cores.iter())
            .flat_map(|p| p.virtual_cores.iter())
            .collect()
    }

    pub fn virtual_core(&self, id: VirtualCoreId) -> Result<&VirtualCore> {
        self.virtual_cores()
            .into_iter()
            .find(|v| v.id == id)
            .ok_or_else(|| Error::NotFound(format!("no virtual core {}", id)))
    }

    /// The distinct physical cores the given virtual cores belong to.
    pub fn virtual_to_physical(&self, vcs: &[VirtualCoreId]) -> Vec<PhysicalCoreId> {
        let mut out = vec![];
        for &vc in vcs {
            if let Ok(v) = self.virtual_core(vc) {
                if !out.contains(&v.physical_core_id) {
                    out.push(v.physical_core_id);
                }
            }
        }
        out
    }

    /// Spins every virtual core of the machine at 100% until
    /// [`Topology::reset_utilization`].
    pub fn maximize_utilization(&self) -> Result<()> {
        for vc in self.virtual_cores() {
            vc.maximize_utilization()?;
        }
        Ok(())
    }

    pub fn reset_utilization(&self) -> Result<()> {
        for vc in self.virtual_cores() {
            vc.reset_utilization()?;
        }
        Ok(())
    }

    fn describe(&self) -> Vec<CpuDesc> {
        self.cpus
            .iter()
            .map(|cpu| CpuDesc {
                id: cpu.id,
                cores: cpu
                    .physical_cores
                    .iter()
                    .map(|core| CoreDesc {
                        id: core.id,
                        vcs: core
                            .virtual_cores
                            .iter()
                            .map(|vc| VcDesc {
                                id: vc.id,
                                hot_pluggable: vc.hot_pluggable,
                                idle_levels: vc
                                    .idle_levels
                                    .iter()
                                    .map(|l| IdleLevelDesc {
                                        level_id: l.level_id,
                                        name: l.name.clone(),
                                        desc: l.desc.clone(),
                                        enableable: l.enableable,
                                    })
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn idle_level(&self, vc: VirtualCoreId, level: u32) -> Result<&IdleLevel> {
        self.virtual_core(vc)?
            .idle_levels
            .iter()
            .find(|l| l.level_id == level)
            .ok_or_else(|| Error::NotFound(format!("no idle level {} on vc {}", level, vc)))
    }

    /// Agent-side dispatch of one topology request.
    pub(crate) fn handle_request(&self, req: TopologyRequest) -> Result<TopologyResponse> {
        use TopologyRequest::*;
        Ok(match req {
            Enumerate => TopologyResponse::Machine(self.describe()),
            IsHotPlugged { vc } => TopologyResponse::Bool(self.virtual_core(vc)?.is_hot_plugged()?),
            HotPlug { vc } => {
                self.virtual_core(vc)?.hot_plug()?;
                TopologyResponse::Unit
            }
            HotUnplug { vc } => {
                self.virtual_core(vc)?.hot_unplug()?;
                TopologyResponse::Unit
            }
            MaximizeUtilization { vc } => {
                self.virtual_core(vc)?.maximize_utilization()?;
                TopologyResponse::Unit
            }
            ResetUtilization { vc } => {
                self.virtual_core(vc)?.reset_utilization()?;
                TopologyResponse::Unit
            }
            AbsoluteIdleTimeUs { vc } => {
                TopologyResponse::U64(self.virtual_core(vc)?.absolute_idle_time_us()?)
            }
            IdleLevelIsEnabled { vc, level } => {
                TopologyResponse::Bool(self.idle_level(vc, level)?.is_enabled()?)
            }
            IdleLevelEnable { vc, level } => {
                self.idle_level(vc, level)?.enable()?;
                TopologyResponse::Unit
            }
            IdleLevelDisable { vc, level } => {
                self.idle_level(vc, level)?.disable()?;
                TopologyResponse::Unit
            }
            IdleLevelExitLatencyUs { vc, level } => {
                TopologyResponse::U64(self.idle_level(vc, level)?.exit_latency_us()?)
            }
            IdleLevelConsumedPowerMw { vc, level } => {
                TopologyResponse::U64(self.idle_level(vc, level)?.consumed_power_mw()?)
            }
            IdleLevelAbsoluteTimeUs { vc, level } => {
                TopologyResponse::U64(self.idle_level(vc, level)?.absolute_time_us()?)
            }
            IdleLevelAbsoluteCount { vc, level } => {
                TopologyResponse::U64(self.idle_level(vc, level)?.absolute_count()?)
            }
            CpuVendorId { cpu } => TopologyResponse::Text(self.cpu(cpu)?.vendor_id()?),
            CpuFamily { cpu } => TopologyResponse::Text(self.cpu(cpu)?.family()?),
            CpuModel { cpu } => TopologyResponse::Text(self.cpu(cpu)?.model()?),
        })
    }
}

impl Cpu {
    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn physical_cores(&self) -> &[PhysicalCore] {
        &self.physical_cores
    }

    pub fn physical_core(&self, id: PhysicalCoreId) -> Option<&PhysicalCore> {
        self.physical_cores.iter().find(|p| p.id == id)
    }

    pub fn virtual_cores(&self) -> Vec<&VirtualCore> {
        self.physical_cores
            .iter()
            .flat_map(|p| p.virtual_cores.iter())
            .collect()
    }

    pub fn virtual_core(&self, id: VirtualCoreId) -> Option<&VirtualCore> {
        self.virtual_cores().into_iter().find(|v| v.id == id)
    }

    pub fn vendor_id(&self) -> Result<String> {
        self.cpuinfo_field("vendor_id")
    }

    pub fn family(&self) -> Result<String> {
        self.cpuinfo_field("cpu family")
    }

    pub fn model(&self) -> Result<String> {
        self.cpuinfo_field("model")
    }

    fn cpuinfo_field(&self, field: &str) -> Result<String> {
        match &self.backing {
            Backing::Local { root } => {
                let path = PathBuf::from(format!("{}/proc/cpuinfo", root.display()));
                let content = read_file_string(&path)?;
                cpuinfo_lookup(&content, self.id, field).ok_or_else(|| {
                    Error::NotFound(format!("no {:?} for cpu {} in cpuinfo", field, self.id))
                })
            }
            Backing::Remote { comm } => {
                let req = match field {
                    "vendor_id" => TopologyRequest::CpuVendorId { cpu: self.id },
                    "cpu family" => TopologyRequest::CpuFamily { cpu: self.id },
                    _ => TopologyRequest::CpuModel { cpu: self.id },
                };
                match topology_call(comm.as_ref(), &req)? {
                    TopologyResponse::Text(s) => Ok(s),
                    _ => Err(unexpected_response("topology")),
                }
            }
        }
    }

    pub fn maximize_utilization(&self) -> Result<()> {
        for vc in self.virtual_cores() {
            vc.maximize_utilization()?;
        }
        Ok(())
    }

    pub fn reset_utilization(&self) -> Result<()> {
        for vc in self.virtual_cores() {
            vc.reset_utilization()?;
        }
        Ok(())
    }
}

impl PhysicalCore {
    pub fn id(&self) -> PhysicalCoreId {
        self.id
    }

    pub fn cpu_id(&self) -> CpuId {
        self.cpu_id
    }

    pub fn kernel_id(&self) -> u32 {
        self.kernel_id
    }

    pub fn virtual_cores(&self) -> &[VirtualCore] {
        &self.virtual_cores
    }

    pub fn virtual_core(&self, id: VirtualCoreId) -> Option<&VirtualCore> {
        self.virtual_cores.iter().find(|v| v.id == id)
    }

    pub fn maximize_utilization(&self) -> Result<()> {
        for vc in self.virtual_cores.iter() {
            vc.maximize_utilization()?;
        }
        Ok(())
    }

    pub fn reset_utilization(&self) -> Result<()> {
        for vc in self.virtual_cores.iter() {
            vc.reset_utilization()?;
        }
        Ok(())
    }
}

impl VirtualCore {
    fn discover(
        cpu_id: CpuId,
        physical_core_id: PhysicalCoreId,
        id: VirtualCoreId,
        root: &PathBuf,
    ) -> Result<Self> {
        let dir = cpu_dir(root, id);
        let hot_pluggable = file_exists(&dir.join("online"));
        let backing = Backing::Local { root: root.clone() };

        let mut idle_levels = vec![];
        let pattern = format!("{}/cpuidle/state[0-9]*", dir.display());
        let mut level_dirs: Vec<(u32, PathBuf)> = vec![];
        if let Ok(paths) = glob(&pattern) {
            for path in paths.filter_map(std::result::Result::ok) {
                let path_str = path.to_string_lossy();
                if let Ok((_, level)) = sscanf!(&*path_str, "{str}/state{u32}") {
                    level_dirs.push((level, path.clone()));
                }
            }
        }
        level_dirs.sort_by_key(|(level, _)| *level);
        for (level, path) in level_dirs {
            idle_levels.push(IdleLevel {
                vc_id: id,
                level_id: level,
                name: read_file_string(&path.join("name"))?,
                desc: read_file_string(&path.join("desc")).unwrap_or_default(),
                enableable: file_exists(&path.join("disable")),
                backing: backing.clone(),
                time_baseline_us: AtomicU64::new(0),
                count_baseline: AtomicU64::new(0),
            });
        }

        Ok(VirtualCore {
            cpu_id,
            physical_core_id,
            id,
            hot_pluggable,
            idle_levels,
            backing,
            spinner: Mutex::new(None),
            idle_baseline_us: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> VirtualCoreId {
        self.id
    }

    pub fn physical_core_id(&self) -> PhysicalCoreId {
        self.physical_core_id
    }

    pub fn cpu_id(&self) -> CpuId {
        self.cpu_id
    }

    /// Ordered list of this core's idle levels (C-states), shallowest
    /// first. Empty when cpuidle is not available.
    pub fn idle_levels(&self) -> &[IdleLevel] {
        &self.idle_levels
    }

    pub fn is_hot_pluggable(&self) -> bool {
        self.hot_pluggable
    }

    /// True when the core is online, or when hot-plug is not supported at
    /// all (a core that cannot be unplugged is always running).
    pub fn is_hot_plugged(&self) -> Result<bool> {
        if !self.hot_pluggable {
            return Ok(true);
        }
        match &self.backing {
            Backing::Local { root } => {
                let online: u32 = read_from_file(&cpu_dir(root, self.id).join("online"))?;
                Ok(online == 1)
            }
            Backing::Remote { comm } => {
                match topology_call(comm.as_ref(), &TopologyRequest::IsHotPlugged { vc: self.id })?
                {
                    TopologyResponse::Bool(b) => Ok(b),
                    _ => Err(unexpected_response("topology")),
                }
            }
        }
    }

    /// Brings the core online. Idempotent; a no-op when hot-plug is not
    /// supported.
    pub fn hot_plug(&self) -> Result<()> {
        self.set_online(true, TopologyRequest::HotPlug { vc: self.id })
    }

    /// Takes the core offline. Idempotent; a no-op when hot-plug is not
    /// supported. Callers must not unplug the last online core of a Cpu.
    pub fn hot_unplug(&self) -> Result<()> {
        self.set_online(false, TopologyRequest::HotUnplug { vc: self.id })
    }

    fn set_online(&self, online: bool, req: TopologyRequest) -> Result<()> {
        if !self.hot_pluggable {
            return Ok(());
        }
        match &self.backing {
            Backing::Local { root } => write_to_file(
                &cpu_dir(root, self.id).join("online"),
                if online { "1" } else { "0" },
            ),
            Backing::Remote { comm } => match topology_call(comm.as_ref(), &req)? {
                TopologyResponse::Unit => Ok(()),
                _ => Err(unexpected_response("topology")),
            },
        }
    }

    /// Keeps this core 100% busy with a pinned spinner thread until
    /// [`VirtualCore::reset_utilization`]. Idempotent.
    pub fn maximize_utilization(&self) -> Result<()> {
        match &self.backing {
            Backing::Local { .. } => {
                let mut spinner = self.spinner.lock().unwrap();
                if spinner.is_none() {
                    *spinner = Some(start_spinner(self.id));
                }
                Ok(())
            }
            Backing::Remote { comm } => {
                match topology_call(
                    comm.as_ref(),
                    &TopologyRequest::MaximizeUtilization { vc: self.id },
                )? {
                    TopologyResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("topology")),
                }
            }
        }
    }

    /// Stops the utilization spinner, if any.
    pub fn reset_utilization(&self) -> Result<()> {
        match &self.backing {
            Backing::Local { .. } => {
                let spinner = self.spinner.lock().unwrap().take();
                if let Some(spinner) = spinner {
                    spinner.stop.store(true, Ordering::Relaxed);
                    let _ = spinner.thread.join();
                }
                Ok(())
            }
            Backing::Remote { comm } => {
                match topology_call(
                    comm.as_ref(),
                    &TopologyRequest::ResetUtilization { vc: self.id },
                )? {
                    TopologyResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("topology")),
                }
            }
        }
    }

    /// Cumulative idle microseconds as accounted in /proc/stat.
    pub fn absolute_idle_time_us(&self) -> Result<u64> {
        match &self.backing {
            Backing::Local { root } => {
                let path = PathBuf::from(format!("{}/proc/stat", root.display()));
                let content = read_file_string(&path)?;
                let needle = format!("cpu{} ", self.id);
                for line in content.lines() {
                    if let Some(rest) = line.strip_prefix(&needle) {
                        let fields: Vec<&str> = rest.split_whitespace().collect();
                        let idle: u64 = fields.get(3).unwrap_or(&"0").parse().map_err(|e| {
                            Error::Fatal(format!("bad idle field in /proc/stat: {}", e))
                        })?;
                        return Ok(idle * JIFFY_US);
                    }
                }
                Err(Error::NotFound(format!(
                    "cpu{} not present in /proc/stat",
                    self.id
                )))
            }
            Backing::Remote { comm } => {
                match topology_call(
                    comm.as_ref(),
                    &TopologyRequest::AbsoluteIdleTimeUs { vc: self.id },
                )? {
                    TopologyResponse::U64(v) => Ok(v),
                    _ => Err(unexpected_response("topology")),
                }
            }
        }
    }

    /// Idle microseconds since the last [`VirtualCore::reset_idle_time`].
    pub fn idle_time_us(&self) -> Result<u64> {
        let abs = self.absolute_idle_time_us()?;
        Ok(abs.saturating_sub(self.idle_baseline_us.load(Ordering::Relaxed)))
    }

    pub fn reset_idle_time(&self) -> Result<()> {
        let abs = self.absolute_idle_time_us()?;
        self.idle_baseline_us.store(abs, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for VirtualCore {
    fn drop(&mut self) {
        if let Some(spinner) = self.spinner.get_mut().unwrap().take() {
            spinner.stop.store(true, Ordering::Relaxed);
            let _ = spinner.thread.join();
        }
    }
}

impl IdleLevel {
    pub fn virtual_core_id(&self) -> VirtualCoreId {
        self.vc_id
    }

    pub fn level_id(&self) -> u32 {
        self.level_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn is_enableable(&self) -> bool {
        self.enableable
    }

    fn state_path(&self, root: &PathBuf, file: &str) -> PathBuf {
        cpu_dir(root, self.vc_id)
            .join("cpuidle")
            .join(format!("state{}", self.level_id))
            .join(file)
    }

    fn read_u64(&self, file: &str, req: TopologyRequest) -> Result<u64> {
        match &self.backing {
            Backing::Local { root } => read_from_file(&self.state_path(root, file)),
            Backing::Remote { comm } => match topology_call(comm.as_ref(), &req)? {
                TopologyResponse::U64(v) => Ok(v),
                _ => Err(unexpected_response("topology")),
            },
        }
    }

    pub fn is_enabled(&self) -> Result<bool> {
        match &self.backing {
            Backing::Local { root } => {
                let disabled: u32 = read_from_file(&self.state_path(root, "disable"))?;
                Ok(disabled == 0)
            }
            Backing::Remote { comm } => {
                match topology_call(
                    comm.as_ref(),
                    &TopologyRequest::IdleLevelIsEnabled {
                        vc: self.vc_id,
                        level: self.level_id,
                    },
                )? {
                    TopologyResponse::Bool(b) => Ok(b),
                    _ => Err(unexpected_response("topology")),
                }
            }
        }
    }

    /// May fail with [`Error::Unsupported`] when the platform forbids it.
    pub fn enable(&self) -> Result<()> {
        self.set_disabled(false)
    }

    /// May fail with [`Error::Unsupported`] when the platform forbids it.
    pub fn disable(&self) -> Result<()> {
        self.set_disabled(true)
    }

    fn set_disabled(&self, disabled: bool) -> Result<()> {
        if !self.enableable {
            return Err(Error::Unsupported(format!(
                "idle level {} of vc {} cannot be toggled",
                self.level_id, self.vc_id
            )));
        }
        match &self.backing {
            Backing::Local { root } => write_to_file(
                &self.state_path(root, "disable"),
                if disabled { "1" } else { "0" },
            ),
            Backing::Remote { comm } => {
                let req = if disabled {
                    TopologyRequest::IdleLevelDisable {
                        vc: self.vc_id,
                        level: self.level_id,
                    }
                } else {
                    TopologyRequest::IdleLevelEnable {
                        vc: self.vc_id,
                        level: self.level_id,
                    }
                };
                match topology_call(comm.as_ref(), &req)? {
                    TopologyResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("topology")),
                }
            }
        }
    }

    pub fn exit_latency_us(&self) -> Result<u64> {
        self.read_u64(
            "latency",
            TopologyRequest::IdleLevelExitLatencyUs {
                vc: self.vc_id,
                level: self.level_id,
            },
        )
    }

    pub fn consumed_power_mw(&self) -> Result<u64> {
        self.read_u64(
            "power",
            TopologyRequest::IdleLevelConsumedPowerMw {
                vc: self.vc_id,
                level: self.level_id,
            },
        )
    }

    /// Cumulative residency. Updated by the kernel only on level changes,
    /// so it can lag slightly.
    pub fn absolute_time_us(&self) -> Result<u64> {
        self.read_u64(
            "time",
            TopologyRequest::IdleLevelAbsoluteTimeUs {
                vc: self.vc_id,
                level: self.level_id,
            },
        )
    }

    /// Residency since the last [`IdleLevel::reset_time`].
    pub fn time_us(&self) -> Result<u64> {
        let abs = self.absolute_time_us()?;
        Ok(abs.saturating_sub(self.time_baseline_us.load(Ordering::Relaxed)))
    }

    pub fn reset_time(&self) -> Result<()> {
        let abs = self.absolute_time_us()?;
        self.time_baseline_us.store(abs, Ordering::Relaxed);
        Ok(())
    }

    pub fn absolute_count(&self) -> Result<u64> {
        self.read_u64(
            "usage",
            TopologyRequest::IdleLevelAbsoluteCount {
                vc: self.vc_id,
                level: self.level_id,
            },
        )
    }

    /// Entries since the last [`IdleLevel::reset_count`].
    pub fn count(&self) -> Result<u64> {
        let abs = self.absolute_count()?;
        Ok(abs.saturating_sub(self.count_baseline.load(Ordering::Relaxed)))
    }

    pub fn reset_count(&self) -> Result<()> {
        let abs = self.absolute_count()?;
        self.count_baseline.store(abs, Ordering::Relaxed);
        Ok(())
    }
}

// Unit equality is identifier equality, meaningful only within one
// topology instance.
impl PartialEq for Cpu {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Cpu {}

impl PartialEq for PhysicalCore {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for PhysicalCore {}

impl PartialEq for VirtualCore {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for VirtualCore {}

fn cpuinfo_lookup(content: &str, cpu_id: CpuId, field: &str) -> Option<String> {
    let mut fallback = None;
    for block in content.split("\n\n") {
        let mut physical_id = None;
        let mut value = None;
        for line in block.lines() {
            let (key, val) = match line.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            };
            if key == "physical id" {
                physical_id = val.parse::<CpuId>().ok();
            }
            if key == field {
                value = Some(val.to_string());
            }
        }
        if fallback.is_none() {
            fallback = value.clone();
        }
        if physical_id == Some(cpu_id) && value.is_some() {
            return value;
        }
    }
    fallback
}

fn topology_call(comm: &dyn Communicator, req: &TopologyRequest) -> Result<TopologyResponse> {
    call(comm, msg::TOPOLOGY_REQUEST, msg::TOPOLOGY_RESPONSE, req)
}

#[derive(Debug, Serialize, Deserialize)]
pub enum TopologyRequest {
    Enumerate,
    IsHotPlugged { vc: VirtualCoreId },
    HotPlug { vc: VirtualCoreId },
    HotUnplug { vc: VirtualCoreId },
    MaximizeUtilization { vc: VirtualCoreId },
    ResetUtilization { vc: VirtualCoreId },
    AbsoluteIdleTimeUs { vc: VirtualCoreId },
    IdleLevelIsEnabled { vc: VirtualCoreId, level: u32 },
    IdleLevelEnable { vc: VirtualCoreId, level: u32 },
    IdleLevelDisable { vc: VirtualCoreId, level: u32 },
    IdleLevelExitLatencyUs { vc: VirtualCoreId, level: u32 },
    IdleLevelConsumedPowerMw { vc: VirtualCoreId, level: u32 },
    IdleLevelAbsoluteTimeUs { vc: VirtualCoreId, level: u32 },
    IdleLevelAbsoluteCount { vc: VirtualCoreId, level: u32 },
    CpuVendorId { cpu: CpuId },
    CpuFamily { cpu: CpuId },
    CpuModel { cpu: CpuId },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum TopologyResponse {
    Machine(Vec<CpuDesc>),
    Bool(bool),
    U64(u64),
    Text(String),
    Unit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CpuDesc {
    pub id: CpuId,
    pub cores: Vec<CoreDesc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CoreDesc {
    pub id: PhysicalCoreId,
    pub vcs: Vec<VcDesc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VcDesc {
    pub id: VirtualCoreId,
    pub hot_pluggable: bool,
    pub idle_levels: Vec<IdleLevelDesc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdleLevelDesc {
    pub level_id: u32,
    pub name: String,
    pub desc: String,
    pub enableable: bool,
}
