// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy counters and power capping
//!
//! Energy is read from the powercap RAPL sysfs tree. Each package zone
//! (`intel-rapl:N`, named `package-N`) accumulates joules for one CPU
//! socket, with optional sub-zones for the cores, the integrated graphics
//! and the DRAM controller.
//!
//! The raw hardware counters wrap; a background refresher samples every
//! counter at a period strictly below the wrapping interval and folds the
//! deltas into 64-bit accumulators, so the values handed out by
//! [`CounterCpus`] are monotonically non-decreasing between resets. The
//! refresher starts on first use of a counter and stops when the counter
//! is dropped. Readers and the refresher share one lock per counter.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use glob::glob;
use log::warn;
use serde::{Deserialize, Serialize};
use sscanf::sscanf;

use crate::misc::{default_root, file_exists, read_file_string, read_from_file, write_to_file};
use crate::remote::{call, msg, Communicator};
use crate::topology::{unexpected_response, CpuId};
use crate::{Error, Result};

pub type Joules = f64;

/// Raw RAPL counters are assumed to wrap no faster than this; the
/// refresher polls at half this period.
pub const DEFAULT_WRAPPING_INTERVAL: Duration = Duration::from_secs(10);

/// The joules consumed by one CPU package and its components since the
/// counter was created or last reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JoulesCpu {
    /// Whole package.
    pub cpu: Joules,
    /// Cores only (PP0).
    pub cores: Joules,
    /// Integrated graphics (PP1).
    pub graphic: Joules,
    /// DRAM controller.
    pub dram: Joules,
}

impl JoulesCpu {
    pub fn zero(&mut self) {
        *self = JoulesCpu::default();
    }
}

impl AddAssign for JoulesCpu {
    fn add_assign(&mut self, rhs: Self) {
        self.cpu += rhs.cpu;
        self.cores += rhs.cores;
        self.graphic += rhs.graphic;
        self.dram += rhs.dram;
    }
}

impl Add for JoulesCpu {
    type Output = JoulesCpu;

    fn add(mut self, rhs: Self) -> JoulesCpu {
        self += rhs;
        self
    }
}

impl fmt::Display for JoulesCpu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cpu {:.3} J, cores {:.3} J, graphic {:.3} J, dram {:.3} J",
            self.cpu, self.cores, self.graphic, self.dram
        )
    }
}

/// Counter precision classes, most precise first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterType {
    /// Per-package CPU counters (optionally with per-component detail).
    Cpus,
    /// DRAM energy only.
    Memory,
    /// Total energy at the wall plug.
    Plug,
}

/// One wrap-corrected accumulator over a powercap energy file.
struct ComponentAccum {
    path: PathBuf,
    max_range_uj: u64,
    last_uj: u64,
    acc_uj: u64,
}

impl ComponentAccum {
    fn new(zone: &PathBuf) -> Result<Self> {
        let path = zone.join("energy_uj");
        let max_range_uj = read_from_file(&zone.join("max_energy_range_uj"))?;
        let last_uj = read_from_file(&path)?;
        Ok(ComponentAccum {
            path,
            max_range_uj,
            last_uj,
            acc_uj: 0,
        })
    }

    fn refresh(&mut self) -> Result<()> {
        let cur: u64 = read_from_file(&self.path)?;
        if cur >= self.last_uj {
            self.acc_uj += cur - self.last_uj;
        } else {
            self.acc_uj += (self.max_range_uj - self.last_uj) + cur;
        }
        self.last_uj = cur;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.last_uj = read_from_file(&self.path)?;
        self.acc_uj = 0;
        Ok(())
    }

    fn joules(&self) -> Joules {
        self.acc_uj as Joules / 1_000_000.0
    }
}

struct PackageAccum {
    cpu_id: CpuId,
    package: ComponentAccum,
    cores: Option<ComponentAccum>,
    graphic: Option<ComponentAccum>,
    dram: Option<ComponentAccum>,
}

impl PackageAccum {
    fn refresh(&mut self) -> Result<()> {
        self.package.refresh()?;
        for sub in [&mut self.cores, &mut self.graphic, &mut self.dram]
            .into_iter()
            .flatten()
        {
            sub.refresh()?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.package.reset()?;
        for sub in [&mut self.cores, &mut self.graphic, &mut self.dram]
            .into_iter()
            .flatten()
        {
            sub.reset()?;
        }
        Ok(())
    }

    fn components(&self) -> JoulesCpu {
        JoulesCpu {
            cpu: self.package.joules(),
            cores: self.cores.as_ref().map(|c| c.joules()).unwrap_or(0.0),
            graphic: self.graphic.as_ref().map(|c| c.joules()).unwrap_or(0.0),
            dram: self.dram.as_ref().map(|c| c.joules()).unwrap_or(0.0),
        }
    }
}

struct CpusInner {
    packages: Mutex<Vec<PackageAccum>>,
    stop: Mutex<bool>,
    cond: Condvar,
    refresh_interval: Duration,
}

impl CpusInner {
    fn refresh_all(packages: &mut [PackageAccum]) -> Result<()> {
        for package in packages.iter_mut() {
            package.refresh()?;
        }
        Ok(())
    }
}

enum CpusBacking {
    Local {
        inner: Arc<CpusInner>,
        refresher: Mutex<Option<JoinHandle<()>>>,
        has_cores: bool,
        has_graphic: bool,
        has_dram: bool,
    },
    Remote {
        comm: Arc<dyn Communicator>,
        cpu_ids: Vec<CpuId>,
        has_cores: bool,
        has_graphic: bool,
        has_dram: bool,
    },
}

/// Per-package energy counters for every CPU socket of the machine.
pub struct CounterCpus {
    backing: CpusBacking,
}

impl fmt::Debug for CounterCpus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CounterCpus")
            .field("cpu_ids", &self.cpu_ids())
            .field("has_cores", &self.has_cores())
            .field("has_graphic", &self.has_graphic())
            .field("has_dram", &self.has_dram())
            .finish()
    }
}

fn rapl_base(root: &PathBuf) -> String {
    format!(
        "{}/sys/devices/virtual/powercap/intel-rapl",
        root.display()
    )
}

fn discover_packages(root: &PathBuf) -> Result<Vec<(CpuId, PathBuf)>> {
    let base = rapl_base(root);
    if !file_exists(std::path::Path::new(&base)) {
        return Err(Error::Unsupported(format!("{} not found", base)));
    }
    let pattern = format!("{}/intel-rapl:[0-9]*", base);
    let mut packages = vec![];
    for path in glob(&pattern)
        .map_err(|e| Error::Fatal(format!("bad glob {}: {}", pattern, e)))?
        .filter_map(std::result::Result::ok)
    {
        // Sub-zones also match the pattern; keep only intel-rapl:N.
        let path_str = path.to_string_lossy();
        if sscanf!(&*path_str, "{str}/intel-rapl:{u32}").is_err() {
            continue;
        }
        let name = read_file_string(&path.join("name"))?;
        if let Some(id) = name.strip_prefix("package-") {
            let cpu_id: CpuId = id.parse().map_err(|e| {
                Error::Fatal(format!("bad package zone name {:?}: {}", name, e))
            })?;
            packages.push((cpu_id, path.clone()));
        }
    }
    if packages.is_empty() {
        return Err(Error::Unsupported(format!(
            "no package zones under {}",
            base
        )));
    }
    packages.sort_by_key(|(id, _)| *id);
    Ok(packages)
}

fn find_subzone(package_path: &PathBuf, wanted: &str) -> Option<PathBuf> {
    let pattern = format!("{}:[0-9]*", package_path.display());
    for path in glob(&pattern).ok()?.filter_map(std::result::Result::ok) {
        if let Ok(name) = read_file_string(&path.join("name")) {
            if name == wanted {
                return Some(path);
            }
        }
    }
    None
}

impl CounterCpus {
    pub(crate) fn discover(root: &PathBuf, refresh_interval: Duration) -> Result<Self> {
        let mut accums = vec![];
        for (cpu_id, package_path) in discover_packages(root)? {
            let cores = find_subzone(&package_path, "core")
                .map(|p| ComponentAccum::new(&p))
                .transpose()?;
            let graphic = find_subzone(&package_path, "uncore")
                .map(|p| ComponentAccum::new(&p))
                .transpose()?;
            let dram = find_subzone(&package_path, "dram")
                .map(|p| ComponentAccum::new(&p))
                .transpose()?;
            accums.push(PackageAccum {
                cpu_id,
                package: ComponentAccum::new(&package_path)?,
                cores,
                graphic,
                dram,
            });
        }
        let has_cores = accums.iter().all(|p| p.cores.is_some());
        let has_graphic = accums.iter().all(|p| p.graphic.is_some());
        let has_dram = accums.iter().all(|p| p.dram.is_some());
        Ok(CounterCpus {
            backing: CpusBacking::Local {
                inner: Arc::new(CpusInner {
                    packages: Mutex::new(accums),
                    stop: Mutex::new(false),
                    cond: Condvar::new(),
                    refresh_interval,
                }),
                refresher: Mutex::new(None),
                has_cores,
                has_graphic,
                has_dram,
            },
        })
    }

    /// The refresher must run with a period below this to never miss a
    /// counter wrap.
    pub fn wrapping_interval(&self) -> Duration {
        DEFAULT_WRAPPING_INTERVAL
    }

    fn ensure_refresher(&self) {
        if let CpusBacking::Local { inner, refresher, .. } = &self.backing {
            let mut refresher = refresher.lock().unwrap();
            if refresher.is_some() {
                return;
            }
            let inner = inner.clone();
            *refresher = Some(std::thread::spawn(move || loop {
                {
                    let stopped = inner.stop.lock().unwrap();
                    let (stopped, _) = inner
                        .cond
                        .wait_timeout(stopped, inner.refresh_interval)
                        .unwrap();
                    if *stopped {
                        break;
                    }
                }
                let mut packages = inner.packages.lock().unwrap();
                if let Err(e) = CpusInner::refresh_all(&mut packages) {
                    warn!("energy refresher: {}", e);
                }
            }));
        }
    }

    pub fn cpu_ids(&self) -> Vec<CpuId> {
        match &self.backing {
            CpusBacking::Local { inner, .. } => inner
                .packages
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.cpu_id)
                .collect(),
            CpusBacking::Remote { cpu_ids, .. } => cpu_ids.clone(),
        }
    }

    pub fn has_cores(&self) -> bool {
        match &self.backing {
            CpusBacking::Local { has_cores, .. } => *has_cores,
            CpusBacking::Remote { has_cores, .. } => *has_cores,
        }
    }

    pub fn has_graphic(&self) -> bool {
        match &self.backing {
            CpusBacking::Local { has_graphic, .. } => *has_graphic,
            CpusBacking::Remote { has_graphic, .. } => *has_graphic,
        }
    }

    pub fn has_dram(&self) -> bool {
        match &self.backing {
            CpusBacking::Local { has_dram, .. } => *has_dram,
            CpusBacking::Remote { has_dram, .. } => *has_dram,
        }
    }

    fn with_package<T>(&self, cpu: CpuId, f: impl Fn(&PackageAccum) -> T) -> Result<T> {
        match &self.backing {
            CpusBacking::Local { inner, .. } => {
                self.ensure_refresher();
                let mut packages = inner.packages.lock().unwrap();
                CpusInner::refresh_all(&mut packages)?;
                packages
                    .iter()
                    .find(|p| p.cpu_id == cpu)
                    .map(f)
                    .ok_or_else(|| Error::NotFound(format!("no energy counter for cpu {}", cpu)))
            }
            CpusBacking::Remote { .. } => unreachable!("remote paths handled by callers"),
        }
    }

    fn remote_joules(&self, req: EnergyRequest) -> Result<Joules> {
        match &self.backing {
            CpusBacking::Remote { comm, .. } => match energy_call(comm, &req)? {
                EnergyResponse::Joules(j) => Ok(j),
                _ => Err(unexpected_response("energy")),
            },
            CpusBacking::Local { .. } => unreachable!("local paths handled by callers"),
        }
    }

    /// The joules consumed by one package and its components since the
    /// counter creation or the last [`CounterCpus::reset`].
    pub fn read_components(&self, cpu: CpuId) -> Result<JoulesCpu> {
        match &self.backing {
            CpusBacking::Local { .. } => self.with_package(cpu, |p| p.components()),
            CpusBacking::Remote { comm, .. } => {
                match energy_call(comm, &EnergyRequest::CpusReadComponents { cpu })? {
                    EnergyResponse::JoulesComponents(j) => Ok(j),
                    _ => Err(unexpected_response("energy")),
                }
            }
        }
    }

    pub fn read_components_all(&self) -> Result<JoulesCpu> {
        let mut total = JoulesCpu::default();
        for cpu in self.cpu_ids() {
            total += self.read_components(cpu)?;
        }
        Ok(total)
    }

    pub fn read_cpu(&self, cpu: CpuId) -> Result<Joules> {
        match &self.backing {
            CpusBacking::Local { .. } => self.with_package(cpu, |p| p.package.joules()),
            CpusBacking::Remote { .. } => self.remote_joules(EnergyRequest::CpusReadCpu { cpu }),
        }
    }

    pub fn read_cpu_all(&self) -> Result<Joules> {
        let mut total = 0.0;
        for cpu in self.cpu_ids() {
            total += self.read_cpu(cpu)?;
        }
        Ok(total)
    }

    fn check_component(&self, present: bool, what: &str) -> Result<()> {
        if present {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("no {} energy counter", what)))
        }
    }

    pub fn read_cores(&self, cpu: CpuId) -> Result<Joules> {
        self.check_component(self.has_cores(), "cores")?;
        match &self.backing {
            CpusBacking::Local { .. } => {
                self.with_package(cpu, |p| p.cores.as_ref().map(|c| c.joules()).unwrap_or(0.0))
            }
            CpusBacking::Remote { .. } => self.remote_joules(EnergyRequest::CpusReadCores { cpu }),
        }
    }

    pub fn read_cores_all(&self) -> Result<Joules> {
        let mut total = 0.0;
        for cpu in self.cpu_ids() {
            total += self.read_cores(cpu)?;
        }
        Ok(total)
    }

    pub fn read_graphic(&self, cpu: CpuId) -> Result<Joules> {
        self.check_component(self.has_graphic(), "graphic")?;
        match &self.backing {
            CpusBacking::Local { .. } => self.with_package(cpu, |p| {
                p.graphic.as_ref().map(|c| c.joules()).unwrap_or(0.0)
            }),
            CpusBacking::Remote { .. } => {
                self.remote_joules(EnergyRequest::CpusReadGraphic { cpu })
            }
        }
    }

    pub fn read_graphic_all(&self) -> Result<Joules> {
        let mut total = 0.0;
        for cpu in self.cpu_ids() {
            total += self.read_graphic(cpu)?;
        }
        Ok(total)
    }

    pub fn read_dram(&self, cpu: CpuId) -> Result<Joules> {
        self.check_component(self.has_dram(), "dram")?;
        match &self.backing {
            CpusBacking::Local { .. } => {
                self.with_package(cpu, |p| p.dram.as_ref().map(|c| c.joules()).unwrap_or(0.0))
            }
            CpusBacking::Remote { .. } => self.remote_joules(EnergyRequest::CpusReadDram { cpu }),
        }
    }

    pub fn read_dram_all(&self) -> Result<Joules> {
        let mut total = 0.0;
        for cpu in self.cpu_ids() {
            total += self.read_dram(cpu)?;
        }
        Ok(total)
    }

    /// Zeros the tracked deltas. A read immediately after a reset is not
    /// guaranteed to be exactly zero, hardware ticks during the call.
    pub fn reset(&self) -> Result<()> {
        match &self.backing {
            CpusBacking::Local { inner, .. } => {
                self.ensure_refresher();
                let mut packages = inner.packages.lock().unwrap();
                for p in packages.iter_mut() {
                    p.reset()?;
                }
                Ok(())
            }
            CpusBacking::Remote { comm, .. } => {
                match energy_call(comm, &EnergyRequest::CpusReset)? {
                    EnergyResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("energy")),
                }
            }
        }
    }
}

impl Drop for CounterCpus {
    fn drop(&mut self) {
        if let CpusBacking::Local { inner, refresher, .. } = &self.backing {
            let handle = refresher.lock().unwrap().take();
            if let Some(handle) = handle {
                *inner.stop.lock().unwrap() = true;
                inner.cond.notify_all();
                let _ = handle.join();
            }
        }
    }
}

enum MemoryBacking {
    /// A private CPU counter so memory resets do not disturb the package
    /// counter handed out by [`Energy::counter_cpus`].
    Local(CounterCpus),
    Remote(Arc<dyn Communicator>),
}

/// DRAM-only energy counter.
pub struct CounterMemory {
    backing: MemoryBacking,
}

impl CounterMemory {
    pub fn joules(&self) -> Result<Joules> {
        match &self.backing {
            MemoryBacking::Local(cpus) => cpus.read_dram_all(),
            MemoryBacking::Remote(comm) => match energy_call(comm, &EnergyRequest::MemoryJoules)? {
                EnergyResponse::Joules(j) => Ok(j),
                _ => Err(unexpected_response("energy")),
            },
        }
    }

    pub fn reset(&self) -> Result<()> {
        match &self.backing {
            MemoryBacking::Local(cpus) => cpus.reset(),
            MemoryBacking::Remote(comm) => match energy_call(comm, &EnergyRequest::MemoryReset)? {
                EnergyResponse::Unit => Ok(()),
                _ => Err(unexpected_response("energy")),
            },
        }
    }
}

/// Wall-plug counter. No local back-end exists; plug meters are reachable
/// only through a remote agent that has one.
pub struct CounterPlug {
    comm: Arc<dyn Communicator>,
}

impl CounterPlug {
    pub fn joules(&self) -> Result<Joules> {
        match energy_call(&self.comm, &EnergyRequest::PlugJoules)? {
            EnergyResponse::Joules(j) => Ok(j),
            _ => Err(unexpected_response("energy")),
        }
    }

    pub fn reset(&self) -> Result<()> {
        match energy_call(&self.comm, &EnergyRequest::PlugReset)? {
            EnergyResponse::Unit => Ok(()),
            _ => Err(unexpected_response("energy")),
        }
    }
}

/// The most precise counter available, as a tagged variant sharing the
/// `{joules, reset, type}` operation set.
pub enum Counter {
    Cpus(Arc<CounterCpus>),
    Memory(Arc<CounterMemory>),
    Plug(Arc<CounterPlug>),
}

impl Counter {
    pub fn joules(&self) -> Result<Joules> {
        match self {
            Counter::Cpus(c) => c.read_cpu_all(),
            Counter::Memory(c) => c.joules(),
            Counter::Plug(c) => c.joules(),
        }
    }

    pub fn reset(&self) -> Result<()> {
        match self {
            Counter::Cpus(c) => c.reset(),
            Counter::Memory(c) => c.reset(),
            Counter::Plug(c) => c.reset(),
        }
    }

    pub fn counter_type(&self) -> CounterType {
        match self {
            Counter::Cpus(_) => CounterType::Cpus,
            Counter::Memory(_) => CounterType::Memory,
            Counter::Plug(_) => CounterType::Plug,
        }
    }
}

/// A power cap: a sustained-power limit over an averaging window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerCap {
    pub watts: f64,
    pub window_secs: f64,
}

enum CapperBacking {
    Local { sockets: Vec<PathBuf> },
    Remote { comm: Arc<dyn Communicator>, sockets: usize },
}

/// RAPL power capping, two independently configurable windows per socket.
pub struct PowerCapper {
    backing: CapperBacking,
}

impl PowerCapper {
    pub fn sockets(&self) -> usize {
        match &self.backing {
            CapperBacking::Local { sockets } => sockets.len(),
            CapperBacking::Remote { sockets, .. } => *sockets,
        }
    }

    fn socket_path(&self, socket: u32) -> Result<&PathBuf> {
        match &self.backing {
            CapperBacking::Local { sockets } => {
                sockets.get(socket as usize).ok_or_else(|| {
                    Error::Unsupported(format!("no socket {} on this machine", socket))
                })
            }
            CapperBacking::Remote { .. } => unreachable!("remote paths handled by callers"),
        }
    }

    fn check_window(window: u32) -> Result<()> {
        if window > 1 {
            return Err(Error::InvalidArgument(format!(
                "power cap window {} (only 0 and 1 exist)",
                window
            )));
        }
        Ok(())
    }

    pub fn get(&self, socket: u32, window: u32) -> Result<PowerCap> {
        Self::check_window(window)?;
        match &self.backing {
            CapperBacking::Local { .. } => {
                let path = self.socket_path(socket)?;
                let uw: u64 =
                    read_from_file(&path.join(format!("constraint_{}_power_limit_uw", window)))?;
                let us: u64 =
                    read_from_file(&path.join(format!("constraint_{}_time_window_us", window)))?;
                Ok(PowerCap {
                    watts: uw as f64 / 1e6,
                    window_secs: us as f64 / 1e6,
                })
            }
            CapperBacking::Remote { comm, .. } => {
                match energy_call(comm, &EnergyRequest::CapGet { socket, window })? {
                    EnergyResponse::Cap(cap) => Ok(cap),
                    _ => Err(unexpected_response("energy")),
                }
            }
        }
    }

    /// Sets one window of one socket. Watts clamp to the hardware bound of
    /// the window. A missing socket is unsupported.
    pub fn set(&self, socket: u32, window: u32, cap: PowerCap) -> Result<()> {
        Self::check_window(window)?;
        if cap.watts < 0.0 || cap.window_secs < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "negative power cap {:?}",
                cap
            )));
        }
        match &self.backing {
            CapperBacking::Local { .. } => {
                let path = self.socket_path(socket)?;
                let mut uw = (cap.watts * 1e6) as u64;
                let max_path = path.join(format!("constraint_{}_max_power_uw", window));
                if file_exists(&max_path) {
                    let max_uw: u64 = read_from_file(&max_path)?;
                    uw = uw.min(max_uw);
                }
                write_to_file(
                    &path.join(format!("constraint_{}_power_limit_uw", window)),
                    &uw.to_string(),
                )?;
                write_to_file(
                    &path.join(format!("constraint_{}_time_window_us", window)),
                    &(((cap.window_secs * 1e6) as u64).to_string()),
                )
            }
            CapperBacking::Remote { comm, .. } => {
                match energy_call(comm, &EnergyRequest::CapSet { socket, window, cap })? {
                    EnergyResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("energy")),
                }
            }
        }
    }

    /// Sets a machine-wide cap: the watts are split equally across the
    /// sockets and applied to both windows of each.
    pub fn set_all(&self, cap: PowerCap) -> Result<()> {
        match &self.backing {
            CapperBacking::Local { sockets } => {
                let per_socket = PowerCap {
                    watts: cap.watts / sockets.len() as f64,
                    window_secs: cap.window_secs,
                };
                for socket in 0..sockets.len() as u32 {
                    for window in 0..2 {
                        self.set(socket, window, per_socket)?;
                    }
                }
                Ok(())
            }
            CapperBacking::Remote { comm, .. } => {
                match energy_call(comm, &EnergyRequest::CapSetAll { cap })? {
                    EnergyResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("energy")),
                }
            }
        }
    }
}

/// The energy view of the machine: the available counters plus the power
/// capper.
pub struct Energy {
    counter_cpus: Option<Arc<CounterCpus>>,
    counter_memory: Option<Arc<CounterMemory>>,
    counter_plug: Option<Arc<CounterPlug>>,
    capper: Option<PowerCapper>,
}

impl Energy {
    pub fn new() -> Result<Self> {
        Self::with_root(default_root())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_root_and_refresh(root, DEFAULT_WRAPPING_INTERVAL / 2)
    }

    /// Like [`Energy::with_root`] with an explicit refresher period; the
    /// period must stay below the wrapping interval.
    pub fn with_root_and_refresh(root: impl Into<PathBuf>, refresh: Duration) -> Result<Self> {
        let root = root.into();
        let counter_cpus = match CounterCpus::discover(&root, refresh) {
            Ok(c) => Some(Arc::new(c)),
            Err(Error::Unsupported(m)) => {
                warn!("no per-cpu energy counters: {}", m);
                None
            }
            Err(e) => return Err(e),
        };
        let counter_memory = match counter_cpus.as_ref().map(|c| c.has_dram()) {
            Some(true) => Some(Arc::new(CounterMemory {
                backing: MemoryBacking::Local(CounterCpus::discover(&root, refresh)?),
            })),
            _ => None,
        };
        let capper = match discover_packages(&root) {
            Ok(packages) => Some(PowerCapper {
                backing: CapperBacking::Local {
                    sockets: packages.into_iter().map(|(_, p)| p).collect(),
                },
            }),
            Err(_) => None,
        };
        Ok(Energy {
            counter_cpus,
            counter_memory,
            // Plug meters have no local back-end.
            counter_plug: None,
            capper,
        })
    }

    /// An energy module that forwards every operation to a remote agent.
    pub fn remote(comm: Arc<dyn Communicator>) -> Result<Self> {
        let desc = match energy_call(&comm, &EnergyRequest::Describe)? {
            EnergyResponse::Description(desc) => desc,
            _ => return Err(unexpected_response("energy")),
        };
        let counter_cpus = if desc.cpu_ids.is_empty() {
            None
        } else {
            Some(Arc::new(CounterCpus {
                backing: CpusBacking::Remote {
                    comm: comm.clone(),
                    cpu_ids: desc.cpu_ids,
                    has_cores: desc.has_cores,
                    has_graphic: desc.has_graphic,
                    has_dram: desc.has_dram,
                },
            }))
        };
        let counter_memory = if desc.has_memory {
            Some(Arc::new(CounterMemory {
                backing: MemoryBacking::Remote(comm.clone()),
            }))
        } else {
            None
        };
        let counter_plug = if desc.has_plug {
            Some(Arc::new(CounterPlug { comm: comm.clone() }))
        } else {
            None
        };
        let capper = if desc.sockets > 0 {
            Some(PowerCapper {
                backing: CapperBacking::Remote {
                    comm,
                    sockets: desc.sockets,
                },
            })
        } else {
            None
        };
        Ok(Energy {
            counter_cpus,
            counter_memory,
            counter_plug,
            capper,
        })
    }

    pub fn counter_cpus(&self) -> Option<&Arc<CounterCpus>> {
        self.counter_cpus.as_ref()
    }

    pub fn counter_memory(&self) -> Option<&Arc<CounterMemory>> {
        self.counter_memory.as_ref()
    }

    pub fn counter_plug(&self) -> Option<&Arc<CounterPlug>> {
        self.counter_plug.as_ref()
    }

    /// Available counter classes, most precise first.
    pub fn counter_types(&self) -> Vec<CounterType> {
        let mut types = vec![];
        if self.counter_cpus.is_some() {
            types.push(CounterType::Cpus);
        }
        if self.counter_memory.is_some() {
            types.push(CounterType::Memory);
        }
        if self.counter_plug.is_some() {
            types.push(CounterType::Plug);
        }
        types
    }

    /// The most precise counter available: per-CPU detail beats DRAM-only,
    /// which beats the plug.
    pub fn preferred_counter(&self) -> Option<Counter> {
        if let Some(c) = &self.counter_cpus {
            return Some(Counter::Cpus(c.clone()));
        }
        if let Some(c) = &self.counter_memory {
            return Some(Counter::Memory(c.clone()));
        }
        self.counter_plug.clone().map(Counter::Plug)
    }

    pub fn power_capper(&self) -> Result<&PowerCapper> {
        self.capper
            .as_ref()
            .ok_or_else(|| Error::Unsupported("no power capping support".into()))
    }

    /// Agent-side dispatch of one energy request.
    pub(crate) fn handle_request(&self, req: EnergyRequest) -> Result<EnergyResponse> {
        use EnergyRequest::*;
        let cpus = |that: &Self| -> Result<Arc<CounterCpus>> {
            that.counter_cpus
                .clone()
                .ok_or_else(|| Error::Unsupported("no per-cpu energy counters".into()))
        };
        Ok(match req {
            Describe => EnergyResponse::Description(EnergyDesc {
                cpu_ids: self
                    .counter_cpus
                    .as_ref()
                    .map(|c| c.cpu_ids())
                    .unwrap_or_default(),
                has_cores: self.counter_cpus.as_ref().is_some_and(|c| c.has_cores()),
                has_graphic: self.counter_cpus.as_ref().is_some_and(|c| c.has_graphic()),
                has_dram: self.counter_cpus.as_ref().is_some_and(|c| c.has_dram()),
                has_memory: self.counter_memory.is_some(),
                has_plug: self.counter_plug.is_some(),
                sockets: self.capper.as_ref().map(|c| c.sockets()).unwrap_or(0),
            }),
            CpusReadComponents { cpu } => {
                EnergyResponse::JoulesComponents(cpus(self)?.read_components(cpu)?)
            }
            CpusReadCpu { cpu } => EnergyResponse::Joules(cpus(self)?.read_cpu(cpu)?),
            CpusReadCores { cpu } => EnergyResponse::Joules(cpus(self)?.read_cores(cpu)?),
            CpusReadGraphic { cpu } => EnergyResponse::Joules(cpus(self)?.read_graphic(cpu)?),
            CpusReadDram { cpu } => EnergyResponse::Joules(cpus(self)?.read_dram(cpu)?),
            CpusReset => {
                cpus(self)?.reset()?;
                EnergyResponse::Unit
            }
            MemoryJoules => EnergyResponse::Joules(
                self.counter_memory
                    .as_ref()
                    .ok_or_else(|| Error::Unsupported("no memory counter".into()))?
                    .joules()?,
            ),
            MemoryReset => {
                self.counter_memory
                    .as_ref()
                    .ok_or_else(|| Error::Unsupported("no memory counter".into()))?
                    .reset()?;
                EnergyResponse::Unit
            }
            PlugJoules => EnergyResponse::Joules(
                self.counter_plug
                    .as_ref()
                    .ok_or_else(|| Error::Unsupported("no plug counter".into()))?
                    .joules()?,
            ),
            PlugReset => {
                self.counter_plug
                    .as_ref()
                    .ok_or_else(|| Error::Unsupported("no plug counter".into()))?
                    .reset()?;
                EnergyResponse::Unit
            }
            CapGet { socket, window } => {
                EnergyResponse::Cap(self.power_capper()?.get(socket, window)?)
            }
            CapSet { socket, window, cap } => {
                self.power_capper()?.set(socket, window, cap)?;
                EnergyResponse::Unit
            }
            CapSetAll { cap } => {
                self.power_capper()?.set_all(cap)?;
                EnergyResponse::Unit
            }
        })
    }
}

fn energy_call(comm: &Arc<dyn Communicator>, req: &EnergyRequest) -> Result<EnergyResponse> {
    call(comm.as_ref(), msg::ENERGY_REQUEST, msg::ENERGY_RESPONSE, req)
}

#[derive(Debug, Serialize, Deserialize)]
pub enum EnergyRequest {
    Describe,
    CpusReadComponents { cpu: CpuId },
    CpusReadCpu { cpu: CpuId },
    CpusReadCores { cpu: CpuId },
    CpusReadGraphic { cpu: CpuId },
    CpusReadDram { cpu: CpuId },
    CpusReset,
    MemoryJoules,
    MemoryReset,
    PlugJoules,
    PlugReset,
    CapGet { socket: u32, window: u32 },
    CapSet { socket: u32, window: u32, cap: PowerCap },
    CapSetAll { cap: PowerCap },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum EnergyResponse {
    Description(EnergyDesc),
    Joules(Joules),
    JoulesComponents(JoulesCpu),
    Cap(PowerCap),
    Unit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnergyDesc {
    pub cpu_ids: Vec<CpuId>,
    pub has_cores: bool,
    pub has_graphic: bool,
    pub has_dram: bool,
    pub has_memory: bool,
    pub has_plug: bool,
    pub sockets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joules_cpu_arithmetic() {
        let mut a = JoulesCpu {
            cpu: 1.0,
            cores: 0.5,
            graphic: 0.25,
            dram: 0.125,
        };
        a += a;
        assert_eq!(a.cpu, 2.0);
        assert_eq!(a.dram, 0.25);
        a.zero();
        assert_eq!(a, JoulesCpu::default());
    }
}
