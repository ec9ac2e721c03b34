// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency scaling
//!
//! [`CpuFreq`] groups the machine's virtual cores into frequency
//! [`Domain`]s: sets of cores whose frequency and governor change together
//! (cpufreq policies, grouped by `related_cpus`). Per-domain operations
//! cover the governor, the explicit userspace frequency, governor bounds
//! and rollback points; machine-level operations cover turbo boosting.
//!
//! Frequencies are expressed in kHz throughout, matching sysfs.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use glob::glob;
use serde::{Deserialize, Serialize};

use crate::misc::{default_root, file_exists, parse_usize_list, read_file_string, read_from_file, write_to_file};
use crate::remote::{call, msg, Communicator};
use crate::topology::{unexpected_response, Backing, VirtualCoreId};
use crate::{Error, Result};

pub type Frequency = u32;
pub type DomainId = u32;

/// The cpufreq governors the library understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Governor {
    Conservative,
    Ondemand,
    Userspace,
    Powersave,
    Performance,
}

impl Governor {
    pub const ALL: [Governor; 5] = [
        Governor::Conservative,
        Governor::Ondemand,
        Governor::Userspace,
        Governor::Powersave,
        Governor::Performance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Governor::Conservative => "conservative",
            Governor::Ondemand => "ondemand",
            Governor::Userspace => "userspace",
            Governor::Powersave => "powersave",
            Governor::Performance => "performance",
        }
    }
}

impl FromStr for Governor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conservative" => Ok(Governor::Conservative),
            "ondemand" => Ok(Governor::Ondemand),
            "userspace" => Ok(Governor::Userspace),
            "powersave" => Ok(Governor::Powersave),
            "performance" => Ok(Governor::Performance),
            other => Err(Error::InvalidArgument(format!(
                "unknown governor {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Governor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to restore a domain to a previously captured state.
/// Capturing under the userspace governor records the explicit frequency;
/// capturing under any other governor records the governor bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub domain_id: DomainId,
    pub governor: Governor,
    pub frequency: Frequency,
    pub lower_bound: Frequency,
    pub upper_bound: Frequency,
}

/// A set of virtual cores sharing one frequency/governor. Mutations act on
/// every member atomically with respect to subsequent reads.
pub struct Domain {
    id: DomainId,
    virtual_core_ids: Vec<VirtualCoreId>,
    backing: Backing,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("virtual_core_ids", &self.virtual_core_ids)
            .finish()
    }
}

impl Domain {
    fn freq_path(&self, root: &PathBuf, file: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}/sys/devices/system/cpu/cpu{}/cpufreq/{}",
            root.display(),
            self.virtual_core_ids[0],
            file
        ))
    }

    fn remote_call(&self, comm: &Arc<dyn Communicator>, req: CpufreqRequest) -> Result<CpufreqResponse> {
        call(comm.as_ref(), msg::CPUFREQ_REQUEST, msg::CPUFREQ_RESPONSE, &req)
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    /// The members of the domain, ascending.
    pub fn virtual_core_ids(&self) -> &[VirtualCoreId] {
        &self.virtual_core_ids
    }

    pub fn contains(&self, vc: VirtualCoreId) -> bool {
        self.virtual_core_ids.contains(&vc)
    }

    /// Frequency steps available on this domain, in kHz, ascending.
    pub fn available_frequencies(&self) -> Result<Vec<Frequency>> {
        match &self.backing {
            Backing::Local { root } => {
                let raw = read_file_string(&self.freq_path(root, "scaling_available_frequencies"))?;
                let mut freqs: Vec<Frequency> = parse_usize_list(&raw)?;
                freqs.sort_unstable();
                Ok(freqs)
            }
            Backing::Remote { comm } => {
                match self.remote_call(comm, CpufreqRequest::AvailableFrequencies { domain: self.id })? {
                    CpufreqResponse::Frequencies(freqs) => Ok(freqs),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    pub fn available_governors(&self) -> Result<Vec<Governor>> {
        match &self.backing {
            Backing::Local { root } => {
                let raw = read_file_string(&self.freq_path(root, "scaling_available_governors"))?;
                let mut governors = vec![];
                for tok in raw.split_whitespace() {
                    // Governors the kernel knows but we do not drive are
                    // skipped rather than rejected.
                    if let Ok(g) = tok.parse::<Governor>() {
                        governors.push(g);
                    }
                }
                Ok(governors)
            }
            Backing::Remote { comm } => {
                match self.remote_call(comm, CpufreqRequest::AvailableGovernors { domain: self.id })? {
                    CpufreqResponse::Governors(governors) => Ok(governors),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    pub fn is_governor_available(&self, governor: Governor) -> Result<bool> {
        Ok(self.available_governors()?.contains(&governor))
    }

    /// The last frequency in effect on the domain, in kHz.
    pub fn current_frequency(&self) -> Result<Frequency> {
        match &self.backing {
            Backing::Local { root } => read_from_file(&self.freq_path(root, "scaling_cur_freq")),
            Backing::Remote { comm } => {
                match self.remote_call(comm, CpufreqRequest::CurrentFrequency { domain: self.id })? {
                    CpufreqResponse::Frequency(f) => Ok(f),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// The frequency requested through the userspace governor. Meaningful
    /// only while the current governor is userspace.
    pub fn current_frequency_userspace(&self) -> Result<Frequency> {
        match &self.backing {
            Backing::Local { root } => read_from_file(&self.freq_path(root, "scaling_setspeed")),
            Backing::Remote { comm } => {
                match self
                    .remote_call(comm, CpufreqRequest::CurrentFrequencyUserspace { domain: self.id })?
                {
                    CpufreqResponse::Frequency(f) => Ok(f),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    pub fn current_governor(&self) -> Result<Governor> {
        match &self.backing {
            Backing::Local { root } => {
                read_file_string(&self.freq_path(root, "scaling_governor"))?.parse()
            }
            Backing::Remote { comm } => {
                match self.remote_call(comm, CpufreqRequest::CurrentGovernor { domain: self.id })? {
                    CpufreqResponse::Governor(g) => Ok(g),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// Switches the domain to `governor`. Fails with
    /// [`Error::InvalidArgument`] when the governor is not available here.
    pub fn set_governor(&self, governor: Governor) -> Result<()> {
        match &self.backing {
            Backing::Local { root } => {
                if !self.is_governor_available(governor)? {
                    return Err(Error::InvalidArgument(format!(
                        "governor {} not available on domain {}",
                        governor, self.id
                    )));
                }
                write_to_file(&self.freq_path(root, "scaling_governor"), governor.name())
            }
            Backing::Remote { comm } => {
                match self.remote_call(
                    comm,
                    CpufreqRequest::SetGovernor {
                        domain: self.id,
                        governor,
                    },
                )? {
                    CpufreqResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// Sets an explicit frequency. Fails unless the current governor is
    /// userspace and `frequency` is one of the available steps.
    pub fn set_frequency_userspace(&self, frequency: Frequency) -> Result<()> {
        match &self.backing {
            Backing::Local { root } => {
                if self.current_governor()? != Governor::Userspace {
                    return Err(Error::InvalidArgument(format!(
                        "domain {} is not under the userspace governor",
                        self.id
                    )));
                }
                if !self.available_frequencies()?.contains(&frequency) {
                    return Err(Error::InvalidArgument(format!(
                        "frequency {} kHz not available on domain {}",
                        frequency, self.id
                    )));
                }
                write_to_file(
                    &self.freq_path(root, "scaling_setspeed"),
                    &frequency.to_string(),
                )
            }
            Backing::Remote { comm } => {
                match self.remote_call(
                    comm,
                    CpufreqRequest::SetFrequencyUserspace {
                        domain: self.id,
                        frequency,
                    },
                )? {
                    CpufreqResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// Sets the governor's frequency bounds. Fails when the current
    /// governor is userspace or the bounds leave the hardware range.
    pub fn set_governor_bounds(&self, lower: Frequency, upper: Frequency) -> Result<()> {
        match &self.backing {
            Backing::Local { root } => {
                if self.current_governor()? == Governor::Userspace {
                    return Err(Error::InvalidArgument(format!(
                        "domain {} is under the userspace governor, bounds do not apply",
                        self.id
                    )));
                }
                let (hw_lower, hw_upper) = self.hardware_frequency_bounds()?;
                if lower > upper || lower < hw_lower || upper > hw_upper {
                    return Err(Error::InvalidArgument(format!(
                        "bounds [{}, {}] outside hardware range [{}, {}]",
                        lower, upper, hw_lower, hw_upper
                    )));
                }
                write_to_file(&self.freq_path(root, "scaling_min_freq"), &lower.to_string())?;
                write_to_file(&self.freq_path(root, "scaling_max_freq"), &upper.to_string())
            }
            Backing::Remote { comm } => {
                match self.remote_call(
                    comm,
                    CpufreqRequest::SetGovernorBounds {
                        domain: self.id,
                        lower,
                        upper,
                    },
                )? {
                    CpufreqResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// Read-only hardware frequency range, in kHz.
    pub fn hardware_frequency_bounds(&self) -> Result<(Frequency, Frequency)> {
        match &self.backing {
            Backing::Local { root } => {
                let lower = read_from_file(&self.freq_path(root, "cpuinfo_min_freq"))?;
                let upper = read_from_file(&self.freq_path(root, "cpuinfo_max_freq"))?;
                Ok((lower, upper))
            }
            Backing::Remote { comm } => {
                match self
                    .remote_call(comm, CpufreqRequest::HardwareFrequencyBounds { domain: self.id })?
                {
                    CpufreqResponse::Bounds(lower, upper) => Ok((lower, upper)),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// The bounds the current governor operates within.
    pub fn current_governor_bounds(&self) -> Result<(Frequency, Frequency)> {
        match &self.backing {
            Backing::Local { root } => {
                let lower = read_from_file(&self.freq_path(root, "scaling_min_freq"))?;
                let upper = read_from_file(&self.freq_path(root, "scaling_max_freq"))?;
                Ok((lower, upper))
            }
            Backing::Remote { comm } => {
                match self
                    .remote_call(comm, CpufreqRequest::CurrentGovernorBounds { domain: self.id })?
                {
                    CpufreqResponse::Bounds(lower, upper) => Ok((lower, upper)),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// Frequency switch latency in nanoseconds.
    pub fn transition_latency_ns(&self) -> Result<u64> {
        match &self.backing {
            Backing::Local { root } => {
                read_from_file(&self.freq_path(root, "cpuinfo_transition_latency"))
            }
            Backing::Remote { comm } => {
                match self.remote_call(comm, CpufreqRequest::TransitionLatencyNs { domain: self.id })? {
                    CpufreqResponse::U64(v) => Ok(v),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// Userspace governor at the highest available step.
    pub fn set_highest_frequency_userspace(&self) -> Result<()> {
        let freqs = self.available_frequencies()?;
        match freqs.last() {
            Some(&f) => self.set_frequency_userspace(f),
            None => Err(Error::Unsupported(format!(
                "no frequency steps on domain {}",
                self.id
            ))),
        }
    }

    /// Userspace governor at the lowest available step.
    pub fn set_lowest_frequency_userspace(&self) -> Result<()> {
        let freqs = self.available_frequencies()?;
        match freqs.first() {
            Some(&f) => self.set_frequency_userspace(f),
            None => Err(Error::Unsupported(format!(
                "no frequency steps on domain {}",
                self.id
            ))),
        }
    }

    /// Captures the domain state for a later [`Domain::rollback`].
    pub fn rollback_point(&self) -> Result<RollbackPoint> {
        let governor = self.current_governor()?;
        let mut rp = RollbackPoint {
            domain_id: self.id,
            governor,
            frequency: 0,
            lower_bound: 0,
            upper_bound: 0,
        };
        if governor == Governor::Userspace {
            rp.frequency = self.current_frequency_userspace()?;
        } else {
            let (lower, upper) = self.current_governor_bounds()?;
            rp.lower_bound = lower;
            rp.upper_bound = upper;
        }
        Ok(rp)
    }

    /// Restores a previously captured state. Failure to restore is fatal.
    pub fn rollback(&self, rp: &RollbackPoint) -> Result<()> {
        if rp.domain_id != self.id {
            return Err(Error::InvalidArgument(format!(
                "rollback point of domain {} applied to domain {}",
                rp.domain_id, self.id
            )));
        }
        self.set_governor(rp.governor)
            .map_err(|e| Error::Fatal(format!("rollback of domain {}: {}", self.id, e)))?;
        if rp.governor == Governor::Userspace {
            self.set_frequency_userspace(rp.frequency)
                .map_err(|e| Error::Fatal(format!("rollback of domain {}: {}", self.id, e)))?;
        } else {
            self.set_governor_bounds(rp.lower_bound, rp.upper_bound)
                .map_err(|e| Error::Fatal(format!("rollback of domain {}: {}", self.id, e)))?;
        }
        Ok(())
    }
}

/// The frequency-scaling view of the machine.
pub struct CpuFreq {
    domains: Vec<Domain>,
    backing: Backing,
}

impl fmt::Debug for CpuFreq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuFreq").field("domains", &self.domains).finish()
    }
}

impl CpuFreq {
    pub fn new() -> Result<Self> {
        Self::with_root(default_root())
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let pattern = format!(
            "{}/sys/devices/system/cpu/cpu[0-9]*/cpufreq/related_cpus",
            root.display()
        );
        let mut groups: Vec<Vec<VirtualCoreId>> = vec![];
        for path in glob(&pattern)
            .map_err(|e| Error::Fatal(format!("bad glob {}: {}", pattern, e)))?
            .filter_map(std::result::Result::ok)
        {
            let raw = read_file_string(&path)?;
            let mut members: Vec<VirtualCoreId> = parse_usize_list(&raw)?;
            members.sort_unstable();
            if !groups.contains(&members) {
                groups.push(members);
            }
        }
        groups.sort_by_key(|members| members.first().copied().unwrap_or(0));

        let backing = Backing::Local { root };
        let domains = groups
            .into_iter()
            .enumerate()
            .map(|(id, virtual_core_ids)| Domain {
                id: id as DomainId,
                virtual_core_ids,
                backing: backing.clone(),
            })
            .collect();
        Ok(CpuFreq { domains, backing })
    }

    /// A frequency module that forwards every operation to a remote agent.
    pub fn remote(comm: Arc<dyn Communicator>) -> Result<Self> {
        let resp: CpufreqResponse = call(
            comm.as_ref(),
            msg::CPUFREQ_REQUEST,
            msg::CPUFREQ_RESPONSE,
            &CpufreqRequest::Domains,
        )?;
        let descs = match resp {
            CpufreqResponse::Domains(descs) => descs,
            _ => return Err(unexpected_response("cpufreq")),
        };
        let backing = Backing::Remote { comm };
        let domains = descs
            .into_iter()
            .map(|d| Domain {
                id: d.id,
                virtual_core_ids: d.virtual_core_ids,
                backing: backing.clone(),
            })
            .collect();
        Ok(CpuFreq { domains, backing })
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn domain(&self, id: DomainId) -> Result<&Domain> {
        self.domains
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::NotFound(format!("no frequency domain {}", id)))
    }

    /// The domain a virtual core belongs to.
    pub fn domain_for(&self, vc: VirtualCoreId) -> Result<&Domain> {
        self.domains
            .iter()
            .find(|d| d.contains(vc))
            .ok_or_else(|| Error::NotFound(format!("no frequency domain for vc {}", vc)))
    }

    /// The distinct domains touched by the given virtual cores.
    pub fn domains_for(&self, vcs: &[VirtualCoreId]) -> Vec<&Domain> {
        self.domains
            .iter()
            .filter(|d| vcs.iter().any(|&vc| d.contains(vc)))
            .collect()
    }

    /// The domains whose members are all contained in `vcs`.
    pub fn domains_complete_for(&self, vcs: &[VirtualCoreId]) -> Vec<&Domain> {
        self.domains
            .iter()
            .filter(|d| d.virtual_core_ids.iter().all(|vc| vcs.contains(vc)))
            .collect()
    }

    /// True when the governor is available on every domain.
    pub fn is_governor_available(&self, governor: Governor) -> Result<bool> {
        if self.domains.is_empty() {
            return Ok(false);
        }
        for domain in self.domains.iter() {
            if !domain.is_governor_available(governor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn rollback_points(&self) -> Result<Vec<RollbackPoint>> {
        self.domains.iter().map(|d| d.rollback_point()).collect()
    }

    pub fn rollback_all(&self, points: &[RollbackPoint]) -> Result<()> {
        for rp in points {
            self.domain(rp.domain_id)?.rollback(rp)?;
        }
        Ok(())
    }

    fn boost_paths(&self, root: &PathBuf) -> (PathBuf, PathBuf) {
        let boost = PathBuf::from(format!(
            "{}/sys/devices/system/cpu/cpufreq/boost",
            root.display()
        ));
        let no_turbo = PathBuf::from(format!(
            "{}/sys/devices/system/cpu/intel_pstate/no_turbo",
            root.display()
        ));
        (boost, no_turbo)
    }

    pub fn is_boosting_supported(&self) -> Result<bool> {
        match &self.backing {
            Backing::Local { root } => {
                let (boost, no_turbo) = self.boost_paths(root);
                Ok(file_exists(&boost) || file_exists(&no_turbo))
            }
            Backing::Remote { comm } => {
                match boost_call(comm, CpufreqRequest::IsBoostingSupported)? {
                    CpufreqResponse::Bool(b) => Ok(b),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    pub fn is_boosting_enabled(&self) -> Result<bool> {
        match &self.backing {
            Backing::Local { root } => {
                let (boost, no_turbo) = self.boost_paths(root);
                if file_exists(&boost) {
                    Ok(read_from_file::<u32>(&boost)? == 1)
                } else if file_exists(&no_turbo) {
                    Ok(read_from_file::<u32>(&no_turbo)? == 0)
                } else {
                    Err(Error::Unsupported("boosting is not supported".into()))
                }
            }
            Backing::Remote { comm } => {
                match boost_call(comm, CpufreqRequest::IsBoostingEnabled)? {
                    CpufreqResponse::Bool(b) => Ok(b),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    pub fn enable_boosting(&self) -> Result<()> {
        self.set_boosting(true)
    }

    pub fn disable_boosting(&self) -> Result<()> {
        self.set_boosting(false)
    }

    fn set_boosting(&self, enabled: bool) -> Result<()> {
        match &self.backing {
            Backing::Local { root } => {
                let (boost, no_turbo) = self.boost_paths(root);
                if file_exists(&boost) {
                    write_to_file(&boost, if enabled { "1" } else { "0" })
                } else if file_exists(&no_turbo) {
                    write_to_file(&no_turbo, if enabled { "0" } else { "1" })
                } else {
                    Err(Error::Unsupported("boosting is not supported".into()))
                }
            }
            Backing::Remote { comm } => {
                let req = if enabled {
                    CpufreqRequest::EnableBoosting
                } else {
                    CpufreqRequest::DisableBoosting
                };
                match boost_call(comm, req)? {
                    CpufreqResponse::Unit => Ok(()),
                    _ => Err(unexpected_response("cpufreq")),
                }
            }
        }
    }

    /// Agent-side dispatch of one cpufreq request.
    pub(crate) fn handle_request(&self, req: CpufreqRequest) -> Result<CpufreqResponse> {
        use CpufreqRequest::*;
        Ok(match req {
            Domains => CpufreqResponse::Domains(
                self.domains
                    .iter()
                    .map(|d| DomainDesc {
                        id: d.id,
                        virtual_core_ids: d.virtual_core_ids.clone(),
                    })
                    .collect(),
            ),
            AvailableFrequencies { domain } => {
                CpufreqResponse::Frequencies(self.domain(domain)?.available_frequencies()?)
            }
            AvailableGovernors { domain } => {
                CpufreqResponse::Governors(self.domain(domain)?.available_governors()?)
            }
            CurrentFrequency { domain } => {
                CpufreqResponse::Frequency(self.domain(domain)?.current_frequency()?)
            }
            CurrentFrequencyUserspace { domain } => {
                CpufreqResponse::Frequency(self.domain(domain)?.current_frequency_userspace()?)
            }
            CurrentGovernor { domain } => {
                CpufreqResponse::Governor(self.domain(domain)?.current_governor()?)
            }
            SetGovernor { domain, governor } => {
                self.domain(domain)?.set_governor(governor)?;
                CpufreqResponse::Unit
            }
            SetFrequencyUserspace { domain, frequency } => {
                self.domain(domain)?.set_frequency_userspace(frequency)?;
                CpufreqResponse::Unit
            }
            SetGovernorBounds { domain, lower, upper } => {
                self.domain(domain)?.set_governor_bounds(lower, upper)?;
                CpufreqResponse::Unit
            }
            HardwareFrequencyBounds { domain } => {
                let (lower, upper) = self.domain(domain)?.hardware_frequency_bounds()?;
                CpufreqResponse::Bounds(lower, upper)
            }
            CurrentGovernorBounds { domain } => {
                let (lower, upper) = self.domain(domain)?.current_governor_bounds()?;
                CpufreqResponse::Bounds(lower, upper)
            }
            TransitionLatencyNs { domain } => {
                CpufreqResponse::U64(self.domain(domain)?.transition_latency_ns()?)
            }
            IsBoostingSupported => CpufreqResponse::Bool(self.is_boosting_supported()?),
            IsBoostingEnabled => CpufreqResponse::Bool(self.is_boosting_enabled()?),
            EnableBoosting => {
                self.enable_boosting()?;
                CpufreqResponse::Unit
            }
            DisableBoosting => {
                self.disable_boosting()?;
                CpufreqResponse::Unit
            }
        })
    }
}

fn boost_call(comm: &Arc<dyn Communicator>, req: CpufreqRequest) -> Result<CpufreqResponse> {
    call(comm.as_ref(), msg::CPUFREQ_REQUEST, msg::CPUFREQ_RESPONSE, &req)
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CpufreqRequest {
    Domains,
    AvailableFrequencies { domain: DomainId },
    AvailableGovernors { domain: DomainId },
    CurrentFrequency { domain: DomainId },
    CurrentFrequencyUserspace { domain: DomainId },
    CurrentGovernor { domain: DomainId },
    SetGovernor { domain: DomainId, governor: Governor },
    SetFrequencyUserspace { domain: DomainId, frequency: Frequency },
    SetGovernorBounds { domain: DomainId, lower: Frequency, upper: Frequency },
    HardwareFrequencyBounds { domain: DomainId },
    CurrentGovernorBounds { domain: DomainId },
    TransitionLatencyNs { domain: DomainId },
    IsBoostingSupported,
    IsBoostingEnabled,
    EnableBoosting,
    DisableBoosting,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CpufreqResponse {
    Domains(Vec<DomainDesc>),
    Frequencies(Vec<Frequency>),
    Governors(Vec<Governor>),
    Frequency(Frequency),
    Governor(Governor),
    Bounds(Frequency, Frequency),
    U64(u64),
    Bool(bool),
    Unit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DomainDesc {
    pub id: DomainId,
    pub virtual_core_ids: Vec<VirtualCoreId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn governor_names_round_trip() {
        for g in Governor::ALL {
            assert_eq!(g.name().parse::<Governor>().unwrap(), g);
        }
        assert!(matches!(
            "turbo".parse::<Governor>().unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }
}
