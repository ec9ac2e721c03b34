// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Adaptivity parameters and their validation.

use std::path::PathBuf;
use std::time::Duration;

use crate::cpufreq::{CpuFreq, Frequency, Governor};
use crate::error::ConfigError;
use crate::topology::Topology;
use crate::voltage::VoltageTable;

/// How farm threads are placed on virtual cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStrategy {
    /// No pinning, the OS decides.
    None,
    /// Resolved at runtime; currently resolves to `Linear`.
    Auto,
    /// One virtual core per physical core first, grouped by CPU, SMT
    /// siblings last.
    Linear,
    /// Reserved; rejected by validation.
    CacheEfficient,
}

/// Whether and how the manager drives DVFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyStrategy {
    /// Frequencies are left alone; only the worker count adapts.
    None,
    /// The OS governor drives frequencies, optionally bounded.
    Os,
    /// Joint `(workers, frequency)` search minimizing virtual cores first.
    CoresConservative,
    /// Joint `(workers, frequency)` search minimizing estimated power.
    PowerConservative,
}

/// What happens to virtual cores not running farm threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedVcStrategy {
    None,
    /// The most aggressive feasible of the strategies below.
    Auto,
    /// Lower the enclosing domain to its minimum, when the whole domain is
    /// unused.
    LowestFrequency,
    /// Hot-unplug the cores; quiesced domains are additionally lowered.
    Off,
}

/// The user's contract with the adaptive manager, plus the knobs shaping
/// how it is enforced. Defaults match an unconstrained utilization band of
/// [80, 90] sampled once per second.
#[derive(Debug, Clone)]
pub struct AdaptivityParameters {
    pub mapping_strategy: MappingStrategy,
    pub frequency_strategy: FrequencyStrategy,
    /// Governor driven when `frequency_strategy` is `Os`.
    pub governor: Governor,
    pub turbo_boost: bool,
    /// Bounds for the `Os` strategy; validation fills absent ends with the
    /// extremes of the available frequencies.
    pub frequency_lower_bound: Option<Frequency>,
    pub frequency_upper_bound: Option<Frequency>,
    /// Raise frequencies to the maximum for the duration of a
    /// reconfiguration, then restore them.
    pub fast_reconfiguration: bool,
    /// Cores never used by the current mapping.
    pub unused_vc_strategy: UnusedVcStrategy,
    /// Cores whose worker was deactivated and may come back.
    pub inactive_vc_strategy: UnusedVcStrategy,
    pub sensitive_emitter: bool,
    pub sensitive_collector: bool,
    /// Sliding-window length, in samples.
    pub num_samples: usize,
    /// Samples dropped after every reconfiguration.
    pub samples_to_discard: usize,
    pub sampling_interval: Duration,
    pub underload_threshold_farm: f64,
    pub overload_threshold_farm: f64,
    pub underload_threshold_worker: f64,
    pub overload_threshold_worker: f64,
    /// Tasks per second the application needs. Nonzero selects the
    /// bandwidth contract instead of the utilization band.
    pub required_bandwidth: f64,
    /// Allowed deviation around `required_bandwidth`, in percent.
    pub max_bandwidth_variation: f64,
    /// Voltage table for the power-conservative strategy, either inline or
    /// as a file to load.
    pub voltage_table: Option<VoltageTable>,
    pub voltage_table_file: Option<PathBuf>,
}

impl Default for AdaptivityParameters {
    fn default() -> Self {
        Self {
            mapping_strategy: MappingStrategy::Linear,
            frequency_strategy: FrequencyStrategy::None,
            governor: Governor::Userspace,
            turbo_boost: false,
            frequency_lower_bound: None,
            frequency_upper_bound: None,
            fast_reconfiguration: false,
            unused_vc_strategy: UnusedVcStrategy::None,
            inactive_vc_strategy: UnusedVcStrategy::None,
            sensitive_emitter: false,
            sensitive_collector: false,
            num_samples: 10,
            samples_to_discard: 1,
            sampling_interval: Duration::from_secs(1),
            underload_threshold_farm: 80.0,
            overload_threshold_farm: 90.0,
            underload_threshold_worker: 80.0,
            overload_threshold_worker: 90.0,
            required_bandwidth: 0.0,
            max_bandwidth_variation: 5.0,
            voltage_table: None,
            voltage_table_file: None,
        }
    }
}

impl AdaptivityParameters {
    /// True when a nonzero required bandwidth selects the bandwidth
    /// contract over the utilization band.
    pub fn uses_bandwidth_contract(&self) -> bool {
        self.required_bandwidth > 0.0
    }

    /// Checks the parameters against the machine and normalizes defaults
    /// (absent `Os` bounds become the extreme available frequencies).
    /// Called by the manager before it starts.
    pub fn validate(
        &mut self,
        topology: &Topology,
        cpufreq: &CpuFreq,
    ) -> std::result::Result<(), ConfigError> {
        let domains = cpufreq.domains();
        let available_frequencies = match domains.first() {
            Some(d) => d.available_frequencies().unwrap_or_default(),
            None => vec![],
        };
        let governor_available = |g: Governor| cpufreq.is_governor_available(g).unwrap_or(false);

        if self.frequency_strategy != FrequencyStrategy::None
            && self.mapping_strategy == MappingStrategy::None
        {
            return Err(ConfigError::FreqStrategyRequiresMapping);
        }

        if self.underload_threshold_farm > self.overload_threshold_farm
            || self.underload_threshold_worker > self.overload_threshold_worker
            || self.underload_threshold_farm < 0.0
            || self.overload_threshold_farm > 100.0
            || self.underload_threshold_worker < 0.0
            || self.overload_threshold_worker > 100.0
        {
            return Err(ConfigError::ThresholdsInvalid);
        }

        if self.frequency_strategy != FrequencyStrategy::None {
            if domains.is_empty() {
                return Err(ConfigError::FreqStrategyUnsupported);
            }
            match self.frequency_strategy {
                FrequencyStrategy::Os => {
                    if !governor_available(self.governor) {
                        return Err(ConfigError::GovernorUnsupported);
                    }
                }
                _ => {
                    // The joint-search strategies drive explicit
                    // frequencies.
                    self.governor = Governor::Userspace;
                    if !governor_available(Governor::Userspace)
                        || available_frequencies.is_empty()
                    {
                        return Err(ConfigError::FreqStrategyUnsupported);
                    }
                }
            }
            if (self.sensitive_emitter || self.sensitive_collector)
                && !governor_available(Governor::Performance)
                && !governor_available(Governor::Userspace)
            {
                return Err(ConfigError::SensitiveMissingGovernors);
            }
        } else if self.sensitive_emitter || self.sensitive_collector {
            return Err(ConfigError::SensitiveWithoutFreqStrategy);
        }

        if self.mapping_strategy == MappingStrategy::CacheEfficient {
            return Err(ConfigError::MappingUnsupported);
        }

        if self.frequency_lower_bound.is_some() || self.frequency_upper_bound.is_some() {
            if self.frequency_strategy != FrequencyStrategy::Os {
                return Err(ConfigError::InvalidFrequencyBounds);
            }
            if available_frequencies.is_empty() {
                return Err(ConfigError::InvalidFrequencyBounds);
            }
            match self.frequency_lower_bound {
                Some(lb) if !available_frequencies.contains(&lb) => {
                    return Err(ConfigError::InvalidFrequencyBounds)
                }
                Some(_) => {}
                None => self.frequency_lower_bound = available_frequencies.first().copied(),
            }
            match self.frequency_upper_bound {
                Some(ub) if !available_frequencies.contains(&ub) => {
                    return Err(ConfigError::InvalidFrequencyBounds)
                }
                Some(_) => {}
                None => self.frequency_upper_bound = available_frequencies.last().copied(),
            }
            if self.frequency_lower_bound > self.frequency_upper_bound {
                return Err(ConfigError::InvalidFrequencyBounds);
            }
        }

        for strategy in [self.unused_vc_strategy, self.inactive_vc_strategy] {
            match strategy {
                UnusedVcStrategy::Off => {
                    let any_hot_pluggable = topology
                        .virtual_cores()
                        .iter()
                        .any(|vc| vc.is_hot_pluggable());
                    if !any_hot_pluggable {
                        return Err(ConfigError::UnusedNoOff);
                    }
                }
                UnusedVcStrategy::LowestFrequency => {
                    if !governor_available(Governor::Powersave)
                        && !governor_available(Governor::Userspace)
                    {
                        return Err(ConfigError::UnusedNoFrequencies);
                    }
                }
                _ => {}
            }
        }

        if self.required_bandwidth < 0.0
            || self.max_bandwidth_variation < 0.0
            || self.max_bandwidth_variation > 100.0
        {
            return Err(ConfigError::BandwidthParamsInvalid);
        }

        if self.frequency_strategy == FrequencyStrategy::PowerConservative {
            if self.voltage_table.is_none() {
                let loaded = self
                    .voltage_table_file
                    .as_ref()
                    .and_then(|path| VoltageTable::load(path).ok());
                match loaded {
                    Some(table) if !table.is_empty() => self.voltage_table = Some(table),
                    _ => return Err(ConfigError::VoltageFileNeeded),
                }
            }
        }

        if self.fast_reconfiguration
            && !governor_available(Governor::Performance)
            && (!governor_available(Governor::Userspace) || available_frequencies.is_empty())
        {
            return Err(ConfigError::NoFastReconf);
        }

        Ok(())
    }
}
