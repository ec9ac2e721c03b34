// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use thiserror::Error;

/// Why a set of [`crate::farm::AdaptivityParameters`] was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("underload/overload thresholds are out of range or inverted")]
    ThresholdsInvalid,
    #[error("a frequency strategy requires a mapping strategy other than none")]
    FreqStrategyRequiresMapping,
    #[error("the requested frequency strategy is not supported on this machine")]
    FreqStrategyUnsupported,
    #[error("the requested governor is not available on this machine")]
    GovernorUnsupported,
    #[error("the requested mapping strategy is not supported")]
    MappingUnsupported,
    #[error("emitter/collector sensitivity requires a frequency strategy")]
    SensitiveWithoutFreqStrategy,
    #[error("emitter/collector sensitivity needs the performance or userspace governor")]
    SensitiveMissingGovernors,
    #[error("frequency bounds are invalid or the frequency strategy is not os")]
    InvalidFrequencyBounds,
    #[error("unused core strategy requires hot-pluggable virtual cores")]
    UnusedNoOff,
    #[error("unused core strategy requires frequency scaling")]
    UnusedNoFrequencies,
    #[error("bandwidth requirement parameters are invalid")]
    BandwidthParamsInvalid,
    #[error("power conservative strategy requires a voltage table")]
    VoltageFileNeeded,
    #[error("fast reconfiguration is not available on this machine")]
    NoFastReconf,
}

/// Library-wide error type. Variants are the error kinds a caller can
/// meaningfully distinguish; the payload carries context for logs.
#[derive(Error, Debug)]
pub enum Error {
    /// The platform lacks the capability (no RAPL, no userspace governor,
    /// no hot-plug, ...).
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Out-of-range frequency, unknown governor, malformed voltage table.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No such CPU / domain / idle level / voltage-table entry.
    #[error("not found: {0}")]
    NotFound(String),
    /// A remote call failed.
    #[error("transport: {0}")]
    Transport(String),
    /// Adaptivity parameters failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),
    /// Rollback failed, a voltage-table entry was missing during a scan, or
    /// the platform denied a previously accepted operation.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True for errors that must abort the adaptive manager.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
