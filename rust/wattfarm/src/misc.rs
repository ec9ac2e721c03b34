// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Error, Result};

lazy_static::lazy_static! {
    /// Prefix prepended to every sysfs/procfs path the library touches.
    /// Empty on a real machine; tests and containers point it at a
    /// synthetic tree.
    pub static ref ROOT_PREFIX: String =
        std::env::var("WATTFARM_SYSFS_PREFIX").unwrap_or_default();
}

/// Default sysfs/procfs root, honoring `WATTFARM_SYSFS_PREFIX`.
pub fn default_root() -> PathBuf {
    PathBuf::from(ROOT_PREFIX.as_str())
}

pub(crate) fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// Reads a file and returns its trimmed content. A missing file means the
/// platform does not expose the capability.
pub(crate) fn read_file_string(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Unsupported(format!(
            "{} is not present",
            path.display()
        ))),
        Err(e) => Err(Error::Fatal(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

pub(crate) fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let val = read_file_string(path)?;
    val.parse::<T>().map_err(|e| {
        Error::Fatal(format!(
            "failed to parse {:?} from {}: {}",
            val,
            path.display(),
            e
        ))
    })
}

/// Writes a value to a sysfs file. Missing files and permission errors both
/// mean the platform refuses the operation.
pub(crate) fn write_to_file(path: &Path, val: &str) -> Result<()> {
    match std::fs::write(path, val) {
        Ok(()) => Ok(()),
        Err(e)
            if e.kind() == io::ErrorKind::NotFound
                || e.kind() == io::ErrorKind::PermissionDenied =>
        {
            Err(Error::Unsupported(format!(
                "cannot write {:?} to {}: {}",
                val,
                path.display(),
                e
            )))
        }
        Err(e) => Err(Error::Fatal(format!(
            "failed to write {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Parses a whitespace-separated list of integers, e.g. cpufreq's
/// `scaling_available_frequencies` or `related_cpus`.
pub(crate) fn parse_usize_list<T>(val: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    val.split_whitespace()
        .map(|tok| {
            tok.parse::<T>()
                .map_err(|e| Error::Fatal(format!("failed to parse {:?}: {}", tok, e)))
        })
        .collect()
}
