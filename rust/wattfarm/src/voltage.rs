// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Voltage table: `(used virtual cores, frequency) -> voltage`, used by the
//! power-conservative strategy to estimate `P ~ n * f * V^2`.
//!
//! The on-disk format is one `cores;frequencyKHz;voltage` entry per line,
//! with `#` starting a comment line.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::cpufreq::Frequency;
use crate::{Error, Result};

pub type Voltage = f64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoltageTable {
    entries: BTreeMap<(u32, Frequency), Voltage>,
}

impl VoltageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cores: u32, frequency: Frequency, voltage: Voltage) {
        self.entries.insert((cores, frequency), voltage);
    }

    /// The voltage needed to run `cores` virtual cores at `frequency`.
    pub fn voltage(&self, cores: u32, frequency: Frequency) -> Option<Voltage> {
        self.entries.get(&(cores, frequency)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, Frequency, Voltage)> + '_ {
        self.entries
            .iter()
            .map(|(&(cores, freq), &voltage)| (cores, freq, voltage))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("cannot read voltage table {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut table = VoltageTable::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(';').collect();
            if fields.len() != 3 {
                return Err(Error::InvalidArgument(format!(
                    "voltage table line {}: expected 3 fields, got {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            let cores = fields[0].trim().parse::<u32>().map_err(|e| {
                Error::InvalidArgument(format!("voltage table line {}: {}", lineno + 1, e))
            })?;
            let frequency = fields[1].trim().parse::<Frequency>().map_err(|e| {
                Error::InvalidArgument(format!("voltage table line {}: {}", lineno + 1, e))
            })?;
            let voltage = fields[2].trim().parse::<Voltage>().map_err(|e| {
                Error::InvalidArgument(format!("voltage table line {}: {}", lineno + 1, e))
            })?;
            table.insert(cores, frequency, voltage);
        }
        Ok(table)
    }

    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.format()).map_err(|e| {
            Error::InvalidArgument(format!(
                "cannot write voltage table {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn format(&self) -> String {
        let mut out = String::from("# Voltage table. Format:\n# NumVirtualCores;FrequencyKHz;Voltage\n");
        for (cores, freq, voltage) in self.iter() {
            let _ = writeln!(out, "{};{};{}", cores, freq, voltage);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VoltageTable {
        let mut table = VoltageTable::new();
        table.insert(1, 800_000, 0.75);
        table.insert(2, 800_000, 0.8);
        table.insert(1, 2_400_000, 1.25);
        table.insert(2, 2_400_000, 1.3125);
        table
    }

    #[test]
    fn dump_then_load_round_trips() {
        let table = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voltages.txt");
        table.dump(&path).unwrap();
        let reloaded = VoltageTable::load(&path).unwrap();
        assert_eq!(reloaded, table);
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let table = VoltageTable::parse("# header\n\n1;800000;0.75\n# tail\n").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.voltage(1, 800_000), Some(0.75));
        assert_eq!(table.voltage(1, 900_000), None);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(
            VoltageTable::parse("1;800000").unwrap_err(),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            VoltageTable::parse("one;800000;0.7").unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }
}
