// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Affinity sets over virtual-core ids.
//!
//! A [`Cpumask`] is a fixed-width bit vector indexed by virtual-core id. It
//! is the currency of the task module: affinity reads return one, affinity
//! moves accept one. Masks are sized explicitly by the id space of the
//! topology they refer to, so masks built against different machines do not
//! silently mix.

use std::fmt;
use std::ops::{BitAndAssign, BitOrAssign};

use bitvec::prelude::*;

use crate::{Error, Result};

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// An empty mask spanning `nr_cpu_ids` ids.
    pub fn new(nr_cpu_ids: usize) -> Self {
        Self {
            mask: bitvec![u64, Lsb0; 0; nr_cpu_ids],
        }
    }

    /// Builds a mask from a kernel cpulist string such as `0-3,7,9-10`.
    pub fn from_cpulist(nr_cpu_ids: usize, cpulist: &str) -> Result<Self> {
        let mut mask = Self::new(nr_cpu_ids);
        for id in parse_cpulist(cpulist)? {
            mask.set_cpu(id)?;
        }
        Ok(mask)
    }

    /// Builds a mask from a hexadecimal string, optionally `0x`-prefixed.
    pub fn from_hex(nr_cpu_ids: usize, s: &str) -> Result<Self> {
        let mut hex_str = s.strip_prefix("0x").unwrap_or(s).replace('_', "");
        if hex_str.len() % 2 != 0 {
            hex_str.insert(0, '0');
        }
        let bytes = hex::decode(&hex_str)
            .map_err(|e| Error::InvalidArgument(format!("bad cpumask {:?}: {}", s, e)))?;

        let mut mask = Self::new(nr_cpu_ids);
        for (index, &byte) in bytes.iter().rev().enumerate() {
            let mut val = byte;
            while val != 0 {
                let bit = val.trailing_zeros() as usize;
                val &= !(1 << bit);
                mask.set_cpu(index * 8 + bit)?;
            }
        }
        Ok(mask)
    }

    pub fn nr_cpu_ids(&self) -> usize {
        self.mask.len()
    }

    fn check(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            return Err(Error::InvalidArgument(format!(
                "cpu {} outside mask of {} ids",
                cpu,
                self.mask.len()
            )));
        }
        Ok(())
    }

    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    pub fn test_cpu(&self, cpu: usize) -> bool {
        self.mask.get(cpu).map(|bit| *bit).unwrap_or(false)
    }

    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Iterates over the set ids, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

impl FromIterator<usize> for Cpumask {
    /// Collects ids into a mask just wide enough to hold them.
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let ids: Vec<usize> = iter.into_iter().collect();
        let width = ids.iter().max().map_or(0, |m| m + 1);
        let mut mask = Cpumask::new(width);
        for id in ids {
            mask.set_cpu(id).unwrap();
        }
        mask
    }
}

impl BitAndAssign<&Cpumask> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Cpumask) {
        let rhs_words = rhs.mask.as_raw_slice();
        for (i, word) in self.mask.as_raw_mut_slice().iter_mut().enumerate() {
            *word &= rhs_words.get(i).copied().unwrap_or(0);
        }
    }
}

impl BitOrAssign<&Cpumask> for Cpumask {
    /// Ids beyond this mask's width are dropped.
    fn bitor_assign(&mut self, rhs: &Cpumask) {
        for id in rhs.iter() {
            if id < self.mask.len() {
                self.mask.set(id, true);
            }
        }
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let slice = self.mask.as_raw_slice();
        let mut hex = String::new();
        for word in slice.iter().rev() {
            if hex.is_empty() && *word == 0 {
                continue;
            }
            if hex.is_empty() {
                hex = format!("{:x}", word);
            } else {
                hex.push_str(&format!("{:016x}", word));
            }
        }
        if hex.is_empty() {
            hex.push('0');
        }
        write!(f, "0x{}", hex)
    }
}

impl fmt::Debug for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:<{}>", self.mask.len(), self)
    }
}

/// Parses a kernel cpulist string (`0-3,7`) into ids.
pub(crate) fn parse_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let mut ids = vec![];
    for group in cpulist.split(',') {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        let (lo, hi) = match group.split_once('-') {
            Some((lo, hi)) => (parse_id(lo)?, parse_id(hi)?),
            None => {
                let id = parse_id(group)?;
                (id, id)
            }
        };
        if hi < lo {
            return Err(Error::InvalidArgument(format!(
                "backwards cpulist range {:?}",
                group
            )));
        }
        ids.extend(lo..=hi);
    }
    Ok(ids)
}

fn parse_id(tok: &str) -> Result<usize> {
    tok.trim()
        .parse::<usize>()
        .map_err(|e| Error::InvalidArgument(format!("bad cpulist element {:?}: {}", tok, e)))
}
