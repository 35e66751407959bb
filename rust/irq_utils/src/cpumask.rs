// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A fixed-capacity set of CPU indices, along with the helpers irqbalance
//! needs to read and write the masks the kernel exposes in sysfs and procfs.
//!
//! Cpumask
//! -------
//!
//! A Cpumask object is a BitVec of u64's with room for `MAX_CPUS` CPUs.
//!
//! Masks can be created empty, or parsed from the kernel's hexadecimal mask
//! format (comma separated 32-bit groups, as found in `smp_affinity`,
//! `shared_cpu_map`, `core_siblings` and `local_cpus`) or from a cpulist:
//!
//!```
//!     use irq_utils::Cpumask;
//!     let empty = Cpumask::new();
//!     let from_hex = Cpumask::from_str("00000000,000000f0").unwrap();
//!     let from_list = Cpumask::from_cpulist("4-7").unwrap();
//!     assert_eq!(from_hex, from_list);
//!     assert!(empty.is_empty());
//!```
//!
//! The special values "none" and "all" respectively yield an empty and a
//! full mask.
//!
//! Formatting a Cpumask with `{}` or `{:x}` produces the kernel's format,
//! trimmed to the number of possible CPU IDs on the host, which is what
//! `/proc/irq/N/smp_affinity` accepts.

use crate::MAX_CPUS;
use crate::NR_CPU_IDS;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Default for Cpumask {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= MAX_CPUS {
            bail!("Invalid CPU {} passed, max {}", cpu, MAX_CPUS);
        }

        Ok(())
    }

    /// Build a new empty Cpumask object.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; MAX_CPUS],
        }
    }

    /// Build a Cpumask with every possible CPU set.
    pub fn full() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; MAX_CPUS],
        }
    }

    /// Build a Cpumask object from a hexadecimal string. Group separators
    /// (',' and '_'), an optional "0x" prefix and trailing whitespace are
    /// accepted. An empty string yields an empty mask.
    pub fn from_str(cpumask: &str) -> Result<Cpumask> {
        let cpumask = cpumask.trim().trim_end_matches('\0');
        match cpumask {
            "none" | "" => return Ok(Self::new()),
            "all" => return Ok(Self::full()),
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace(|c: char| c == '_' || c == ',', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = bitvec![u64, Lsb0; 0; MAX_CPUS];
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= MAX_CPUS {
                    bail!(
                        "Found cpu ({}) in cpumask ({}) which is larger than {}",
                        cpu,
                        cpumask,
                        MAX_CPUS
                    );
                }
                mask.set(cpu, true);
            }
        }

        Ok(Self { mask })
    }

    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    /// Build a Cpumask with the given CPUs set.
    pub fn from_cpus<I>(cpus: I) -> Result<Cpumask>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut mask = Cpumask::new();
        for cpu in cpus {
            mask.set_cpu(cpu)?;
        }
        Ok(mask)
    }

    /// Return a slice of u64's whose bits reflect the Cpumask.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. CPUs beyond
    /// the capacity of the mask are never set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Create a Cpumask that is the negation of the current Cpumask.
    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= other.mask.clone();
        new
    }

    /// Return true if at least one CPU is set in both masks.
    pub fn intersects(&self, other: &Cpumask) -> bool {
        self.mask
            .as_raw_slice()
            .iter()
            .zip(other.mask.as_raw_slice())
            .any(|(a, b)| a & b != 0)
    }

    /// Return true if every CPU set in this mask is also set in @other.
    pub fn is_subset(&self, other: &Cpumask) -> bool {
        self.mask
            .as_raw_slice()
            .iter()
            .zip(other.mask.as_raw_slice())
            .all(|(a, b)| a & !b == 0)
    }

    /// Iterate over each element of a Cpumask, and return the indices with bits
    /// set.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    fn fmt_kernel(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Never drop a set bit, even one past the possible CPU IDs.
        let nr_bits = match self.mask.last_one() {
            Some(last) => (*NR_CPU_IDS).max(last + 1),
            None => *NR_CPU_IDS,
        };
        masks.truncate(nr_bits.div_ceil(32).max(1));

        // Print the highest 32bit. Trim digits beyond nr_bits.
        let width = match nr_bits.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        write!(f, "{:0width$x}", top, width = width)?;

        // The rest in descending order.
        for submask in masks.iter().rev() {
            write!(f, ",{submask:08x}")?;
        }
        Ok(())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    if cpulist.is_empty() {
        return Ok(vec![]);
    }
    let cpu_groups: Vec<&str> = cpulist.split(',').collect();
    let mut cpu_ids = vec![];
    for group in cpu_groups.iter() {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.mask.mask[self.index.min(MAX_CPUS)..].first_one()?;
        let cpu = self.index + next;
        self.index = cpu + 1;
        Some(cpu)
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_kernel(f)
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_kernel(f)
    }
}
