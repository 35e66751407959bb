// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for irqbalance
//!
//! This crate collects the pieces of irqbalance that deal with the raw
//! kernel interfaces, so that the balancing engine itself only ever sees
//! structured data.
//!
//! ## Cpumask
//!
//! `Cpumask` is a fixed-capacity CPU bitset which parses and formats the
//! kernel's hexadecimal mask and cpulist representations.
//!
//! ## Host Topology
//!
//! `HostTopology` reads the online CPUs, their cache and package siblings and
//! the NUMA nodes from sysfs. Missing files degrade to permissive defaults.
//!
//! ## Interrupts
//!
//! Helpers to enumerate PCI devices and their interrupt vectors, to parse
//! `/proc/interrupts`, and to read and write `/proc/irq/N/smp_affinity`.

#[macro_use]
extern crate lazy_static;

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

mod misc;
pub use misc::read_file_string;
pub use misc::read_from_file;

mod topology;
pub use topology::HostCpu;
pub use topology::HostNode;
pub use topology::HostTopology;

pub mod irq;

use std::path::Path;

/// Capacity of every Cpumask.
pub const MAX_CPUS: usize = 1024;

lazy_static! {
    /// Number of possible CPU IDs on the host, used to trim formatted masks.
    pub static ref NR_CPU_IDS: usize = read_cpu_ids(Path::new("/sys"))
        .ok()
        .and_then(|ids| ids.last().copied())
        .map(|last| (last + 1).min(MAX_CPUS))
        .unwrap_or(MAX_CPUS);
}

/// Read the list of possible CPU IDs below @sysfs_root.
pub fn read_cpu_ids(sysfs_root: &Path) -> anyhow::Result<Vec<usize>> {
    let possible = read_file_string(&sysfs_root.join("devices/system/cpu/possible"))?;
    read_cpulist(&possible)
}
