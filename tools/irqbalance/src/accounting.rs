// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Load Accounting
//!
//! Turns raw kernel counters into a load figure for every topology object
//! and every resident irq. A sample runs in four phases:
//!
//! 1. Interrupt counters. Cumulative per-irq counts are summed across CPU
//!    columns. An unknown irq, a column count that doesn't match the number
//!    of online CPUs, a count going backwards or a previously listed irq
//!    disappearing means the registries are stale, and a rescan is
//!    requested instead.
//!
//! 2. CPU busy time. The irq + softirq time of every CPU, in nanoseconds,
//!    minus the previous sample. The first sample after a build only sets
//!    the baseline.
//!
//! 3. Propagation. Working up from the Cpu layer, every object's load is
//!    split evenly among its children and added to its parent.
//!
//! 4. Apportioning. The load of an object is distributed over its resident
//!    irqs by their share of the firings in its branch. Every irq ends up
//!    with a load of at least 1 so that idle irqs still sort.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use irq_utils::irq::ProcInterrupts;
use log::debug;
use log::info;
use log::warn;

use crate::interrupts::IrqRegistry;
use crate::topology::ObjKind;
use crate::topology::Topology;

const NSEC_PER_USEC: u64 = 1000;

/// Source of the raw counters sampled every cycle.
pub trait CounterSource {
    fn irq_counts(&mut self) -> Result<ProcInterrupts>;
    /// Cumulative irq + softirq time per CPU in nanoseconds.
    fn cpu_busy_ns(&mut self) -> Result<BTreeMap<usize, u64>>;
}

pub struct ProcCounters {
    procfs_root: PathBuf,
    proc_reader: procfs::ProcReader,
}

impl ProcCounters {
    pub fn new(procfs_root: &Path) -> Self {
        Self {
            procfs_root: procfs_root.to_path_buf(),
            proc_reader: procfs::ProcReader::new_with_custom_procfs(procfs_root.to_path_buf()),
        }
    }
}

impl CounterSource for ProcCounters {
    fn irq_counts(&mut self) -> Result<ProcInterrupts> {
        irq_utils::irq::read_proc_interrupts(&self.procfs_root)
    }

    fn cpu_busy_ns(&mut self) -> Result<BTreeMap<usize, u64>> {
        let cpus_map = self
            .proc_reader
            .read_stat()
            .context("Failed to read procfs")?
            .cpus_map
            .ok_or_else(|| anyhow!("Expected cpus_map to exist"))?;

        let mut busy = BTreeMap::new();
        for (cpu, stat) in cpus_map.iter() {
            if let procfs::CpuStat {
                irq_usec: Some(irq),
                softirq_usec: Some(softirq),
                ..
            } = stat
            {
                busy.insert(*cpu as usize, (irq + softirq) * NSEC_PER_USEC);
            }
        }
        Ok(busy)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Loads were recomputed.
    Updated,
    /// Counters disagree with the registries, which must be rebuilt.
    Rescan,
    /// Not every CPU reported busy time. Loads are left untouched.
    Incomplete,
}

#[derive(Debug, Default)]
pub struct LoadAccounting {
    msi_warned: bool,
}

impl LoadAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(
        &mut self,
        src: &mut dyn CounterSource,
        topo: &mut Topology,
        reg: &mut IrqRegistry,
    ) -> Result<SampleOutcome> {
        if !self.sample_irq_counts(src, topo, reg)? {
            return Ok(SampleOutcome::Rescan);
        }
        if !self.sample_cpu_busy(src, topo)? {
            return Ok(SampleOutcome::Incomplete);
        }
        propagate_and_apportion(topo, reg);
        Ok(SampleOutcome::Updated)
    }

    /// Returns false when a rescan is needed.
    fn sample_irq_counts(
        &mut self,
        src: &mut dyn CounterSource,
        topo: &Topology,
        reg: &mut IrqRegistry,
    ) -> Result<bool> {
        let interrupts = src.irq_counts()?;

        if interrupts.has_msi && !reg.has_msi_devices() && !self.msi_warned {
            warn!("MSI interrupts found in /proc/interrupts but none found in sysfs");
            warn!("Balancing of MSI interrupts is likely to be broken");
            self.msi_warned = true;
        }

        let mut present = BTreeSet::new();
        for proc_irq in interrupts.irqs.iter() {
            let info = match reg.lookup_mut(proc_irq.irq) {
                Some(info) => info,
                None => {
                    info!("irq {} is not in the database, rescanning", proc_irq.irq);
                    return Ok(false);
                }
            };

            if proc_irq.counts.len() != topo.count() {
                info!(
                    "irq {} reports {} cpus, expected {}, rescanning",
                    proc_irq.irq,
                    proc_irq.counts.len(),
                    topo.count()
                );
                return Ok(false);
            }

            let count = proc_irq.total();
            if count < info.irq_count {
                info!("irq {} count went backwards, rescanning", proc_irq.irq);
                return Ok(false);
            }
            info.last_irq_count = info.irq_count;
            info.irq_count = count;
            info.seen = true;
            present.insert(proc_irq.irq);
        }

        // Irqs never listed, such as unused legacy lines, are not missed.
        if let Some(info) = reg
            .iter()
            .find(|info| info.seen && !present.contains(&info.irq))
        {
            info!("irq {} is gone from /proc/interrupts, rescanning", info.irq);
            return Ok(false);
        }

        Ok(true)
    }

    /// Returns false when some CPU went unsampled.
    fn sample_cpu_busy(
        &mut self,
        src: &mut dyn CounterSource,
        topo: &mut Topology,
    ) -> Result<bool> {
        let busy = src.cpu_busy_ns()?;

        let cpus = topo.layer(ObjKind::Cpu).to_vec();
        let mut sampled = 0;
        for id in cpus.iter().copied() {
            let obj = topo.obj_mut(id);
            let now = match busy.get(&(obj.id as usize)) {
                Some(&now) => now,
                None => continue,
            };
            obj.load = match obj.last_cpu_counter {
                Some(last) => now.saturating_sub(last),
                None => 0,
            };
            obj.last_cpu_counter = Some(now);
            sampled += 1;
        }

        if sampled != cpus.len() {
            warn!(
                "Collected load for {} of {} cpus, balancing is broken",
                sampled,
                cpus.len()
            );
            return Ok(false);
        }
        Ok(true)
    }
}

/// Sum of the firings attributed to the branch ending at each object: its
/// parent's share split evenly among the parent's children, plus the
/// firings of its own irqs.
fn branch_irq_shares(topo: &Topology, reg: &IrqRegistry) -> Vec<u64> {
    let mut shares = Vec::new();
    for kind in ObjKind::TOP_DOWN {
        for &id in topo.layer(kind) {
            if shares.len() <= id {
                shares.resize(id + 1, 0);
            }
            let inherited = match topo.parent(id) {
                Some(parent) => shares[parent] / topo.children(parent).len().max(1) as u64,
                None => 0,
            };
            let own: u64 = topo
                .obj(id)
                .interrupts
                .iter()
                .filter_map(|&irq| reg.lookup(irq))
                .map(|info| info.delta())
                .sum();
            shares[id] = inherited + own;
        }
    }
    shares
}

fn propagate_and_apportion(topo: &mut Topology, reg: &mut IrqRegistry) {
    for kind in [ObjKind::Cache, ObjKind::Package, ObjKind::Node] {
        for id in topo.layer(kind).to_vec() {
            topo.obj_mut(id).load = 0;
        }
    }

    let shares = branch_irq_shares(topo, reg);

    for kind in ObjKind::BOTTOM_UP {
        for id in topo.layer(kind).to_vec() {
            let nr_children = topo.children(id).len().max(1) as u64;
            let obj = topo.obj_mut(id);
            obj.load /= nr_children;
            let load = obj.load;

            if !obj.interrupts.is_empty() {
                let share = shares[id];
                let slice = if share > 0 { load / share } else { 1 };
                for &irq in obj.interrupts.iter() {
                    if let Some(info) = reg.lookup_mut(irq) {
                        info.load = (info.delta() * slice).max(1);
                    }
                }
            }

            if let Some(parent) = topo.parent(id) {
                topo.obj_mut(parent).load += load;
            }
        }
    }

    debug!("Load accounting complete");
}
