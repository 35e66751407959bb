// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Pushes placement decisions to the kernel through
//! `/proc/irq/<irq>/smp_affinity`.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use irq_utils::Cpumask;
use log::debug;
use log::warn;

use crate::interrupts::HintPolicy;
use crate::interrupts::IrqInfo;
use crate::interrupts::IrqRegistry;
use crate::topology::Topology;

pub trait AffinitySink {
    fn read_affinity(&self, irq: u32) -> Result<Cpumask>;
    fn write_affinity(&mut self, irq: u32, mask: &Cpumask) -> Result<()>;
}

pub struct ProcAffinity {
    procfs_root: PathBuf,
}

impl ProcAffinity {
    pub fn new(procfs_root: &Path) -> Self {
        Self {
            procfs_root: procfs_root.to_path_buf(),
        }
    }
}

impl AffinitySink for ProcAffinity {
    fn read_affinity(&self, irq: u32) -> Result<Cpumask> {
        irq_utils::irq::read_smp_affinity(&self.procfs_root, irq)
    }

    fn write_affinity(&mut self, irq: u32, mask: &Cpumask) -> Result<()> {
        irq_utils::irq::write_smp_affinity(&self.procfs_root, irq, mask)
    }
}

/// The mask @info should be given, or None if it must be left alone.
fn target_mask(topo: &Topology, info: &IrqInfo) -> Option<Cpumask> {
    let obj = info.assigned_obj?;
    let hint = &info.affinity_hint;

    if info.hint_policy == HintPolicy::Exact && !hint.is_empty() {
        if hint.intersects(topo.banned_cpus()) {
            warn!("irq {} affinity_hint and banned cpus conflict", info.irq);
            return None;
        }
        return Some(hint.clone());
    }

    let mut mask = topo.obj(obj).mask.clone();
    if info.hint_policy == HintPolicy::Subset && !hint.is_empty() {
        mask = mask.and(hint);
        if !mask.intersects(topo.unbanned_cpus()) {
            warn!(
                "irq {} affinity_hint subset empty, skipping activation",
                info.irq
            );
            return None;
        }
    }
    Some(mask)
}

/// Write the affinity of every moved irq. An irq whose write was skipped or
/// failed stays marked as moved and is retried next cycle. Returns the number
/// of masks written.
pub fn activate(topo: &Topology, reg: &mut IrqRegistry, sink: &mut dyn AffinitySink) -> usize {
    let mut written = 0;

    for info in reg.iter_mut() {
        if !info.moved {
            continue;
        }
        let mask = match target_mask(topo, info) {
            Some(mask) if !mask.is_empty() => mask,
            _ => continue,
        };

        match sink.read_affinity(info.irq) {
            Ok(current) if current == mask => continue,
            Ok(_) => {}
            Err(e) => {
                debug!("irq {}: failed to read smp_affinity: {}", info.irq, e);
                continue;
            }
        }

        match sink.write_affinity(info.irq, &mask) {
            Ok(()) => {
                debug!("irq {}: smp_affinity set to {}", info.irq, mask);
                info.moved = false;
                written += 1;
            }
            Err(e) => warn!("Cannot change irq {}'s affinity: {:#}", info.irq, e),
        }
    }

    written
}
