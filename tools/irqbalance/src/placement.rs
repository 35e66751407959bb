// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Placement Engine
//!
//! Finds a home for every irq in the pending pool. Irqs are taken in order
//! of decreasing class, then decreasing load, and each is pushed down the
//! hierarchy one layer at a time:
//!
//! 1. An irq pinned to a NUMA node which still has usable CPUs goes straight
//!    to that node. Otherwise the least loaded node wins.
//!
//! 2. Within the winner, the least loaded child wins, as long as the irq's
//!    balance level allows living that deep. On an exact load tie the child
//!    with fewer resident irqs is preferred.
//!
//! Every winner is charged the irq's load right away so that later irqs of
//! the same pass see it.

use std::cmp::Reverse;

use irq_utils::Cpumask;
use log::debug;
use log::warn;

use crate::interrupts::BalanceLevel;
use crate::interrupts::HintPolicy;
use crate::interrupts::IrqInfo;
use crate::interrupts::IrqRegistry;
use crate::topology::ObjId;
use crate::topology::ObjKind;
use crate::topology::Topology;

/// Irqs detached from any object, waiting for placement.
#[derive(Debug, Default)]
pub struct PendingPool {
    irqs: Vec<u32>,
}

impl PendingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.irqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.irqs.is_empty()
    }

    pub fn contains(&self, irq: u32) -> bool {
        self.irqs.contains(&irq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &u32> {
        self.irqs.iter()
    }

    pub fn clear(&mut self) {
        self.irqs.clear();
    }

    /// Detach @info from its object and queue it for placement.
    pub fn migrate(&mut self, topo: &mut Topology, info: &mut IrqInfo) {
        if let Some(obj) = info.assigned_obj.take() {
            topo.detach_irq(obj, info.irq);
        }
        info.moved = true;
        if !self.contains(info.irq) {
            self.irqs.push(info.irq);
        }
    }

    /// Queue every irq that may be balanced at all.
    pub fn seed(&mut self, topo: &mut Topology, reg: &mut IrqRegistry) {
        for info in reg.iter_mut() {
            if info.balance_level == BalanceLevel::None {
                continue;
            }
            self.migrate(topo, info);
        }
    }
}

#[derive(Debug)]
struct Candidate {
    irq: u32,
    load: u64,
    balance_level: BalanceLevel,
    hint_policy: HintPolicy,
    affinity_hint: Cpumask,
    numa_override: Option<i32>,
}

/// Pick the object among @objs that should receive @cand.
fn find_best_object(topo: &Topology, objs: &[ObjId], cand: &Candidate) -> Option<ObjId> {
    let mut best: Option<ObjId> = None;
    let mut best_cost = u64::MAX;
    let mut least_irqs: Option<ObjId> = None;

    for &id in objs {
        let obj = topo.obj(id);

        if obj.kind == ObjKind::Node {
            if topo.numa_available() && obj.id == -1 {
                continue;
            }
            if !obj.mask.intersects(topo.unbanned_cpus()) {
                continue;
            }
        }
        if cand.hint_policy == HintPolicy::Subset
            && !cand.affinity_hint.is_empty()
            && !cand.affinity_hint.intersects(&obj.mask)
        {
            continue;
        }
        if obj.powersave {
            continue;
        }

        if obj.load < best_cost || best.is_none() {
            best = Some(id);
            best_cost = obj.load;
            least_irqs = None;
        } else if obj.load == best_cost {
            if let Some(fewest) = least_irqs.or(best) {
                if obj.interrupts.len() < topo.obj(fewest).interrupts.len() {
                    least_irqs = Some(id);
                }
            }
        }
    }

    least_irqs.or(best)
}

/// Place a single irq. Returns the object it ends up on, or None if it has
/// to stay pending.
fn place_irq(topo: &mut Topology, cand: &Candidate) -> Option<ObjId> {
    if cand.balance_level == BalanceLevel::None && topo.banned_cpus().is_empty() {
        return None;
    }

    let mut cur = None;
    if let Some(node_id) = cand.numa_override {
        let node = topo.node(node_id);
        let obj = topo.obj(node);
        if obj.id != -1 && obj.mask.intersects(topo.unbanned_cpus()) {
            topo.obj_mut(node).load += cand.load + 1;
            cur = Some(node);
        }
    }

    let mut cur = match cur {
        Some(node) => node,
        None => {
            let nodes = topo.layer(ObjKind::Node).to_vec();
            let node = find_best_object(topo, &nodes, cand)?;
            topo.obj_mut(node).load += cand.load;
            node
        }
    };

    while let Some(kind) = topo.obj(cur).kind.child() {
        if !cand.balance_level.permits(kind) {
            break;
        }
        let children = topo.children(cur).to_vec();
        match find_best_object(topo, &children, cand) {
            Some(child) => {
                topo.obj_mut(child).load += cand.load;
                cur = child;
            }
            None => break,
        }
    }

    Some(cur)
}

/// Assign every pending irq an object. Irqs which can't be placed stay in
/// @pool.
pub fn place(topo: &mut Topology, reg: &mut IrqRegistry, pool: &mut PendingPool) {
    let mut cands: Vec<Candidate> = pool
        .irqs
        .iter()
        .filter_map(|&irq| reg.lookup(irq))
        .filter(|info| !info.banned)
        .map(|info| Candidate {
            irq: info.irq,
            load: info.load,
            balance_level: info.balance_level,
            hint_policy: info.hint_policy,
            affinity_hint: info.affinity_hint.clone(),
            numa_override: info.numa_override,
        })
        .collect();
    cands.sort_by_key(|c| {
        let class = reg.lookup(c.irq).map(|info| info.class);
        (Reverse(class), Reverse(c.load), c.irq)
    });

    pool.clear();
    for cand in cands.iter() {
        let info = match reg.lookup_mut(cand.irq) {
            Some(info) => info,
            None => continue,
        };
        match place_irq(topo, cand) {
            Some(obj) => {
                topo.attach_irq(obj, cand.irq);
                info.assigned_obj = Some(obj);
                info.moved = true;
                debug!(
                    "Placed irq {} on {}[{}]",
                    cand.irq,
                    topo.obj(obj).kind,
                    topo.obj(obj).id
                );
            }
            None => pool.irqs.push(cand.irq),
        }
    }
}

/// Check that every resident irq points back at the object hosting it.
/// Returns the number of mismatches.
pub fn validate(topo: &Topology, reg: &IrqRegistry) -> usize {
    let mut errors = 0;
    for kind in ObjKind::TOP_DOWN {
        for &id in topo.layer(kind) {
            for &irq in topo.obj(id).interrupts.iter() {
                let assigned = reg.lookup(irq).and_then(|info| info.assigned_obj);
                if assigned != Some(id) {
                    warn!(
                        "Object validation error: irq {} points to {:?}, should be {}",
                        irq, assigned, id
                    );
                    errors += 1;
                }
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::IrqClass;
    use crate::interrupts::IrqMetadata;
    use crate::interrupts::IrqType;
    use crate::policy::IrqPolicy;
    use crate::topology::tests::host_2x2x2;
    use crate::topology::tests::host_flat;

    fn add_irq(reg: &mut IrqRegistry, irq: u32, class: IrqClass, load: u64) {
        reg.add(IrqMetadata::new(irq, IrqType::MsiX, class), &IrqPolicy::default());
        reg.lookup_mut(irq).unwrap().load = load;
    }

    fn resident_kind(topo: &Topology, reg: &IrqRegistry, irq: u32) -> ObjKind {
        topo.obj(reg.lookup(irq).unwrap().assigned_obj.unwrap()).kind
    }

    #[test]
    fn test_residency_follows_balance_level() {
        let mut topo = Topology::build(&host_2x2x2(), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        add_irq(&mut reg, 1, IrqClass::Other, 10);
        add_irq(&mut reg, 2, IrqClass::Legacy, 10);
        add_irq(&mut reg, 3, IrqClass::Ethernet, 10);
        add_irq(&mut reg, 4, IrqClass::Storage, 10);
        reg.lookup_mut(4).unwrap().balance_level = BalanceLevel::None;

        let mut pool = PendingPool::new();
        pool.seed(&mut topo, &mut reg);
        assert!(!pool.contains(4));
        place(&mut topo, &mut reg, &mut pool);

        assert!(pool.is_empty());
        assert_eq!(resident_kind(&topo, &reg, 1), ObjKind::Package);
        assert_eq!(resident_kind(&topo, &reg, 2), ObjKind::Cache);
        assert_eq!(resident_kind(&topo, &reg, 3), ObjKind::Cpu);
        assert!(reg.lookup(4).unwrap().assigned_obj.is_none());
        assert_eq!(validate(&topo, &reg), 0);
    }

    #[test]
    fn test_level_none_is_placed_on_a_node_with_banned_cpus() {
        let mut topo = Topology::build(&host_2x2x2(), &Cpumask::from_cpus([7]).unwrap()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        add_irq(&mut reg, 5, IrqClass::Storage, 10);
        reg.lookup_mut(5).unwrap().balance_level = BalanceLevel::None;

        let mut pool = PendingPool::new();
        let mut info = reg.lookup(5).unwrap().clone();
        pool.migrate(&mut topo, &mut info);
        place(&mut topo, &mut reg, &mut pool);
        assert_eq!(resident_kind(&topo, &reg, 5), ObjKind::Node);
    }

    #[test]
    fn test_tie_prefers_fewer_irqs() {
        let mut topo = Topology::build(&host_flat(2), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        add_irq(&mut reg, 1, IrqClass::Storage, 1);
        add_irq(&mut reg, 2, IrqClass::Storage, 1);
        add_irq(&mut reg, 3, IrqClass::Storage, 1);

        // cpu0 holds two irqs, cpu1 one, and both carry the same load.
        let cpu0 = topo.find_cpu(0).unwrap();
        let cpu1 = topo.find_cpu(1).unwrap();
        for (irq, cpu) in [(1, cpu0), (2, cpu0), (3, cpu1)] {
            topo.attach_irq(cpu, irq);
            reg.lookup_mut(irq).unwrap().assigned_obj = Some(cpu);
        }
        topo.obj_mut(cpu0).load = 100;
        topo.obj_mut(cpu1).load = 100;

        add_irq(&mut reg, 4, IrqClass::Ethernet, 50);
        let mut pool = PendingPool::new();
        let mut info = reg.lookup(4).unwrap().clone();
        pool.migrate(&mut topo, &mut info);
        place(&mut topo, &mut reg, &mut pool);

        assert_eq!(reg.lookup(4).unwrap().assigned_obj, Some(cpu1));
        assert_eq!(topo.obj(cpu1).load, 150);
    }

    #[test]
    fn test_tie_picks_sibling_with_fewest_irqs() {
        let mut topo = Topology::build(&host_flat(3), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        let cpus: Vec<ObjId> = (0..3).map(|cpu| topo.find_cpu(cpu).unwrap()).collect();

        // Three irqs on cpu0, one on cpu1, two on cpu2, all equally loaded.
        for (irq, cpu) in [(1, 0), (2, 0), (3, 0), (4, 1), (5, 2), (6, 2)] {
            add_irq(&mut reg, irq, IrqClass::Storage, 1);
            topo.attach_irq(cpus[cpu], irq);
            reg.lookup_mut(irq).unwrap().assigned_obj = Some(cpus[cpu]);
        }
        for &cpu in cpus.iter() {
            topo.obj_mut(cpu).load = 100;
        }

        add_irq(&mut reg, 7, IrqClass::Ethernet, 10);
        let mut pool = PendingPool::new();
        let mut info = reg.lookup(7).unwrap().clone();
        pool.migrate(&mut topo, &mut info);
        place(&mut topo, &mut reg, &mut pool);

        assert_eq!(reg.lookup(7).unwrap().assigned_obj, Some(cpus[1]));
        assert_eq!(topo.obj(cpus[1]).interrupts, vec![4, 7]);
    }

    #[test]
    fn test_pool_order_and_load_charging() {
        let mut topo = Topology::build(&host_flat(2), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        add_irq(&mut reg, 1, IrqClass::Storage, 10);
        add_irq(&mut reg, 2, IrqClass::Ethernet, 5);
        add_irq(&mut reg, 3, IrqClass::Ethernet, 40);

        let mut pool = PendingPool::new();
        pool.seed(&mut topo, &mut reg);
        place(&mut topo, &mut reg, &mut pool);

        // irq 3 goes first onto cpu0, irq 2 then sees cpu0 loaded and takes
        // cpu1, irq 1 joins irq 2.
        let cpu0 = topo.find_cpu(0).unwrap();
        let cpu1 = topo.find_cpu(1).unwrap();
        assert_eq!(topo.obj(cpu0).interrupts, vec![3]);
        assert_eq!(topo.obj(cpu1).interrupts, vec![2, 1]);
        assert_eq!(topo.obj(cpu1).load, 15);
        assert!(reg.iter().all(|info| info.moved));
    }

    #[test]
    fn test_numa_override() {
        let mut topo = Topology::build(&host_2x2x2(), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        add_irq(&mut reg, 1, IrqClass::Ethernet, 10);
        reg.lookup_mut(1).unwrap().numa_override = Some(1);
        // Make node 1 look busier; the override still wins.
        let node1 = topo.find_node(1).unwrap();
        topo.obj_mut(node1).load = 1000;

        let mut pool = PendingPool::new();
        pool.seed(&mut topo, &mut reg);
        place(&mut topo, &mut reg, &mut pool);

        let cpu = reg.lookup(1).unwrap().assigned_obj.unwrap();
        assert_eq!(topo.obj(cpu).kind, ObjKind::Cpu);
        assert!(topo.obj(cpu).mask.is_subset(&topo.obj(node1).mask));
        assert_eq!(topo.obj(node1).load, 1011);
    }

    #[test]
    fn test_numa_override_falls_through_without_usable_cpus() {
        let banned = Cpumask::from_cpus([4, 5, 6, 7]).unwrap();
        let mut topo = Topology::build(&host_2x2x2(), &banned).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        add_irq(&mut reg, 1, IrqClass::Ethernet, 10);
        reg.lookup_mut(1).unwrap().numa_override = Some(1);

        let mut pool = PendingPool::new();
        pool.seed(&mut topo, &mut reg);
        place(&mut topo, &mut reg, &mut pool);

        let node1 = topo.find_node(1).unwrap();
        let node0 = topo.find_node(0).unwrap();
        assert_eq!(topo.obj(node1).load, 0);
        assert_eq!(topo.obj(node0).load, 10);
        let cpu = reg.lookup(1).unwrap().assigned_obj.unwrap();
        assert!(topo.obj(cpu).mask.is_subset(&topo.obj(node0).mask));
    }

    #[test]
    fn test_subset_hint_and_powersave_exclude_objects() {
        let mut topo = Topology::build(&host_flat(4), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Subset);
        add_irq(&mut reg, 1, IrqClass::Ethernet, 10);
        reg.lookup_mut(1).unwrap().affinity_hint = Cpumask::from_cpus([2, 3]).unwrap();

        let cpu2 = topo.find_cpu(2).unwrap();
        topo.obj_mut(cpu2).powersave = true;

        let mut pool = PendingPool::new();
        pool.seed(&mut topo, &mut reg);
        place(&mut topo, &mut reg, &mut pool);
        assert_eq!(reg.lookup(1).unwrap().assigned_obj, topo.find_cpu(3));
    }

    #[test]
    fn test_no_candidate_keeps_irq_pending_or_on_parent() {
        let mut topo = Topology::build(&host_flat(2), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Subset);
        add_irq(&mut reg, 1, IrqClass::Ethernet, 10);
        add_irq(&mut reg, 2, IrqClass::Ethernet, 10);
        // No object intersects cpu 9.
        reg.lookup_mut(1).unwrap().affinity_hint = Cpumask::from_cpus([9]).unwrap();

        for cpu in [0, 1] {
            let id = topo.find_cpu(cpu).unwrap();
            topo.obj_mut(id).powersave = true;
        }

        let mut pool = PendingPool::new();
        pool.seed(&mut topo, &mut reg);
        place(&mut topo, &mut reg, &mut pool);

        assert!(pool.contains(1));
        assert_eq!(pool.len(), 1);
        assert_eq!(resident_kind(&topo, &reg, 2), ObjKind::Cache);
    }

    #[test]
    fn test_validate_reports_mismatch() {
        let mut topo = Topology::build(&host_flat(2), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        add_irq(&mut reg, 1, IrqClass::Ethernet, 10);
        let cpu0 = topo.find_cpu(0).unwrap();
        topo.attach_irq(cpu0, 1);
        assert_eq!(validate(&topo, &reg), 1);
        reg.lookup_mut(1).unwrap().assigned_obj = Some(cpu0);
        assert_eq!(validate(&topo, &reg), 0);
    }
}
