// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Balancer
//!
//! Decides which irqs leave their object this cycle. Each layer is looked at
//! as a set of siblings, working from the Cpu layer up to the Node layer:
//!
//! 1. Compute the total, the average and the sample standard deviation of
//!    the layer's loads, along with the minimum load.
//!
//! 2. Classify every object. An object at least one standard deviation below
//!    the average is under-loaded, one at least a standard deviation above
//!    it is over-loaded.
//!
//! 3. Every object loaded above the running minimum which holds more than
//!    one irq gives up its lightest irqs for as long as doing so keeps it
//!    above the minimum plus what it gave away.
//!
//! On the Cpu layer a powersave state machine runs on top. When enough CPUs
//! idle along and none is overloaded, one of the idle CPUs is emptied and
//! excluded from placement. As soon as any CPU is overloaded again all CPUs
//! are brought back.
//!
//! Displaced irqs end up in the pending pool for the placement engine.

use std::fmt;

use log::debug;
use log::info;

use crate::interrupts::BalanceLevel;
use crate::interrupts::IrqRegistry;
use crate::placement::PendingPool;
use crate::topology::ObjId;
use crate::topology::ObjKind;
use crate::topology::Topology;

/// Powersave is only considered once the loads have settled.
const POWERSAVE_MIN_CYCLES: u64 = 5;

#[derive(Clone, Copy, Debug, PartialEq)]
enum BalanceState {
    Balanced,
    NeedsPush,
    NeedsPull,
}

impl fmt::Display for BalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceState::Balanced => write!(f, "BALANCED"),
            BalanceState::NeedsPush => write!(f, "OVER-LOADED"),
            BalanceState::NeedsPull => write!(f, "UNDER-LOADED"),
        }
    }
}

/// Load statistics of one layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerStat {
    pub kind: Option<ObjKind>,
    pub nr_objs: usize,
    pub total_load: u64,
    pub avg_load: u64,
    pub std_deviation: f64,
    pub min_load: u64,
    pub nr_over: usize,
    pub nr_under: usize,
    pub nr_powersave: usize,
    pub nr_migrated: usize,
}

impl LayerStat {
    fn compute(topo: &Topology, kind: ObjKind) -> LayerStat {
        let objs = topo.layer(kind);
        let loads: Vec<u64> = objs.iter().map(|&id| topo.obj(id).load).collect();

        let total_load: u64 = loads.iter().sum();
        let nr_objs = loads.len();
        let avg_load = total_load / nr_objs.max(1) as u64;

        let std_deviation = if nr_objs <= 1 {
            0.0
        } else {
            let deviations: u64 = loads
                .iter()
                .map(|&load| {
                    let dev = load.abs_diff(avg_load);
                    dev.saturating_mul(dev)
                })
                .fold(0u64, |acc, dev| acc.saturating_add(dev));
            ((deviations / (nr_objs as u64 - 1)) as f64).sqrt()
        };

        LayerStat {
            kind: Some(kind),
            nr_objs,
            total_load,
            avg_load,
            std_deviation,
            min_load: loads.iter().copied().min().unwrap_or(0),
            ..Default::default()
        }
    }

    fn state(&self, load: u64) -> BalanceState {
        let load = load as f64;
        let avg = self.avg_load as f64;
        if load + self.std_deviation <= avg {
            BalanceState::NeedsPull
        } else if load - self.std_deviation >= avg {
            BalanceState::NeedsPush
        } else {
            BalanceState::Balanced
        }
    }
}

impl fmt::Display for LayerStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Some(kind) => kind.to_string(),
            None => "-".to_string(),
        };
        write!(
            f,
            "{:<8} nr={:<3} load={} avg={} sd={:.2} min={} over={} under={} powersave={} migrated={}",
            kind,
            self.nr_objs,
            self.total_load,
            self.avg_load,
            self.std_deviation,
            self.min_load,
            self.nr_over,
            self.nr_under,
            self.nr_powersave,
            self.nr_migrated
        )
    }
}

pub struct Balancer {
    power_thresh: Option<usize>,
}

impl Balancer {
    pub fn new(power_thresh: Option<usize>) -> Self {
        Self { power_thresh }
    }

    /// Run one balancing pass over every layer and move the displaced irqs
    /// into @pool.
    pub fn balance(
        &self,
        topo: &mut Topology,
        reg: &mut IrqRegistry,
        pool: &mut PendingPool,
        cycle: u64,
    ) -> Vec<LayerStat> {
        let mut stats = Vec::with_capacity(ObjKind::BOTTOM_UP.len());

        for kind in ObjKind::BOTTOM_UP {
            let mut stat = LayerStat::compute(topo, kind);
            let mut powersave_cand = None;

            for id in topo.layer(kind).to_vec() {
                let obj = topo.obj(id);
                if obj.powersave {
                    stat.nr_powersave += 1;
                }

                match stat.state(obj.load) {
                    BalanceState::NeedsPull => {
                        stat.nr_under += 1;
                        if self.power_thresh.is_some()
                            && powersave_cand.is_none()
                            && !obj.powersave
                        {
                            powersave_cand = Some(id);
                        }
                    }
                    BalanceState::NeedsPush => stat.nr_over += 1,
                    BalanceState::Balanced => {}
                }

                stat.nr_migrated += Self::migrate_overloaded_irqs(topo, reg, pool, id, &mut stat);
            }

            if kind == ObjKind::Cpu {
                self.update_powersave(topo, reg, pool, &stat, powersave_cand, cycle);
            }

            debug!("{}", stat);
            stats.push(stat);
        }

        stats
    }

    /// Pull the lightest irqs off @id while it stays above the running
    /// minimum. Returns the number of irqs pulled.
    fn migrate_overloaded_irqs(
        topo: &mut Topology,
        reg: &mut IrqRegistry,
        pool: &mut PendingPool,
        id: ObjId,
        stat: &mut LayerStat,
    ) -> usize {
        let obj = topo.obj(id);
        if obj.load <= stat.min_load || obj.interrupts.len() <= 1 {
            return 0;
        }

        let mut sorted = obj.interrupts.clone();
        sorted.sort_by_key(|&irq| reg.lookup(irq).map(|info| info.load).unwrap_or(0));
        topo.obj_mut(id).interrupts = sorted.clone();

        let mut adjustment_load = topo.obj(id).load;
        let mut migrated = 0;
        for irq in sorted {
            let info = match reg.lookup_mut(irq) {
                Some(info) => info,
                None => continue,
            };

            if info.hint_pinned() || info.balance_level == BalanceLevel::None {
                continue;
            }
            if topo.obj(id).interrupts.len() <= 1 {
                continue;
            }
            // Most likely never fired, not worth moving.
            if info.load <= 1 {
                continue;
            }

            if adjustment_load.saturating_sub(info.load) <= stat.min_load + info.load {
                break;
            }
            adjustment_load -= info.load;
            stat.min_load += info.load;

            info!("Selecting irq {} for rebalancing", irq);
            pool.migrate(topo, info);
            migrated += 1;
        }

        migrated
    }

    fn update_powersave(
        &self,
        topo: &mut Topology,
        reg: &mut IrqRegistry,
        pool: &mut PendingPool,
        stat: &LayerStat,
        cand: Option<ObjId>,
        cycle: u64,
    ) {
        let thresh = match self.power_thresh {
            Some(thresh) => thresh,
            None => return,
        };
        if cycle <= POWERSAVE_MIN_CYCLES {
            return;
        }

        if stat.nr_over == 0 && stat.nr_under >= thresh {
            let cpu = match cand {
                Some(cpu) => cpu,
                None => return,
            };
            info!("cpu {} entering powersave mode", topo.obj(cpu).id);
            topo.obj_mut(cpu).powersave = true;
            for irq in topo.obj(cpu).interrupts.clone() {
                if let Some(info) = reg.lookup_mut(irq) {
                    pool.migrate(topo, info);
                }
            }
        } else if stat.nr_over > 0 && stat.nr_powersave > 0 {
            info!("Load average increasing, re-enabling all cpus for irq balancing");
            for id in topo.layer(ObjKind::Cpu).to_vec() {
                topo.obj_mut(id).powersave = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::HintPolicy;
    use crate::interrupts::IrqClass;
    use crate::interrupts::IrqMetadata;
    use crate::interrupts::IrqType;
    use crate::placement::place;
    use crate::policy::IrqPolicy;
    use crate::topology::tests::host_flat;
    use irq_utils::Cpumask;

    /// Cpus below a single cache, each with the given load and irqs.
    fn setup(cpus: &[(u64, &[(u32, u64)])]) -> (Topology, IrqRegistry) {
        let mut topo = Topology::build(&host_flat(cpus.len()), &Cpumask::new()).unwrap();
        let mut reg = IrqRegistry::new(HintPolicy::Ignore);
        for (cpu, (load, irqs)) in cpus.iter().enumerate() {
            let id = topo.find_cpu(cpu).unwrap();
            topo.obj_mut(id).load = *load;
            for &(irq, irq_load) in irqs.iter() {
                reg.add(
                    IrqMetadata::new(irq, IrqType::MsiX, IrqClass::Ethernet),
                    &IrqPolicy::default(),
                );
                let info = reg.lookup_mut(irq).unwrap();
                info.load = irq_load;
                info.assigned_obj = Some(id);
                topo.attach_irq(id, irq);
            }
        }
        (topo, reg)
    }

    #[test]
    fn test_layer_stat() {
        let (topo, _) = setup(&[(10, &[]), (10, &[]), (10, &[]), (40, &[])]);
        let stat = LayerStat::compute(&topo, ObjKind::Cpu);
        assert_eq!(stat.total_load, 70);
        assert_eq!(stat.avg_load, 17);
        assert_eq!(stat.min_load, 10);
        // deviations 49 + 49 + 49 + 529 = 676, / 3 = 225
        assert_eq!(stat.std_deviation, 15.0);
        assert_eq!(stat.state(40), BalanceState::NeedsPush);
        assert_eq!(stat.state(10), BalanceState::Balanced);
        assert_eq!(stat.state(2), BalanceState::NeedsPull);

        let single = LayerStat::compute(&topo, ObjKind::Cache);
        assert_eq!(single.std_deviation, 0.0);
    }

    #[test]
    fn test_overloaded_cpu_sheds_lightest_irqs() {
        let (mut topo, mut reg) = setup(&[
            (10, &[]),
            (10, &[]),
            (10, &[]),
            (40, &[(1, 30), (2, 5), (3, 5)]),
        ]);
        let balancer = Balancer::new(None);
        let mut pool = PendingPool::new();
        let stats = balancer.balance(&mut topo, &mut reg, &mut pool, 1);

        // 40 - 5 > 10 + 5 and 35 - 5 > 15 + 5, after which the heavy irq is
        // the only one left on the cpu.
        assert!(pool.contains(2));
        assert!(pool.contains(3));
        assert!(!pool.contains(1));
        assert_eq!(stats[0].nr_migrated, 2);
        assert_eq!(stats[0].nr_over, 1);
        let cpu3 = topo.find_cpu(3).unwrap();
        assert_eq!(topo.obj(cpu3).interrupts, vec![1]);
        assert!(reg.lookup(2).unwrap().moved);
        assert!(reg.lookup(2).unwrap().assigned_obj.is_none());

        // Both land on lightly loaded siblings, one each.
        place(&mut topo, &mut reg, &mut pool);
        let homes: Vec<_> = [2, 3]
            .iter()
            .map(|&irq| topo.obj(reg.lookup(irq).unwrap().assigned_obj.unwrap()).id)
            .collect();
        assert!(homes.iter().all(|&cpu| cpu != 3));
        assert_ne!(homes[0], homes[1]);
    }

    #[test]
    fn test_selection_stops_at_first_failing_candidate() {
        let (mut topo, mut reg) = setup(&[
            (10, &[]),
            (30, &[(1, 8), (2, 9), (3, 13)]),
        ]);
        let mut pool = PendingPool::new();
        Balancer::new(None).balance(&mut topo, &mut reg, &mut pool, 1);
        // 30 - 8 > 10 + 8, then 22 - 9 > 18 + 9 fails.
        assert_eq!(pool.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_pinned_and_idle_irqs_stay() {
        let (mut topo, mut reg) = setup(&[
            (0, &[]),
            (1000, &[(1, 1), (2, 100), (3, 100), (4, 100)]),
        ]);
        {
            let pinned = reg.lookup_mut(2).unwrap();
            pinned.hint_policy = HintPolicy::Exact;
            pinned.affinity_hint = Cpumask::from_cpus([1]).unwrap();
        }
        reg.lookup_mut(3).unwrap().balance_level = BalanceLevel::None;

        let mut pool = PendingPool::new();
        Balancer::new(None).balance(&mut topo, &mut reg, &mut pool, 1);
        assert_eq!(pool.iter().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_balanced_topology_is_left_alone() {
        let (mut topo, mut reg) = setup(&[
            (20, &[(1, 10), (2, 10)]),
            (20, &[(3, 10), (4, 10)]),
        ]);
        let mut pool = PendingPool::new();
        Balancer::new(None).balance(&mut topo, &mut reg, &mut pool, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_powersave_enter_and_leave() {
        // Idle cpus all sit at the average with no deviation.
        let (mut topo, mut reg) = setup(&[
            (0, &[(1, 5)]),
            (0, &[]),
            (0, &[]),
            (0, &[(2, 5)]),
        ]);
        let balancer = Balancer::new(Some(3));
        let mut pool = PendingPool::new();

        // Too early.
        balancer.balance(&mut topo, &mut reg, &mut pool, 5);
        assert!(pool.is_empty());

        let stats = balancer.balance(&mut topo, &mut reg, &mut pool, 6);
        assert!(stats[0].nr_under >= 3);
        assert_eq!(stats[0].nr_over, 0);
        let cpu0 = topo.find_cpu(0).unwrap();
        assert!(topo.obj(cpu0).powersave);
        assert_eq!(
            topo.layer(ObjKind::Cpu)
                .iter()
                .filter(|&&id| topo.obj(id).powersave)
                .count(),
            1
        );
        assert_eq!(pool.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert!(topo.obj(cpu0).interrupts.is_empty());

        // One cpu far above the rest brings everybody back.
        for (cpu, load) in [(0, 0), (1, 10), (2, 10), (3, 10_000)] {
            let id = topo.find_cpu(cpu).unwrap();
            topo.obj_mut(id).load = load;
        }
        let stats = balancer.balance(&mut topo, &mut reg, &mut pool, 7);
        assert!(stats[0].nr_over > 0);
        assert!(!topo.obj(cpu0).powersave);
    }
}
