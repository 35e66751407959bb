// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Balancing Topology
//!
//! The hierarchy irqs are balanced over. Every level is a layer of sibling
//! objects, the tree is stored as an arena indexed by ObjId:
//!
//!                                o----------------------o
//!                                |         Node         |
//!                                | ID    -1 / 0 / 1 ... |
//!                                | Mask  node cpumap    |
//!                                o----------o-----------o
//!                                           |
//!                                o----------o-----------o
//!                                |       Package        |
//!                                | ID    physical id    |
//!                                | Mask  core siblings  |
//!                                o----------o-----------o
//!                                           |
//!                                o----------o-----------o
//!                                |        Cache         |
//!                                | Mask  shared cpu map |
//!                                o----------o-----------o
//!                                           |
//!                                o----------o-----------o
//!                                |         Cpu          |
//!                                | ID    cpu number     |
//!                                o----------------------o
//!
//! Node -1 is the unspecified node. It always exists and is the first
//! object of the arena. Packages whose NUMA node can't be resolved hang
//! below it, which is every package when the host doesn't expose NUMA.
//!
//! Banned CPUs never get an object and are removed from every mask, but
//! they still count towards count().

use std::fmt;

use anyhow::Result;
use irq_utils::Cpumask;
use irq_utils::HostTopology;
use log::debug;
use log::warn;

pub type ObjId = usize;

/// Layers of the hierarchy, coarsest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjKind {
    Node,
    Package,
    Cache,
    Cpu,
}

impl ObjKind {
    pub const TOP_DOWN: [ObjKind; 4] = [
        ObjKind::Node,
        ObjKind::Package,
        ObjKind::Cache,
        ObjKind::Cpu,
    ];

    pub const BOTTOM_UP: [ObjKind; 4] = [
        ObjKind::Cpu,
        ObjKind::Cache,
        ObjKind::Package,
        ObjKind::Node,
    ];

    /// Distance from the Node layer.
    pub fn depth(self) -> usize {
        self as usize
    }

    pub fn child(self) -> Option<ObjKind> {
        match self {
            ObjKind::Node => Some(ObjKind::Package),
            ObjKind::Package => Some(ObjKind::Cache),
            ObjKind::Cache => Some(ObjKind::Cpu),
            ObjKind::Cpu => None,
        }
    }
}

impl fmt::Display for ObjKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjKind::Node => write!(f, "NODE"),
            ObjKind::Package => write!(f, "PACKAGE"),
            ObjKind::Cache => write!(f, "CACHE"),
            ObjKind::Cpu => write!(f, "CPU"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopoObj {
    pub kind: ObjKind,
    pub id: i32,
    pub mask: Cpumask,
    pub parent: Option<ObjId>,
    pub children: Vec<ObjId>,
    /// Irqs resident on this object, in arrival order.
    pub interrupts: Vec<u32>,
    /// Load of the current cycle in nanoseconds.
    pub load: u64,
    /// Last irq + softirq time sample, Cpu objects only.
    pub last_cpu_counter: Option<u64>,
    pub powersave: bool,
}

impl TopoObj {
    fn new(kind: ObjKind, id: i32, mask: Cpumask) -> Self {
        Self {
            kind,
            id,
            mask,
            parent: None,
            children: Vec::new(),
            interrupts: Vec::new(),
            load: 0,
            last_cpu_counter: None,
            powersave: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    objs: Vec<TopoObj>,
    layers: [Vec<ObjId>; 4],
    banned_cpus: Cpumask,
    unbanned_cpus: Cpumask,
    nr_cpus: usize,
    numa_available: bool,
}

const UNSPECIFIED_NODE: ObjId = 0;

impl Topology {
    /// Build the balancing hierarchy from @host, leaving out @banned_cpus.
    pub fn build(host: &HostTopology, banned_cpus: &Cpumask) -> Result<Topology> {
        let unbanned_cpus = banned_cpus.not();
        let numa_available = host.numa_available();

        let mut online = Cpumask::new();
        for cpu in host.cpus.iter().filter(|cpu| cpu.online) {
            online.set_cpu(cpu.id)?;
        }

        let mut topo = Topology {
            objs: Vec::new(),
            layers: Default::default(),
            banned_cpus: banned_cpus.clone(),
            unbanned_cpus,
            nr_cpus: 0,
            numa_available,
        };

        let unspecified = topo.push(TopoObj::new(
            ObjKind::Node,
            -1,
            online.and(&topo.unbanned_cpus),
        ));
        debug_assert_eq!(unspecified, UNSPECIFIED_NODE);

        if numa_available {
            for node in host.nodes.iter() {
                let mask = node.mask.and(&topo.unbanned_cpus);
                topo.push(TopoObj::new(ObjKind::Node, node.id as i32, mask));
            }
        }

        for cpu in host.cpus.iter() {
            if !cpu.online {
                continue;
            }
            topo.nr_cpus += 1;
            if topo.banned_cpus.test_cpu(cpu.id) {
                debug!("Skipping banned cpu {}", cpu.id);
                continue;
            }

            let cpu_mask = Cpumask::from_cpus([cpu.id])?;
            let cpu_obj = topo.push(TopoObj::new(ObjKind::Cpu, cpu.id as i32, cpu_mask));

            let cache_mask = cpu.cache_mask.and(&topo.unbanned_cpus);
            let cache = match topo.find_by_mask(ObjKind::Cache, &cache_mask) {
                Some(cache) => cache,
                None => {
                    let id = topo.layers[ObjKind::Cache.depth()].len() as i32;
                    let cache = topo.push(TopoObj::new(ObjKind::Cache, id, cache_mask));

                    let package_mask = cpu.package_mask.and(&topo.unbanned_cpus);
                    let package = match topo.find_by_mask(ObjKind::Package, &package_mask) {
                        Some(package) => {
                            if topo.objs[package].id != cpu.package_id as i32 {
                                warn!(
                                    "Package {} and {} share cpus {}, merging",
                                    topo.objs[package].id, cpu.package_id, package_mask
                                );
                            }
                            package
                        }
                        None => {
                            let package = topo.push(TopoObj::new(
                                ObjKind::Package,
                                cpu.package_id as i32,
                                package_mask,
                            ));
                            let node_id = cpu.node.map(|id| id as i32).unwrap_or(-1);
                            let node = topo.node(node_id);
                            topo.link(node, package);
                            package
                        }
                    };
                    topo.link(package, cache);
                    cache
                }
            };
            topo.link(cache, cpu_obj);
        }

        Ok(topo)
    }

    fn push(&mut self, obj: TopoObj) -> ObjId {
        let id = self.objs.len();
        self.layers[obj.kind.depth()].push(id);
        self.objs.push(obj);
        id
    }

    fn link(&mut self, parent: ObjId, child: ObjId) {
        self.objs[child].parent = Some(parent);
        self.objs[parent].children.push(child);
    }

    fn find_by_mask(&self, kind: ObjKind, mask: &Cpumask) -> Option<ObjId> {
        self.layer(kind)
            .iter()
            .copied()
            .find(|&id| self.objs[id].mask == *mask)
    }

    /// Drop every object. The unspecified node is recreated empty.
    pub fn clear(&mut self) {
        self.objs.clear();
        self.layers = Default::default();
        self.nr_cpus = 0;
        self.push(TopoObj::new(ObjKind::Node, -1, Cpumask::new()));
    }

    pub fn obj(&self, id: ObjId) -> &TopoObj {
        &self.objs[id]
    }

    pub fn obj_mut(&mut self, id: ObjId) -> &mut TopoObj {
        &mut self.objs[id]
    }

    pub fn layer(&self, kind: ObjKind) -> &[ObjId] {
        &self.layers[kind.depth()]
    }

    pub fn parent(&self, id: ObjId) -> Option<ObjId> {
        self.objs[id].parent
    }

    pub fn children(&self, id: ObjId) -> &[ObjId] {
        &self.objs[id].children
    }

    pub fn find_cpu(&self, cpu: usize) -> Option<ObjId> {
        self.layer(ObjKind::Cpu)
            .iter()
            .copied()
            .find(|&id| self.objs[id].id == cpu as i32)
    }

    /// Find the Node object for @id. The unspecified node is only returned
    /// for id -1.
    pub fn find_node(&self, id: i32) -> Option<ObjId> {
        self.layer(ObjKind::Node)
            .iter()
            .copied()
            .find(|&obj| self.objs[obj].id == id)
    }

    /// Resolve a NUMA node id, falling back to the unspecified node.
    pub fn node(&self, id: i32) -> ObjId {
        if !self.numa_available {
            return self.unspecified_node();
        }
        self.find_node(id).unwrap_or(self.unspecified_node())
    }

    pub fn unspecified_node(&self) -> ObjId {
        UNSPECIFIED_NODE
    }

    /// Number of online CPUs, banned ones included.
    pub fn count(&self) -> usize {
        self.nr_cpus
    }

    pub fn numa_available(&self) -> bool {
        self.numa_available
    }

    pub fn banned_cpus(&self) -> &Cpumask {
        &self.banned_cpus
    }

    pub fn unbanned_cpus(&self) -> &Cpumask {
        &self.unbanned_cpus
    }

    pub fn attach_irq(&mut self, obj: ObjId, irq: u32) {
        let interrupts = &mut self.objs[obj].interrupts;
        if !interrupts.contains(&irq) {
            interrupts.push(irq);
        }
    }

    /// Returns whether @irq was resident on @obj.
    pub fn detach_irq(&mut self, obj: ObjId, irq: u32) -> bool {
        let interrupts = &mut self.objs[obj].interrupts;
        match interrupts.iter().position(|&i| i == irq) {
            Some(pos) => {
                interrupts.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear_work_stats(&mut self) {
        for obj in self.objs.iter_mut() {
            obj.load = 0;
        }
    }

    /// Log the whole tree at debug level.
    pub fn dump(&self) {
        for &node in self.layer(ObjKind::Node) {
            self.dump_obj(node, 0);
        }
    }

    fn dump_obj(&self, id: ObjId, indent: usize) {
        let obj = &self.objs[id];
        debug!(
            "{:indent$}{}[{}] mask={} load={}{} irqs={:?}",
            "",
            obj.kind,
            obj.id,
            obj.mask,
            obj.load,
            if obj.powersave { " powersave" } else { "" },
            obj.interrupts,
            indent = indent * 2
        );
        for &child in obj.children.iter() {
            self.dump_obj(child, indent + 1);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use irq_utils::HostCpu;
    use irq_utils::HostNode;

    fn mask(cpus: &[usize]) -> Cpumask {
        Cpumask::from_cpus(cpus.iter().copied()).unwrap()
    }

    /// Two packages on two nodes, each with two caches of two cpus.
    pub(crate) fn host_2x2x2() -> HostTopology {
        let mut cpus = Vec::new();
        for id in 0..8 {
            let package = id / 4;
            let cache_base = id / 2 * 2;
            cpus.push(HostCpu {
                id,
                online: true,
                package_id: package,
                package_mask: mask(&[
                    package * 4,
                    package * 4 + 1,
                    package * 4 + 2,
                    package * 4 + 3,
                ]),
                cache_mask: mask(&[cache_base, cache_base + 1]),
                node: Some(package),
            });
        }
        let nodes = vec![
            HostNode {
                id: 0,
                mask: mask(&[0, 1, 2, 3]),
            },
            HostNode {
                id: 1,
                mask: mask(&[4, 5, 6, 7]),
            },
        ];
        HostTopology { cpus, nodes }
    }

    /// A single package and cache of @nr cpus without NUMA information.
    pub(crate) fn host_flat(nr: usize) -> HostTopology {
        let all: Vec<usize> = (0..nr).collect();
        let cpus = (0..nr)
            .map(|id| HostCpu {
                id,
                online: true,
                package_id: 0,
                package_mask: mask(&all),
                cache_mask: mask(&all),
                node: None,
            })
            .collect();
        HostTopology {
            cpus,
            nodes: vec![],
        }
    }

    #[test]
    fn test_build_hierarchy() {
        let topo = Topology::build(&host_2x2x2(), &Cpumask::new()).unwrap();
        assert!(topo.numa_available());
        assert_eq!(topo.count(), 8);
        assert_eq!(topo.layer(ObjKind::Node).len(), 3);
        assert_eq!(topo.layer(ObjKind::Package).len(), 2);
        assert_eq!(topo.layer(ObjKind::Cache).len(), 4);
        assert_eq!(topo.layer(ObjKind::Cpu).len(), 8);

        // Every cpu has exactly one chain up to a real node.
        for cpu in 0..8 {
            let obj = topo.find_cpu(cpu).unwrap();
            let cache = topo.parent(obj).unwrap();
            let package = topo.parent(cache).unwrap();
            let node = topo.parent(package).unwrap();
            assert_eq!(topo.obj(node).kind, ObjKind::Node);
            assert_eq!(topo.obj(node).id, (cpu / 4) as i32);
            assert!(topo.parent(node).is_none());
            assert!(topo.obj(node).mask.test_cpu(cpu));
        }
        assert!(topo.children(topo.unspecified_node()).is_empty());
    }

    #[test]
    fn test_packages_sharing_a_mask_are_merged() {
        let mut host = host_flat(4);
        for cpu in host.cpus.iter_mut() {
            cpu.package_id = cpu.id / 2;
            cpu.cache_mask = mask(&[cpu.id / 2 * 2, cpu.id / 2 * 2 + 1]);
        }
        let topo = Topology::build(&host, &Cpumask::new()).unwrap();

        assert_eq!(topo.layer(ObjKind::Package).len(), 1);
        let package = topo.layer(ObjKind::Package)[0];
        assert_eq!(topo.obj(package).id, 0);
        assert_eq!(topo.obj(package).mask, mask(&[0, 1, 2, 3]));
        assert_eq!(topo.layer(ObjKind::Cache).len(), 2);
        for &cache in topo.layer(ObjKind::Cache) {
            assert_eq!(topo.parent(cache), Some(package));
        }
    }

    #[test]
    fn test_banned_cpus_are_counted_but_skipped() {
        let banned = mask(&[0, 1]);
        let topo = Topology::build(&host_2x2x2(), &banned).unwrap();
        assert_eq!(topo.count(), 8);
        assert_eq!(topo.layer(ObjKind::Cpu).len(), 6);
        assert!(topo.find_cpu(0).is_none());
        assert_eq!(topo.layer(ObjKind::Cache).len(), 3);
        for &id in topo.layer(ObjKind::Package) {
            assert!(!topo.obj(id).mask.intersects(&banned));
        }
        let node0 = topo.find_node(0).unwrap();
        assert_eq!(topo.obj(node0).mask, mask(&[2, 3]));
    }

    #[test]
    fn test_offline_cpus_are_ignored() {
        let mut host = host_flat(4);
        host.cpus[3].online = false;
        let topo = Topology::build(&host, &Cpumask::new()).unwrap();
        assert_eq!(topo.count(), 3);
        assert!(topo.find_cpu(3).is_none());
        assert!(!topo.obj(topo.unspecified_node()).mask.test_cpu(3));
    }

    #[test]
    fn test_without_numa_everything_hangs_below_unspecified_node() {
        let topo = Topology::build(&host_flat(4), &Cpumask::new()).unwrap();
        assert!(!topo.numa_available());
        assert_eq!(topo.layer(ObjKind::Node).len(), 1);
        assert_eq!(topo.node(0), topo.unspecified_node());
        assert!(topo.find_node(0).is_none());
        let package = topo.layer(ObjKind::Package)[0];
        assert_eq!(topo.parent(package), Some(topo.unspecified_node()));
    }

    #[test]
    fn test_attach_detach_and_clear() {
        let mut topo = Topology::build(&host_flat(2), &Cpumask::new()).unwrap();
        let cpu = topo.find_cpu(1).unwrap();
        topo.attach_irq(cpu, 30);
        topo.attach_irq(cpu, 30);
        assert_eq!(topo.obj(cpu).interrupts, vec![30]);
        assert!(topo.detach_irq(cpu, 30));
        assert!(!topo.detach_irq(cpu, 30));

        topo.obj_mut(cpu).load = 10;
        topo.clear_work_stats();
        assert_eq!(topo.obj(cpu).load, 0);

        topo.clear();
        assert_eq!(topo.count(), 0);
        assert!(topo.layer(ObjKind::Cpu).is_empty());
        assert_eq!(topo.layer(ObjKind::Node).len(), 1);
    }
}
