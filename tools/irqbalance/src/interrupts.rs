// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Interrupt Registry
//!
//! Every interrupt the daemon knows about, keyed by irq number. Interrupts
//! are discovered through an IrqProvider (PCI devices first, then the full
//! `/proc/interrupts` listing for everything without device metadata) and
//! shaped by a PolicyProvider.
//!
//! Banned interrupts live on a separate list. They can be looked up so that
//! counter sampling recognizes them, but they are never iterated over and
//! thus never placed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use clap::ValueEnum;
use irq_utils::irq::PciDevice;
use irq_utils::irq::ProcIrq;
use irq_utils::Cpumask;
use log::debug;
use log::info;
use log::warn;

use crate::policy::IrqPolicy;
use crate::policy::PolicyProvider;
use crate::topology::ObjId;
use crate::topology::ObjKind;
use crate::topology::Topology;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqType {
    Legacy,
    Msi,
    MsiX,
    VirtEvent,
}

/// Interrupt classes, in increasing placement priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IrqClass {
    Other = 0,
    Legacy = 1,
    Storage = 2,
    Video = 3,
    Ethernet = 4,
    GbitEthernet = 5,
    TenGbitEthernet = 6,
    VirtEvent = 7,
}

/// PCI base class (bits 23:16 of the class code) to irq class.
const PCI_CLASS_TABLE: [IrqClass; 0x12] = [
    IrqClass::Other,    // unclassified
    IrqClass::Storage,  // mass storage
    IrqClass::Ethernet, // network
    IrqClass::Video,    // display
    IrqClass::Other,    // multimedia
    IrqClass::Other,    // memory
    IrqClass::Legacy,   // bridge
    IrqClass::Other,    // communication
    IrqClass::Other,    // system peripheral
    IrqClass::Legacy,   // input
    IrqClass::Other,    // docking station
    IrqClass::Other,    // processor
    IrqClass::Legacy,   // serial bus
    IrqClass::Ethernet, // wireless
    IrqClass::Storage,  // intelligent i/o
    IrqClass::Other,    // satellite
    IrqClass::Other,    // crypto
    IrqClass::Other,    // signal processing
];

impl IrqClass {
    pub fn from_pci_class(class: u32) -> IrqClass {
        PCI_CLASS_TABLE
            .get((class >> 16) as usize)
            .copied()
            .unwrap_or(IrqClass::Other)
    }

    /// The balance level an irq of this class gets without a policy override.
    pub fn default_level(self) -> BalanceLevel {
        match self {
            IrqClass::Other => BalanceLevel::Package,
            IrqClass::Legacy => BalanceLevel::Cache,
            _ => BalanceLevel::Core,
        }
    }
}

impl fmt::Display for IrqClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IrqClass::Other => "other",
            IrqClass::Legacy => "legacy",
            IrqClass::Storage => "storage",
            IrqClass::Video => "video",
            IrqClass::Ethernet => "ethernet",
            IrqClass::GbitEthernet => "gbit-ethernet",
            IrqClass::TenGbitEthernet => "10gbit-ethernet",
            IrqClass::VirtEvent => "virt-event",
        };
        write!(f, "{}", name)
    }
}

/// Finest layer an irq may be moved within.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BalanceLevel {
    None,
    Package,
    Cache,
    Core,
}

impl BalanceLevel {
    /// Whether an irq of this level may reside on an object of @kind.
    pub fn permits(self, kind: ObjKind) -> bool {
        kind.depth() <= self as usize
    }

    pub fn parse(val: &str) -> Option<BalanceLevel> {
        match val.to_ascii_lowercase().as_str() {
            "none" => Some(BalanceLevel::None),
            "package" => Some(BalanceLevel::Package),
            "cache" => Some(BalanceLevel::Cache),
            "core" => Some(BalanceLevel::Core),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum HintPolicy {
    #[default]
    Ignore,
    Exact,
    Subset,
}

impl HintPolicy {
    pub fn parse(val: &str) -> Option<HintPolicy> {
        match val.to_ascii_lowercase().as_str() {
            "ignore" => Some(HintPolicy::Ignore),
            "exact" => Some(HintPolicy::Exact),
            "subset" => Some(HintPolicy::Subset),
            _ => None,
        }
    }
}

/// Static description of an irq as discovered from the system.
#[derive(Debug, Clone)]
pub struct IrqMetadata {
    pub irq: u32,
    pub irq_type: IrqType,
    pub class: IrqClass,
    /// Device NUMA node, None when unknown or NUMA is unavailable.
    pub numa_node: Option<i32>,
    pub local_cpus: Option<Cpumask>,
    pub affinity_hint: Cpumask,
}

impl IrqMetadata {
    pub fn new(irq: u32, irq_type: IrqType, class: IrqClass) -> Self {
        Self {
            irq,
            irq_type,
            class,
            numa_node: None,
            local_cpus: None,
            affinity_hint: Cpumask::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IrqInfo {
    pub irq: u32,
    pub irq_type: IrqType,
    pub class: IrqClass,
    pub balance_level: BalanceLevel,
    pub hint_policy: HintPolicy,
    pub affinity_hint: Cpumask,
    pub local_cpus: Cpumask,
    pub banned: bool,
    pub numa_override: Option<i32>,
    pub irq_count: u64,
    pub last_irq_count: u64,
    /// Listed in /proc/interrupts at the last sample.
    pub seen: bool,
    pub load: u64,
    pub assigned_obj: Option<ObjId>,
    /// Set when the placement changed and the new affinity still has to be
    /// written out.
    pub moved: bool,
}

impl IrqInfo {
    fn banned(irq: u32) -> Self {
        Self {
            irq,
            irq_type: IrqType::Legacy,
            class: IrqClass::Other,
            balance_level: BalanceLevel::None,
            hint_policy: HintPolicy::Exact,
            affinity_hint: Cpumask::new(),
            local_cpus: Cpumask::full(),
            banned: true,
            numa_override: None,
            irq_count: 0,
            last_irq_count: 0,
            seen: false,
            load: 0,
            assigned_obj: None,
            moved: false,
        }
    }

    /// Fired count since the previous sample.
    pub fn delta(&self) -> u64 {
        self.irq_count.saturating_sub(self.last_irq_count)
    }

    /// An exact hint pins the irq; the balancer never touches it.
    pub fn hint_pinned(&self) -> bool {
        self.hint_policy == HintPolicy::Exact && !self.affinity_hint.is_empty()
    }
}

/// Source of interrupt metadata.
pub trait IrqProvider {
    fn devices(&self) -> Result<Vec<PciDevice>>;
    fn interrupts(&self) -> Result<Vec<ProcIrq>>;
    fn affinity_hint(&self, irq: u32) -> Result<Cpumask>;
}

pub struct SysfsIrqProvider {
    sysfs_root: PathBuf,
    procfs_root: PathBuf,
}

impl SysfsIrqProvider {
    pub fn new(sysfs_root: &Path, procfs_root: &Path) -> Self {
        Self {
            sysfs_root: sysfs_root.to_path_buf(),
            procfs_root: procfs_root.to_path_buf(),
        }
    }
}

impl IrqProvider for SysfsIrqProvider {
    fn devices(&self) -> Result<Vec<PciDevice>> {
        irq_utils::irq::read_pci_devices(&self.sysfs_root)
    }

    fn interrupts(&self) -> Result<Vec<ProcIrq>> {
        Ok(irq_utils::irq::read_proc_interrupts(&self.procfs_root)?.irqs)
    }

    fn affinity_hint(&self, irq: u32) -> Result<Cpumask> {
        irq_utils::irq::read_affinity_hint(&self.procfs_root, irq)
    }
}

#[derive(Debug, Default)]
pub struct IrqRegistry {
    irqs: BTreeMap<u32, IrqInfo>,
    banned: BTreeMap<u32, IrqInfo>,
    cmdline_banned: BTreeSet<u32>,
    default_hint_policy: HintPolicy,
    has_msi_devices: bool,
}

impl IrqRegistry {
    pub fn new(default_hint_policy: HintPolicy) -> Self {
        Self {
            default_hint_policy,
            ..Default::default()
        }
    }

    /// Register an irq. Returns false and adds nothing if the irq is already
    /// known or banned.
    pub fn add(&mut self, meta: IrqMetadata, policy: &IrqPolicy) -> bool {
        let irq = meta.irq;
        if self.irqs.contains_key(&irq) {
            info!("Dropping duplicate entry for irq {}", irq);
            return false;
        }
        if self.is_banned(irq) {
            info!("Skipping banned irq {}", irq);
            return false;
        }

        let info = IrqInfo {
            irq,
            irq_type: meta.irq_type,
            class: meta.class,
            balance_level: policy
                .balance_level
                .unwrap_or_else(|| meta.class.default_level()),
            hint_policy: policy.hint_policy.unwrap_or(self.default_hint_policy),
            affinity_hint: meta.affinity_hint,
            local_cpus: meta.local_cpus.unwrap_or_else(Cpumask::full),
            banned: false,
            numa_override: policy.numa_node.or(meta.numa_node),
            irq_count: 0,
            last_irq_count: 0,
            seen: false,
            load: 0,
            assigned_obj: None,
            moved: false,
        };
        debug!(
            "Adding irq {} ({:?}, class {}, level {:?})",
            irq, info.irq_type, info.class, info.balance_level
        );
        self.irqs.insert(irq, info);
        true
    }

    /// Put @irq on the banned list, dropping it from the placeable set and
    /// from the object it was resident on.
    pub fn ban(&mut self, topo: &mut Topology, irq: u32) {
        if let Some(obj) = self.mark_banned(irq).and_then(|info| info.assigned_obj) {
            topo.detach_irq(obj, irq);
        }
    }

    /// Ban @irq for the lifetime of the registry, across rebuilds.
    pub fn ban_from_command_line(&mut self, topo: &mut Topology, irq: u32) {
        self.cmdline_banned.insert(irq);
        self.ban(topo, irq);
    }

    fn mark_banned(&mut self, irq: u32) -> Option<IrqInfo> {
        let live = self.irqs.remove(&irq);
        self.banned.entry(irq).or_insert_with(|| IrqInfo::banned(irq));
        live
    }

    pub fn is_banned(&self, irq: u32) -> bool {
        self.banned.contains_key(&irq) || self.cmdline_banned.contains(&irq)
    }

    /// Drop every irq and collect them again from @provider.
    pub fn rebuild(
        &mut self,
        provider: &dyn IrqProvider,
        policy: &dyn PolicyProvider,
        topo: &Topology,
    ) -> Result<()> {
        self.irqs.clear();
        self.banned.clear();
        self.has_msi_devices = false;
        for irq in self.cmdline_banned.clone() {
            self.mark_banned(irq);
        }

        for dev in provider.devices()?.iter() {
            let class = dev
                .class
                .map(IrqClass::from_pci_class)
                .unwrap_or(IrqClass::Other);
            let irq_type = match (dev.msi_irqs.is_empty(), dev.msix) {
                (true, _) => IrqType::Legacy,
                (false, true) => IrqType::MsiX,
                (false, false) => IrqType::Msi,
            };
            if irq_type != IrqType::Legacy {
                self.has_msi_devices = true;
            }

            for irq in dev.irqs() {
                if self.lookup(irq).is_some() {
                    continue;
                }
                let pol = self.resolve_policy(policy, &dev.path, irq, topo);
                if pol.ban {
                    info!("irq {} banned by policy", irq);
                    self.mark_banned(irq);
                    continue;
                }

                let mut meta = IrqMetadata::new(irq, irq_type, class);
                meta.numa_node = dev
                    .numa_node
                    .filter(|&node| topo.numa_available() && node >= 0);
                meta.local_cpus = dev.local_cpus.clone();
                meta.affinity_hint = self.read_hint(provider, irq);
                self.add(meta, &pol);
            }
        }

        // Whatever has no device behind it still gets balanced.
        for proc_irq in provider.interrupts()?.iter() {
            let irq = proc_irq.irq;
            if self.lookup(irq).is_some() {
                continue;
            }
            let pol = self.resolve_policy(policy, Path::new("/sys"), irq, topo);
            if pol.ban {
                self.mark_banned(irq);
                continue;
            }

            let meta = if proc_irq.chip == "xen-dyn-event" {
                IrqMetadata::new(irq, IrqType::VirtEvent, IrqClass::VirtEvent)
            } else {
                IrqMetadata::new(irq, IrqType::Legacy, IrqClass::Other)
            };
            let meta = IrqMetadata {
                affinity_hint: self.read_hint(provider, irq),
                ..meta
            };
            self.add(meta, &pol);
        }

        Ok(())
    }

    fn resolve_policy(
        &self,
        policy: &dyn PolicyProvider,
        devpath: &Path,
        irq: u32,
        topo: &Topology,
    ) -> IrqPolicy {
        let mut pol = policy.policy(devpath, irq);
        if let Some(node) = pol.numa_node {
            if topo.find_node(node).is_none() || node < 0 {
                warn!("NUMA node {} doesn't exist, ignoring for irq {}", node, irq);
                pol.numa_node = None;
            }
        }
        pol
    }

    fn read_hint(&self, provider: &dyn IrqProvider, irq: u32) -> Cpumask {
        match provider.affinity_hint(irq) {
            Ok(hint) => hint,
            Err(e) => {
                debug!("No affinity hint for irq {}: {}", irq, e);
                Cpumask::new()
            }
        }
    }

    /// Look up @irq on both the placeable and the banned list.
    pub fn lookup(&self, irq: u32) -> Option<&IrqInfo> {
        self.irqs.get(&irq).or_else(|| self.banned.get(&irq))
    }

    pub fn lookup_mut(&mut self, irq: u32) -> Option<&mut IrqInfo> {
        match self.irqs.get_mut(&irq) {
            Some(info) => Some(info),
            None => self.banned.get_mut(&irq),
        }
    }

    /// Iterate over the placeable irqs.
    pub fn iter(&self) -> impl Iterator<Item = &IrqInfo> {
        self.irqs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IrqInfo> {
        self.irqs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.irqs.len()
    }

    pub fn has_msi_devices(&self) -> bool {
        self.has_msi_devices
    }

    pub fn clear_work_stats(&mut self) {
        for info in self.irqs.values_mut() {
            info.load = 0;
        }
    }

    /// Log every placeable irq with its workload.
    pub fn dump(&self, topo: &Topology) {
        for info in self.iter() {
            let node = info.numa_override.map(|id| topo.node(id));
            debug!(
                "Interrupt {} node {} (class {}) has workload {} hint={} local={}",
                info.irq,
                node.map(|n| topo.obj(n).id).unwrap_or(-1),
                info.class,
                info.load,
                info.affinity_hint,
                info.local_cpus,
            );
        }
    }
}
