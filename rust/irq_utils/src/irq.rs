// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Raw interrupt interfaces: PCI device enumeration, `/proc/interrupts`
//! parsing and `/proc/irq/N/{smp_affinity,affinity_hint}` access.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use crate::misc::read_file_string;
use crate::misc::read_from_file;
use crate::Cpumask;
use anyhow::Context;
use anyhow::Result;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PciDevice {
    pub path: PathBuf,
    /// Raw 24-bit PCI class code, e.g. 0x020000 for an ethernet controller.
    pub class: Option<u32>,
    pub numa_node: Option<i32>,
    pub local_cpus: Option<Cpumask>,
    pub msi_irqs: Vec<u32>,
    /// Whether the MSI vectors are MSI-X vectors.
    pub msix: bool,
    pub legacy_irq: Option<u32>,
}

impl PciDevice {
    /// Interrupt vectors of this device. A device with MSI/MSI-X vectors never
    /// reports its legacy INTx line.
    pub fn irqs(&self) -> Vec<u32> {
        if !self.msi_irqs.is_empty() {
            self.msi_irqs.clone()
        } else {
            self.legacy_irq.into_iter().collect()
        }
    }
}

fn read_hex_u32(path: &Path) -> Result<u32> {
    let val = read_file_string(path)?;
    let hex_str = val.strip_prefix("0x").unwrap_or(&val);
    u32::from_str_radix(hex_str, 16).with_context(|| format!("Failed to parse {:?}", path))
}

/// Enumerate every PCI device below @sysfs_root along with its interrupt
/// vectors and locality information.
pub fn read_pci_devices(sysfs_root: &Path) -> Result<Vec<PciDevice>> {
    let mut devices = Vec::new();
    let dev_root = sysfs_root.join("bus/pci/devices");

    let entries = match fs::read_dir(&dev_root) {
        Ok(entries) => entries,
        Err(_) => return Ok(devices),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        let class = read_hex_u32(&path.join("class")).ok();
        let numa_node = read_from_file::<i32>(&path.join("numa_node")).ok();
        let local_cpus = read_file_string(&path.join("local_cpus"))
            .and_then(|s| Cpumask::from_str(&s))
            .ok();

        let mut msi_irqs = Vec::new();
        let mut msix = true;
        if let Ok(msi_entries) = fs::read_dir(path.join("msi_irqs")) {
            for msi in msi_entries.filter_map(Result::ok) {
                let irq = match msi.file_name().to_string_lossy().parse::<u32>() {
                    Ok(irq) if irq != 0 => irq,
                    _ => continue,
                };
                // Older kernels expose the mode in a subdirectory.
                let mode = read_file_string(&msi.path())
                    .or_else(|_| read_file_string(&msi.path().join("mode")));
                if let Ok(mode) = mode {
                    msix = mode == "msix";
                }
                msi_irqs.push(irq);
            }
        }
        msi_irqs.sort_unstable();

        let legacy_irq = read_from_file::<u32>(&path.join("irq"))
            .ok()
            .filter(|irq| *irq != 0);

        devices.push(PciDevice {
            path,
            class,
            numa_node,
            local_cpus,
            msi_irqs,
            msix,
            legacy_irq,
        });
    }
    devices.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(devices)
}

/// One numbered line of `/proc/interrupts`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProcIrq {
    pub irq: u32,
    /// Per-CPU fired counts, one column per online CPU.
    pub counts: Vec<u64>,
    /// The interrupt chip name, e.g. "IO-APIC", "PCI-MSI" or "xen-dyn-event".
    pub chip: String,
}

impl ProcIrq {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ProcInterrupts {
    pub irqs: Vec<ProcIrq>,
    /// Whether any line mentions MSI.
    pub has_msi: bool,
}

/// Parse the content of `/proc/interrupts`. Parsing stops at the first line
/// not labelled with an irq number (NMI, LOC and friends come last).
pub fn parse_proc_interrupts(content: &str) -> ProcInterrupts {
    let mut result = ProcInterrupts::default();

    // The first line names the CPU columns.
    for line in content.lines().skip(1) {
        if !result.has_msi && line.contains("MSI") {
            result.has_msi = true;
        }

        let trimmed = line.trim_start();
        if !trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            break;
        }

        let (label, rest) = match trimmed.split_once(':') {
            Some(split) => split,
            None => continue,
        };
        let irq = match label.trim().parse::<u32>() {
            Ok(irq) => irq,
            Err(_) => continue,
        };

        let tokens: Vec<&str> = rest.split_whitespace().collect();
        let counts: Vec<u64> = tokens
            .iter()
            .map_while(|tok| tok.parse::<u64>().ok())
            .collect();

        let desc = &tokens[counts.len()..];
        let chip = match desc.len() {
            0 => String::new(),
            1 => desc[0].to_string(),
            n => desc[n - 2].to_string(),
        };

        result.irqs.push(ProcIrq { irq, counts, chip });
    }

    result
}

pub fn read_proc_interrupts(procfs_root: &Path) -> Result<ProcInterrupts> {
    let path = procfs_root.join("interrupts");
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(parse_proc_interrupts(&content))
}

fn irq_path(procfs_root: &Path, irq: u32, file: &str) -> PathBuf {
    procfs_root.join("irq").join(irq.to_string()).join(file)
}

pub fn read_smp_affinity(procfs_root: &Path, irq: u32) -> Result<Cpumask> {
    let smp_affinity = read_file_string(&irq_path(procfs_root, irq, "smp_affinity"))?;
    Cpumask::from_str(&smp_affinity)
}

pub fn write_smp_affinity(procfs_root: &Path, irq: u32, cpumask: &Cpumask) -> Result<()> {
    let path = irq_path(procfs_root, irq, "smp_affinity");
    fs::write(&path, format!("{cpumask:x}")).with_context(|| format!("Failed to write {:?}", path))
}

/// Read the driver's affinity hint. A missing file reads as an empty mask.
pub fn read_affinity_hint(procfs_root: &Path, irq: u32) -> Result<Cpumask> {
    let path = irq_path(procfs_root, irq, "affinity_hint");
    if !path.exists() {
        return Ok(Cpumask::new());
    }
    Cpumask::from_str(&read_file_string(&path)?)
}
