// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Host Topology
//!
//! A raw description of the host's CPUs and NUMA nodes as exposed by sysfs:
//!
//!```text
//!   /sys/devices/system/cpu/cpuN/online
//!   /sys/devices/system/cpu/cpuN/topology/core_siblings
//!   /sys/devices/system/cpu/cpuN/topology/physical_package_id
//!   /sys/devices/system/cpu/cpuN/cache/indexI/shared_cpu_map
//!   /sys/devices/system/cpu/cpuN/nodeM
//!   /sys/devices/system/node/nodeM/cpumap
//!```
//!
//! Nothing here groups CPUs into domains; that is up to the consumer. Every
//! file is optional: a CPU without an `online` file is online, a CPU without
//! sibling or cache information is alone in its package and cache domain, a
//! CPU without a node link has no node.
//!
//! All paths are relative to a sysfs root so the reader can be pointed at a
//! fake tree:
//!
//!```no_run
//!     use irq_utils::HostTopology;
//!     use std::path::Path;
//!     let host = HostTopology::read(Path::new("/sys"), 2).unwrap();
//!     for cpu in host.cpus.iter() {
//!         println!("cpu{} package {} cache {}", cpu.id, cpu.package_mask, cpu.cache_mask);
//!     }
//!```

use crate::misc::read_file_string;
use crate::misc::read_from_file;
use crate::Cpumask;
use anyhow::Result;
use glob::glob;
use log::debug;
use sscanf::sscanf;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct HostCpu {
    pub id: usize,
    pub online: bool,
    pub package_id: usize,
    pub package_mask: Cpumask,
    pub cache_mask: Cpumask,
    pub node: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HostNode {
    pub id: usize,
    pub mask: Cpumask,
}

#[derive(Debug, Clone, Default)]
pub struct HostTopology {
    pub cpus: Vec<HostCpu>,
    pub nodes: Vec<HostNode>,
}

impl HostTopology {
    /// Read every CPU and NUMA node below @sysfs_root. Cache domains are
    /// taken from the deepest cache index available, but no deeper than
    /// @deepest_cache.
    pub fn read(sysfs_root: &Path, deepest_cache: usize) -> Result<HostTopology> {
        let cpu_root = sysfs_root.join("devices/system/cpu");
        let mut cpus = Vec::new();
        let cpu_pattern = cpu_root.join("cpu[0-9]*");
        for cpu_path in glob(cpu_pattern.to_string_lossy().as_ref())?.filter_map(Result::ok) {
            let name = match cpu_path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            // Only real cpus, not cpufreq and cpuidle.
            let cpu_id = match sscanf!(name.as_str(), "cpu{usize}") {
                Ok(id) => id,
                Err(_) => continue,
            };
            cpus.push(read_one_cpu(&cpu_path, cpu_id, deepest_cache)?);
        }
        cpus.sort_by_key(|cpu| cpu.id);

        let nodes = read_nodes(sysfs_root)?;

        Ok(HostTopology { cpus, nodes })
    }

    /// NUMA is considered available when sysfs describes at least one node.
    pub fn numa_available(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/**********************************************
 * Helper functions for reading the topology  *
 **********************************************/

fn solitary_mask(cpu_id: usize) -> Result<Cpumask> {
    Cpumask::from_cpus([cpu_id])
}

fn read_mask_or(path: &Path, fallback: Cpumask) -> Cpumask {
    match read_file_string(path).and_then(|s| Cpumask::from_str(&s)) {
        Ok(mask) => mask,
        Err(e) => {
            debug!("Using fallback mask for {:?}: {}", path, e);
            fallback
        }
    }
}

fn read_one_cpu(cpu_path: &Path, cpu_id: usize, deepest_cache: usize) -> Result<HostCpu> {
    let online = match read_file_string(&cpu_path.join("online")) {
        Ok(val) => !val.starts_with('0'),
        Err(_) => true,
    };

    let top_path = cpu_path.join("topology");
    let package_mask = read_mask_or(&top_path.join("core_siblings"), solitary_mask(cpu_id)?);
    let package_id = read_from_file::<usize>(&top_path.join("physical_package_id")).unwrap_or(0);

    // Find the deepest cache index, stopping at @deepest_cache.
    let cache_path = cpu_path.join("cache");
    let mut max_cache_index = 0;
    let mut cache_index = 1;
    while cache_path
        .join(format!("index{}", cache_index))
        .join("shared_cpu_map")
        .exists()
    {
        max_cache_index = cache_index;
        if max_cache_index == deepest_cache {
            break;
        }
        cache_index += 1;
    }

    let mut cache_mask = solitary_mask(cpu_id)?;
    if max_cache_index > 0 {
        let map = cache_path
            .join(format!("index{}", max_cache_index))
            .join("shared_cpu_map");
        cache_mask = read_mask_or(&map, cache_mask);
    }

    let mut node = None;
    if let Ok(entries) = std::fs::read_dir(cpu_path) {
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(id) = sscanf!(name.as_str(), "node{usize}") {
                node = Some(id);
                break;
            }
        }
    }

    Ok(HostCpu {
        id: cpu_id,
        online,
        package_id,
        package_mask,
        cache_mask,
        node,
    })
}

fn read_nodes(sysfs_root: &Path) -> Result<Vec<HostNode>> {
    let mut nodes = Vec::new();

    let numa_pattern = sysfs_root.join("devices/system/node/node[0-9]*");
    for numa_path in glob(numa_pattern.to_string_lossy().as_ref())?.filter_map(Result::ok) {
        let name = match numa_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let node_id = match sscanf!(name.as_str(), "node{usize}") {
            Ok(id) => id,
            Err(_) => continue,
        };

        // A node without a cpumap has no CPUs to offer.
        let cpumap = numa_path.join("cpumap");
        if !cpumap.exists() {
            continue;
        }
        let mask = read_mask_or(&cpumap, Cpumask::new());
        nodes.push(HostNode { id: node_id, mask });
    }
    nodes.sort_by_key(|node| node.id);

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_read_full_cpu_description() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for cpu in 0..4 {
            let base = format!("devices/system/cpu/cpu{cpu}");
            write(root, &format!("{base}/topology/core_siblings"), "0000000f\n");
            write(root, &format!("{base}/topology/physical_package_id"), "0\n");
            let l1 = format!("{:08x}\n", 1 << cpu);
            write(root, &format!("{base}/cache/index1/shared_cpu_map"), &l1);
            let l2 = if cpu < 2 { "00000003" } else { "0000000c" };
            write(root, &format!("{base}/cache/index2/shared_cpu_map"), l2);
            write(root, &format!("{base}/cache/index3/shared_cpu_map"), "0000000f");
            fs::create_dir_all(root.join(format!("{base}/node0"))).unwrap();
        }
        write(root, "devices/system/cpu/cpu3/online", "0\n");
        fs::create_dir_all(root.join("devices/system/cpu/cpufreq")).unwrap();
        write(root, "devices/system/node/node0/cpumap", "0000000f\n");

        let host = HostTopology::read(root, 2).unwrap();
        assert_eq!(host.cpus.len(), 4);
        assert!(host.numa_available());
        assert_eq!(host.nodes[0].mask.weight(), 4);

        let cpu1 = &host.cpus[1];
        assert_eq!(cpu1.id, 1);
        assert!(cpu1.online);
        assert_eq!(cpu1.cache_mask, Cpumask::from_cpus([0, 1]).unwrap());
        assert_eq!(cpu1.package_mask.weight(), 4);
        assert_eq!(cpu1.node, Some(0));
        assert!(!host.cpus[3].online);

        let deeper = HostTopology::read(root, 3).unwrap();
        assert_eq!(deeper.cpus[1].cache_mask.weight(), 4);
    }

    #[test]
    fn test_missing_files_fall_back() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("devices/system/cpu/cpu0")).unwrap();
        fs::create_dir_all(root.join("devices/system/cpu/cpu1")).unwrap();

        let host = HostTopology::read(root, 2).unwrap();
        assert!(!host.numa_available());
        assert_eq!(host.cpus.len(), 2);
        let cpu1 = &host.cpus[1];
        assert!(cpu1.online);
        assert_eq!(cpu1.package_id, 0);
        assert_eq!(cpu1.package_mask, Cpumask::from_cpus([1]).unwrap());
        assert_eq!(cpu1.cache_mask, Cpumask::from_cpus([1]).unwrap());
        assert_eq!(cpu1.node, None);
    }
}
