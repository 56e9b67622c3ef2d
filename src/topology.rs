//! Best-effort system topology discovery.
//!
//! Enumerates fabric NICs, GPUs, and NUMA nodes from sysfs and groups each
//! NIC with its nearest GPU by PCIe common-ancestor distance, so rail
//! selection can keep bulk transfers on the NICs closest to the memory they
//! touch. Discovery failure is not fatal: selection falls back to
//! round-robin across all rails, and discovery never blocks progress.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::{MemKind, RailId};

/// One discovered fabric NIC.
#[derive(Debug, Clone)]
pub struct NicInfo {
    pub name: String,
    /// Canonical PCIe device path under /sys.
    pub pcie_path: PathBuf,
    /// NUMA node of the NIC, -1 when unknown.
    pub numa_node: i32,
    /// Ordinal of the nearest GPU, when one was found.
    pub nearest_gpu: Option<u32>,
}

/// Discovered system topology.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    discovered: bool,
    nics: Vec<NicInfo>,
    num_gpus: usize,
    num_numa_nodes: usize,
}

impl Topology {
    /// Discover the local topology. Never fails: on any problem the result
    /// reports `discovered() == false` and selection degrades to
    /// round-robin.
    pub fn discover() -> Self {
        let gpus = discover_gpus("/sys/bus/pci/devices");
        let mut nics = discover_nics("/sys/class/infiniband");
        let num_numa_nodes = count_numa_nodes("/sys/devices/system/node");

        group_nics_with_gpus(&mut nics, &gpus);

        let discovered = !nics.is_empty();
        if !discovered {
            tracing::warn!("topology discovery found no fabric NICs, falling back to round-robin");
        } else {
            tracing::debug!(
                nics = nics.len(),
                gpus = gpus.len(),
                numa_nodes = num_numa_nodes,
                "topology discovered"
            );
        }

        Self {
            discovered,
            nics,
            num_gpus: gpus.len(),
            num_numa_nodes,
        }
    }

    /// A topology that always falls back to round-robin.
    pub fn undiscovered() -> Self {
        Self::default()
    }

    pub fn discovered(&self) -> bool {
        self.discovered
    }

    pub fn nics(&self) -> &[NicInfo] {
        &self.nics
    }

    pub fn num_gpus(&self) -> usize {
        self.num_gpus
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.num_numa_nodes
    }

    /// Sorted rail ids to use for a registration.
    ///
    /// GPU memory selects the rails grouped with that GPU; host memory
    /// selects the rails on the descriptor's NUMA node. An empty match or
    /// undiscovered topology yields every rail, leaving the placement to
    /// round-robin.
    pub fn select_rails(&self, kind: MemKind, dev_id: u32, total_rails: usize) -> Vec<RailId> {
        let all = || (0..total_rails).collect::<Vec<_>>();
        if !self.discovered || self.nics.is_empty() || total_rails == 0 {
            return all();
        }

        let matches = |nic: &NicInfo| match kind {
            MemKind::Vram => nic.nearest_gpu == Some(dev_id),
            MemKind::Dram => nic.numa_node == dev_id as i32,
            MemKind::Blk | MemKind::File => false,
        };

        // Rails beyond the NIC table wrap onto it positionally.
        let mut rails: Vec<RailId> = (0..total_rails)
            .filter(|&rail| matches(&self.nics[rail % self.nics.len()]))
            .collect();
        if rails.is_empty() {
            return all();
        }
        rails.sort_unstable();
        rails
    }
}

/// PCIe path of each NVIDIA display-class device, ordered by bus address.
fn discover_gpus(pci_root: impl AsRef<Path>) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(pci_root) else {
        return Vec::new();
    };
    let mut gpus: Vec<PathBuf> = entries
        .flatten()
        .filter_map(|entry| {
            let dir = entry.path();
            let class = std::fs::read_to_string(dir.join("class")).ok()?;
            let vendor = std::fs::read_to_string(dir.join("vendor")).ok()?;
            // 0x03xxxx is the display controller class; 0x10de is NVIDIA.
            (class.trim().starts_with("0x03") && vendor.trim() == "0x10de")
                .then(|| dir.canonicalize().ok())?
        })
        .collect();
    gpus.sort();
    gpus
}

fn discover_nics(ib_root: impl AsRef<Path>) -> Vec<NicInfo> {
    let Ok(entries) = std::fs::read_dir(ib_root) else {
        return Vec::new();
    };
    let mut nics: Vec<NicInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let pcie_path = entry.path().join("device").canonicalize().ok()?;
            let numa_node = std::fs::read_to_string(pcie_path.join("numa_node"))
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
                .unwrap_or(-1);
            Some(NicInfo {
                name,
                pcie_path,
                numa_node,
                nearest_gpu: None,
            })
        })
        .collect();
    nics.sort_by(|a, b| a.name.cmp(&b.name));
    nics
}

fn count_numa_nodes(node_root: impl AsRef<Path>) -> usize {
    let Ok(entries) = std::fs::read_dir(node_root) else {
        return 1;
    };
    let n = entries
        .flatten()
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix("node")
                .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
        })
        .count();
    n.max(1)
}

/// Fill each NIC's `nearest_gpu` with the GPU sharing the deepest PCIe
/// ancestor. Ties resolve to the lower GPU ordinal.
fn group_nics_with_gpus(nics: &mut [NicInfo], gpus: &[PathBuf]) {
    for nic in nics.iter_mut() {
        let mut best: Option<(usize, u32)> = None;
        for (ordinal, gpu_path) in gpus.iter().enumerate() {
            let depth = common_ancestor_depth(&nic.pcie_path, gpu_path);
            if best.map_or(true, |(best_depth, _)| depth > best_depth) {
                best = Some((depth, ordinal as u32));
            }
        }
        nic.nearest_gpu = best.map(|(_, ordinal)| ordinal);
    }
}

/// Number of leading path components two PCIe device paths share.
fn common_ancestor_depth(a: &Path, b: &Path) -> usize {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(name: &str, path: &str, numa: i32) -> NicInfo {
        NicInfo {
            name: name.into(),
            pcie_path: PathBuf::from(path),
            numa_node: numa,
            nearest_gpu: None,
        }
    }

    #[test]
    fn test_grouping_by_common_ancestor() {
        let mut nics = vec![
            nic("rdmap0", "/sys/devices/pci0000:00/0000:00:01.0/0000:01:00.0", 0),
            nic("rdmap1", "/sys/devices/pci0000:80/0000:80:01.0/0000:81:00.0", 1),
        ];
        let gpus = vec![
            PathBuf::from("/sys/devices/pci0000:00/0000:00:01.0/0000:02:00.0"),
            PathBuf::from("/sys/devices/pci0000:80/0000:80:01.0/0000:82:00.0"),
        ];
        group_nics_with_gpus(&mut nics, &gpus);
        assert_eq!(nics[0].nearest_gpu, Some(0));
        assert_eq!(nics[1].nearest_gpu, Some(1));
    }

    #[test]
    fn test_grouping_without_gpus() {
        let mut nics = vec![nic("rdmap0", "/sys/devices/pci0000:00/0000:01:00.0", 0)];
        group_nics_with_gpus(&mut nics, &[]);
        assert_eq!(nics[0].nearest_gpu, None);
    }

    fn topo_with(nics: Vec<NicInfo>) -> Topology {
        Topology {
            discovered: !nics.is_empty(),
            nics,
            num_gpus: 2,
            num_numa_nodes: 2,
        }
    }

    #[test]
    fn test_select_rails_gpu_memory() {
        let mut nics = vec![
            nic("a", "/x", 0),
            nic("b", "/x", 0),
            nic("c", "/y", 1),
            nic("d", "/y", 1),
        ];
        nics[0].nearest_gpu = Some(0);
        nics[1].nearest_gpu = Some(0);
        nics[2].nearest_gpu = Some(1);
        nics[3].nearest_gpu = Some(1);
        let topo = topo_with(nics);

        assert_eq!(topo.select_rails(MemKind::Vram, 0, 4), vec![0, 1]);
        assert_eq!(topo.select_rails(MemKind::Vram, 1, 4), vec![2, 3]);
        // No NIC near GPU 5: everything, round-robin decides later.
        assert_eq!(topo.select_rails(MemKind::Vram, 5, 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_select_rails_host_memory_by_numa() {
        let topo = topo_with(vec![
            nic("a", "/x", 0),
            nic("b", "/x", 1),
            nic("c", "/y", 1),
        ]);
        assert_eq!(topo.select_rails(MemKind::Dram, 1, 3), vec![1, 2]);
        assert_eq!(topo.select_rails(MemKind::Dram, 0, 3), vec![0]);
    }

    #[test]
    fn test_select_rails_fallback_when_undiscovered() {
        let topo = Topology::undiscovered();
        assert_eq!(topo.select_rails(MemKind::Vram, 0, 3), vec![0, 1, 2]);
        assert_eq!(topo.select_rails(MemKind::Dram, 7, 2), vec![0, 1]);
    }

    #[test]
    fn test_select_rails_wraps_past_nic_table() {
        let mut nics = vec![nic("a", "/x", 0), nic("b", "/y", 1)];
        nics[0].nearest_gpu = Some(0);
        nics[1].nearest_gpu = Some(1);
        let topo = topo_with(nics);
        // 4 rails over 2 NICs: rails 0 and 2 sit on NIC a.
        assert_eq!(topo.select_rails(MemKind::Vram, 0, 4), vec![0, 2]);
    }

    #[test]
    fn test_discover_never_panics() {
        let topo = Topology::discover();
        let _ = topo.discovered();
    }
}
