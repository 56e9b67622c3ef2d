//! Rail bank management: creation, topology-aware selection, striping,
//! memory registration fan-out, and wire serialization of connection info
//! and memory keys.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{FabrixError, Result};
use crate::fabric::MemRegion;
use crate::serdes::{read_blob_list, write_blob_list, BlobReader, BlobWriter};
use crate::topology::Topology;
use crate::types::{MemAccess, MemKind, RailId};

use super::rail::{FabricAddr, Rail};

/// Which bank a connection operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RailKind {
    Data,
    Control,
}

/// One planned chunk of a user descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkPlan {
    pub(crate) rail: RailId,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

/// Bank of data rails for bulk RDMA plus a smaller bank of control rails
/// for connection packets and notifications.
pub(crate) struct RailManager {
    data_rails: Vec<Rail>,
    control_rails: Vec<Rail>,
    topology: Topology,
    striping_threshold: usize,
    rr_cursor: AtomicUsize,
    active_rails: Mutex<HashSet<RailId>>,
}

impl RailManager {
    pub(crate) fn new(
        num_data_rails: usize,
        num_control_rails: usize,
        striping_threshold: usize,
        topology: Topology,
    ) -> Result<Self> {
        // One data rail per discovered NIC; the configured count is the
        // fallback when discovery came up empty.
        let data_count = if topology.discovered() {
            topology.nics().len()
        } else {
            num_data_rails
        };
        if data_count == 0 || num_control_rails == 0 {
            return Err(FabrixError::invalid_param(
                "rail counts must be at least one",
            ));
        }
        // The key blob's selection mask is 64 bits wide.
        if data_count > 64 {
            return Err(FabrixError::invalid_param(format!(
                "{data_count} data rails exceeds the 64-rail limit"
            )));
        }

        let mut data_rails = Vec::with_capacity(data_count);
        for id in 0..data_count {
            let device = topology
                .nics()
                .get(id % topology.nics().len().max(1))
                .map(|nic| nic.name.clone())
                .filter(|_| topology.discovered());
            data_rails.push(Rail::new(id, device)?);
        }
        let mut control_rails = Vec::with_capacity(num_control_rails);
        for id in 0..num_control_rails {
            control_rails.push(Rail::new(id, None)?);
        }

        tracing::debug!(
            data_rails = data_count,
            control_rails = num_control_rails,
            striping_threshold,
            "rail manager created"
        );
        for rail in &data_rails {
            if let Some(device) = &rail.device {
                tracing::debug!(rail = rail.id, %device, "data rail bound to NIC");
            }
        }

        Ok(Self {
            data_rails,
            control_rails,
            topology,
            striping_threshold,
            rr_cursor: AtomicUsize::new(0),
            active_rails: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn num_data_rails(&self) -> usize {
        self.data_rails.len()
    }

    pub(crate) fn num_control_rails(&self) -> usize {
        self.control_rails.len()
    }

    pub(crate) fn data_rail(&self, id: RailId) -> &Rail {
        &self.data_rails[id]
    }

    pub(crate) fn control_rail(&self, id: RailId) -> &Rail {
        &self.control_rails[id]
    }

    // ── Selection and striping ───────────────────────────────────────

    /// Sorted rail ids for a registration, by memory locality.
    pub(crate) fn select_rails(&self, kind: MemKind, dev_id: u32) -> Vec<RailId> {
        self.topology
            .select_rails(kind, dev_id, self.data_rails.len())
    }

    /// Striping decision: sizes strictly above the threshold stripe.
    pub(crate) fn should_stripe(&self, transfer_size: usize) -> bool {
        transfer_size > self.striping_threshold
    }

    /// Plan the chunks of one descriptor over the selected rails:
    /// round-robin below the threshold, contiguous nearly-equal chunks
    /// across every selected rail above it (last chunk absorbs the
    /// remainder).
    pub(crate) fn plan_transfer(&self, size: usize, selected: &[RailId]) -> Vec<ChunkPlan> {
        debug_assert!(!selected.is_empty());
        if !self.should_stripe(size) {
            let pick = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % selected.len();
            return vec![ChunkPlan {
                rail: selected[pick],
                offset: 0,
                len: size,
            }];
        }

        let n = selected.len();
        let base = size / n;
        let mut plans = Vec::with_capacity(n);
        let mut offset = 0usize;
        for (i, &rail) in selected.iter().enumerate() {
            let len = if i == n - 1 { size - offset } else { base };
            if len == 0 {
                continue;
            }
            plans.push(ChunkPlan { rail, offset, len });
            offset += len;
        }
        plans
    }

    // ── Memory registration ──────────────────────────────────────────

    /// Register a buffer on the selected rails. Returns per-rail regions
    /// (`None` on unselected rails) and the selected set.
    pub(crate) fn register_memory(
        &self,
        base: u64,
        len: usize,
        kind: MemKind,
        dev_id: u32,
    ) -> Result<(Vec<Option<Arc<MemRegion>>>, Vec<RailId>)> {
        let selected = self.select_rails(kind, dev_id);
        let mut regions: Vec<Option<Arc<MemRegion>>> =
            (0..self.data_rails.len()).map(|_| None).collect();
        for &rail_id in &selected {
            let region = self.data_rails[rail_id]
                .register_memory(base, len, kind, MemAccess::rdma_default())?;
            regions[rail_id] = Some(Arc::new(region));
        }
        Ok((regions, selected))
    }

    /// Deregister from every selected rail, continuing past failures.
    pub(crate) fn deregister_memory(&self, regions: &mut [Option<Arc<MemRegion>>]) {
        for region in regions.iter_mut() {
            if let Some(region) = region.take() {
                region.deregister();
            }
        }
    }

    // ── Connection plumbing ──────────────────────────────────────────

    /// Serialize every rail endpoint under the given table prefix
    /// (`src` for connection requests, `dest` for runtime exchange).
    pub(crate) fn serialize_connection_info(&self, prefix: &str) -> Vec<u8> {
        let data: Vec<Vec<u8>> = self.data_rails.iter().map(|r| r.endpoint_name()).collect();
        let control: Vec<Vec<u8>> = self
            .control_rails
            .iter()
            .map(|r| r.endpoint_name())
            .collect();
        let mut w = BlobWriter::new();
        write_blob_list(&mut w, &format!("{prefix}_d"), &data);
        write_blob_list(&mut w, &format!("{prefix}_c"), &control);
        w.finish()
    }

    /// Deserialize a peer's endpoint tables, requiring the rail counts to
    /// match this engine's banks.
    pub(crate) fn deserialize_connection_info(
        &self,
        prefix: &str,
        blob: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let mut r = BlobReader::new(blob);
        let data = read_blob_list(&mut r, &format!("{prefix}_d"), Some(self.data_rails.len()))?;
        let control = read_blob_list(
            &mut r,
            &format!("{prefix}_c"),
            Some(self.control_rails.len()),
        )?;
        Ok((data, control))
    }

    /// Insert a peer's endpoint table into every rail's address table.
    pub(crate) fn insert_all_addresses(
        &self,
        kind: RailKind,
        endpoints: &[Vec<u8>],
    ) -> Result<Vec<FabricAddr>> {
        let rails = match kind {
            RailKind::Data => &self.data_rails,
            RailKind::Control => &self.control_rails,
        };
        if endpoints.len() != rails.len() {
            return Err(FabrixError::invalid_param(format!(
                "expected {} endpoints, got {}",
                rails.len(),
                endpoints.len()
            )));
        }
        rails
            .iter()
            .zip(endpoints)
            .map(|(rail, ep)| rail.insert_address(ep))
            .collect()
    }

    /// Drop a peer's addresses from every rail's table.
    pub(crate) fn cleanup_connection(&self, kind: RailKind, addrs: &[FabricAddr]) {
        let rails = match kind {
            RailKind::Data => &self.data_rails,
            RailKind::Control => &self.control_rails,
        };
        for (rail, &addr) in rails.iter().zip(addrs) {
            rail.remove_address(addr);
        }
    }

    // ── Memory key wire format ───────────────────────────────────────

    /// Pack per-rail remote keys: base address, rail-selection mask, then
    /// one positional entry per rail (empty for unselected rails).
    pub(crate) fn serialize_memory_keys(
        &self,
        regions: &[Option<Arc<MemRegion>>],
        base_addr: u64,
    ) -> Vec<u8> {
        let mut mask = 0u64;
        let keys: Vec<Vec<u8>> = regions
            .iter()
            .enumerate()
            .map(|(i, region)| match region {
                Some(region) => {
                    mask |= 1 << i;
                    region.pack_key()
                }
                None => Vec::new(),
            })
            .collect();

        let mut w = BlobWriter::new();
        w.add_u64("addr", base_addr);
        w.add_u64("mask", mask);
        write_blob_list(&mut w, "k", &keys);
        w.finish()
    }

    /// Unpack a peer's key blob into `(remote base, per-rail packed keys)`.
    pub(crate) fn deserialize_memory_keys(
        &self,
        blob: &[u8],
    ) -> Result<(u64, Vec<Option<Vec<u8>>>)> {
        let mut r = BlobReader::new(blob);
        let addr = r.expect_u64("addr")?;
        let mask = r.expect_u64("mask")?;
        let keys = read_blob_list(&mut r, "k", Some(self.data_rails.len()))?;
        let keys = keys
            .into_iter()
            .enumerate()
            .map(|(i, k)| {
                let selected = mask & (1 << i) != 0;
                match (selected, k.is_empty()) {
                    (true, false) => Ok(Some(k)),
                    (false, true) => Ok(None),
                    _ => Err(FabrixError::mismatch(format!(
                        "rail {i} key disagrees with selection mask"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((addr, keys))
    }

    // ── Progress ─────────────────────────────────────────────────────

    pub(crate) fn mark_rail_active(&self, rail: RailId) {
        self.active_rails.lock().unwrap().insert(rail);
    }

    pub(crate) fn active_rail_count(&self) -> usize {
        self.active_rails.lock().unwrap().len()
    }

    /// Progress only the rails with outstanding data requests; drained
    /// rails leave the active set.
    pub(crate) fn progress_active_data_rails(&self) -> usize {
        let active: Vec<RailId> = self.active_rails.lock().unwrap().iter().copied().collect();
        let mut events = 0;
        for rail_id in active {
            let rail = &self.data_rails[rail_id];
            events += rail.progress();
            if rail.data_pool.active() == 0 {
                self.active_rails.lock().unwrap().remove(&rail_id);
            }
        }
        events
    }

    /// Progress every data rail regardless of the active set.
    pub(crate) fn progress_all_data_rails(&self) -> usize {
        self.data_rails.iter().map(|r| r.progress()).sum()
    }

    pub(crate) fn progress_all_control_rails(&self) -> usize {
        self.control_rails.iter().map(|r| r.progress()).sum()
    }

    /// Blocking completion read on control rail 0, when supported.
    pub(crate) fn control_wait(&self, timeout: std::time::Duration) -> bool {
        self.control_rails[0].worker.wait(timeout)
    }

    pub(crate) fn control_blocking_supported(&self) -> bool {
        self.control_rails[0].worker.blocking_read_supported()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n_data: usize) -> RailManager {
        RailManager::new(n_data, 1, 1024 * 1024, Topology::undiscovered()).unwrap()
    }

    #[test]
    fn test_threshold_boundary_is_round_robin() {
        let m = manager(4);
        let selected = vec![0, 1, 2, 3];
        // Exactly at the threshold: a single whole-descriptor chunk.
        let plans = m.plan_transfer(1024 * 1024, &selected);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].len, 1024 * 1024);
        assert_eq!(plans[0].offset, 0);

        // One byte above: striped across all selected rails.
        let plans = m.plan_transfer(1024 * 1024 + 1, &selected);
        assert_eq!(plans.len(), 4);
    }

    #[test]
    fn test_striping_contiguous_with_remainder() {
        let m = manager(4);
        let size = 8 * 1024 * 1024 + 3;
        let plans = m.plan_transfer(size, &[0, 1, 2, 3]);
        assert_eq!(plans.len(), 4);
        // Contiguous coverage.
        let mut expected_offset = 0;
        for plan in &plans {
            assert_eq!(plan.offset, expected_offset);
            expected_offset += plan.len;
        }
        assert_eq!(expected_offset, size);
        // Last chunk absorbs the remainder.
        assert_eq!(plans[3].len, size / 4 + 3);
    }

    #[test]
    fn test_round_robin_cycles_selected_set() {
        let m = manager(3);
        let selected = vec![0, 2];
        let first = m.plan_transfer(100, &selected)[0].rail;
        let second = m.plan_transfer(100, &selected)[0].rail;
        let third = m.plan_transfer(100, &selected)[0].rail;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_connection_info_roundtrip_src_dest_prefixes() {
        let m = manager(2);
        let blob = m.serialize_connection_info("src");
        let (data, control) = m.deserialize_connection_info("src", &blob).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(control.len(), 1);

        // A dest-tagged reader must refuse a src-tagged table.
        assert!(m.deserialize_connection_info("dest", &blob).is_err());
    }

    #[test]
    fn test_memory_key_roundtrip() {
        let m = manager(3);
        let buf = vec![0u8; 4096];
        let (mut regions, selected) =
            m.register_memory(buf.as_ptr() as u64, buf.len(), MemKind::Dram, 0).unwrap();
        assert_eq!(selected, vec![0, 1, 2]);

        let blob = m.serialize_memory_keys(&regions, buf.as_ptr() as u64);
        let (addr, keys) = m.deserialize_memory_keys(&blob).unwrap();
        assert_eq!(addr, buf.as_ptr() as u64);
        assert_eq!(keys.iter().filter(|k| k.is_some()).count(), 3);

        m.deregister_memory(&mut regions);
        assert!(regions.iter().all(|r| r.is_none()));
    }

    #[test]
    fn test_memory_key_mask_disagreement() {
        let m = manager(2);
        let mut w = BlobWriter::new();
        w.add_u64("addr", 0x1000);
        w.add_u64("mask", 0b11);
        // Rail 1 claims selected but carries an empty key.
        write_blob_list(&mut w, "k", &[vec![0u8; 16], Vec::new()]);
        assert!(matches!(
            m.deserialize_memory_keys(&w.finish()),
            Err(FabrixError::Mismatch(_))
        ));
    }

    #[test]
    fn test_insert_addresses_count_mismatch() {
        let m = manager(2);
        let err = m
            .insert_all_addresses(RailKind::Data, &[vec![0u8; 8]])
            .unwrap_err();
        assert!(matches!(err, FabrixError::InvalidParam(_)));
    }

    #[test]
    fn test_active_rail_set_drains() {
        let m = manager(2);
        m.mark_rail_active(0);
        m.mark_rail_active(1);
        assert_eq!(m.active_rail_count(), 2);
        // No outstanding data requests: one progress pass empties the set.
        m.progress_active_data_rails();
        assert_eq!(m.active_rail_count(), 0);
    }
}
