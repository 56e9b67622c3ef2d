//! A rail: one independent fabric endpoint with its completion path,
//! address table, domain, and request pools.
//!
//! Rails do not share memory registrations; each rail maps its own handle
//! on the same buffer. Two pools exist per rail: a control pool whose slots
//! own small pre-registered buffers for connection blobs and notification
//! payloads, and a buffer-less data pool whose chunk parameters are filled
//! in at post time. Allocation is O(1) off a free-index stack; release
//! re-arms the slot with a fresh XFER_ID so identifiers stay unique within
//! the initiator's lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::ArrayQueue;

use crate::config::ErrHandlingMode;
use crate::error::{FabrixError, Result};
use crate::fabric::{
    CompletionFn, Endpoint, FabricContext, FabricWorker, MemRegion, Posted, RemoteKey,
};
use crate::types::{MemAccess, MemKind, RailId, XferId};

use super::{imm, next_xfer_id, ControlMsgType};

/// Control-pool slots per rail.
pub(crate) const CONTROL_REQUESTS_PER_RAIL: usize = 256;

/// Data-pool slots per rail.
pub(crate) const DATA_REQUESTS_PER_RAIL: usize = 1024;

/// Size of each control slot's pre-registered buffer.
pub(crate) const CONTROL_BUFFER_SIZE: usize = 4096;

/// Resolved address of a remote rail endpoint within this rail's table.
pub(crate) type FabricAddr = u64;

// ── Request pools ────────────────────────────────────────────────────

/// Free-index pool of pre-assigned XFER_IDs.
struct IndexPool {
    free: ArrayQueue<usize>,
    xfer_ids: Vec<Mutex<XferId>>,
    active: AtomicUsize,
}

impl IndexPool {
    fn new(size: usize) -> Self {
        let free = ArrayQueue::new(size);
        for i in 0..size {
            free.push(i).expect("pool sized for all slots");
        }
        let xfer_ids = (0..size).map(|_| Mutex::new(next_xfer_id())).collect();
        Self {
            free,
            xfer_ids,
            active: AtomicUsize::new(0),
        }
    }

    fn allocate(&self) -> Option<(usize, XferId)> {
        let slot = self.free.pop()?;
        self.active.fetch_add(1, Ordering::AcqRel);
        let id = *self.xfer_ids[slot].lock().unwrap();
        Some((slot, id))
    }

    /// Return a slot, re-arming it with a fresh XFER_ID.
    fn release(&self, slot: usize) {
        *self.xfer_ids[slot].lock().unwrap() = next_xfer_id();
        self.active.fetch_sub(1, Ordering::AcqRel);
        let _ = self.free.push(slot);
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// Control request: a slot plus its pre-registered staging buffer.
pub(crate) struct ControlReq {
    pub(crate) slot: usize,
    pub(crate) xfer_id: XferId,
    base: *mut u8,
    cap: usize,
    len: usize,
}

// The slot buffer is exclusively owned between allocate and release.
unsafe impl Send for ControlReq {}

impl ControlReq {
    pub(crate) fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.cap {
            return Err(FabrixError::invalid_param(format!(
                "control payload {} exceeds slot capacity {}",
                bytes.len(),
                self.cap
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base, bytes.len());
        }
        self.len = bytes.len();
        Ok(())
    }

    pub(crate) fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }
}

/// Pool of control slots backed by one pre-registered buffer chunk.
pub(crate) struct ControlRequestPool {
    pool: IndexPool,
    chunk_base: *mut u8,
    _chunk: Box<[u8]>,
    _chunk_region: MemRegion,
}

// Slot buffers are only touched through exclusively-owned `ControlReq`s.
unsafe impl Send for ControlRequestPool {}
unsafe impl Sync for ControlRequestPool {}

impl ControlRequestPool {
    fn new(ctx: &Arc<FabricContext>, size: usize) -> Result<Self> {
        let mut chunk = vec![0u8; size * CONTROL_BUFFER_SIZE].into_boxed_slice();
        let chunk_base = chunk.as_mut_ptr();
        let chunk_region = ctx.register(
            chunk_base as u64,
            chunk.len(),
            MemKind::Dram,
            MemAccess::LOCAL_READ | MemAccess::LOCAL_WRITE,
        )?;
        Ok(Self {
            pool: IndexPool::new(size),
            chunk_base,
            _chunk: chunk,
            _chunk_region: chunk_region,
        })
    }

    pub(crate) fn allocate(&self, needed_size: usize) -> Option<ControlReq> {
        if needed_size > CONTROL_BUFFER_SIZE {
            return None;
        }
        let (slot, xfer_id) = self.pool.allocate()?;
        Some(ControlReq {
            slot,
            xfer_id,
            base: unsafe { self.chunk_base.add(slot * CONTROL_BUFFER_SIZE) },
            cap: CONTROL_BUFFER_SIZE,
            len: 0,
        })
    }

    pub(crate) fn release(&self, req: ControlReq) {
        self.pool.release(req.slot);
    }

    pub(crate) fn active(&self) -> usize {
        self.pool.active()
    }
}

/// Buffer-less pool for WRITE/READ sub-requests.
pub(crate) struct DataRequestPool {
    pool: IndexPool,
}

impl DataRequestPool {
    fn new(size: usize) -> Self {
        Self {
            pool: IndexPool::new(size),
        }
    }

    pub(crate) fn allocate(&self) -> Option<(usize, XferId)> {
        self.pool.allocate()
    }

    pub(crate) fn release(&self, slot: usize) {
        self.pool.release(slot);
    }

    pub(crate) fn active(&self) -> usize {
        self.pool.active()
    }
}

// ── Rail ─────────────────────────────────────────────────────────────

/// One rail: its own domain, worker, address table, and request pools.
pub(crate) struct Rail {
    pub(crate) id: RailId,
    /// NIC name when topology discovery produced one.
    pub(crate) device: Option<String>,
    ctx: Arc<FabricContext>,
    pub(crate) worker: Arc<FabricWorker>,
    pub(crate) control_pool: ControlRequestPool,
    pub(crate) data_pool: DataRequestPool,
    /// Address table: resolved remote endpoints keyed by their address.
    av: Mutex<HashMap<FabricAddr, Arc<Endpoint>>>,
}

impl Rail {
    pub(crate) fn new(id: RailId, device: Option<String>) -> Result<Self> {
        let ctx = FabricContext::new();
        let worker = ctx.create_worker();
        let control_pool = ControlRequestPool::new(&ctx, CONTROL_REQUESTS_PER_RAIL)?;
        Ok(Self {
            id,
            device,
            ctx,
            worker,
            control_pool,
            data_pool: DataRequestPool::new(DATA_REQUESTS_PER_RAIL),
            av: Mutex::new(HashMap::new()),
        })
    }

    /// Endpoint address other agents use to reach this rail.
    pub(crate) fn endpoint_name(&self) -> Vec<u8> {
        self.worker.address()
    }

    /// Register a caller-pinned buffer with this rail's domain.
    pub(crate) fn register_memory(
        &self,
        base: u64,
        len: usize,
        kind: MemKind,
        access: MemAccess,
    ) -> Result<MemRegion> {
        self.ctx.register(base, len, kind, access)
    }

    /// Insert a remote endpoint address into this rail's address table.
    pub(crate) fn insert_address(&self, addr: &[u8]) -> Result<FabricAddr> {
        let bytes: [u8; 8] = addr
            .try_into()
            .map_err(|_| FabrixError::mismatch("endpoint address must be 8 bytes"))?;
        let key = u64::from_le_bytes(bytes);
        let mut av = self.av.lock().unwrap();
        if !av.contains_key(&key) {
            let ep = self.worker.connect(addr, ErrHandlingMode::Peer, None)?;
            av.insert(key, Arc::new(ep));
        }
        Ok(key)
    }

    /// Remove an address from the table. Unknown addresses are ignored.
    pub(crate) fn remove_address(&self, addr: FabricAddr) {
        self.av.lock().unwrap().remove(&addr);
    }

    fn endpoint(&self, addr: FabricAddr) -> Result<Arc<Endpoint>> {
        self.av
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or_else(|| FabrixError::backend(format!("address {addr:#x} not in rail {} table", self.id)))
    }

    /// Send a control message; the slot's payload travels as the message
    /// body and the discriminant in the immediate data.
    pub(crate) fn post_control(
        &self,
        msg_type: ControlMsgType,
        req: &ControlReq,
        dest: FabricAddr,
        agent_index: u16,
    ) -> Result<()> {
        let ep = self.endpoint(dest)?;
        tracing::trace!(
            rail = self.id,
            slot = req.slot,
            xfer_id = req.xfer_id,
            ?msg_type,
            "posting control message"
        );
        ep.am_send(
            imm::encode(imm::KIND_CONTROL, agent_index, msg_type as u32),
            &[],
            req.payload(),
        )
    }

    /// Post one data-chunk write carrying its XFER_ID as immediate data.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn post_write(
        &self,
        dest: FabricAddr,
        local: &MemRegion,
        local_addr: u64,
        len: usize,
        remote_addr: u64,
        rkey: RemoteKey,
        xfer_id: XferId,
        agent_index: u16,
        cb: CompletionFn,
    ) -> Result<Posted> {
        let ep = self.endpoint(dest)?;
        ep.rma_write(
            local,
            local_addr,
            len,
            remote_addr,
            rkey,
            Some(imm::encode(imm::KIND_DATA, agent_index, xfer_id)),
            cb,
        )
    }

    /// Post one data-chunk read.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn post_read(
        &self,
        dest: FabricAddr,
        local: &MemRegion,
        local_addr: u64,
        len: usize,
        remote_addr: u64,
        rkey: RemoteKey,
        cb: CompletionFn,
    ) -> Result<Posted> {
        let ep = self.endpoint(dest)?;
        ep.rma_read(local, local_addr, len, remote_addr, rkey, cb)
    }

    pub(crate) fn progress(&self) -> usize {
        self.worker.progress()
    }
}
