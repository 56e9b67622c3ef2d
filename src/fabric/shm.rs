//! In-process shared-segment provider.
//!
//! A process-wide switchboard resolves worker addresses and remote-key
//! domains, so several engines inside one process form a fabric: one-sided
//! operations are bounds-checked against the target domain's registrations
//! and executed as direct copies during the initiator's progress step, with
//! write immediates and active messages delivered into the target worker's
//! inbox.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, Weak};

use crate::error::{FabrixError, Result};
use crate::types::{MemAccess, MemKind};

use super::{EpShared, RemoteKey, ReqShared};

// ── Registry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Region {
    base: u64,
    len: usize,
    kind: MemKind,
    access: MemAccess,
}

/// Per-domain table of registered regions, keyed by remote key.
pub(super) struct MemRegistry {
    pub(super) ctx_id: u64,
    next_rkey: AtomicU64,
    regions: Mutex<HashMap<u64, Region>>,
}

impl MemRegistry {
    pub(super) fn register(&self, base: u64, len: usize, kind: MemKind, access: MemAccess) -> u64 {
        let rkey = self.next_rkey.fetch_add(1, Ordering::Relaxed);
        self.regions.lock().unwrap().insert(
            rkey,
            Region {
                base,
                len,
                kind,
                access,
            },
        );
        rkey
    }

    /// Idempotent: deregistering an unknown key is a no-op.
    pub(super) fn deregister(&self, rkey: u64) {
        self.regions.lock().unwrap().remove(&rkey);
    }

    fn resolve(&self, rkey: u64, addr: u64, len: usize, need: MemAccess) -> Result<Region> {
        let regions = self.regions.lock().unwrap();
        let region = regions
            .get(&rkey)
            .ok_or_else(|| FabrixError::backend(format!("unknown remote key {rkey}")))?;
        if !region.access.contains(need) {
            return Err(FabrixError::backend(format!(
                "remote key {rkey} lacks {need:?} access"
            )));
        }
        let in_bounds = addr >= region.base
            && addr.saturating_add(len as u64) <= region.base + region.len as u64;
        if !in_bounds {
            return Err(FabrixError::backend(format!(
                "remote access [{addr:#x}, +{len}) outside registration"
            )));
        }
        Ok(*region)
    }
}

// ── Workers ──────────────────────────────────────────────────────────

/// Packets delivered into a worker's inbox.
pub(super) enum Packet {
    Am {
        imm: u64,
        header: Vec<u8>,
        body: Vec<u8>,
    },
    WriteImm {
        imm: u64,
    },
}

pub(super) struct WorkerState {
    pub(super) inbox: VecDeque<Packet>,
    pub(super) work: VecDeque<WorkItem>,
    pub(super) closed: bool,
}

pub(super) struct WorkerShared {
    pub(super) uid: u64,
    pub(super) paused: AtomicBool,
    pub(super) state: Mutex<WorkerState>,
    pub(super) cv: Condvar,
}

impl WorkerShared {
    pub(super) fn push_work(&self, item: WorkItem) {
        let mut state = self.state.lock().unwrap();
        state.work.push_back(item);
        self.cv.notify_all();
    }
}

// ── Work items ───────────────────────────────────────────────────────

pub(super) enum WorkOp {
    Am {
        target: u64,
        packet: Packet,
    },
    Rma {
        is_write: bool,
        local_addr: u64,
        local_kind: MemKind,
        remote_addr: u64,
        rkey: RemoteKey,
        len: usize,
        imm: Option<u64>,
        target: u64,
    },
}

pub(super) struct WorkItem {
    /// `None` for fire-and-forget sends.
    pub(super) req: Option<Arc<ReqShared>>,
    pub(super) ep: Weak<EpShared>,
    pub(super) op: WorkOp,
}

/// Execute one work item: perform the copy or delivery, fire the endpoint
/// error path when the peer vanished, and complete the request.
pub(super) fn execute(item: WorkItem) {
    if let Some(req) = &item.req {
        if !req.is_pending() {
            return;
        }
    }

    let outcome = match item.op {
        WorkOp::Am { target, packet } => {
            if switchboard().deliver(target, packet) {
                Ok(())
            } else {
                Err(FabrixError::backend("active message peer vanished"))
            }
        }
        WorkOp::Rma {
            is_write,
            local_addr,
            local_kind,
            remote_addr,
            rkey,
            len,
            imm,
            target,
        } => execute_rma(
            is_write,
            local_addr,
            local_kind,
            remote_addr,
            rkey,
            len,
            imm,
            target,
        ),
    };

    if outcome.is_err() {
        if let Some(ep) = item.ep.upgrade() {
            ep.fail();
        }
    }
    if let Some(req) = item.req {
        req.complete(outcome);
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_rma(
    is_write: bool,
    local_addr: u64,
    local_kind: MemKind,
    remote_addr: u64,
    rkey: RemoteKey,
    len: usize,
    imm: Option<u64>,
    target: u64,
) -> Result<()> {
    let registry = switchboard()
        .registry(rkey.ctx_id)
        .ok_or_else(|| FabrixError::backend("remote domain vanished"))?;

    let need = if is_write {
        MemAccess::REMOTE_WRITE
    } else {
        MemAccess::REMOTE_READ
    };
    let region = registry.resolve(rkey.rkey, remote_addr, len, need)?;

    if is_write {
        copy_bytes(local_addr, local_kind, remote_addr, region.kind, len)?;
        if let Some(imm) = imm {
            if !switchboard().deliver(target, Packet::WriteImm { imm }) {
                return Err(FabrixError::backend("write immediate peer vanished"));
            }
        }
    } else {
        copy_bytes(remote_addr, region.kind, local_addr, local_kind, len)?;
    }
    Ok(())
}

/// Move `len` bytes between registered regions, honoring memory kinds.
fn copy_bytes(src: u64, src_kind: MemKind, dst: u64, dst_kind: MemKind, len: usize) -> Result<()> {
    match (src_kind, dst_kind) {
        (MemKind::Vram, _) | (_, MemKind::Vram) => {
            #[cfg(feature = "cuda")]
            {
                crate::gpu::copy(src, src_kind, dst, dst_kind, len)
            }
            #[cfg(not(feature = "cuda"))]
            {
                let _ = (src, dst, len);
                Err(FabrixError::not_supported("VRAM copy without cuda feature"))
            }
        }
        _ => {
            // Registered regions are caller-pinned for the duration; overlap
            // within one buffer is allowed, so this must be a memmove.
            unsafe {
                std::ptr::copy(src as *const u8, dst as *mut u8, len);
            }
            Ok(())
        }
    }
}

// ── Switchboard ──────────────────────────────────────────────────────

pub(super) struct Switchboard {
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, Arc<WorkerShared>>>,
    registries: Mutex<HashMap<u64, Arc<MemRegistry>>>,
}

static SWITCHBOARD: LazyLock<Switchboard> = LazyLock::new(|| Switchboard {
    next_id: AtomicU64::new(1),
    workers: Mutex::new(HashMap::new()),
    registries: Mutex::new(HashMap::new()),
});

pub(super) fn switchboard() -> &'static Switchboard {
    &SWITCHBOARD
}

impl Switchboard {
    pub(super) fn create_registry(&self) -> Arc<MemRegistry> {
        let ctx_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::new(MemRegistry {
            ctx_id,
            next_rkey: AtomicU64::new(1),
            regions: Mutex::new(HashMap::new()),
        });
        self.registries
            .lock()
            .unwrap()
            .insert(ctx_id, Arc::clone(&registry));
        registry
    }

    pub(super) fn drop_registry(&self, ctx_id: u64) {
        self.registries.lock().unwrap().remove(&ctx_id);
    }

    pub(super) fn registry(&self, ctx_id: u64) -> Option<Arc<MemRegistry>> {
        self.registries.lock().unwrap().get(&ctx_id).cloned()
    }

    pub(super) fn create_worker(&self) -> Arc<WorkerShared> {
        let uid = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(WorkerShared {
            uid,
            paused: AtomicBool::new(false),
            state: Mutex::new(WorkerState {
                inbox: VecDeque::new(),
                work: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        });
        self.workers.lock().unwrap().insert(uid, Arc::clone(&shared));
        shared
    }

    pub(super) fn drop_worker(&self, uid: u64) {
        self.workers.lock().unwrap().remove(&uid);
    }

    pub(super) fn worker_exists(&self, uid: u64) -> bool {
        self.workers.lock().unwrap().contains_key(&uid)
    }

    /// Deliver a packet into a worker's inbox. Returns false when the
    /// address no longer resolves.
    pub(super) fn deliver(&self, uid: u64, packet: Packet) -> bool {
        let Some(worker) = self.workers.lock().unwrap().get(&uid).cloned() else {
            return false;
        };
        let mut state = worker.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.inbox.push_back(packet);
        worker.cv.notify_all();
        true
    }
}
