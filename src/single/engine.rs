//! Engine implementation.
//!
//! Transfers route each descriptor through the worker bound to its private
//! metadata and the endpoint created from that worker, one sub-request per
//! descriptor with a shared atomic completion counter. Notifications ride
//! an active-message channel and, when attached to a transfer, are sent
//! only after every sub-request has completed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{
    BackendEngine, LocalDesc, MemHandle, NotifMap, RemoteDesc, RemoteMemHandle, ReqHandle,
    XferOpts,
};
use crate::config::{EngineParams, ProgressMode};
use crate::error::{FabrixError, Result};
use crate::fabric::{
    CompletionFn, Endpoint, FabricContext, FabricReq, FabricWorker, MemRegion, Posted, RemoteKey,
};
use crate::progress::ProgressThread;
use crate::serdes::{read_blob_list, write_blob_list, BlobReader, BlobWriter};
use crate::telemetry::TelemetryQueue;
use crate::types::{
    CostEstimate, CostMethod, MemAccess, MemDesc, MemKind, XferOp, XferStatus,
};

use super::AM_NOTIF;

// ── Connections ──────────────────────────────────────────────────────

struct SingleConn {
    remote_agent: String,
    /// The peer's worker address table, as loaded from its conn info.
    remote_addrs: Vec<Vec<u8>>,
    /// One endpoint per local worker; empty until `connect`.
    eps: Mutex<Vec<Arc<Endpoint>>>,
    /// Set from the asynchronous endpoint error callback.
    failed: Arc<AtomicBool>,
}

impl SingleConn {
    fn connected(&self) -> bool {
        !self.eps.lock().unwrap().is_empty()
    }

    fn ep(&self, worker_id: usize) -> Result<Arc<Endpoint>> {
        let eps = self.eps.lock().unwrap();
        if eps.is_empty() {
            return Err(FabrixError::not_found(
                self.remote_agent.clone(),
                "established connection",
            ));
        }
        Ok(Arc::clone(&eps[worker_id % eps.len()]))
    }
}

// ── Metadata ─────────────────────────────────────────────────────────

struct SingleMd {
    base: u64,
    len: usize,
    kind: MemKind,
    #[allow(dead_code)]
    dev_id: u32,
    region: Mutex<Option<Arc<MemRegion>>>,
    /// Shared worker this registration is tied to, advancing round-robin
    /// across registrations.
    worker_id: usize,
}

struct SinglePubMd {
    remote_base: u64,
    /// Worker index the packed key blob was prefixed with.
    #[allow(dead_code)]
    worker_id: usize,
    rkey: RemoteKey,
    conn: Arc<SingleConn>,
}

// ── Requests ─────────────────────────────────────────────────────────

/// Transfer-attached notification, sent by the completion that makes the
/// request terminal.
struct NotifPlan {
    ep: Arc<Endpoint>,
    header: Vec<u8>,
    msg: Vec<u8>,
}

struct ReqCore {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: Mutex<Option<FabrixError>>,
    notif: Mutex<Option<NotifPlan>>,
}

impl ReqCore {
    fn is_terminal(&self) -> bool {
        let total = self.total.load(Ordering::Acquire);
        total > 0 && self.completed.load(Ordering::Acquire) == total
    }
}

struct PreppedPair {
    local_md: Arc<SingleMd>,
    remote_md: Arc<SinglePubMd>,
    local_addr: u64,
    remote_addr: u64,
    len: usize,
}

struct SingleReq {
    op: XferOp,
    conn: Arc<SingleConn>,
    pairs: Vec<PreppedPair>,
    core: Arc<ReqCore>,
    subreqs: Mutex<Vec<Option<FabricReq>>>,
}

// ── Engine ───────────────────────────────────────────────────────────

struct EngineInner {
    agent: String,
    params: EngineParams,
    ctx: Arc<FabricContext>,
    workers: Vec<Arc<FabricWorker>>,
    shared_worker_index: AtomicUsize,
    conns: Mutex<HashMap<String, Arc<SingleConn>>>,
    notifs: Mutex<Vec<(String, Vec<u8>)>>,
    telemetry: TelemetryQueue,
    #[cfg(feature = "cuda")]
    cuda: crate::gpu::CudaCtx,
}

impl EngineInner {
    fn connection(&self, agent: &str) -> Result<Arc<SingleConn>> {
        self.conns
            .lock()
            .unwrap()
            .get(agent)
            .cloned()
            .ok_or_else(|| FabrixError::not_found(agent, "connection"))
    }

    /// Next shared worker, round-robin.
    fn next_worker_id(&self) -> usize {
        self.shared_worker_index.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Build one endpoint per local worker against round-robin remote
    /// worker addresses.
    fn establish(&self, conn: &Arc<SingleConn>) -> Result<()> {
        let mut eps = conn.eps.lock().unwrap();
        if !eps.is_empty() {
            return Ok(());
        }
        conn.failed.store(false, Ordering::Release);
        let mut built = Vec::with_capacity(self.workers.len());
        for (i, worker) in self.workers.iter().enumerate() {
            let remote = &conn.remote_addrs[i % conn.remote_addrs.len()];
            let failed = Arc::clone(&conn.failed);
            let agent = conn.remote_agent.clone();
            let ep = worker.connect(
                remote,
                self.params.err_handling_mode,
                Some(Box::new(move || {
                    failed.store(true, Ordering::Release);
                    tracing::warn!(%agent, "endpoint failed, connection marked down");
                })),
            )?;
            built.push(Arc::new(ep));
        }
        *eps = built;
        tracing::debug!(agent = %conn.remote_agent, workers = self.workers.len(), "connected");
        Ok(())
    }

    fn check_conn_live(&self, conn: &SingleConn) -> Result<()> {
        if conn.failed.load(Ordering::Acquire) {
            return Err(FabrixError::remote_disconnect(conn.remote_agent.clone()));
        }
        Ok(())
    }

    /// Bounded inline progress across all shared workers.
    fn progress_all(&self) -> usize {
        #[cfg(feature = "cuda")]
        self.cuda.apply();
        self.workers.iter().map(|w| w.progress()).sum()
    }

    fn drive_progress(&self) {
        if self.params.progress_mode == ProgressMode::Inline {
            self.progress_all();
        }
    }
}

/// Single-transport engine; see the module docs.
pub struct SingleFabricEngine {
    inner: Arc<EngineInner>,
    threads: Mutex<Vec<ProgressThread>>,
}

impl SingleFabricEngine {
    pub fn new(params: EngineParams) -> Result<Self> {
        if params.num_workers == 0 {
            return Err(FabrixError::invalid_param("num_workers must be at least 1"));
        }

        let ctx = FabricContext::new();
        let workers: Vec<Arc<FabricWorker>> =
            (0..params.num_workers).map(|_| ctx.create_worker()).collect();

        let inner = Arc::new(EngineInner {
            agent: params.agent_name.clone(),
            telemetry: TelemetryQueue::new(params.telemetry),
            params,
            ctx,
            workers,
            shared_worker_index: AtomicUsize::new(0),
            conns: Mutex::new(HashMap::new()),
            notifs: Mutex::new(Vec::new()),
            #[cfg(feature = "cuda")]
            cuda: crate::gpu::CudaCtx::new(),
        });

        // Notification active messages land on any worker and append to
        // the engine's list.
        for worker in &inner.workers {
            let weak = Arc::downgrade(&inner);
            worker.set_am_handler(Box::new(move |am_id, header, body| {
                if am_id != AM_NOTIF {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    let agent = String::from_utf8_lossy(header).into_owned();
                    inner.notifs.lock().unwrap().push((agent, body.to_vec()));
                }
            }));
        }

        let threads = match inner.params.progress_mode {
            ProgressMode::Inline => Vec::new(),
            ProgressMode::Thread => {
                let tick_inner = Arc::clone(&inner);
                vec![ProgressThread::spawn(
                    "fabrix-shared-progress",
                    Some(inner.params.progress_delay),
                    move || tick_inner.progress_all() > 0,
                )]
            }
            ProgressMode::Pool => inner
                .workers
                .iter()
                .enumerate()
                .map(|(i, worker)| {
                    let worker = Arc::clone(worker);
                    #[cfg(feature = "cuda")]
                    let cuda_inner = Arc::clone(&inner);
                    ProgressThread::spawn(
                        &format!("fabrix-worker-{i}"),
                        Some(inner.params.progress_delay),
                        move || {
                            #[cfg(feature = "cuda")]
                            cuda_inner.cuda.apply();
                            worker.progress() > 0
                        },
                    )
                })
                .collect(),
        };

        let engine = Self {
            inner,
            threads: Mutex::new(threads),
        };

        // Self-connection so local transfers and loadLocalMD work without a
        // runtime round-trip.
        let own_info = engine.conn_info()?;
        engine.load_remote_conn_info(&engine.inner.agent.clone(), &own_info)?;
        let self_conn = engine.inner.connection(&engine.inner.agent)?;
        engine.inner.establish(&self_conn)?;

        Ok(engine)
    }

    /// Pause or resume one worker's progress. Fault-injection hook.
    pub fn set_worker_paused(&self, worker: usize, paused: bool) {
        self.inner.workers[worker].set_paused(paused);
    }
}

impl Drop for SingleFabricEngine {
    fn drop(&mut self) {
        for thread in self.threads.lock().unwrap().iter_mut() {
            thread.stop();
        }
    }
}

// ── BackendEngine ────────────────────────────────────────────────────

impl BackendEngine for SingleFabricEngine {
    fn local_agent(&self) -> &str {
        &self.inner.agent
    }

    fn supported_mems(&self) -> Vec<MemKind> {
        let mut mems = vec![MemKind::Dram];
        if cfg!(feature = "cuda") {
            mems.push(MemKind::Vram);
        }
        mems
    }

    fn conn_info(&self) -> Result<Vec<u8>> {
        let addrs: Vec<Vec<u8>> = self.inner.workers.iter().map(|w| w.address()).collect();
        let mut w = BlobWriter::new();
        write_blob_list(&mut w, "w", &addrs);
        Ok(w.finish())
    }

    fn load_remote_conn_info(&self, agent: &str, blob: &[u8]) -> Result<()> {
        if blob.is_empty() {
            return Err(FabrixError::invalid_param("empty connection info"));
        }
        let mut r = BlobReader::new(blob);
        // The peer's worker count need not match ours.
        let remote_addrs = read_blob_list(&mut r, "w", None)?;
        if remote_addrs.is_empty() {
            return Err(FabrixError::mismatch("connection info has no workers"));
        }

        let mut conns = self.inner.conns.lock().unwrap();
        if conns.contains_key(agent) {
            return Err(FabrixError::invalid_param(format!(
                "connection info for agent {agent} already loaded"
            )));
        }
        conns.insert(
            agent.to_string(),
            Arc::new(SingleConn {
                remote_agent: agent.to_string(),
                remote_addrs,
                eps: Mutex::new(Vec::new()),
                failed: Arc::new(AtomicBool::new(false)),
            }),
        );
        Ok(())
    }

    fn connect(&self, agent: &str) -> Result<()> {
        let conn = self.inner.connection(agent)?;
        if conn.failed.load(Ordering::Acquire) {
            // Fresh handshake after failure.
            conn.eps.lock().unwrap().clear();
        }
        self.inner.establish(&conn)
    }

    fn disconnect(&self, agent: &str) -> Result<()> {
        let conn = self.inner.connection(agent)?;
        for ep in conn.eps.lock().unwrap().drain(..) {
            if let Err(e) = ep.disconnect_nb() {
                tracing::warn!(%agent, "endpoint close failed: {e}");
            }
        }
        self.inner.conns.lock().unwrap().remove(agent);
        Ok(())
    }

    fn register_mem(&self, desc: &MemDesc) -> Result<MemHandle> {
        if desc.length == 0 {
            return Err(FabrixError::invalid_param("zero-length registration"));
        }
        match desc.mem_kind {
            MemKind::Dram => {}
            MemKind::Vram => {
                #[cfg(feature = "cuda")]
                {
                    self.inner.cuda.update(desc.dev_id)?;
                    self.inner.cuda.apply();
                    if !self.inner.cuda.is_device_ptr(desc.virt_addr) {
                        tracing::warn!(
                            addr = %format_args!("{:#x}", desc.virt_addr),
                            "VRAM registration resolves to host memory; GPU plugin or \
                             configuration may be missing, proceeding best-effort"
                        );
                    }
                }
                #[cfg(not(feature = "cuda"))]
                {
                    return Err(FabrixError::not_supported(
                        "VRAM registration on a CPU-only build",
                    ));
                }
            }
            other => {
                return Err(FabrixError::not_supported(format!(
                    "memory kind {other} on the single-transport engine"
                )))
            }
        }

        let region = self.inner.ctx.register(
            desc.virt_addr,
            desc.length,
            desc.mem_kind,
            MemAccess::rdma_default(),
        )?;
        self.inner
            .telemetry
            .record("register_mem_bytes", desc.length as u64);
        Ok(MemHandle::new(Arc::new(SingleMd {
            base: desc.virt_addr,
            len: desc.length,
            kind: desc.mem_kind,
            dev_id: desc.dev_id,
            region: Mutex::new(Some(Arc::new(region))),
            worker_id: self.inner.next_worker_id(),
        })))
    }

    fn deregister_mem(&self, mem: MemHandle) -> Result<()> {
        let md = mem.downcast::<SingleMd>()?;
        if let Some(region) = md.region.lock().unwrap().take() {
            region.deregister();
        }
        tracing::debug!(kind = %md.kind, len = md.len, "memory deregistered");
        Ok(())
    }

    fn public_data(&self, mem: &MemHandle) -> Result<Vec<u8>> {
        let md = mem.downcast::<SingleMd>()?;
        let region = md.region.lock().unwrap();
        let region = region
            .as_ref()
            .ok_or_else(|| FabrixError::invalid_param("memory already deregistered"))?;
        let mut w = BlobWriter::new();
        w.add_u32("w", md.worker_id as u32);
        w.add_u64("addr", md.base);
        w.add("key", &region.pack_key());
        Ok(w.finish())
    }

    fn load_remote_md(&self, agent: &str, blob: &[u8]) -> Result<RemoteMemHandle> {
        let conn = self.inner.connection(agent)?;
        let mut r = BlobReader::new(blob);
        let worker_id = r.expect_u32("w")? as usize;
        let remote_base = r.expect_u64("addr")?;
        let rkey = RemoteKey::unpack(r.expect("key")?)?;
        Ok(RemoteMemHandle::new(Arc::new(SinglePubMd {
            remote_base,
            worker_id,
            rkey,
            conn,
        })))
    }

    fn load_local_md(&self, mem: &MemHandle) -> Result<RemoteMemHandle> {
        let blob = self.public_data(mem)?;
        self.load_remote_md(&self.inner.agent.clone(), &blob)
    }

    fn unload_md(&self, md: RemoteMemHandle) -> Result<()> {
        md.downcast::<SinglePubMd>().map(|_| ())
    }

    fn prep_xfer(
        &self,
        op: XferOp,
        local: &[LocalDesc],
        remote: &[RemoteDesc],
        agent: &str,
        _opts: &XferOpts,
    ) -> Result<ReqHandle> {
        if local.is_empty() || local.len() != remote.len() {
            return Err(FabrixError::invalid_param(format!(
                "descriptor count mismatch: {} local vs {} remote",
                local.len(),
                remote.len()
            )));
        }
        let conn = self.inner.connection(agent)?;

        let mut pairs = Vec::with_capacity(local.len());
        for (l, r) in local.iter().zip(remote) {
            if l.len == 0 {
                return Err(FabrixError::invalid_param("zero-length descriptor"));
            }
            if l.len != r.len {
                return Err(FabrixError::invalid_param(
                    "local/remote descriptor lengths differ",
                ));
            }
            let local_md = l.mem.downcast::<SingleMd>()?;
            let remote_md = r.mem.downcast::<SinglePubMd>()?;
            if !Arc::ptr_eq(&remote_md.conn, &conn) {
                return Err(FabrixError::mismatch(
                    "remote metadata belongs to a different connection",
                ));
            }
            let local_end = l.addr.saturating_add(l.len as u64);
            if l.addr < local_md.base || local_end > local_md.base + local_md.len as u64 {
                return Err(FabrixError::invalid_param(
                    "local descriptor outside its registration",
                ));
            }
            pairs.push(PreppedPair {
                local_md,
                remote_md,
                local_addr: l.addr,
                remote_addr: r.addr,
                len: l.len,
            });
        }

        Ok(ReqHandle::new(Arc::new(SingleReq {
            op,
            conn,
            pairs,
            core: Arc::new(ReqCore {
                total: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                failed: Mutex::new(None),
                notif: Mutex::new(None),
            }),
            subreqs: Mutex::new(Vec::new()),
        })))
    }

    fn post_xfer(&self, req: &ReqHandle, opts: &XferOpts) -> Result<XferStatus> {
        let req = req.downcast::<SingleReq>()?;
        let inner = &self.inner;

        inner.check_conn_live(&req.conn)?;
        if !req.conn.connected() {
            inner.establish(&req.conn)?;
        }

        {
            let total = req.core.total.load(Ordering::Acquire);
            if total != 0 && req.core.completed.load(Ordering::Acquire) < total {
                return Err(FabrixError::invalid_param(
                    "request re-posted before previous post completed",
                ));
            }
        }
        req.core.total.store(req.pairs.len(), Ordering::Release);
        req.core.completed.store(0, Ordering::Release);
        *req.core.failed.lock().unwrap() = None;
        req.subreqs.lock().unwrap().clear();

        // The attached notification is never piggybacked onto the data; the
        // terminal completion sends it.
        if let Some(msg) = &opts.notif {
            let notif_ep = req.conn.ep(inner.next_worker_id())?;
            *req.core.notif.lock().unwrap() = Some(NotifPlan {
                ep: notif_ep,
                header: inner.agent.clone().into_bytes(),
                msg: msg.clone(),
            });
        }

        let pool_dispatch = inner.params.progress_mode == ProgressMode::Pool;
        let dispatch_base = inner.next_worker_id();
        let mut subreqs = Vec::with_capacity(req.pairs.len());
        let mut total_bytes = 0usize;

        for (i, pair) in req.pairs.iter().enumerate() {
            // Pool mode splits the batch across dedicated workers
            // round-robin; otherwise each descriptor rides the worker its
            // registration is tied to.
            let worker_id = if pool_dispatch {
                (dispatch_base + i) % inner.workers.len()
            } else {
                pair.local_md.worker_id
            };
            let ep = req.conn.ep(worker_id)?;
            let local_region = pair.local_md.region.lock().unwrap().clone().ok_or_else(|| {
                FabrixError::invalid_param("local memory already deregistered")
            })?;

            let core = Arc::clone(&req.core);
            let cb: CompletionFn = Box::new(move |result: Result<()>| {
                if let Err(e) = result {
                    let mut failed = core.failed.lock().unwrap();
                    if failed.is_none() {
                        *failed = Some(e);
                    }
                }
                let done = core.completed.fetch_add(1, Ordering::AcqRel) + 1;
                if done == core.total.load(Ordering::Acquire) {
                    let notif = core.notif.lock().unwrap().take();
                    if let Some(plan) = notif {
                        if core.failed.lock().unwrap().is_none() {
                            if let Err(e) = plan.ep.am_send(AM_NOTIF, &plan.header, &plan.msg) {
                                tracing::warn!("post-completion notification failed: {e}");
                            }
                        }
                    }
                }
            });

            let posted = match req.op {
                XferOp::Write => ep.rma_write(
                    &local_region,
                    pair.local_addr,
                    pair.len,
                    pair.remote_addr,
                    pair.remote_md.rkey,
                    None,
                    cb,
                ),
                XferOp::Read => ep.rma_read(
                    &local_region,
                    pair.local_addr,
                    pair.len,
                    pair.remote_addr,
                    pair.remote_md.rkey,
                    cb,
                ),
            }?;

            subreqs.push(match posted {
                Posted::Pending(freq) => Some(freq),
                Posted::Complete => None,
            });
            total_bytes += pair.len;
        }

        *req.subreqs.lock().unwrap() = subreqs;
        inner.telemetry.record("post_xfer_bytes", total_bytes as u64);
        inner.drive_progress();

        if req.core.is_terminal() {
            if let Some(e) = req.core.failed.lock().unwrap().as_ref() {
                return Err(e.duplicate());
            }
            return Ok(XferStatus::Complete);
        }
        Ok(XferStatus::InProgress)
    }

    fn check_xfer(&self, req: &ReqHandle) -> Result<XferStatus> {
        let req = req.downcast::<SingleReq>()?;
        self.inner.drive_progress();
        if !req.core.is_terminal() {
            return Ok(XferStatus::InProgress);
        }
        if let Some(e) = req.core.failed.lock().unwrap().as_ref() {
            return Err(e.duplicate());
        }
        Ok(XferStatus::Complete)
    }

    fn release_req(&self, req: &ReqHandle) -> Result<()> {
        let req = req.downcast::<SingleReq>()?;
        for sub in req.subreqs.lock().unwrap().iter().flatten() {
            sub.cancel();
        }
        Ok(())
    }

    fn gen_notif(&self, agent: &str, msg: &[u8]) -> Result<XferStatus> {
        let conn = self.inner.connection(agent)?;
        self.inner.check_conn_live(&conn)?;
        if !conn.connected() {
            self.inner.establish(&conn)?;
        }
        let ep = conn.ep(self.inner.next_worker_id())?;
        ep.am_send(AM_NOTIF, self.inner.agent.as_bytes(), msg)?;
        Ok(XferStatus::Complete)
    }

    fn take_notifs(&self) -> Result<NotifMap> {
        self.inner.drive_progress();
        let drained = std::mem::take(&mut *self.inner.notifs.lock().unwrap());
        let mut map: NotifMap = HashMap::new();
        for (agent, msg) in drained {
            map.entry(agent).or_default().push(msg);
        }
        Ok(map)
    }

    fn estimate_cost(
        &self,
        _op: XferOp,
        local: &[LocalDesc],
        remote: &[RemoteDesc],
        _agent: &str,
    ) -> Result<CostEstimate> {
        if local.len() != remote.len() {
            return Err(FabrixError::invalid_param(
                "descriptor count mismatch in cost estimate",
            ));
        }
        let bytes: usize = local.iter().map(|d| d.len).sum();
        let (duration, err_margin) = self.inner.ctx.estimate(bytes);
        Ok(CostEstimate {
            duration,
            err_margin,
            method: CostMethod::Analytical,
        })
    }

    fn take_telemetry_events(&self) -> Vec<crate::telemetry::TelemetryEvent> {
        self.inner.telemetry.drain()
    }
}
