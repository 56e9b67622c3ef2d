//! The backend engine contract.
//!
//! Every backend maps the same surface onto a specific transport: register
//! memory, exchange opaque descriptors, post one-sided reads/writes over
//! scatter/gather lists, receive completion notifications. The upper-layer
//! runtime composes backends exclusively through [`BackendEngine`] trait
//! objects and the opaque handles defined here.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FabrixError, Result};
use crate::types::{AgentName, CostEstimate, MemDesc, MemKind, XferOp, XferStatus};

/// Opaque handle to a local memory registration (the backend's private
/// metadata). Lifetime ends with `deregister_mem`.
#[derive(Clone)]
pub struct MemHandle(Arc<dyn Any + Send + Sync>);

/// Opaque handle to loaded peer metadata (the backend's public metadata).
/// Lifetime ends with `unload_md`.
#[derive(Clone)]
pub struct RemoteMemHandle(Arc<dyn Any + Send + Sync>);

/// Opaque handle to a prepared transfer request.
///
/// May be re-posted once every previously posted sub-request has completed;
/// must be passed to `release_req` exactly once, including after an
/// inline-completed post.
#[derive(Clone)]
pub struct ReqHandle(Arc<dyn Any + Send + Sync>);

macro_rules! opaque_handle {
    ($name:ident, $what:literal) => {
        impl $name {
            pub(crate) fn new<T: Any + Send + Sync>(inner: Arc<T>) -> Self {
                Self(inner)
            }

            /// Downcast to the owning engine's concrete type. A handle from
            /// a different backend fails with `Mismatch`.
            pub(crate) fn downcast<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
                self.0
                    .clone()
                    .downcast::<T>()
                    .map_err(|_| FabrixError::mismatch(concat!("foreign ", $what, " handle")))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }
    };
}

opaque_handle!(MemHandle, "memory");
opaque_handle!(RemoteMemHandle, "remote-memory");
opaque_handle!(ReqHandle, "request");

/// One local element of a scatter/gather list.
#[derive(Debug, Clone)]
pub struct LocalDesc {
    pub addr: u64,
    pub len: usize,
    pub mem: MemHandle,
}

/// One remote element of a scatter/gather list.
#[derive(Debug, Clone)]
pub struct RemoteDesc {
    pub addr: u64,
    pub len: usize,
    pub mem: RemoteMemHandle,
}

/// Per-post options.
#[derive(Debug, Clone, Default)]
pub struct XferOpts {
    /// User message delivered to the peer once every RDMA operation of the
    /// post has been observed at the receiver.
    pub notif: Option<Vec<u8>>,
}

impl XferOpts {
    pub fn with_notif(msg: impl Into<Vec<u8>>) -> Self {
        Self {
            notif: Some(msg.into()),
        }
    }
}

/// Drained notifications, keyed by the sending agent.
pub type NotifMap = HashMap<AgentName, Vec<Vec<u8>>>;

/// Uniform contract implemented by every backend engine.
///
/// Thread safety: engines accept concurrent `prep_xfer` / `post_xfer` /
/// `check_xfer` / `release_req` / `gen_notif` / `take_notifs` calls, with
/// the caller guaranteeing that a given [`ReqHandle`] is not posted from two
/// threads at once and that registered memory stays live-pinned while used.
pub trait BackendEngine: Send + Sync {
    /// Name of the local agent this engine belongs to.
    fn local_agent(&self) -> &str;

    /// Memory kinds this backend can register.
    fn supported_mems(&self) -> Vec<MemKind>;

    fn supports_remote(&self) -> bool {
        true
    }

    fn supports_local(&self) -> bool {
        true
    }

    fn supports_notifs(&self) -> bool {
        true
    }

    /// Serialized local endpoint table for the host runtime to publish.
    fn conn_info(&self) -> Result<Vec<u8>>;

    /// Record a peer's endpoint table. Fails with `InvalidParam` when the
    /// agent was already loaded.
    fn load_remote_conn_info(&self, agent: &str, blob: &[u8]) -> Result<()>;

    /// Establish the connection to `agent`, blocking until it is usable or
    /// has failed.
    fn connect(&self, agent: &str) -> Result<()>;

    /// Tear the connection down and erase its record.
    fn disconnect(&self, agent: &str) -> Result<()>;

    fn register_mem(&self, desc: &MemDesc) -> Result<MemHandle>;

    /// Idempotent; releases every transport-side handle even when individual
    /// releases fail.
    fn deregister_mem(&self, mem: MemHandle) -> Result<()>;

    /// Packable blob a peer feeds to `load_remote_md`.
    fn public_data(&self, mem: &MemHandle) -> Result<Vec<u8>>;

    fn load_remote_md(&self, agent: &str, blob: &[u8]) -> Result<RemoteMemHandle>;

    /// Derive peer-side metadata for a local registration through the
    /// self-connection, skipping the serialized round-trip.
    fn load_local_md(&self, mem: &MemHandle) -> Result<RemoteMemHandle>;

    fn unload_md(&self, md: RemoteMemHandle) -> Result<()>;

    /// Validate descriptor lists and build a reusable request handle.
    fn prep_xfer(
        &self,
        op: XferOp,
        local: &[LocalDesc],
        remote: &[RemoteDesc],
        agent: &str,
        opts: &XferOpts,
    ) -> Result<ReqHandle>;

    /// Issue the work. May complete inline for tiny transfers.
    fn post_xfer(&self, req: &ReqHandle, opts: &XferOpts) -> Result<XferStatus>;

    /// Poll a posted request, advancing progress on the caller's thread when
    /// no progress thread is running.
    fn check_xfer(&self, req: &ReqHandle) -> Result<XferStatus>;

    /// Non-blocking release. Aborts outstanding sub-requests; accepts any
    /// request state.
    fn release_req(&self, req: &ReqHandle) -> Result<()>;

    /// Standalone agent-to-agent message; unordered with respect to data.
    fn gen_notif(&self, agent: &str, msg: &[u8]) -> Result<XferStatus>;

    /// Drain pending notifications. Never suspends.
    fn take_notifs(&self) -> Result<NotifMap>;

    /// Estimated transfer cost from the transport's performance model.
    fn estimate_cost(
        &self,
        _op: XferOp,
        _local: &[LocalDesc],
        _remote: &[RemoteDesc],
        _agent: &str,
    ) -> Result<CostEstimate> {
        Err(FabrixError::not_supported("cost estimation"))
    }

    /// Drain queued telemetry events. Empty unless telemetry is enabled.
    fn take_telemetry_events(&self) -> Vec<crate::telemetry::TelemetryEvent> {
        Vec::new()
    }
}
