//! fabrix: a pluggable data-movement substrate for large GPU- and
//! CPU-resident memory regions exchanged between cooperating agents.
//!
//! One backend-agnostic contract (register memory, exchange descriptors,
//! post one-sided reads/writes over scatter/gather lists, receive
//! completion notifications) with two reference engines behind it:
//!
//! - [`SingleFabricEngine`]: one transport context driven by N progress
//!   workers, notification active messages, and worker-indexed memory keys.
//! - [`MultiRailEngine`]: bulk transfers striped across parallel data
//!   rails with topology-aware rail selection, a dedicated control plane
//!   for connections and notifications, and completion tracking keyed by
//!   transfer IDs so a notification never outruns its data.
//!
//! The in-process shared-segment provider in [`fabric`] backs both engines
//! and the test suite; hardware transports plug in behind the same
//! primitives.

pub mod backend;
pub mod config;
pub mod error;
pub mod fabric;
#[cfg(feature = "cuda")]
pub mod gpu;
pub mod multirail;
mod progress;
pub mod serdes;
pub mod single;
pub mod telemetry;
pub mod topology;
pub mod types;

pub use backend::{
    BackendEngine, LocalDesc, MemHandle, NotifMap, RemoteDesc, RemoteMemHandle, ReqHandle,
    XferOpts,
};
pub use config::{EngineParams, ErrHandlingMode, ProgressMode};
pub use error::{FabrixError, Result};
pub use multirail::MultiRailEngine;
pub use single::SingleFabricEngine;
pub use topology::Topology;
pub use types::{
    CostEstimate, CostMethod, MemAccess, MemDesc, MemKind, XferOp, XferStatus,
};
