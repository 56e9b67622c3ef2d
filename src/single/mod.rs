//! Single-transport engine.
//!
//! One fabric context, N progress workers, one endpoint per worker per
//! remote agent, context-wide memory registration with worker-indexed
//! packed keys, and a lightweight active-message channel for notifications.

mod engine;

pub use engine::SingleFabricEngine;

/// Active-message id of the notification channel.
pub(crate) const AM_NOTIF: u64 = 1;
