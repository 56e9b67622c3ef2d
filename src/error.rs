pub type Result<T> = std::result::Result<T, FabrixError>;

/// Closed error set shared by every backend engine.
///
/// `Success` and `InProgress` are not errors: fallible calls return
/// `Result<T>`, and calls that may still be running return
/// [`XferStatus`](crate::types::XferStatus) inside the `Ok` arm.
#[derive(Debug, thiserror::Error)]
pub enum FabrixError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("agent {agent} has no {what}")]
    NotFound { agent: String, what: &'static str },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("blob mismatch: {0}")]
    Mismatch(String),

    #[error("remote agent {agent} disconnected")]
    RemoteDisconnect { agent: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FabrixError {
    /// Create an `InvalidParam` error.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create a `NotFound` error for a missing per-agent resource.
    pub fn not_found(agent: impl Into<String>, what: &'static str) -> Self {
        Self::NotFound {
            agent: agent.into(),
            what,
        }
    }

    /// Create a `NotSupported` error.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create a `Mismatch` error (blob parse failure, width disagreement).
    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::Mismatch(msg.into())
    }

    /// Create a `RemoteDisconnect` error for the given agent.
    pub fn remote_disconnect(agent: impl Into<String>) -> Self {
        Self::RemoteDisconnect {
            agent: agent.into(),
        }
    }

    /// Create a `Backend` error with just a message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Backend` error with a message and a source error.
    pub fn backend_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Same-kind copy for terminal states reported from multiple polls.
    /// Source errors are not carried over.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidParam(m) => Self::InvalidParam(m.clone()),
            Self::NotFound { agent, what } => Self::NotFound {
                agent: agent.clone(),
                what,
            },
            Self::NotSupported(m) => Self::NotSupported(m.clone()),
            Self::Mismatch(m) => Self::Mismatch(m.clone()),
            Self::RemoteDisconnect { agent } => Self::RemoteDisconnect {
                agent: agent.clone(),
            },
            Self::Cancelled => Self::Cancelled,
            Self::Backend { message, .. } => Self::Backend {
                message: message.clone(),
                source: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = FabrixError::not_found("agent-b", "connection");
        assert_eq!(e.to_string(), "agent agent-b has no connection");
    }

    #[test]
    fn test_remote_disconnect_display() {
        let e = FabrixError::remote_disconnect("peer-3");
        assert_eq!(e.to_string(), "remote agent peer-3 disconnected");
    }

    #[test]
    fn test_backend_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let e = FabrixError::backend_with_source("endpoint flush", io);
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<FabrixError> = vec![
            FabrixError::invalid_param("zero-length descriptor"),
            FabrixError::not_found("a", "metadata"),
            FabrixError::not_supported("VRAM on a CPU-only build"),
            FabrixError::mismatch("bad tag"),
            FabrixError::remote_disconnect("a"),
            FabrixError::Cancelled,
            FabrixError::backend("cq overflow"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
