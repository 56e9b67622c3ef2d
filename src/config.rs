//! Backend init parameters.
//!
//! All values have defaults. Override by constructing [`EngineParams`]
//! directly or via environment variables (prefixed `FABRIX_`).

use std::time::Duration;

/// Default striping threshold: 1 MiB.
pub const DEFAULT_STRIPING_THRESHOLD: usize = 1024 * 1024;

/// Default number of data rails when topology discovery finds no fabric NICs.
pub const DEFAULT_DATA_RAILS: usize = 4;

/// Default number of control rails.
pub const DEFAULT_CONTROL_RAILS: usize = 1;

/// How progress is driven for the single-transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Progress only runs during user calls.
    Inline,
    /// One thread services all shared workers.
    Thread,
    /// A small pool of threads, each owning a worker; batches are split
    /// across dedicated workers round-robin.
    Pool,
}

/// Endpoint error-handling mode, matching the transport's `none|peer` knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrHandlingMode {
    None,
    Peer,
}

impl ErrHandlingMode {
    pub fn parse(s: &str) -> Result<Self, crate::error::FabrixError> {
        match s {
            "none" => Ok(Self::None),
            "peer" => Ok(Self::Peer),
            other => Err(crate::error::FabrixError::invalid_param(format!(
                "invalid error handling mode: {other}. Valid values are: <none|peer>"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Peer => "peer",
        }
    }
}

/// Init parameters shared by both reference engines.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Name of the local agent. Must be process-unique across the fabric.
    pub agent_name: String,

    /// Number of progress workers for the single-transport engine.
    pub num_workers: usize,

    /// Descriptors larger than this are striped across all selected rails;
    /// smaller ones go whole onto one rail round-robin.
    pub striping_threshold: usize,

    /// Data rail count used when no fabric NICs are discovered.
    pub num_data_rails: usize,

    /// Control rail count.
    pub num_control_rails: usize,

    /// Endpoint error-handling mode for the single-transport engine.
    pub err_handling_mode: ErrHandlingMode,

    /// Progress mode for the single-transport engine.
    pub progress_mode: ProgressMode,

    /// Whether the multi-rail engine runs a dedicated data-rail progress
    /// thread. When false, data-rail progress is driven by `post_xfer`,
    /// `check_xfer`, and `take_notifs`.
    pub progress_thread: bool,

    /// Sleep between idle progress-thread iterations.
    pub progress_delay: Duration,

    /// Queue telemetry events for the host runtime to drain.
    pub telemetry: bool,

    /// Directory the host runtime writes telemetry files into. Recorded
    /// only; the engines never touch the filesystem.
    pub telemetry_dir: Option<String>,
}

impl EngineParams {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            num_workers: 1,
            striping_threshold: DEFAULT_STRIPING_THRESHOLD,
            num_data_rails: DEFAULT_DATA_RAILS,
            num_control_rails: DEFAULT_CONTROL_RAILS,
            err_handling_mode: ErrHandlingMode::Peer,
            progress_mode: ProgressMode::Inline,
            progress_thread: true,
            progress_delay: Duration::from_micros(100),
            telemetry: false,
            telemetry_dir: None,
        }
    }

    /// Apply environment overrides, falling back to the current values.
    ///
    /// Recognized variables:
    /// - `FABRIX_NUM_WORKERS`
    /// - `FABRIX_STRIPING_THRESHOLD`
    /// - `FABRIX_NUM_DATA_RAILS`
    /// - `FABRIX_NUM_CONTROL_RAILS`
    /// - `FABRIX_ERR_HANDLING_MODE`
    /// - `FABRIX_PROGRESS_DELAY_US`
    /// - `FABRIX_TELEMETRY`
    /// - `FABRIX_TELEMETRY_DIR`
    pub fn from_env(agent_name: impl Into<String>) -> Self {
        let mut p = Self::new(agent_name);

        if let Ok(v) = std::env::var("FABRIX_NUM_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                if n >= 1 {
                    p.num_workers = n;
                }
            }
        }
        if let Ok(v) = std::env::var("FABRIX_STRIPING_THRESHOLD") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    p.striping_threshold = n;
                } else {
                    tracing::warn!(
                        "invalid FABRIX_STRIPING_THRESHOLD '{v}', using default {}",
                        p.striping_threshold
                    );
                }
            }
        }
        if let Ok(v) = std::env::var("FABRIX_NUM_DATA_RAILS") {
            if let Ok(n) = v.parse::<usize>() {
                if n >= 1 {
                    p.num_data_rails = n;
                }
            }
        }
        if let Ok(v) = std::env::var("FABRIX_NUM_CONTROL_RAILS") {
            if let Ok(n) = v.parse::<usize>() {
                if n >= 1 {
                    p.num_control_rails = n;
                }
            }
        }
        if let Ok(v) = std::env::var("FABRIX_ERR_HANDLING_MODE") {
            match ErrHandlingMode::parse(&v) {
                Ok(mode) => p.err_handling_mode = mode,
                Err(e) => tracing::warn!("{e}"),
            }
        }
        if let Ok(v) = std::env::var("FABRIX_PROGRESS_DELAY_US") {
            if let Ok(us) = v.parse::<u64>() {
                p.progress_delay = Duration::from_micros(us);
            }
        }
        if std::env::var("FABRIX_TELEMETRY").is_ok_and(|v| v != "0") {
            p.telemetry = true;
        }
        if let Ok(dir) = std::env::var("FABRIX_TELEMETRY_DIR") {
            p.telemetry_dir = Some(dir);
        }

        p
    }

    /// Whether the CUDA base-address workaround is active.
    ///
    /// Enabled unless `FABRIX_DISABLE_CUDA_ADDR_WA` is set; with the
    /// workaround disabled, registrations on a second device are accepted.
    pub fn cuda_addr_workaround() -> bool {
        std::env::var("FABRIX_DISABLE_CUDA_ADDR_WA").is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = EngineParams::new("a1");
        assert_eq!(p.agent_name, "a1");
        assert_eq!(p.num_workers, 1);
        assert_eq!(p.striping_threshold, DEFAULT_STRIPING_THRESHOLD);
        assert_eq!(p.num_control_rails, 1);
        assert_eq!(p.err_handling_mode, ErrHandlingMode::Peer);
    }

    #[test]
    fn test_err_mode_parse() {
        assert_eq!(ErrHandlingMode::parse("none").unwrap(), ErrHandlingMode::None);
        assert_eq!(ErrHandlingMode::parse("peer").unwrap(), ErrHandlingMode::Peer);
        assert!(ErrHandlingMode::parse("retry").is_err());
    }

    #[test]
    fn test_err_mode_roundtrip() {
        for mode in [ErrHandlingMode::None, ErrHandlingMode::Peer] {
            assert_eq!(ErrHandlingMode::parse(mode.as_str()).unwrap(), mode);
        }
    }
}
