//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] installs the global fmt subscriber (compact or JSON)
//! - [`marker`] emits execution-marker events on the [`MARKER_TARGET`] target;
//!   any tracing layer filtering on that target acts as the marker sink
//! - [`test_utils::capture_logs`] captures events in tests

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

/// Tracing target used for execution markers.
pub const MARKER_TARGET: &str = "crossline::marker";

/// Outcome recorded by an execution marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerOutcome {
    /// Operation started (long-running operations only).
    Started,
    /// Operation completed successfully.
    Succeeded,
    /// Operation was rejected or failed.
    Failed,
    /// Operation was cancelled.
    Cancelled,
}

impl MarkerOutcome {
    /// Lowercase name used as the `outcome` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Emit an execution marker.
///
/// `operation` names the externally visible operation (`setControlMode`,
/// `lockFlowDirection`, ...); `target` is the cross, task or subscriber the
/// operation acted on.
pub fn marker(operation: &str, target: &str, outcome: MarkerOutcome) {
    tracing::info!(
        target: "crossline::marker",
        operation,
        target_id = target,
        outcome = outcome.as_str(),
        "execution marker"
    );
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// Call once at startup; later calls are no-ops. `RUST_LOG` overrides
/// `level` when set.
pub fn init_subscriber(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json();
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact();
        let _ = subscriber.try_init();
    }
}
