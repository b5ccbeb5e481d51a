//! Tracing initialisation.
//!
//! Structured logs go through `tracing` with per-subsystem targets; the
//! subscriber is configured once per process. Metric counters are emitted
//! through the `opentelemetry` global meter at the call sites; wiring an
//! exporter (or none) is the host's choice, since metric sinks live outside
//! the engine.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Safe to call more than once; only
/// the first call wins (tests initialise it from several entry points).
pub fn init_telemetry(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        info!(target: "telemetry", service = service_name, "Telemetry initialised");
    }
}
