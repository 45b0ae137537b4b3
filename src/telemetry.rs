//! Tracing initialization for the CLI.

use tracing_subscriber::EnvFilter;

/// Guard returned by init; keep it alive for the process lifetime.
pub struct Telemetry;

/// Install the global tracing subscriber. Filter via `BOOMTOWN_LOG`
/// (default: warnings only); diagnostics go to stderr so command output
/// stays parseable.
pub fn init() -> Telemetry {
    let filter = EnvFilter::try_from_env("BOOMTOWN_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    Telemetry
}
