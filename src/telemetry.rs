use tracing_subscriber::EnvFilter;

/// Guard returned by [`init`]. Held for the lifetime of the process.
pub struct Telemetry;

/// Initialize tracing output to stderr.
///
/// Filtering follows `FLEETD_LOG` (falling back to `RUST_LOG`), defaulting
/// to `info`. Safe to call more than once; later calls are no-ops.
pub fn init() -> Telemetry {
    let filter = EnvFilter::try_from_env("FLEETD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    Telemetry
}
