//! Telemetry helpers for structured logging and tracing.

/// Initialize tracing/telemetry. Callers can install their own subscriber; this
/// helper installs a default env-based subscriber if none is set.
///
/// Defaults to `info` for this crate when `RUST_LOG` is unset.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("instance_harvest=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
