use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Sends diagnostics to stderr; stdout carries only the event stream.
///
/// The returned guard flushes buffered lines when dropped, so keep it alive
/// until the process exits.
pub fn init_logging() -> Result<WorkerGuard, Box<dyn std::error::Error + Send + Sync>> {
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let env_filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_new(&env_filter_str)
        .map_err(|e| format!("Failed to parse RUST_LOG value '{}': {}", env_filter_str, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::debug!("Log level configured via RUST_LOG='{}'", env_filter_str);

    Ok(guard)
}
