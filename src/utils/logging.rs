use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call more than once (tests do);
/// later calls are ignored.
pub fn init() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,nazr_recognition=info".to_string());
    let fmt = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter)).with_ansi(false);
    let _ = fmt.try_init();
}
