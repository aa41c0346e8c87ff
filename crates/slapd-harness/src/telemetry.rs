use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "SLAPD_HARNESS_LOG";

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Route `log` and `tracing` output to stderr.
///
/// Directives come from `SLAPD_HARNESS_LOG`, then `RUST_LOG`, then "info".
/// Stdout is left alone so binaries can print URIs and secrets there.
/// Repeated calls are no-ops.
pub fn init() {
    init_with("info");
}

/// Like [`init`] with a different fallback directive.
pub fn init_with(default_directive: &str) {
    let _ = LogTracer::init();

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter(default_directive))
        .with(fmt_layer)
        .try_init();
}
