//! Tracing subscriber setup for SOOlink nodes.
//!
//! Level conventions:
//! - WARN: abandoned blocks, invalidated neighbours, ignored configuration
//! - INFO: node start and stop
//! - DEBUG: Winenet state changes, retries, handoffs
//! - TRACE: dropped or malformed frames, individual transmissions

use tracing_subscriber::EnvFilter;

/// Error returned when a global subscriber is already installed.
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a human-readable subscriber.
///
/// The level comes from `RUST_LOG` and defaults to `info`.
pub fn init() -> Result<(), InitError> {
    tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .try_init()
}

/// Install a JSON subscriber.
pub fn init_json() -> Result<(), InitError> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter("info"))
        .try_init()
}

/// Install the JSON subscriber when `SOOLINK_LOG_FORMAT=json`, the
/// human-readable one otherwise.
pub fn init_from_env() -> Result<(), InitError> {
    match std::env::var("SOOLINK_LOG_FORMAT") {
        Ok(format) if format.eq_ignore_ascii_case("json") => init_json(),
        _ => init(),
    }
}

/// Install a subscriber writing through the test harness.
///
/// Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}
