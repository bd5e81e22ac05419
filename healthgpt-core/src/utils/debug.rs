use std::sync::atomic::Ordering;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::DEBUG;

/// Install the global subscriber. `HEALTHGPT_DEBUG=1` lowers the default level to debug,
/// `RUST_LOG` still takes precedence.
pub fn setup_logger_and_debug() {
    let is_debug = std::env::var("HEALTHGPT_DEBUG")
        .unwrap_or_default()
        .contains('1');
    DEBUG.store(is_debug, Ordering::Relaxed);

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    // A second call (tests, embedding applications) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
