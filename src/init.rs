//! Tracing setup (ambient stack). Grounded in the teacher's
//! `src/init.rs::init_tracing`: an `EnvFilter` built from a configured
//! default level (overridable by `RUST_LOG`), with a json-or-text `fmt`
//! layer, installed once and idempotently.

use tracing_subscriber::EnvFilter;

pub fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    // `try_init` errors only when a global subscriber is already set (e.g.
    // repeated calls in tests); that's not a real failure here.
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already initialized: {e}");
    }
}
