//! Tracing setup for the `scout` binary.
//!
//! Reads `RUST_LOG` when set. Otherwise logs `scout=info` (or `scout=debug`
//! with `--verbose`) plus warnings from dependencies. Output goes to stderr so
//! command output on stdout stays clean.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init(verbose: bool, json: bool) {
    let default = if verbose {
        "warn,scout=debug,tower_http=debug"
    } else {
        "warn,scout=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
    };
    // Already installed (tests, embedding); keep the existing subscriber.
    let _ = result;
}
