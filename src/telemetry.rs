//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries and tests opt into a
//! subscriber here. The filter honors `RUST_LOG` and defaults to
//! `loomrail=info`.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the default subscriber; harmless to call twice.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loomrail=info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(ErrorLayer::default())
        .try_init();
}
