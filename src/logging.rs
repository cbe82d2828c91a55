//! Logging setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber.
///
/// The level is taken from `RUST_LOG` (for example `RUST_LOG=debug` or
/// `RUST_LOG=vegetable_service_rs=trace`) and defaults to `info`.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init();

    if result.is_ok() {
        tracing::info!("Logging initialized");
    }
}
