use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use crate::util::env::env_flag;

/// Installs the global fmt subscriber. `RUST_LOG` wins over `default_filter`;
/// `LOG_ANSI=0` disables colours for log shippers.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_ansi(env_flag("LOG_ANSI", true))
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
