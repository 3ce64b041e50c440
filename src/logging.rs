//! Console logging setup.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SpvError};

/// Initialize console logging.
///
/// An explicit level takes precedence; otherwise `RUST_LOG` applies, falling
/// back to INFO.
pub fn init_console_logging(level: Option<LevelFilter>) -> Result<()> {
    let env_filter = match level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .try_init()
        .map_err(|e| SpvError::General(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}
