use crate::error::{Result, TlfsError};
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level;
/// `verbose` forces debug output.
pub fn init(level: &str, verbose: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| TlfsError::config(format!("log_level '{}': {}", level, e)))?,
    };

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TlfsError::Generic(anyhow::anyhow!("logger already set: {}", e)))?;

    Ok(())
}
