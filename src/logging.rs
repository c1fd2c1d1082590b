use std::fs::OpenOptions;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEBUG_LOG_FILE: &str = "voisemail_debug.log";
const DEFAULT_FILTER: &str = "voisemail=info";

/// With `debug`, everything at debug level is appended to the debug log file.
/// Otherwise logs go to stderr, filtered by `RUST_LOG`.
pub fn init(debug: bool) -> anyhow::Result<()> {
    if debug {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(DEBUG_LOG_FILE)?;

        tracing_subscriber::registry()
            .with(EnvFilter::new("voisemail=debug,inspect_db=debug"))
            .with(
                fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}
