//! Tracing setup for the command line

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use particle_sim_core::config::LogLevel;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` overrides `level`. Events go to stderr and, without ANSI
/// colors, to `log_path`.
pub fn init_logging(level: LogLevel, log_path: &Path) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let file = File::create(log_path)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
