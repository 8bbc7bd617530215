//! provides logging helpers

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

/// Initiate the global tracing subscriber with the configured default level.
/// An unparseable level is a fatal startup error.
pub fn init(log_level: &str) -> anyhow::Result<()> {
    let level: LevelFilter = log_level
        .parse()
        .with_context(|| format!("error parsing log level {log_level}"))?;

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_filter(filter);

    registry().with(fmt_layer).init();
    Ok(())
}
