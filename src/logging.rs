use anyhow::Context;
use tracing::Level;
use tracing_subscriber::{prelude::*, Registry};

/// stdout 日志，INFO 及以上；rocket 自己的 `log` 输出也会被接到这里
pub fn configure_logging() -> anyhow::Result<()> {
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .map_writer(|x| x.with_max_level(Level::INFO));

    Registry::default()
        .with(stdout_log)
        .try_init()
        .context("failed to install tracing subscriber")
}
