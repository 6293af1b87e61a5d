use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Log filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "PAGESIFT_LOG";

pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new("info"))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
