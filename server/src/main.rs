use anyhow::{anyhow, Result};
use bildlager_server::Config;
use std::env;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    let config_path = env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: bildlager-server <config.json5>"))?;
    let config: Config = json5::from_str(&fs_err::read_to_string(config_path)?)?;
    bildlager_server::run(config).await
}
