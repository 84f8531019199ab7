use clap::Parser;
use porthole::{ApplicationConfig, entrypoint};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let config = ApplicationConfig::parse();
    let default_directive = if config.debug { "porthole=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();
    entrypoint(config).await
}
