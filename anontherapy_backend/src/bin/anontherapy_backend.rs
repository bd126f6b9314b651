use anontherapy_backend::config::ServiceConfig;
use anontherapy_backend::server::serve_backend;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,anontherapy_backend=debug")),
        )
        .init();

    let config = ServiceConfig::load();

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(config))
}
