use anyhow::{Context, Result};
use colloquy::config::{parse_bool_flag, ServerConfig};
use colloquy::runtime::BackendRuntime;
use colloquy::server::serve;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let debug = std::env::var("COLLOQUY_DEBUG")
        .map(|value| parse_bool_flag(&value))
        .unwrap_or(false);
    let default_filter = if debug { "debug" } else { "info,colloquy=debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = ServerConfig::load();
    tracing::info!(
        "Starting colloquy worker {} (workers: {}, hub port: {})",
        std::process::id(),
        config.workers,
        config.hub_port
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async {
        let runtime = BackendRuntime::bootstrap(config)
            .await
            .context("failed to bootstrap backend runtime")?;
        serve(runtime).await
    })
}
