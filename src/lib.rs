pub mod models;
pub mod modules;
pub mod proxy;

use std::path::PathBuf;

use tracing::{error, info};

pub use modules::logging;

/// `--config <path>` from the command line, if given
fn config_path_arg(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

async fn serve(config: models::GatewayConfig) -> anyhow::Result<()> {
    let settings = proxy::SharedSettings::new(config.clone());
    let state = proxy::build_state(settings)?;
    let (server, handle) = proxy::AxumServer::start(&config, state)
        .await
        .map_err(anyhow::Error::msg)?;

    info!("Gateway is running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.ok();
    server.stop().await;
    handle.await.ok();
    info!("Gateway shut down");
    Ok(())
}

/// Headless entry point: load config, init logging, serve until Ctrl+C.
pub fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = modules::load_config(config_path_arg(&args).as_deref())?;
    let _guard = logging::init_tracing(&config.logging);

    info!(
        "Starting Antigravity Gateway v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.server.host,
        config.server.port
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config)).inspect_err(|e| error!("Gateway failed: {:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_arg() {
        let args: Vec<String> = ["gw", "--config", "/etc/gw.toml"].iter().map(|s| s.to_string()).collect();
        assert_eq!(config_path_arg(&args), Some(PathBuf::from("/etc/gw.toml")));

        let args: Vec<String> = ["gw", "--config"].iter().map(|s| s.to_string()).collect();
        assert_eq!(config_path_arg(&args), None);
    }
}
