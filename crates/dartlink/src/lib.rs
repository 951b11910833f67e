mod config;
mod mcp_stdio;
mod static_tools;

pub use config::BridgeConfig;

use tracing_subscriber::EnvFilter;

pub async fn run() -> anyhow::Result<()> {
    // stdout carries the MCP channel, so all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::from_env();
    mcp_stdio::serve(config).await
}
