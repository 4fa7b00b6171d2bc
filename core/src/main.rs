/// hotelchat development backend - main entry point
use hotelchat_core::dev_server::DevServer;
use hotelchat_core::DevServerConfig;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = DevServerConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let server = DevServer::bind(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Bind error: {}", e))?;
    info!("Starting hotelchat development backend");
    info!("   Base URL: {}", server.base_url()?);
    info!("   Ping interval: {:?}", config.ping_interval);

    tokio::select! {
        result = server.run() => {
            result.map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }

    Ok(())
}
