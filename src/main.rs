use anyhow::Result;
use dotenvy::dotenv;
use tokio::net::TcpListener;

use threatwatch::{api, config::EngineConfig, metrics, security};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load and validate configuration
    let config = EngineConfig::from_env()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    if config.reputation.api_key.is_some() {
        tracing::info!("IP reputation provider enabled");
    } else {
        tracing::warn!("No ABUSEIPDB_API_KEY set - reputation signal disabled");
    }

    // Wire up the threat engine
    let engine = security::build_engine(config);

    let app = api::create_router(engine).merge(metrics::create_metrics_router());

    // Start server
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("🛡️ ThreatWatch engine listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
