//! outdial-server: the campaign engine process.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use outdial_engine::config::EngineConfig;
use outdial_engine::engine::OutdialEngine;
use outdial_engine::server::{self, SecretTokenVerifier};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let verifier = Arc::new(SecretTokenVerifier::from_env()?);

    let engine = OutdialEngine::new(config).await?;
    engine.start().await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
        });
    }

    server::serve(engine.clone(), verifier, shutdown).await?;
    engine.stop();
    Ok(())
}
