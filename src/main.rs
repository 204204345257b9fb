#![deny(clippy::all)]

mod archive;
mod assembler;
mod capture;
mod config;
mod engine;
mod lifecycle;
mod message;
mod provider;
mod store;
mod sync;

use crate::config::Config;
use crate::engine::{ConversationEngine, EngineEvent};
use crate::provider::HttpTokenIssuer;
use crate::store::QueryFilter;
use crate::sync::HttpPersistence;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging
    tracing_subscriber::fmt::init();

    // Endpoint overrides come from .env in development
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    if config.endpoints.token_url.is_empty() {
        anyhow::bail!("No token endpoint configured (set COLLOQUY_TOKEN_URL)");
    }
    if config.endpoints.persistence_url.is_empty() {
        anyhow::bail!("No persistence endpoint configured (set COLLOQUY_PERSISTENCE_URL)");
    }

    let session_id = format!("session_{}", Utc::now().timestamp_millis());
    let token_issuer = Arc::new(HttpTokenIssuer::new(config.endpoints.token_url.clone()));
    let persistence = Arc::new(HttpPersistence::new(
        config.endpoints.persistence_url.clone(),
    ));

    let engine = ConversationEngine::new(config, token_issuer, persistence, session_id);

    // Log finalized messages as the conversation builds up
    let mut events = engine.subscribe();
    let observer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::MessageFinalized { id }) => {
                    info!("Message finalized: {}", id);
                }
                Ok(EngineEvent::ChannelClosed(channel)) => {
                    info!("Channel closed: {}", channel);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event observer lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("Connecting microphone channel");
    if let Err(e) = engine.connect_microphone().await {
        error!("Microphone connect failed: {}", e);
    }

    info!("Running; press Ctrl-C to end the session");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    let report = engine.shutdown().await;
    if report.failed {
        warn!(
            "Final save failed; {} messages were not persisted remotely",
            report.attempted
        );
    }

    // Local archive is written regardless of remote save outcome
    let transcript = engine.transcript(QueryFilter::default());
    if !transcript.is_empty() {
        match archive::save_transcript(&transcript) {
            Ok(path) => info!("Transcript archived at {:?}", path),
            Err(e) => error!("Failed to archive transcript: {}", e),
        }
    }

    let stats = engine.stats();
    info!(
        "Session {} ended: {} messages ({} local, {} remote), {} unsaved",
        engine.session_id(),
        stats.total,
        stats.local_messages,
        stats.remote_messages,
        stats.unsaved
    );

    observer.abort();
    Ok(())
}
