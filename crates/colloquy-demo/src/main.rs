//! Runs an echo conversation twice: once over the local loopback and once
//! through a remote client whose transport delivers every message twice.
//!
//! `COLLOQUY_IDLE_TIMEOUT_MS` sets the idle timeout, `RUST_LOG` the log
//! filter (default `info`).

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use colloquy::ClientMessenger;
use colloquy::CollectionConfig;
use colloquy::ConversationClient;
use colloquy::ConversationCollection;
use colloquy::LocalServer;
use colloquy::ResponseTransport;
use colloquy::Service;
use colloquy::ServiceError;
use colloquy::ServiceMessenger;
use colloquy::mock_transport::DuplicatingSink;

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

struct Echo;

#[async_trait::async_trait]
impl Service for Echo {
    async fn run(&mut self, mut messenger: ServiceMessenger) -> Result<(), ServiceError> {
        loop {
            let value: String = messenger.receive().await?;
            messenger.send(value).await?;
        }
    }
}

fn idle_timeout_millis() -> anyhow::Result<u64> {
    match std::env::var("COLLOQUY_IDLE_TIMEOUT_MS") {
        Ok(value) => value
            .parse()
            .with_context(|| format!("COLLOQUY_IDLE_TIMEOUT_MS is not a number: {}", value)),
        Err(_) => Ok(DEFAULT_IDLE_TIMEOUT_MS),
    }
}

async fn chat(label: &str, messenger: &ClientMessenger) -> anyhow::Result<()> {
    for word in ["One", "Two", "Three"] {
        messenger.send(word.to_string()).await?;
        let reply: String = messenger.receive().await?;
        info!(conversation = %messenger.id(), label, sent = word, %reply, "echoed");
    }
    messenger.terminate().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CollectionConfig::from_idle_timeout_millis(idle_timeout_millis()?);
    let collection = ConversationCollection::new(config)?;
    collection.add_service_type("echo", || Echo);

    let local = collection.start_conversation("echo")?;
    chat("loopback", &local).await?;

    let responses = ResponseTransport::new();
    let server = LocalServer::new(collection.clone(), Arc::new(DuplicatingSink::new(responses.clone())));
    let client = ConversationClient::new(
        Arc::new(server),
        Arc::new(DuplicatingSink::new(collection.incoming_transport())),
        responses,
    );
    let remote = client.start_conversation("echo").await?;
    chat("remote", &remote).await?;

    collection.shutdown().await;
    info!(live = collection.conversation_count(), "done");
    Ok(())
}
