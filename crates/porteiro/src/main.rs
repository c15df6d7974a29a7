//! Service entry point: configuration, providers, engine lifecycle.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use porteiro_intercom_core::capabilities::bus::NatsClickToCallPublisher;
use porteiro_intercom_core::capabilities::directory::{PgDirectoryStore, PgDirectoryWatcher};
use porteiro_intercom_core::capabilities::intent::HttpIntentExtractor;
use porteiro_intercom_core::capabilities::speech::{HttpSynthesizer, HttpTranscriber};
use porteiro_intercom_core::{AppConfig, Capabilities, Engine};

#[derive(Parser, Debug)]
#[command(name = "porteiro", about = "Voice intercom automation service", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config/porteiro.json")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            warn!(path = %args.config, %error, "configuration not loaded, using defaults");
            AppConfig::default()
        }
    };

    let transcriber = Arc::new(HttpTranscriber::new(&config.speech)?);
    let synthesizer = Arc::new(HttpSynthesizer::new(&config.speech)?);
    let extractor = Arc::new(HttpIntentExtractor::new(&config.intent)?);
    // The bus is a hard dependency: refuse to start without it.
    let publisher = Arc::new(
        NatsClickToCallPublisher::connect(&config.bus)
            .await
            .context("click-to-call bus is required")?,
    );
    let store = Arc::new(PgDirectoryStore::new(&config.directory)?);
    let directory_config = config.directory.clone();

    let engine = Engine::new(
        config,
        Capabilities {
            transcriber,
            synthesizer,
            extractor,
            publisher,
            store,
        },
    );
    engine.start().await?;

    // The watcher connects in the background with backoff so a database
    // outage delays notifications without delaying startup.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut backoff = std::time::Duration::from_secs(1);
            loop {
                match PgDirectoryWatcher::connect(&directory_config).await {
                    Ok(watcher) => {
                        engine.spawn_watcher(Box::new(watcher));
                        break;
                    }
                    Err(error) => {
                        warn!(%error, "directory watcher connect failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(std::time::Duration::from_secs(60));
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    engine.shutdown();
    // Give leg handlers a moment to deliver farewells and hang up.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    Ok(())
}
