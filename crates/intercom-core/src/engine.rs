//! Engine composition
//!
//! Wires the registry, resource manager, dialog engine, extension manager
//! and management API together around a set of capability providers, and
//! owns startup and cooperative shutdown.

use std::sync::Arc;

use tracing::{info, warn};

use porteiro_intercom_media::PhraseCache;

use crate::api::{self, ApiState};
use crate::capabilities::{
    ClickToCallPublisher, DirectoryStore, DirectoryWatcher, IntentExtractor, Synthesizer,
    Transcriber,
};
use crate::config::AppConfig;
use crate::dialog::DialogEngine;
use crate::error::Result;
use crate::extensions::ExtensionManager;
use crate::leg::LegDeps;
use crate::registry::SessionRegistry;
use crate::resources::ResourceManager;

/// The capability providers the engine runs against.
pub struct Capabilities {
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub extractor: Arc<dyn IntentExtractor>,
    pub publisher: Arc<dyn ClickToCallPublisher>,
    pub store: Arc<dyn DirectoryStore>,
}

pub struct Engine {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub resources: Arc<ResourceManager>,
    pub dialog: Arc<DialogEngine>,
    pub manager: Arc<ExtensionManager>,
    pub cache: PhraseCache,
    synthesizer: Arc<dyn Synthesizer>,
}

impl Engine {
    pub fn new(config: AppConfig, capabilities: Capabilities) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new());
        let resources = ResourceManager::new(
            config.audio.transmission_delay(),
            config.resources.max_concurrent_transcriptions,
            config.resources.max_concurrent_synthesis,
        );
        let cache = PhraseCache::new(&config.resources.cache_dir);

        let dialog = DialogEngine::new(
            Arc::clone(&registry),
            capabilities.extractor,
            Arc::clone(&capabilities.store),
            capabilities.publisher,
            Arc::clone(&config),
        );

        let deps = LegDeps {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            resources: Arc::clone(&resources),
            dialog: Arc::clone(&dialog),
            transcriber: capabilities.transcriber,
            synthesizer: Arc::clone(&capabilities.synthesizer),
            cache: cache.clone(),
        };
        let manager = ExtensionManager::new(deps, capabilities.store);

        Arc::new(Self {
            config,
            registry,
            resources,
            dialog,
            manager,
            cache,
            synthesizer: capabilities.synthesizer,
        })
    }

    /// Start listeners, the load sampler, the cache pre-warm and the
    /// management API. Returns once the listener set is up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.resources.spawn_sampler(Arc::clone(&self.registry));
        self.spawn_prewarm();
        self.manager.start().await?;

        let state = Arc::new(ApiState {
            registry: Arc::clone(&self.registry),
            resources: Arc::clone(&self.resources),
            manager: Arc::clone(&self.manager),
        });
        let listen_addr = self.config.management.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(error) = api::serve(state, &listen_addr).await {
                warn!(%error, "management API stopped");
            }
        });

        info!("engine started");
        Ok(())
    }

    /// Attach a directory watcher; its loop runs until the process exits.
    pub fn spawn_watcher(self: &Arc<Self>, watcher: Box<dyn DirectoryWatcher>) {
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            manager.watch(watcher).await;
        });
    }

    /// Stop accepting new connections and latch every live session.
    /// Leg handlers drain farewells and complete on their own.
    pub fn shutdown(&self) {
        self.manager.stop_all();
        for snapshot in self.registry.list() {
            self.registry.end(&snapshot.call_id);
        }
        info!("engine shutdown signalled");
    }

    /// Synthesize the configured common phrases into the cache so first
    /// conversations skip the synthesis round-trip.
    fn spawn_prewarm(self: &Arc<Self>) {
        let phrases = self.config.speech.prewarm_phrases.clone();
        if phrases.is_empty() {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let voice = engine.config.speech.voice.clone();
            for phrase in phrases {
                if engine.cache.contains(&voice, &phrase).await {
                    continue;
                }
                let _permit = engine.resources.acquire_synthesis().await;
                match engine.synthesizer.synthesize(&phrase, &voice).await {
                    Ok(pcm) => {
                        if let Err(error) = engine.cache.put(&voice, &phrase, &pcm).await {
                            warn!(%error, "pre-warm cache write failed");
                        }
                    }
                    Err(error) => warn!(%error, phrase, "pre-warm synthesis failed"),
                }
            }
            info!("phrase cache pre-warm complete");
        });
    }
}
