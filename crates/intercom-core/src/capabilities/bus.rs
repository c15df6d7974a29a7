//! Click-to-call bus publisher
//!
//! NATS-backed implementation of [`ClickToCallPublisher`]. The bus is a
//! hard dependency: connect failures abort startup and publish failures
//! surface as `BusFatal`, which terminates the session that requested the
//! call. There is intentionally no silent fallback.

use async_trait::async_trait;
use tracing::info;

use crate::capabilities::{ClickToCallPublisher, ClickToCallRequest};
use crate::config::BusConfig;
use crate::error::{EngineError, Result};

pub struct NatsClickToCallPublisher {
    client: async_nats::Client,
    subject: String,
}

impl NatsClickToCallPublisher {
    /// Connect to the broker. Failing here fails service startup.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| EngineError::BusFatal(format!("connect {}: {e}", config.url)))?;
        info!(url = %config.url, subject = %config.subject, "click-to-call bus connected");
        Ok(Self {
            client,
            subject: config.subject.clone(),
        })
    }
}

#[async_trait]
impl ClickToCallPublisher for NatsClickToCallPublisher {
    async fn publish(&self, request: &ClickToCallRequest) -> Result<()> {
        let payload = request.payload(chrono::Utc::now());
        let bytes = serde_json::to_vec(&payload)?;
        self.client
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| EngineError::BusFatal(format!("publish: {e}")))?;
        self.client
            .flush()
            .await
            .map_err(|e| EngineError::BusFatal(format!("flush: {e}")))?;
        info!(guid = %request.guid, origin = %request.origin, "click-to-call published");
        Ok(())
    }
}
