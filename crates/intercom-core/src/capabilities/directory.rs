//! Postgres extension directory
//!
//! Queries run against a lazily connected pool so the service can still
//! start (from the local snapshot) when the database is down; each failed
//! query surfaces as `DirectoryUnavailable` and the caller decides whether
//! a fallback applies. Change notifications arrive over LISTEN/NOTIFY as
//! JSON `{action, data}` payloads.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::capabilities::{DirectoryChange, DirectoryEntry, DirectoryStore, DirectoryWatcher, Extension};
use crate::config::DirectoryConfig;
use crate::error::{EngineError, Result};

pub struct PgDirectoryStore {
    pool: PgPool,
}

impl PgDirectoryStore {
    /// Build a lazily connected store; no I/O happens here.
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(&config.database_url)
            .map_err(|e| EngineError::Config(format!("directory url: {e}")))?;
        Ok(Self { pool })
    }
}

fn port_from(row_value: i32, column: &str) -> Result<u16> {
    u16::try_from(row_value)
        .map_err(|_| EngineError::DirectoryUnavailable(format!("{column} {row_value} out of range")))
}

#[async_trait]
impl DirectoryStore for PgDirectoryStore {
    async fn active_extensions(&self) -> Result<Vec<Extension>> {
        let rows = sqlx::query(
            "SELECT id, ia_number, return_number, bind_ip, ia_port, return_port, building_id \
             FROM ramais WHERE active = true ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::DirectoryUnavailable(format!("active_extensions: {e}")))?;

        let mut extensions = Vec::with_capacity(rows.len());
        for row in rows {
            extensions.push(Extension {
                id: row.get::<i64, _>("id"),
                ia_number: row.get::<String, _>("ia_number"),
                return_number: row.get::<String, _>("return_number"),
                bind_ip: row.get::<String, _>("bind_ip"),
                ia_port: port_from(row.get::<i32, _>("ia_port"), "ia_port")?,
                return_port: port_from(row.get::<i32, _>("return_port"), "return_port")?,
                building_id: row.get::<Option<i64>, _>("building_id"),
            });
        }
        debug!(count = extensions.len(), "active extensions loaded");
        Ok(extensions)
    }

    async fn find_apartment(
        &self,
        building_id: Option<i64>,
        apartment: &str,
    ) -> Result<Option<DirectoryEntry>> {
        let row = match building_id {
            Some(building) => {
                sqlx::query(
                    "SELECT apartment, residents, voip_number FROM directory_entries \
                     WHERE building_id = $1 AND apartment = $2",
                )
                .bind(building)
                .bind(apartment)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT apartment, residents, voip_number FROM directory_entries \
                     WHERE apartment = $1",
                )
                .bind(apartment)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| EngineError::DirectoryUnavailable(format!("find_apartment: {e}")))?;

        Ok(row.map(|row| DirectoryEntry {
            apartment: row.get::<String, _>("apartment"),
            residents: row.get::<Vec<String>, _>("residents"),
            voip_number: row.get::<String, _>("voip_number"),
        }))
    }
}

/// LISTEN/NOTIFY watcher over the configured channel.
pub struct PgDirectoryWatcher {
    listener: PgListener,
}

impl PgDirectoryWatcher {
    pub async fn connect(config: &DirectoryConfig) -> Result<Self> {
        let mut listener = PgListener::connect(&config.database_url)
            .await
            .map_err(|e| EngineError::DirectoryUnavailable(format!("listener connect: {e}")))?;
        listener
            .listen(&config.notify_channel)
            .await
            .map_err(|e| EngineError::DirectoryUnavailable(format!("listen: {e}")))?;
        info!(channel = %config.notify_channel, "directory watcher listening");
        Ok(Self { listener })
    }
}

#[async_trait]
impl DirectoryWatcher for PgDirectoryWatcher {
    async fn next_change(&mut self) -> Result<DirectoryChange> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|e| EngineError::DirectoryUnavailable(format!("notify recv: {e}")))?;
        let change: DirectoryChange = serde_json::from_str(notification.payload())?;
        debug!(action = ?change.action, extension = change.data.id, "directory change received");
        Ok(change)
    }
}
