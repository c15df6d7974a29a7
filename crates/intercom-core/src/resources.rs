//! Resource manager
//!
//! Bounds concurrent transcription and synthesis with semaphores sized
//! from the hardware at startup, samples CPU load against the active
//! session count to drive adaptive audio pacing, and keeps the weak
//! connection registry used for targeted hangups from the management API.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use porteiro_audiosocket::{CallId, FrameSink};

use crate::registry::SessionRegistry;
use crate::session::CallRole;

/// Sessions above this count arm the throttle check.
const THROTTLE_SESSION_FLOOR: usize = 3;
/// CPU percentage above which pacing widens.
const THROTTLE_CPU_PERCENT: f32 = 85.0;
/// Pacing multiplier under throttle.
const THROTTLE_FACTOR: f64 = 1.5;
/// Load sampling cadence. Throttle is evaluated on samples, not frames.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Concurrency caps derived from cores and memory.
fn tier_slots(cores: usize, total_memory_bytes: u64) -> usize {
    const GIB: u64 = 1024 * 1024 * 1024;
    if cores >= 4 && total_memory_bytes >= 8 * GIB {
        4
    } else if cores >= 2 && total_memory_bytes >= 4 * GIB {
        2
    } else {
        1
    }
}

/// Writer handle registered per leg, held weakly so a departed handler
/// takes its connection with it.
struct ConnectionEntry {
    sink: Weak<tokio::sync::Mutex<FrameSink>>,
    port: u16,
    since: Instant,
}

/// Operation counters exposed by the status API.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub transcriptions: u64,
    pub syntheses: u64,
    pub cache_hits: u64,
}

#[derive(Default)]
struct Counters {
    transcriptions: AtomicU64,
    syntheses: AtomicU64,
    cache_hits: AtomicU64,
}

/// Per-connection status row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub call_id: CallId,
    pub role: CallRole,
    pub port: u16,
    pub connected_seconds: u64,
}

pub struct ResourceManager {
    transcription: Arc<Semaphore>,
    synthesis: Arc<Semaphore>,
    throttled: AtomicBool,
    connections: DashMap<(CallId, CallRole), ConnectionEntry>,
    counters: Counters,
    base_transmission_delay: Duration,
}

impl ResourceManager {
    /// Size the semaphores from hardware, unless overridden.
    pub fn new(
        base_transmission_delay: Duration,
        transcription_override: usize,
        synthesis_override: usize,
    ) -> Arc<Self> {
        let mut system = System::new();
        system.refresh_memory();
        let cores = num_cpus::get();
        let slots = tier_slots(cores, system.total_memory());

        let transcription_slots = if transcription_override > 0 {
            transcription_override
        } else {
            slots
        };
        let synthesis_slots = if synthesis_override > 0 {
            synthesis_override
        } else {
            slots
        };
        info!(
            cores,
            transcription_slots, synthesis_slots, "resource manager sized"
        );

        Arc::new(Self {
            transcription: Arc::new(Semaphore::new(transcription_slots)),
            synthesis: Arc::new(Semaphore::new(synthesis_slots)),
            throttled: AtomicBool::new(false),
            connections: DashMap::new(),
            counters: Counters::default(),
            base_transmission_delay,
        })
    }

    /// Spawn the periodic load sampler: throttle while more than three
    /// sessions are active and the CPU sits above 85 percent.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        registry: Arc<SessionRegistry>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut system = System::new();
            loop {
                tokio::time::sleep(SAMPLE_INTERVAL).await;
                system.refresh_cpu_usage();
                let cpu = system.global_cpu_usage();
                let sessions = registry.len();
                let throttle = sessions > THROTTLE_SESSION_FLOOR && cpu > THROTTLE_CPU_PERCENT;
                let was = manager.throttled.swap(throttle, Ordering::Relaxed);
                if throttle != was {
                    info!(cpu, sessions, throttle, "audio throttle state changed");
                }
            }
        })
    }

    /// Acquire a transcription slot; the permit releases on drop, on every
    /// exit path including cancellation.
    pub async fn acquire_transcription(&self) -> OwnedSemaphorePermit {
        let permit = Arc::clone(&self.transcription)
            .acquire_owned()
            .await
            .expect("transcription semaphore closed");
        self.counters.transcriptions.fetch_add(1, Ordering::Relaxed);
        permit
    }

    /// Acquire a synthesis slot. Cache hits skip this entirely.
    pub async fn acquire_synthesis(&self) -> OwnedSemaphorePermit {
        let permit = Arc::clone(&self.synthesis)
            .acquire_owned()
            .await
            .expect("synthesis semaphore closed");
        self.counters.syntheses.fetch_add(1, Ordering::Relaxed);
        permit
    }

    pub fn record_cache_hit(&self) {
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Current inter-frame pacing: the configured delay, widened by 1.5
    /// while the throttle is engaged.
    pub fn transmission_delay(&self) -> Duration {
        if self.throttled.load(Ordering::Relaxed) {
            self.base_transmission_delay.mul_f64(THROTTLE_FACTOR)
        } else {
            self.base_transmission_delay
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Track a leg's writer for targeted hangup and status.
    pub fn register_connection(
        &self,
        call_id: CallId,
        role: CallRole,
        sink: &Arc<tokio::sync::Mutex<FrameSink>>,
        port: u16,
    ) {
        self.connections.insert(
            (call_id, role),
            ConnectionEntry {
                sink: Arc::downgrade(sink),
                port,
                since: Instant::now(),
            },
        );
        debug!(%call_id, %role, port, "connection registered");
    }

    pub fn unregister_connection(&self, call_id: CallId, role: CallRole) {
        self.connections.remove(&(call_id, role));
        debug!(%call_id, %role, "connection unregistered");
    }

    /// Write a HANGUP frame on a specific leg, if its handler still holds
    /// the connection. Returns whether the connection was known.
    pub async fn hangup_connection(&self, call_id: CallId, role: CallRole) -> bool {
        let sink = match self.connections.get(&(call_id, role)) {
            Some(entry) => entry.sink.upgrade(),
            None => None,
        };
        match sink {
            Some(sink) => {
                let mut sink = sink.lock().await;
                if let Err(error) = sink.send_hangup().await {
                    warn!(%call_id, %role, %error, "targeted hangup write failed");
                }
                true
            }
            None => false,
        }
    }

    /// Connection rows for the status API.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| {
                let (call_id, role) = *entry.key();
                ConnectionInfo {
                    call_id,
                    role,
                    port: entry.port,
                    connected_seconds: entry.since.elapsed().as_secs(),
                }
            })
            .collect()
    }

    pub fn metrics(&self) -> ResourceMetrics {
        ResourceMetrics {
            transcriptions: self.counters.transcriptions.load(Ordering::Relaxed),
            syntheses: self.counters.syntheses.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_table_matches_hardware_classes() {
        const GIB: u64 = 1024 * 1024 * 1024;
        assert_eq!(tier_slots(8, 16 * GIB), 4);
        assert_eq!(tier_slots(4, 8 * GIB), 4);
        assert_eq!(tier_slots(2, 4 * GIB), 2);
        assert_eq!(tier_slots(4, 2 * GIB), 1);
        assert_eq!(tier_slots(1, 16 * GIB), 1);
    }

    #[tokio::test]
    async fn permits_release_on_drop() {
        let manager = ResourceManager::new(Duration::from_millis(10), 1, 1);
        let permit = manager.acquire_transcription().await;
        assert!(manager.transcription.try_acquire().is_err());
        drop(permit);
        assert!(manager.transcription.try_acquire().is_ok());
        assert_eq!(manager.metrics().transcriptions, 1);
    }

    #[tokio::test]
    async fn throttle_widens_pacing() {
        let manager = ResourceManager::new(Duration::from_millis(10), 1, 1);
        assert_eq!(manager.transmission_delay(), Duration::from_millis(10));
        manager.throttled.store(true, Ordering::Relaxed);
        assert!(manager.is_throttled());
        assert_eq!(manager.transmission_delay(), Duration::from_millis(15));
    }

    #[tokio::test]
    async fn hangup_on_unknown_connection_reports_missing() {
        let manager = ResourceManager::new(Duration::from_millis(10), 1, 1);
        let known = manager
            .hangup_connection(CallId::generate(), CallRole::Visitor)
            .await;
        assert!(!known);
    }
}
