//! Extension manager
//!
//! Owns the set of per-extension listener pairs (visitor port + resident
//! port) and keeps it in sync with the directory at runtime: startup load
//! with local-snapshot fallback, change notifications, and an on-demand
//! refresh that reconciles the running set against the store.
//!
//! Stopping a pair only stops its accept loops; leg handlers already
//! running on those ports hold their own tasks and run to completion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::capabilities::{ChangeAction, DirectoryChange, DirectoryStore, Extension};
use crate::error::{EngineError, Result};
use crate::leg::{self, LegDeps};
use crate::session::CallRole;

/// Listener backlog.
const LISTEN_BACKLOG: i32 = 100;

/// Socket receive buffer, sized for bursts of audio frames.
const RECV_BUFFER_BYTES: usize = 1024 * 1024;

/// How many ports to scan forward when the configured one is taken.
const PORT_SCAN_RANGE: u16 = 100;

/// Default pair used when neither the store nor the snapshot is available.
fn default_extension() -> Extension {
    Extension {
        id: 0,
        ia_number: "8080".to_string(),
        return_number: "8081".to_string(),
        bind_ip: "0.0.0.0".to_string(),
        ia_port: 8080,
        return_port: 8081,
        building_id: None,
    }
}

/// Counts returned by a refresh reconciliation.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct RefreshReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// One running listener pair.
struct RunningPair {
    extension: Extension,
    /// Ports actually bound, after any conflict scan.
    ia_port: u16,
    return_port: u16,
    shutdown: watch::Sender<bool>,
}

/// Status row for the management API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    pub extension: Extension,
    pub ia_port: u16,
    pub return_port: u16,
}

pub struct ExtensionManager {
    deps: LegDeps,
    store: Arc<dyn DirectoryStore>,
    snapshot_path: PathBuf,
    pairs: Mutex<HashMap<i64, RunningPair>>,
}

impl ExtensionManager {
    pub fn new(deps: LegDeps, store: Arc<dyn DirectoryStore>) -> Arc<Self> {
        let snapshot_path = PathBuf::from(&deps.config.directory.snapshot_path);
        Arc::new(Self {
            deps,
            store,
            snapshot_path,
            pairs: Mutex::new(HashMap::new()),
        })
    }

    /// Load the extension set and bind every pair, in parallel. Falls back
    /// to the local snapshot, then to the single default pair.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let extensions = match self.store.active_extensions().await {
            Ok(extensions) => {
                self.write_snapshot(&extensions).await;
                extensions
            }
            Err(error) => {
                warn!(%error, "directory unavailable at startup, trying snapshot");
                match self.read_snapshot().await {
                    Some(extensions) => extensions,
                    None => {
                        warn!("no snapshot available, starting the default pair");
                        vec![default_extension()]
                    }
                }
            }
        };

        let startups = extensions
            .into_iter()
            .map(|extension| {
                let manager = Arc::clone(self);
                async move {
                    let id = extension.id;
                    if let Err(error) = manager.start_pair(extension).await {
                        error!(extension = id, %error, "failed to start listener pair");
                    }
                }
            })
            .collect::<Vec<_>>();
        join_all(startups).await;

        info!(pairs = self.pairs.lock().len(), "extension manager started");
        Ok(())
    }

    /// Bind and run one listener pair.
    pub async fn start_pair(self: &Arc<Self>, extension: Extension) -> Result<()> {
        if self.pairs.lock().contains_key(&extension.id) {
            return Err(EngineError::Config(format!(
                "extension {} already running",
                extension.id
            )));
        }

        let (ia_listener, ia_port) = bind_listener(&extension.bind_ip, extension.ia_port).await?;
        let (return_listener, return_port) =
            bind_listener(&extension.bind_ip, extension.return_port).await?;
        if ia_port != extension.ia_port || return_port != extension.return_port {
            warn!(
                extension = extension.id,
                ia_port, return_port, "configured ports busy, substituted free ones"
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // The accepted legs see the ports that were actually bound.
        let mut bound = extension.clone();
        bound.ia_port = ia_port;
        bound.return_port = return_port;
        let bound = Arc::new(bound);

        tokio::spawn(accept_loop(
            self.deps.clone(),
            ia_listener,
            CallRole::Visitor,
            Arc::clone(&bound),
            shutdown_rx.clone(),
        ));
        tokio::spawn(accept_loop(
            self.deps.clone(),
            return_listener,
            CallRole::Resident,
            Arc::clone(&bound),
            shutdown_rx,
        ));

        info!(
            extension = extension.id,
            bind_ip = %extension.bind_ip,
            ia_port,
            return_port,
            "listener pair started"
        );
        self.pairs.lock().insert(
            extension.id,
            RunningPair {
                extension,
                ia_port,
                return_port,
                shutdown: shutdown_tx,
            },
        );
        Ok(())
    }

    /// Stop a pair's accept loops. Sessions in progress keep running.
    pub fn stop_pair(&self, extension_id: i64) -> bool {
        match self.pairs.lock().remove(&extension_id) {
            Some(pair) => {
                let _ = pair.shutdown.send(true);
                info!(extension = extension_id, "listener pair stopped");
                true
            }
            None => false,
        }
    }

    /// Apply one change notification and mirror the result to the
    /// snapshot.
    pub async fn apply_change(self: &Arc<Self>, change: DirectoryChange) {
        let id = change.data.id;
        match change.action {
            ChangeAction::Insert => {
                if let Err(error) = self.start_pair(change.data).await {
                    error!(extension = id, %error, "insert failed");
                }
            }
            ChangeAction::Update => {
                self.stop_pair(id);
                if let Err(error) = self.start_pair(change.data).await {
                    error!(extension = id, %error, "update restart failed");
                }
            }
            ChangeAction::Delete => {
                self.stop_pair(id);
            }
        }
        let current: Vec<Extension> = self
            .pairs
            .lock()
            .values()
            .map(|pair| pair.extension.clone())
            .collect();
        self.write_snapshot(&current).await;
    }

    /// Reconcile the running set against the store.
    pub async fn refresh(self: &Arc<Self>) -> Result<RefreshReport> {
        let desired = self.store.active_extensions().await?;
        let mut report = RefreshReport::default();

        let running: HashMap<i64, Extension> = self
            .pairs
            .lock()
            .iter()
            .map(|(id, pair)| (*id, pair.extension.clone()))
            .collect();

        let desired_ids: std::collections::HashSet<i64> =
            desired.iter().map(|e| e.id).collect();

        for (id, _) in running.iter() {
            if !desired_ids.contains(id) {
                self.stop_pair(*id);
                report.removed += 1;
            }
        }

        for extension in desired {
            match running.get(&extension.id) {
                None => {
                    if let Err(error) = self.start_pair(extension).await {
                        error!(%error, "refresh start failed");
                    } else {
                        report.added += 1;
                    }
                }
                Some(current) if *current != extension => {
                    self.stop_pair(extension.id);
                    if let Err(error) = self.start_pair(extension).await {
                        error!(%error, "refresh restart failed");
                    } else {
                        report.updated += 1;
                    }
                }
                Some(_) => {}
            }
        }

        let current: Vec<Extension> = self
            .pairs
            .lock()
            .values()
            .map(|pair| pair.extension.clone())
            .collect();
        self.write_snapshot(&current).await;

        info!(?report, "extension refresh complete");
        Ok(report)
    }

    /// Restart one pair, addressed by id or by its IA number.
    pub async fn restart(
        self: &Arc<Self>,
        extension_id: Option<i64>,
        ramal: Option<&str>,
    ) -> Result<()> {
        let target = {
            let pairs = self.pairs.lock();
            pairs
                .values()
                .find(|pair| {
                    extension_id.map(|id| pair.extension.id == id).unwrap_or(false)
                        || ramal
                            .map(|number| pair.extension.ia_number == number)
                            .unwrap_or(false)
                })
                .map(|pair| pair.extension.clone())
        };
        let extension =
            target.ok_or_else(|| EngineError::NotFound("unknown extension".to_string()))?;
        self.stop_pair(extension.id);
        self.start_pair(extension).await
    }

    /// Run the change-notification loop. Watcher failures pause
    /// notifications with backoff; listeners persist.
    pub async fn watch(
        self: Arc<Self>,
        mut watcher: Box<dyn crate::capabilities::DirectoryWatcher>,
    ) {
        let mut backoff = std::time::Duration::from_secs(1);
        loop {
            match watcher.next_change().await {
                Ok(change) => {
                    backoff = std::time::Duration::from_secs(1);
                    info!(action = ?change.action, extension = change.data.id, "applying directory change");
                    self.apply_change(change).await;
                }
                Err(error) => {
                    warn!(%error, "directory watcher failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(std::time::Duration::from_secs(60));
                }
            }
        }
    }

    /// Status rows for the management API.
    pub fn list(&self) -> Vec<ExtensionStatus> {
        self.pairs
            .lock()
            .values()
            .map(|pair| ExtensionStatus {
                extension: pair.extension.clone(),
                ia_port: pair.ia_port,
                return_port: pair.return_port,
            })
            .collect()
    }

    /// Stop every pair (shutdown path).
    pub fn stop_all(&self) {
        let ids: Vec<i64> = self.pairs.lock().keys().copied().collect();
        for id in ids {
            self.stop_pair(id);
        }
    }

    async fn write_snapshot(&self, extensions: &[Extension]) {
        if let Some(parent) = self.snapshot_path.parent() {
            if let Err(error) = tokio::fs::create_dir_all(parent).await {
                warn!(%error, "snapshot directory creation failed");
                return;
            }
        }
        match serde_json::to_vec_pretty(extensions) {
            Ok(body) => {
                if let Err(error) = tokio::fs::write(&self.snapshot_path, body).await {
                    warn!(%error, "snapshot write failed");
                }
            }
            Err(error) => warn!(%error, "snapshot serialization failed"),
        }
    }

    async fn read_snapshot(&self) -> Option<Vec<Extension>> {
        let raw = tokio::fs::read(&self.snapshot_path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(extensions) => {
                info!(path = %self.snapshot_path.display(), "extensions loaded from snapshot");
                Some(extensions)
            }
            Err(error) => {
                warn!(%error, "snapshot unreadable");
                None
            }
        }
    }
}

/// Bind a listener with a large receive buffer, scanning forward for a
/// free port when the configured one is taken.
async fn bind_listener(bind_ip: &str, port: u16) -> Result<(TcpListener, u16)> {
    let ip: std::net::IpAddr = bind_ip
        .parse()
        .map_err(|e| EngineError::Config(format!("bind ip {bind_ip}: {e}")))?;

    let mut last_error = None;
    for offset in 0..PORT_SCAN_RANGE {
        let candidate = match port.checked_add(offset) {
            Some(p) => p,
            None => break,
        };
        let addr = SocketAddr::new(ip, candidate);
        match bind_once(addr) {
            Ok(listener) => return Ok((listener, candidate)),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        EngineError::Config(format!("no bindable port near {bind_ip}:{port}"))
    }))
}

fn bind_once(addr: SocketAddr) -> Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_recv_buffer_size(RECV_BUFFER_BYTES)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener)?)
}

/// Accept loop whose lifetime equals the extension's.
async fn accept_loop(
    deps: LegDeps,
    listener: TcpListener,
    role: CallRole,
    extension: Arc<Extension>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(extension = extension.id, %role, "accept loop stopped");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(extension = extension.id, %role, %peer, "connection accepted");
                    let deps = deps.clone();
                    let extension = Arc::clone(&extension);
                    tokio::spawn(async move {
                        leg::run(deps, role, stream, extension).await;
                    });
                }
                Err(error) => {
                    warn!(extension = extension.id, %role, %error, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
}
