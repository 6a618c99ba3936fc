//! Backend registry and stream-to-backend selection
//!
//! Backends register out-of-band; sessions ask for a backend by stream URL.
//! Selection must be sticky: every packet, request and reconnect for one
//! stream has to land on the same backend while the stream is live.
//!
//! The first pick for a stream uses rendezvous hashing: each candidate is
//! scored with CRC-32 over `stream_url` and the backend ip, and the highest
//! score wins. Adding or removing one backend only moves the streams that
//! scored highest on it. The winner is then pinned, so later
//! registrations do not move a stream that is already being served.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISO_HDLC};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::config::RegistryConfig;
use super::server::BackendServer;
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A stream's chosen backend
#[derive(Debug, Clone)]
struct Pin {
    ip: String,
    last_used: Instant,
}

/// Thread-safe table of backend servers keyed by ip
pub struct BackendRegistry {
    servers: RwLock<HashMap<String, Arc<BackendServer>>>,
    pins: DashMap<String, Pin>,
    config: RegistryConfig,
}

impl BackendRegistry {
    /// Create an empty registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create an empty registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            pins: DashMap::new(),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert or replace a backend, keyed by its ip
    ///
    /// The last registration for an ip wins, including its endpoint lists.
    pub async fn update(&self, mut server: BackendServer) {
        server.updated_at = Instant::now();
        self.store(server).await;
    }

    pub(crate) async fn store(&self, server: BackendServer) {
        let mut servers = self.servers.write().await;
        let replaced = servers.insert(server.ip.clone(), Arc::new(server.clone()));

        match replaced {
            Some(old) if old.id() == server.id() => {
                tracing::trace!(backend = %server, "Backend heartbeat");
            }
            Some(old) => {
                tracing::info!(backend = %server, previous = %old.id(), "Backend re-registered");
            }
            None => {
                tracing::info!(backend = %server, total = servers.len(), "Backend registered");
            }
        }
    }

    /// Pick the backend that serves `stream_url`
    ///
    /// Repeated calls for one stream return the same backend as long as it
    /// stays registered and alive. Fails with [`Error::BackendUnavailable`]
    /// when no backend is registered.
    pub async fn pick(&self, stream_url: &str) -> Result<Arc<BackendServer>> {
        let servers = self.servers.read().await;
        if servers.is_empty() {
            return Err(Error::BackendUnavailable(format!(
                "no backend available for {stream_url}"
            )));
        }

        let any_alive = servers.values().any(|s| self.is_alive(s));

        if let Some(mut pin) = self.pins.get_mut(stream_url) {
            if let Some(server) = servers.get(&pin.ip) {
                if self.is_alive(server) || !any_alive {
                    pin.last_used = Instant::now();
                    return Ok(Arc::clone(server));
                }
            }
        }

        // Prefer alive backends; with none alive, any registered one will do.
        let chosen = servers
            .values()
            .filter(|s| !any_alive || self.is_alive(s))
            .max_by(|a, b| {
                rendezvous_score(stream_url, &a.ip)
                    .cmp(&rendezvous_score(stream_url, &b.ip))
                    .then_with(|| a.ip.cmp(&b.ip))
            })
            .cloned()
            .ok_or_else(|| {
                Error::BackendUnavailable(format!("no backend available for {stream_url}"))
            })?;

        self.pins.insert(
            stream_url.to_string(),
            Pin {
                ip: chosen.ip.clone(),
                last_used: Instant::now(),
            },
        );

        tracing::debug!(stream = %stream_url, backend = %chosen, "Picked backend");
        Ok(chosen)
    }

    /// Look up a backend by ip
    pub async fn get(&self, ip: &str) -> Option<Arc<BackendServer>> {
        self.servers.read().await.get(ip).cloned()
    }

    /// Snapshot of all registered backends
    pub async fn servers(&self) -> Vec<Arc<BackendServer>> {
        self.servers.read().await.values().cloned().collect()
    }

    /// Number of registered backends
    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    /// True when no backend is registered
    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    /// Number of streams currently pinned to a backend
    pub fn pinned_streams(&self) -> usize {
        self.pins.len()
    }

    fn is_alive(&self, server: &BackendServer) -> bool {
        server.updated_at.elapsed() < self.config.alive_window
    }

    /// Run cleanup once
    ///
    /// Drops backends silent for longer than the eviction window and pins
    /// that are idle or point at a backend that is gone.
    pub async fn cleanup(&self) {
        let eviction = self.config.eviction_window();
        let mut servers = self.servers.write().await;

        servers.retain(|_, server| {
            let keep = server.updated_at.elapsed() < eviction;
            if !keep {
                tracing::info!(backend = %server, "Backend evicted after missing heartbeats");
            }
            keep
        });

        let pin_ttl = self.config.pin_ttl;
        self.pins.retain(|stream, pin| {
            let keep = servers.contains_key(&pin.ip) && pin.last_used.elapsed() < pin_ttl;
            if !keep {
                tracing::debug!(stream = %stream, backend = %pin.ip, "Stream pin released");
            }
            keep
        });
    }

    /// Spawn background cleanup task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.cleanup().await;
            }
        })
    }

    /// Keep a statically configured backend registered
    ///
    /// Registers `server` now and again every `every`, the way a real
    /// backend heartbeats.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        server: BackendServer,
        every: Duration,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                registry.update(server.clone()).await;
            }
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn rendezvous_score(stream_url: &str, ip: &str) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(stream_url.as_bytes());
    digest.update(&[0]);
    digest.update(ip.as_bytes());
    digest.finalize()
}
