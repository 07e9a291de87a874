//! ConnectionManager: owns every live upstream connection.
//!
//! Responsibilities:
//! - open transports through a [`Connector`] and run discovery (tools, then
//!   resources, then prompts), registering capabilities in lockstep with the
//!   connection's lifetime
//! - tear connections down and remove everything they registered
//! - notice upstream sessions that end on their own and treat them as a
//!   connection failure
//! - schedule reconnects with capped exponential backoff, at most one pending
//!   timer per server
//! - an optional periodic monitor that re-schedules idle, disconnected servers
//!
//! Operations on the same server are serialized by a per-server async lock.
//! Different servers proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::CapabilityBridge;
use crate::config::{ReconnectConfig, ServerConfig};
use crate::error::{ConcourseError, UpstreamError};
use crate::proxy::ProxyInvoker;
use crate::registry::{Capability, CapabilityKind, CapabilityRegistry};
use crate::stats::{ServerStatus, StatsCollector};
use crate::transport::Connector;
use crate::upstream::Upstream;

/// Smallest delay ever used between reconnect attempts.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Source of jitter samples in `[-1.0, 1.0]`.
pub type JitterSource = fn() -> f64;

/// Jitter sample derived from the low bits of the wall clock.
pub fn clock_jitter() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 2001) / 1000.0 - 1.0
}

/// Delay before reconnect attempt `attempt` (1-based).
///
/// `min(max_delay, base_delay * 2^(attempt-1))`, shifted by
/// `delay * jitter * sample`, floored at [`MIN_RECONNECT_DELAY`].
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig, sample: f64) -> Duration {
    let shift = attempt.saturating_sub(1).min(63);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let capped = config
        .base_delay_ms
        .saturating_mul(multiplier)
        .min(config.max_delay_ms);

    let capped_f = capped as f64;
    let adjusted = capped_f + capped_f * config.jitter * sample.clamp(-1.0, 1.0);
    let millis = if adjusted.is_finite() && adjusted > 0.0 {
        adjusted.round() as u64
    } else {
        0
    };
    Duration::from_millis(millis).max(MIN_RECONNECT_DELAY)
}

/// One open upstream connection and the capability IDs it registered.
struct Connection {
    id: u64,
    config: ServerConfig,
    upstream: Arc<dyn Upstream>,
    cancel: CancellationToken,
    tools: Vec<String>,
    resources: Vec<String>,
    prompts: Vec<String>,
}

impl Connection {
    fn ids_mut(&mut self, kind: CapabilityKind) -> &mut Vec<String> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::Prompt => &mut self.prompts,
        }
    }
}

struct PendingReconnect {
    token: CancellationToken,
    generation: u64,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    registry: Arc<CapabilityRegistry>,
    stats: Arc<StatsCollector>,
    invoker: Arc<ProxyInvoker>,
    reconnect: ReconnectConfig,
    jitter: JitterSource,
    connections: Mutex<HashMap<String, Connection>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    timers: Mutex<HashMap<String, PendingReconnect>>,
    attempts: Mutex<HashMap<String, u32>>,
    known: Mutex<HashMap<String, ServerConfig>>,
    generation: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
    root: CancellationToken,
}

/// Connection lifecycle owner. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<CapabilityRegistry>,
        stats: Arc<StatsCollector>,
        invoker: Arc<ProxyInvoker>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                registry,
                stats,
                invoker,
                reconnect,
                jitter: clock_jitter,
                connections: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                monitor: Mutex::new(None),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Replace the jitter source. Must be called before the manager is shared.
    pub fn with_jitter_source(mut self, jitter: JitterSource) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.jitter = jitter;
        }
        self
    }

    fn server_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.inner
                .locks
                .lock()
                .entry(name.to_string())
                .or_default(),
        )
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.inner.connections.lock().contains_key(name)
    }

    pub fn connected_servers(&self) -> Vec<String> {
        self.inner.connections.lock().keys().cloned().collect()
    }

    pub fn has_pending_reconnect(&self, name: &str) -> bool {
        self.inner.timers.lock().contains_key(name)
    }

    pub fn reconnect_attempts(&self, name: &str) -> u32 {
        self.inner.attempts.lock().get(name).copied().unwrap_or(0)
    }

    /// Connect (or restart) the server described by `config`.
    ///
    /// Inactive or disabled configs cancel any pending reconnect and return
    /// `Ok` without connecting. A failed open schedules a reconnect and
    /// returns the error.
    pub async fn connect(&self, config: ServerConfig) -> crate::Result<()> {
        if self.inner.root.is_cancelled() {
            return Err(ConcourseError::ShuttingDown);
        }
        let lock = self.server_lock(&config.name);
        let _guard = lock.lock().await;
        self.connect_locked(config).await
    }

    async fn connect_locked(&self, config: ServerConfig) -> crate::Result<()> {
        let name = config.name.clone();
        self.inner.known.lock().insert(name.clone(), config.clone());
        // This attempt supersedes any pending retry; its snapshot may be stale.
        self.cancel_timer(&name);

        if self.teardown(&name).await {
            tracing::info!(server = %name, "restarting existing connection");
        }

        if !config.is_active() {
            self.cancel_reconnect(&name);
            self.inner
                .stats
                .update_server_status(&name, ServerStatus::Inactive, Some(config.transport));
            tracing::info!(server = %name, "server inactive, not connecting");
            return Ok(());
        }

        self.inner
            .stats
            .update_server_status(&name, ServerStatus::Connecting, Some(config.transport));
        let cancel = self.inner.root.child_token();

        let upstream = match self.inner.connector.open(&config, cancel.clone()).await {
            Ok(upstream) => upstream,
            Err(e) => {
                cancel.cancel();
                tracing::warn!(server = %name, error = %e, "failed to connect");
                self.inner.stats.record_server_error(&name, &e.to_string());
                self.schedule_reconnect(&config);
                return Err(e);
            }
        };

        if self.inner.root.is_cancelled() {
            if let Err(e) = upstream.close().await {
                tracing::debug!(server = %name, error = %e, "error closing upstream, ignoring");
            }
            cancel.cancel();
            return Err(ConcourseError::ShuttingDown);
        }

        let id = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.lock().insert(
            name.clone(),
            Connection {
                id,
                config: config.clone(),
                upstream: Arc::clone(&upstream),
                cancel: cancel.clone(),
                tools: Vec::new(),
                resources: Vec::new(),
                prompts: Vec::new(),
            },
        );
        self.inner
            .stats
            .update_server_status(&name, ServerStatus::Connected, Some(config.transport));

        for kind in [
            CapabilityKind::Tool,
            CapabilityKind::Resource,
            CapabilityKind::Prompt,
        ] {
            match self.discover(&name, kind).await {
                Ok(_) => {}
                Err(UpstreamError::MethodNotSupported) => {
                    tracing::debug!(server = %name, kind = %kind, "upstream does not support {} listing", kind);
                }
                Err(e) => {
                    tracing::warn!(server = %name, kind = %kind, error = %e, "discovery failed, continuing");
                }
            }
        }

        self.cancel_reconnect(&name);
        self.watch_connection(&name, id, Arc::clone(&upstream), cancel);
        tracing::info!(
            server = %name,
            capabilities = self.inner.registry.count_for_server(&name),
            "server connected"
        );
        Ok(())
    }

    /// Disconnect `name`: cancel any pending reconnect, close the transport,
    /// and remove every capability it registered.
    pub async fn disconnect(&self, name: &str) {
        self.cancel_reconnect(name);
        let lock = self.server_lock(name);
        let _guard = lock.lock().await;
        self.cancel_reconnect(name);
        if self.teardown(name).await {
            tracing::info!(server = %name, "server disconnected");
        }
        self.inner
            .stats
            .update_server_status(name, ServerStatus::Disconnected, None);
    }

    /// Remove the connection for `name`, if any. Returns whether one existed.
    async fn teardown(&self, name: &str) -> bool {
        let Some(conn) = self.inner.connections.lock().remove(name) else {
            return false;
        };
        let removed = self.inner.registry.remove_server(name);
        self.inner.stats.clear_server_capabilities(name);
        if let Err(e) = conn.upstream.close().await {
            tracing::debug!(server = %name, error = %e, "error closing upstream, ignoring");
        }
        conn.cancel.cancel();
        tracing::debug!(server = %name, removed, "connection torn down");
        true
    }

    pub async fn discover_tools(&self, name: &str) -> crate::Result<usize> {
        self.discover_public(name, CapabilityKind::Tool).await
    }

    pub async fn discover_resources(&self, name: &str) -> crate::Result<usize> {
        self.discover_public(name, CapabilityKind::Resource).await
    }

    pub async fn discover_prompts(&self, name: &str) -> crate::Result<usize> {
        self.discover_public(name, CapabilityKind::Prompt).await
    }

    async fn discover_public(&self, name: &str, kind: CapabilityKind) -> crate::Result<usize> {
        let lock = self.server_lock(name);
        let _guard = lock.lock().await;
        match self.discover(name, kind).await {
            Ok(count) => Ok(count),
            Err(UpstreamError::MethodNotSupported) => Ok(0),
            Err(e) => Err(e.into_gateway(name)),
        }
    }

    /// List one capability kind from the upstream and replace that kind's
    /// registry entries for the server. No-op without an open connection.
    async fn discover(&self, name: &str, kind: CapabilityKind) -> Result<usize, UpstreamError> {
        let bridge = {
            let connections = self.inner.connections.lock();
            let Some(conn) = connections.get(name) else {
                return Ok(0);
            };
            CapabilityBridge::new(
                &conn.config,
                Arc::clone(&conn.upstream),
                Some(Arc::clone(&self.inner.invoker)),
                Arc::clone(&self.inner.stats),
            )
        };

        let started = Instant::now();
        let capabilities: Vec<Capability> = match kind {
            CapabilityKind::Tool => bridge
                .upstream()
                .list_tools()
                .await?
                .into_iter()
                .map(|t| bridge.bridge_tool(t))
                .collect(),
            CapabilityKind::Resource => bridge
                .upstream()
                .list_resources()
                .await?
                .into_iter()
                .map(|r| bridge.bridge_resource(r))
                .collect(),
            CapabilityKind::Prompt => bridge
                .upstream()
                .list_prompts()
                .await?
                .into_iter()
                .map(|p| bridge.bridge_prompt(p))
                .collect(),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let ids: Vec<String> = capabilities.iter().map(|c| c.id.clone()).collect();

        {
            let mut connections = self.inner.connections.lock();
            let Some(conn) = connections.get_mut(name) else {
                return Ok(0);
            };
            let previous = std::mem::replace(conn.ids_mut(kind), ids.clone());
            for id in &previous {
                self.inner.registry.unregister(kind, id);
            }
            for capability in capabilities {
                self.inner.registry.register(capability);
            }
        }

        let count = ids.len();
        self.inner.stats.update_server_capabilities(name, kind, ids);
        self.inner
            .stats
            .record_discovery(name, kind, count, duration_ms);
        tracing::info!(server = %name, kind = %kind, count, duration_ms, "discovered capabilities");
        Ok(count)
    }

    /// Tear down connection `id` of `name` when its upstream session ends on
    /// its own, then schedule a reconnect.
    fn watch_connection(
        &self,
        name: &str,
        id: u64,
        upstream: Arc<dyn Upstream>,
        cancel: CancellationToken,
    ) {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = upstream.closed() => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            let manager = ConnectionManager { inner };
            let lock = manager.server_lock(&name);
            let _guard = lock.lock().await;
            let config = {
                let connections = manager.inner.connections.lock();
                match connections.get(&name) {
                    Some(conn) if conn.id == id => conn.config.clone(),
                    _ => return,
                }
            };
            if manager.inner.root.is_cancelled() {
                return;
            }
            tracing::warn!(server = %name, "upstream session ended unexpectedly");
            manager.teardown(&name).await;
            manager
                .inner
                .stats
                .record_server_error(&name, "upstream session ended unexpectedly");
            manager.schedule_reconnect(&config);
        });
    }

    fn cancel_timer(&self, name: &str) {
        if let Some(pending) = self.inner.timers.lock().remove(name) {
            pending.token.cancel();
            tracing::debug!(server = %name, "cancelled pending reconnect");
        }
    }

    fn cancel_reconnect(&self, name: &str) {
        self.cancel_timer(name);
        self.inner.attempts.lock().remove(name);
    }

    /// Schedule a reconnect for `config`. A no-op when one is already pending.
    fn schedule_reconnect(&self, config: &ServerConfig) {
        if self.inner.root.is_cancelled() {
            return;
        }
        let name = config.name.clone();
        let mut timers = self.inner.timers.lock();
        if timers.contains_key(&name) {
            tracing::debug!(server = %name, "reconnect already pending");
            return;
        }

        let attempt = {
            let mut attempts = self.inner.attempts.lock();
            let attempt = attempts.entry(name.clone()).or_insert(0);
            *attempt = attempt.saturating_add(1);
            *attempt
        };
        let delay = backoff_delay(attempt, &self.inner.reconnect, (self.inner.jitter)());
        let token = self.inner.root.child_token();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        timers.insert(
            name.clone(),
            PendingReconnect {
                token: token.clone(),
                generation,
            },
        );
        drop(timers);

        tracing::warn!(
            server = %name,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        let manager = self.clone();
        let snapshot = config.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let lock = manager.server_lock(&snapshot.name);
            let _guard = lock.lock().await;
            let ours = {
                let mut timers = manager.inner.timers.lock();
                match timers.get(&snapshot.name) {
                    Some(pending) if pending.generation == generation => {
                        timers.remove(&snapshot.name);
                        true
                    }
                    _ => false,
                }
            };
            if !ours || token.is_cancelled() {
                return;
            }
            tracing::info!(server = %snapshot.name, attempt, "attempting reconnect");
            if let Err(e) = manager.connect_locked(snapshot).await {
                tracing::debug!(error = %e, "reconnect attempt failed");
            }
        });
    }

    /// Schedule reconnects for active servers that are neither connected nor
    /// already waiting on a timer. Returns the number scheduled.
    pub fn check_health(&self) -> usize {
        let known: Vec<ServerConfig> = self.inner.known.lock().values().cloned().collect();
        let mut scheduled = 0;
        for config in known.into_iter().filter(ServerConfig::is_active) {
            let name = config.name.as_str();
            if self.is_connected(name) || self.has_pending_reconnect(name) {
                continue;
            }
            if self.inner.stats.server_status(name) == Some(ServerStatus::Connected) {
                continue;
            }
            tracing::info!(server = %name, "health monitor rescheduling idle server");
            self.schedule_reconnect(&config);
            scheduled += 1;
        }
        scheduled
    }

    /// Start the periodic health monitor. No-op when the interval is zero or
    /// a monitor is already running.
    pub fn spawn_monitor(&self) {
        let interval_secs = self.inner.reconnect.monitor_interval_secs;
        if interval_secs == 0 {
            return;
        }
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let cancel = self.inner.root.child_token();
        *monitor = Some(tokio::spawn(async move {
            let period = Duration::from_secs(interval_secs);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        ConnectionManager { inner }.check_health();
                    }
                }
            }
            tracing::debug!("health monitor stopped");
        }));
    }

    /// Remember `config` and connect it.
    pub async fn on_server_active(&self, config: ServerConfig) -> crate::Result<()> {
        self.connect(config).await
    }

    /// Forget `name` and disconnect it. Removal and deactivation are the same.
    pub async fn on_server_inactive(&self, name: &str) {
        self.inner.known.lock().remove(name);
        self.disconnect(name).await;
        self.inner
            .stats
            .update_server_status(name, ServerStatus::Inactive, None);
    }

    /// Cancel all timers and the monitor, then disconnect every connection.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        for (_, pending) in self.inner.timers.lock().drain() {
            pending.token.cancel();
        }
        self.inner.attempts.lock().clear();
        if let Some(handle) = self.inner.monitor.lock().take() {
            handle.abort();
        }

        // Every server that ever took a lock, so connects still in flight
        // finish before their server is torn down.
        let names: Vec<String> = self.inner.locks.lock().keys().cloned().collect();
        for name in names {
            let lock = self.server_lock(&name);
            let _guard = lock.lock().await;
            if self.teardown(&name).await {
                self.inner
                    .stats
                    .update_server_status(&name, ServerStatus::Disconnected, None);
            }
        }
        tracing::info!("connection manager shut down");
    }
}
