//! Usage and health statistics.
//!
//! Pure aggregation: per-server and per-capability counters plus running
//! latency aggregates. Reads return point-in-time copies safe to serialize.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::TransportKind;
use crate::registry::CapabilityKind;

/// Last-known connection status of an upstream server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Inactive,
}

/// Running latency aggregate. Average is `total_ms / count`, rounded down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub avg_ms: u64,
}

impl LatencyStats {
    fn record(&mut self, duration_ms: u64) {
        self.count += 1;
        self.total_ms = self.total_ms.saturating_add(duration_ms);
        self.min_ms = Some(self.min_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_ms = Some(self.max_ms.map_or(duration_ms, |m| m.max(duration_ms)));
        self.avg_ms = self.total_ms / self.count;
    }
}

/// Outcome of the most recent discovery call for one capability kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRecord {
    pub count: usize,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Per-server aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    pub status: ServerStatus,
    pub transport: Option<TransportKind>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub invocations: u64,
    pub errors: u64,
    pub latency: LatencyStats,
    pub discoveries: BTreeMap<String, DiscoveryRecord>,
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
}

/// Per-capability aggregate. Persists across disconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityStats {
    pub server: String,
    pub invocations: u64,
    pub errors: u64,
    pub latency: LatencyStats,
    pub last_used: Option<DateTime<Utc>>,
    pub last_response_size: Option<usize>,
}

/// Serializable status report combining all statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub servers: BTreeMap<String, ServerStats>,
    pub capabilities: BTreeMap<String, CapabilityStats>,
}

#[derive(Default)]
struct StatsInner {
    servers: HashMap<String, ServerStats>,
    capabilities: HashMap<String, CapabilityStats>,
}

/// Shared statistics collector. Internally locked; safe to share via `Arc`.
#[derive(Default)]
pub struct StatsCollector {
    inner: RwLock<StatsInner>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one upstream call outcome against the server and the capability.
    pub fn record_call(
        &self,
        server: &str,
        capability_id: &str,
        duration_ms: u64,
        is_error: bool,
        response_size: Option<usize>,
    ) {
        let mut inner = self.inner.write();

        let server_stats = inner.servers.entry(server.to_string()).or_default();
        server_stats.invocations += 1;
        if is_error {
            server_stats.errors += 1;
        }
        server_stats.latency.record(duration_ms);

        let cap_stats = inner
            .capabilities
            .entry(capability_id.to_string())
            .or_default();
        cap_stats.server = server.to_string();
        cap_stats.invocations += 1;
        if is_error {
            cap_stats.errors += 1;
        }
        cap_stats.latency.record(duration_ms);
        cap_stats.last_used = Some(Utc::now());
        if response_size.is_some() {
            cap_stats.last_response_size = response_size;
        }
    }

    /// Update the server's status. `Connected` stamps `connected_at`.
    pub fn update_server_status(
        &self,
        server: &str,
        status: ServerStatus,
        transport: Option<TransportKind>,
    ) {
        let mut inner = self.inner.write();
        let stats = inner.servers.entry(server.to_string()).or_default();
        stats.status = status;
        if transport.is_some() {
            stats.transport = transport;
        }
        match status {
            ServerStatus::Connected => {
                stats.connected_at = Some(Utc::now());
                stats.last_error = None;
            }
            ServerStatus::Disconnected | ServerStatus::Inactive => stats.connected_at = None,
            ServerStatus::Connecting | ServerStatus::Error => {}
        }
    }

    /// Mark the server as errored with a message.
    pub fn record_server_error(&self, server: &str, error: &str) {
        let mut inner = self.inner.write();
        let stats = inner.servers.entry(server.to_string()).or_default();
        stats.status = ServerStatus::Error;
        stats.last_error = Some(error.to_string());
    }

    /// Record the size and timing of a discovery call.
    pub fn record_discovery(
        &self,
        server: &str,
        kind: CapabilityKind,
        count: usize,
        duration_ms: u64,
    ) {
        let mut inner = self.inner.write();
        let stats = inner.servers.entry(server.to_string()).or_default();
        stats.discoveries.insert(
            kind.to_string(),
            DiscoveryRecord {
                count,
                duration_ms,
                at: Utc::now(),
            },
        );
    }

    /// Replace the list of currently owned capability IDs of one kind.
    pub fn update_server_capabilities(&self, server: &str, kind: CapabilityKind, ids: Vec<String>) {
        let mut inner = self.inner.write();
        let stats = inner.servers.entry(server.to_string()).or_default();
        match kind {
            CapabilityKind::Tool => stats.tools = ids,
            CapabilityKind::Resource => stats.resources = ids,
            CapabilityKind::Prompt => stats.prompts = ids,
        }
    }

    /// Clear the current capability lists. Historical counters are retained.
    pub fn clear_server_capabilities(&self, server: &str) {
        let mut inner = self.inner.write();
        if let Some(stats) = inner.servers.get_mut(server) {
            stats.tools.clear();
            stats.resources.clear();
            stats.prompts.clear();
        }
    }

    pub fn server_status(&self, server: &str) -> Option<ServerStatus> {
        self.inner.read().servers.get(server).map(|s| s.status)
    }

    pub fn server(&self, server: &str) -> Option<ServerStats> {
        self.inner.read().servers.get(server).cloned()
    }

    pub fn capability(&self, capability_id: &str) -> Option<CapabilityStats> {
        self.inner.read().capabilities.get(capability_id).cloned()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        StatsSnapshot {
            servers: inner
                .servers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            capabilities: inner
                .capabilities
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}
