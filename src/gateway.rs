//! Gateway: the instance struct that owns every component.
//!
//! Callers list and invoke capabilities through it; configuration sources
//! feed active/inactive events into it. Access control is applied on both
//! paths: listing omits denied entries, invocation rejects them before any
//! upstream call is made.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rmcp::model::{
    CallToolResult, GetPromptResult, JsonObject, Prompt, ReadResourceResult, Resource, Tool,
};
use serde::Serialize;

use crate::config::{GatewayConfig, ServerConfig};
use crate::error::ConcourseError;
use crate::manager::ConnectionManager;
use crate::proxy::{CircuitSnapshot, ProxyInvoker};
use crate::rbac::{AccessDecision, SessionContext};
use crate::registry::{
    Capability, CapabilityDefinition, CapabilityKind, CapabilityOutput, CapabilityRegistry,
};
use crate::stats::{CapabilityStats, ServerStats, StatsCollector};
use crate::transport::Connector;

/// Capabilities visible to one caller, sorted by ID.
#[derive(Debug, Clone, Default)]
pub struct CapabilityListing {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

/// Read-only operational snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub servers: BTreeMap<String, ServerStats>,
    pub capabilities: BTreeMap<String, CapabilityStats>,
    pub circuits: BTreeMap<String, CircuitSnapshot>,
}

pub struct Gateway {
    registry: Arc<CapabilityRegistry>,
    stats: Arc<StatsCollector>,
    invoker: Arc<ProxyInvoker>,
    manager: ConnectionManager,
    closed: AtomicBool,
}

impl Gateway {
    /// Build a gateway. No connections are opened until [`Gateway::start`]
    /// or [`Gateway::on_server_active`].
    pub fn new(config: &GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let stats = Arc::new(StatsCollector::new());
        let invoker = Arc::new(ProxyInvoker::new(config.proxy, Arc::clone(&stats)));
        let manager = ConnectionManager::new(
            connector,
            Arc::clone(&registry),
            Arc::clone(&stats),
            Arc::clone(&invoker),
            config.reconnect,
        );
        Self {
            registry,
            stats,
            invoker,
            manager,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect every configured server and start the health monitor.
    ///
    /// Servers connect concurrently. One that fails is logged and left to the
    /// reconnect schedule.
    pub async fn start(&self, config: &GatewayConfig) {
        let connects = config.servers.values().map(|server| async move {
            if let Err(e) = self.manager.connect(server.clone()).await {
                tracing::warn!(server = %server.name, error = %e, "server failed to start");
            }
        });
        futures::future::join_all(connects).await;
        self.manager.spawn_monitor();
        tracing::info!(
            servers = config.servers.len(),
            capabilities = self.registry.len(),
            "gateway started"
        );
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    fn ensure_open(&self) -> crate::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ConcourseError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn visible(&self, kind: CapabilityKind, ctx: &SessionContext) -> Vec<Arc<Capability>> {
        let mut visible: Vec<Arc<Capability>> = self
            .registry
            .list(kind)
            .into_iter()
            .filter(|cap| match cap.authorize(ctx) {
                AccessDecision::Denied(reason) => {
                    tracing::debug!(capability = %cap.id, reason = %reason, "omitted from listing");
                    false
                }
                _ => true,
            })
            .collect();
        visible.sort_by(|a, b| a.id.cmp(&b.id));
        visible
    }

    /// Every capability `ctx` may use.
    pub fn list_capabilities(&self, ctx: &SessionContext) -> CapabilityListing {
        let mut listing = CapabilityListing::default();
        for kind in [
            CapabilityKind::Tool,
            CapabilityKind::Resource,
            CapabilityKind::Prompt,
        ] {
            for cap in self.visible(kind, ctx) {
                match &cap.definition {
                    CapabilityDefinition::Tool(t) => listing.tools.push(t.clone()),
                    CapabilityDefinition::Resource(r) => listing.resources.push(r.clone()),
                    CapabilityDefinition::Prompt(p) => listing.prompts.push(p.clone()),
                }
            }
        }
        listing
    }

    /// Look up and authorize a capability for invocation.
    fn authorized(
        &self,
        kind: CapabilityKind,
        id: &str,
        ctx: &SessionContext,
    ) -> crate::Result<Arc<Capability>> {
        self.ensure_open()?;
        let cap = self
            .registry
            .get(kind, id)
            .ok_or_else(|| ConcourseError::NotFound(id.to_string()))?;
        match cap.authorize(ctx) {
            AccessDecision::Denied(reason) => {
                tracing::info!(
                    capability = %id,
                    agent = ?ctx.agent_name,
                    reason = %reason,
                    "access denied"
                );
                Err(ConcourseError::Forbidden(id.to_string(), reason.to_string()))
            }
            AccessDecision::TrustedAgent | AccessDecision::Allowed => Ok(cap),
        }
    }

    pub async fn call_tool(
        &self,
        id: &str,
        args: Option<JsonObject>,
        ctx: &SessionContext,
    ) -> crate::Result<CallToolResult> {
        let cap = self.authorized(CapabilityKind::Tool, id, ctx)?;
        match cap.execute(args, ctx).await? {
            CapabilityOutput::Tool(result) => Ok(result),
            _ => Err(mismatched(&cap)),
        }
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        ctx: &SessionContext,
    ) -> crate::Result<ReadResourceResult> {
        let cap = self.authorized(CapabilityKind::Resource, uri, ctx)?;
        match cap.execute(None, ctx).await? {
            CapabilityOutput::Resource(result) => Ok(result),
            _ => Err(mismatched(&cap)),
        }
    }

    pub async fn get_prompt(
        &self,
        id: &str,
        args: Option<JsonObject>,
        ctx: &SessionContext,
    ) -> crate::Result<GetPromptResult> {
        let cap = self.authorized(CapabilityKind::Prompt, id, ctx)?;
        match cap.execute(args, ctx).await? {
            CapabilityOutput::Prompt(result) => Ok(result),
            _ => Err(mismatched(&cap)),
        }
    }

    pub fn status(&self) -> StatusReport {
        let snapshot = self.stats.snapshot();
        StatusReport {
            servers: snapshot.servers,
            capabilities: snapshot.capabilities,
            circuits: self.invoker.circuits().into_iter().collect(),
        }
    }

    pub async fn on_server_active(&self, config: ServerConfig) -> crate::Result<()> {
        self.ensure_open()?;
        self.manager.on_server_active(config).await
    }

    pub async fn on_server_inactive(&self, name: &str) {
        self.manager.on_server_inactive(name).await;
    }

    /// Stop reconnects and the monitor, then disconnect everything.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.shutdown().await;
        tracing::info!("gateway shut down");
    }
}

fn mismatched(cap: &Capability) -> ConcourseError {
    ConcourseError::Upstream(
        cap.origin_server.clone(),
        format!("unexpected response kind for {} '{}'", cap.kind(), cap.id),
    )
}
