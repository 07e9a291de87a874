//! CapabilityBridge: turns one upstream server's discovered definitions into
//! registry entries whose execution is routed back through the proxy invoker.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{
    CallToolResult, GetPromptResult, JsonObject, Prompt, PromptMessageContent,
    ReadResourceResult, Resource, ResourceContents, Tool,
};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::error::UpstreamError;
use crate::namespace::{namespace_prompt, namespace_resource, namespace_tool};
use crate::proxy::{ProxyInvoker, UpstreamResponse, classify};
use crate::rbac::{AccessPolicy, SessionContext};
use crate::registry::{
    Capability, CapabilityDefinition, CapabilityExecutor, CapabilityKind, CapabilityOutput,
};
use crate::stats::StatsCollector;
use crate::upstream::Upstream;

/// Sum of text segment lengths, or `None` when there are no text segments.
fn text_len<'a>(texts: impl Iterator<Item = &'a str>) -> Option<usize> {
    texts.fold(None, |acc, t| Some(acc.unwrap_or(0) + t.len()))
}

fn payload_len<T: serde::Serialize>(value: &T) -> Option<usize> {
    serde_json::to_string(value).ok().map(|s| s.len())
}

impl UpstreamResponse for CallToolResult {
    fn is_application_error(&self) -> bool {
        self.is_error == Some(true)
    }

    fn error_message(&self) -> String {
        let text: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| c.raw.as_text().map(|t| t.text.as_str()))
            .collect();
        if text.is_empty() {
            "tool reported an error".to_string()
        } else {
            text.join("\n")
        }
    }

    fn response_size(&self) -> Option<usize> {
        text_len(
            self.content
                .iter()
                .filter_map(|c| c.raw.as_text().map(|t| t.text.as_str())),
        )
        .or_else(|| payload_len(self))
    }
}

impl UpstreamResponse for ReadResourceResult {
    fn response_size(&self) -> Option<usize> {
        text_len(self.contents.iter().filter_map(|c| match c {
            ResourceContents::TextResourceContents { text, .. } => Some(text.as_str()),
            _ => None,
        }))
        .or_else(|| payload_len(self))
    }
}

impl UpstreamResponse for GetPromptResult {
    fn response_size(&self) -> Option<usize> {
        text_len(self.messages.iter().filter_map(|m| match &m.content {
            PromptMessageContent::Text { text } => Some(text.as_str()),
            _ => None,
        }))
        .or_else(|| payload_len(self))
    }
}

/// Normalize a degenerate "no parameters" schema into a valid empty-object schema.
///
/// `{}` and `{"type": "object"}` both become `{"type": "object", "properties": {}}`.
/// Anything else is passed through untouched.
pub fn normalize_schema(schema: &JsonObject) -> JsonObject {
    let mut normalized = schema.clone();
    if !normalized.contains_key("type") {
        normalized.insert("type".to_string(), Value::String("object".to_string()));
    }
    let is_object = normalized.get("type").and_then(Value::as_str) == Some("object");
    let has_properties = normalized
        .get("properties")
        .is_some_and(Value::is_object);
    if is_object && !has_properties {
        normalized.insert("properties".to_string(), Value::Object(JsonObject::new()));
    }
    normalized
}

/// Translates raw definitions from one upstream connection into registry entries.
pub struct CapabilityBridge {
    server: String,
    server_access: AccessPolicy,
    config: ServerConfig,
    upstream: Arc<dyn Upstream>,
    invoker: Option<Arc<ProxyInvoker>>,
    stats: Arc<StatsCollector>,
}

impl CapabilityBridge {
    pub fn new(
        config: &ServerConfig,
        upstream: Arc<dyn Upstream>,
        invoker: Option<Arc<ProxyInvoker>>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            server: config.name.clone(),
            server_access: config.access_policy(),
            config: config.clone(),
            upstream,
            invoker,
            stats,
        }
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    fn capability(
        &self,
        kind: CapabilityKind,
        id: String,
        upstream_name: String,
        definition: CapabilityDefinition,
    ) -> Capability {
        let executor = UpstreamCall {
            server: self.server.clone(),
            capability_id: id.clone(),
            upstream_name: upstream_name.clone(),
            kind,
            upstream: Arc::clone(&self.upstream),
            invoker: self.invoker.clone(),
            stats: Arc::clone(&self.stats),
        };
        Capability {
            id,
            access: self.config.item_policy(&upstream_name),
            upstream_name,
            origin_server: self.server.clone(),
            definition,
            server_access: self.server_access.clone(),
            executor: Arc::new(executor),
        }
    }

    pub fn bridge_tool(&self, tool: Tool) -> Capability {
        let upstream_name = tool.name.to_string();
        let mut tool = namespace_tool(&self.server, tool);
        tool.input_schema = Arc::new(normalize_schema(&tool.input_schema));
        let id = tool.name.to_string();
        self.capability(
            CapabilityKind::Tool,
            id,
            upstream_name,
            CapabilityDefinition::Tool(tool),
        )
    }

    pub fn bridge_resource(&self, resource: Resource) -> Capability {
        let upstream_name = resource.raw.uri.clone();
        let resource = namespace_resource(&self.server, resource);
        let id = resource.raw.uri.clone();
        self.capability(
            CapabilityKind::Resource,
            id,
            upstream_name,
            CapabilityDefinition::Resource(resource),
        )
    }

    pub fn bridge_prompt(&self, prompt: Prompt) -> Capability {
        let upstream_name = prompt.name.clone();
        let prompt = namespace_prompt(&self.server, prompt);
        let id = prompt.name.clone();
        self.capability(
            CapabilityKind::Prompt,
            id,
            upstream_name,
            CapabilityDefinition::Prompt(prompt),
        )
    }
}

/// Executor that forwards a capability call to its upstream server.
struct UpstreamCall {
    server: String,
    capability_id: String,
    upstream_name: String,
    kind: CapabilityKind,
    upstream: Arc<dyn Upstream>,
    invoker: Option<Arc<ProxyInvoker>>,
    stats: Arc<StatsCollector>,
}

impl UpstreamCall {
    async fn run<T, Fut>(&self, call: Fut) -> crate::Result<T>
    where
        T: UpstreamResponse + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        if let Some(invoker) = &self.invoker {
            return invoker.invoke(&self.server, &self.capability_id, call).await;
        }

        let started = Instant::now();
        let result = classify(&self.server, call.await);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let size = result.as_ref().ok().and_then(UpstreamResponse::response_size);
        self.stats.record_call(
            &self.server,
            &self.capability_id,
            duration_ms,
            result.is_err(),
            size,
        );
        result
    }
}

#[async_trait]
impl CapabilityExecutor for UpstreamCall {
    async fn execute(
        &self,
        args: Option<JsonObject>,
        ctx: &SessionContext,
    ) -> crate::Result<CapabilityOutput> {
        tracing::debug!(
            server = %self.server,
            capability = %self.capability_id,
            agent = ?ctx.agent_name,
            "forwarding {} call upstream",
            self.kind
        );
        let upstream = Arc::clone(&self.upstream);
        let name = self.upstream_name.clone();
        match self.kind {
            CapabilityKind::Tool => self
                .run(async move { upstream.call_tool(&name, args).await })
                .await
                .map(CapabilityOutput::Tool),
            CapabilityKind::Resource => self
                .run(async move { upstream.read_resource(&name).await })
                .await
                .map(CapabilityOutput::Resource),
            CapabilityKind::Prompt => self
                .run(async move { upstream.get_prompt(&name, args).await })
                .await
                .map(CapabilityOutput::Prompt),
        }
    }
}
