//! Scripted upstreams and connectors for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{
    AnnotateAble, CallToolResult, Content, GetPromptResult, JsonObject, Prompt, PromptMessage,
    PromptMessageRole, RawResource, ReadResourceResult, Resource, ResourceContents, Tool,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{ConcourseError, UpstreamError};
use crate::rbac::{AccessPolicy, SessionContext};
use crate::registry::{Capability, CapabilityDefinition, CapabilityExecutor, CapabilityOutput};
use crate::transport::Connector;
use crate::upstream::Upstream;

pub fn tool(name: &str) -> Tool {
    Tool::new(
        name.to_string(),
        format!("{name} tool"),
        Arc::new(JsonObject::new()),
    )
}

pub fn resource(uri: &str) -> Resource {
    RawResource::new(uri, uri).no_annotation()
}

pub fn prompt(name: &str) -> Prompt {
    Prompt::new(name, Some(format!("{name} prompt")), None)
}

struct Unreachable;

#[async_trait]
impl CapabilityExecutor for Unreachable {
    async fn execute(
        &self,
        _args: Option<JsonObject>,
        _ctx: &SessionContext,
    ) -> crate::Result<CapabilityOutput> {
        Err(ConcourseError::Upstream(
            "test".to_string(),
            "static capability".to_string(),
        ))
    }
}

fn static_entry(server: &str, name: &str, definition: CapabilityDefinition) -> Capability {
    Capability {
        id: crate::namespace::namespace_id(server, name),
        upstream_name: name.to_string(),
        origin_server: server.to_string(),
        definition,
        server_access: AccessPolicy::default(),
        access: AccessPolicy::default(),
        executor: Arc::new(Unreachable),
    }
}

/// A tool capability with no live upstream behind it.
pub fn static_capability(server: &str, name: &str) -> Capability {
    static_entry(server, name, CapabilityDefinition::Tool(tool(name)))
}

/// A resource capability with no live upstream behind it.
pub fn static_resource(server: &str, uri: &str) -> Capability {
    static_entry(server, uri, CapabilityDefinition::Resource(resource(uri)))
}

#[derive(Default)]
struct Script {
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
    unsupported: HashSet<&'static str>,
    failing_lists: HashSet<&'static str>,
    replies: HashMap<String, CallToolResult>,
    failures: HashMap<String, UpstreamError>,
    delay: Option<Duration>,
    tool_calls: Vec<String>,
    resource_reads: Vec<String>,
    prompt_gets: Vec<String>,
}

/// Upstream whose discovery lists and call results are scripted per test.
#[derive(Default)]
pub struct MockUpstream {
    script: Mutex<Script>,
    calls: AtomicUsize,
    closes: AtomicUsize,
    death: Notify,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(names: &[&str]) -> Self {
        let upstream = Self::new();
        upstream.script.lock().tools = names.iter().map(|n| tool(n)).collect();
        upstream
    }

    pub fn set_tools(&self, names: &[&str]) {
        self.script.lock().tools = names.iter().map(|n| tool(n)).collect();
    }

    pub fn set_resources(&self, uris: &[&str]) {
        self.script.lock().resources = uris.iter().map(|u| resource(u)).collect();
    }

    pub fn set_prompts(&self, names: &[&str]) {
        self.script.lock().prompts = names.iter().map(|n| prompt(n)).collect();
    }

    /// Make `list` ("tools", "resources", or "prompts") answer method-not-found.
    pub fn unsupported(&self, list: &'static str) {
        self.script.lock().unsupported.insert(list);
    }

    /// Make `list` fail with a generic upstream error.
    pub fn failing_list(&self, list: &'static str) {
        self.script.lock().failing_lists.insert(list);
    }

    pub fn reply_to_tool(&self, name: &str, result: CallToolResult) {
        self.script.lock().replies.insert(name.to_string(), result);
    }

    pub fn fail_tool(&self, name: &str, error: UpstreamError) {
        self.script.lock().failures.insert(name.to_string(), error);
    }

    /// Delay every invocation by `delay`.
    pub fn slow(&self, delay: Duration) {
        self.script.lock().delay = Some(delay);
    }

    /// End the current session as if the server crashed. Wakes one
    /// `closed()` waiter, now or when it next starts waiting.
    pub fn die(&self) {
        self.death.notify_one();
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn tool_calls(&self) -> Vec<String> {
        self.script.lock().tool_calls.clone()
    }

    pub fn resource_reads(&self) -> Vec<String> {
        self.script.lock().resource_reads.clone()
    }

    pub fn prompt_gets(&self) -> Vec<String> {
        self.script.lock().prompt_gets.clone()
    }

    fn list<T: Clone>(
        &self,
        list: &'static str,
        pick: impl FnOnce(&Script) -> &Vec<T>,
    ) -> Result<Vec<T>, UpstreamError> {
        let script = self.script.lock();
        if script.unsupported.contains(list) {
            return Err(UpstreamError::MethodNotSupported);
        }
        if script.failing_lists.contains(list) {
            return Err(UpstreamError::Failed(format!("{list}/list exploded")));
        }
        Ok(pick(&script).clone())
    }

    async fn begin_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError> {
        self.list("tools", |s| &s.tools)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, UpstreamError> {
        self.list("resources", |s| &s.resources)
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>, UpstreamError> {
        self.list("prompts", |s| &s.prompts)
    }

    async fn call_tool(
        &self,
        name: &str,
        _args: Option<JsonObject>,
    ) -> Result<CallToolResult, UpstreamError> {
        self.begin_call().await;
        let mut script = self.script.lock();
        script.tool_calls.push(name.to_string());
        if let Some(error) = script.failures.get(name) {
            return Err(error.clone());
        }
        Ok(script
            .replies
            .get(name)
            .cloned()
            .unwrap_or_else(|| CallToolResult::success(vec![Content::text(format!("{name} ok"))])))
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, UpstreamError> {
        self.begin_call().await;
        self.script.lock().resource_reads.push(uri.to_string());
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(format!("contents of {uri}"), uri)],
        })
    }

    async fn get_prompt(
        &self,
        name: &str,
        _args: Option<JsonObject>,
    ) -> Result<GetPromptResult, UpstreamError> {
        self.begin_call().await;
        self.script.lock().prompt_gets.push(name.to_string());
        Ok(GetPromptResult {
            description: None,
            messages: vec![PromptMessage::new_text(
                PromptMessageRole::User,
                format!("{name} prompt body"),
            )],
        })
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn closed(&self) {
        self.death.notified().await;
    }
}

/// Connector that hands out pre-registered mock upstreams by server name.
#[derive(Default)]
pub struct MockConnector {
    upstreams: Mutex<HashMap<String, Arc<MockUpstream>>>,
    failures: Mutex<HashMap<String, usize>>,
    opens: Mutex<HashMap<String, usize>>,
    commands: Mutex<Vec<Option<String>>>,
    open_delays: Mutex<HashMap<String, Duration>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, server: &str, upstream: Arc<MockUpstream>) {
        self.upstreams.lock().insert(server.to_string(), upstream);
    }

    /// Fail the next `times` opens for `server` with a transport error.
    pub fn fail_next(&self, server: &str, times: usize) {
        self.failures.lock().insert(server.to_string(), times);
    }

    /// Delay every open for `server` by `delay`.
    pub fn slow_open(&self, server: &str, delay: Duration) {
        self.open_delays.lock().insert(server.to_string(), delay);
    }

    pub fn open_count(&self, server: &str) -> usize {
        self.opens.lock().get(server).copied().unwrap_or(0)
    }

    /// `command` of every config opened so far, in order.
    pub fn opened_commands(&self) -> Vec<Option<String>> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        config: &ServerConfig,
        _cancel: CancellationToken,
    ) -> crate::Result<Arc<dyn Upstream>> {
        *self.opens.lock().entry(config.name.clone()).or_default() += 1;
        self.commands.lock().push(config.command.clone());
        let delay = self.open_delays.lock().get(&config.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        config.validate()?;

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&config.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConcourseError::Transport(
                        config.name.clone(),
                        "scripted open failure".to_string(),
                    ));
                }
            }
        }

        let upstream = self
            .upstreams
            .lock()
            .get(&config.name)
            .cloned()
            .ok_or_else(|| {
                ConcourseError::Transport(config.name.clone(), "no such server".to_string())
            })?;
        Ok(upstream)
    }
}
