//! CapabilityRegistry: the in-memory catalog of every upstream tool,
//! resource, and prompt the gateway currently exposes.
//!
//! Entries are keyed by namespaced ID and owned by the registry. Each entry
//! carries an executor that routes calls back to its origin server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rmcp::model::{
    CallToolResult, GetPromptResult, JsonObject, Prompt, ReadResourceResult, Resource, Tool,
};

use crate::rbac::{AccessDecision, AccessPolicy, SessionContext, evaluate};

/// The three kinds of capability an upstream server can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        })
    }
}

/// Namespaced definition as exposed to callers.
#[derive(Debug, Clone)]
pub enum CapabilityDefinition {
    Tool(Tool),
    Resource(Resource),
    Prompt(Prompt),
}

/// Result of executing a capability.
#[derive(Debug, Clone)]
pub enum CapabilityOutput {
    Tool(CallToolResult),
    Resource(ReadResourceResult),
    Prompt(GetPromptResult),
}

/// Execution delegate attached to every registry entry.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(
        &self,
        args: Option<JsonObject>,
        ctx: &SessionContext,
    ) -> crate::Result<CapabilityOutput>;
}

/// One registry entry.
#[derive(Clone)]
pub struct Capability {
    /// Namespaced ID (`server__name`, or `server__uri` for resources).
    pub id: String,
    /// Name as known to the upstream server (URI for resources).
    pub upstream_name: String,
    /// Name of the server this capability was discovered from.
    pub origin_server: String,
    pub definition: CapabilityDefinition,
    /// Owning server's policy, snapshotted when the capability was bridged.
    pub server_access: AccessPolicy,
    pub access: AccessPolicy,
    pub executor: Arc<dyn CapabilityExecutor>,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("origin_server", &self.origin_server)
            .finish_non_exhaustive()
    }
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self.definition {
            CapabilityDefinition::Tool(_) => CapabilityKind::Tool,
            CapabilityDefinition::Resource(_) => CapabilityKind::Resource,
            CapabilityDefinition::Prompt(_) => CapabilityKind::Prompt,
        }
    }

    /// Evaluate `ctx` against this capability's server and item policies.
    pub fn authorize(&self, ctx: &SessionContext) -> AccessDecision {
        evaluate(&self.server_access, &self.access, ctx)
    }

    pub async fn execute(
        &self,
        args: Option<JsonObject>,
        ctx: &SessionContext,
    ) -> crate::Result<CapabilityOutput> {
        self.executor.execute(args, ctx).await
    }
}

type Store = RwLock<HashMap<String, Arc<Capability>>>;

/// Keyed store of capabilities, one map per kind.
///
/// Safe for concurrent register/unregister/list from discovery, invocation,
/// and disconnect flows. Entries are handed out as `Arc` so a reader never
/// observes a half-written entry.
#[derive(Default)]
pub struct CapabilityRegistry {
    tools: Store,
    resources: Store,
    prompts: Store,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, kind: CapabilityKind) -> &Store {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    /// Insert a capability. An existing entry with the same ID is replaced.
    pub fn register(&self, capability: Capability) {
        let kind = capability.kind();
        let id = capability.id.clone();
        if let Some(previous) = self.store(kind).write().insert(id, Arc::new(capability)) {
            tracing::debug!(
                capability = %previous.id,
                kind = %kind,
                previous_server = %previous.origin_server,
                "replaced existing registry entry"
            );
        }
    }

    pub fn unregister(&self, kind: CapabilityKind, id: &str) -> Option<Arc<Capability>> {
        self.store(kind).write().remove(id)
    }

    pub fn get(&self, kind: CapabilityKind, id: &str) -> Option<Arc<Capability>> {
        self.store(kind).read().get(id).cloned()
    }

    pub fn list(&self, kind: CapabilityKind) -> Vec<Arc<Capability>> {
        self.store(kind).read().values().cloned().collect()
    }

    pub fn unregister_tool(&self, id: &str) -> Option<Arc<Capability>> {
        self.unregister(CapabilityKind::Tool, id)
    }

    pub fn get_tool(&self, id: &str) -> Option<Arc<Capability>> {
        self.get(CapabilityKind::Tool, id)
    }

    pub fn list_tools(&self) -> Vec<Arc<Capability>> {
        self.list(CapabilityKind::Tool)
    }

    pub fn unregister_resource(&self, uri: &str) -> Option<Arc<Capability>> {
        self.unregister(CapabilityKind::Resource, uri)
    }

    pub fn get_resource(&self, uri: &str) -> Option<Arc<Capability>> {
        self.get(CapabilityKind::Resource, uri)
    }

    pub fn list_resources(&self) -> Vec<Arc<Capability>> {
        self.list(CapabilityKind::Resource)
    }

    pub fn unregister_prompt(&self, id: &str) -> Option<Arc<Capability>> {
        self.unregister(CapabilityKind::Prompt, id)
    }

    pub fn get_prompt(&self, id: &str) -> Option<Arc<Capability>> {
        self.get(CapabilityKind::Prompt, id)
    }

    pub fn list_prompts(&self) -> Vec<Arc<Capability>> {
        self.list(CapabilityKind::Prompt)
    }

    /// Remove every capability of `kind` whose origin is `server`. Returns the number removed.
    pub fn remove_server_kind(&self, server: &str, kind: CapabilityKind) -> usize {
        let mut store = self.store(kind).write();
        let before = store.len();
        store.retain(|_, cap| cap.origin_server != server);
        before - store.len()
    }

    /// Remove every capability of any kind whose origin is `server`.
    pub fn remove_server(&self, server: &str) -> usize {
        [
            CapabilityKind::Tool,
            CapabilityKind::Resource,
            CapabilityKind::Prompt,
        ]
        .into_iter()
        .map(|kind| self.remove_server_kind(server, kind))
        .sum()
    }

    /// Number of capabilities (all kinds) whose origin is `server`.
    pub fn count_for_server(&self, server: &str) -> usize {
        [&self.tools, &self.resources, &self.prompts]
            .into_iter()
            .map(|store| {
                store
                    .read()
                    .values()
                    .filter(|cap| cap.origin_server == server)
                    .count()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len() + self.resources.read().len() + self.prompts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{static_capability, static_resource};

    #[test]
    fn test_register_then_get() {
        let registry = CapabilityRegistry::new();
        registry.register(static_capability("gh", "list_repos"));
        let cap = registry.get_tool("gh__list_repos").unwrap();
        assert_eq!(cap.origin_server, "gh");
        assert_eq!(cap.upstream_name, "list_repos");
        assert_eq!(cap.kind(), CapabilityKind::Tool);
    }

    #[test]
    fn test_unregister_then_get_is_absent() {
        let registry = CapabilityRegistry::new();
        registry.register(static_capability("gh", "list_repos"));
        assert!(registry.unregister_tool("gh__list_repos").is_some());
        assert!(registry.get_tool("gh__list_repos").is_none());
        assert!(registry.unregister_tool("gh__list_repos").is_none());
    }

    #[test]
    fn test_reregister_replaces_entry() {
        let registry = CapabilityRegistry::new();
        registry.register(static_capability("gh", "list_repos"));
        let mut replacement = static_capability("gh", "list_repos");
        replacement.origin_server = "gh-mirror".to_string();
        registry.register(replacement);
        assert_eq!(registry.list_tools().len(), 1);
        assert_eq!(
            registry.get_tool("gh__list_repos").unwrap().origin_server,
            "gh-mirror"
        );
    }

    #[test]
    fn test_kinds_are_separate_namespaces() {
        let registry = CapabilityRegistry::new();
        registry.register(static_capability("fs", "x"));
        registry.register(static_resource("fs", "x"));
        assert_eq!(registry.list_tools().len(), 1);
        assert_eq!(registry.list_resources().len(), 1);
        assert!(registry.get_prompt("fs__x").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_server_leaves_other_servers() {
        let registry = CapabilityRegistry::new();
        registry.register(static_capability("a", "one"));
        registry.register(static_capability("a", "two"));
        registry.register(static_resource("a", "file:///x"));
        registry.register(static_capability("b", "one"));

        assert_eq!(registry.count_for_server("a"), 3);
        assert_eq!(registry.remove_server("a"), 3);
        assert_eq!(registry.count_for_server("a"), 0);
        assert_eq!(registry.count_for_server("b"), 1);
    }

    #[test]
    fn test_concurrent_register_and_list() {
        let registry = Arc::new(CapabilityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        registry.register(static_capability(&format!("s{i}"), &format!("t{j}")));
                        let _ = registry.list_tools();
                    }
                    registry.remove_server(&format!("s{i}"));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
