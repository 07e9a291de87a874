//! GatewayMcpServer: rmcp ServerHandler backed by a [`Gateway`].
//!
//! Tool, resource, and prompt requests are delegated to the gateway with the
//! caller's identity. On Streamable HTTP sessions the identity is read from
//! the `x-concourse-roles` / `x-concourse-agent` request headers; STDIO
//! sessions use the identity the server was started with.
//!
//! The identity headers are taken as given: any client that can reach the
//! HTTP listener can claim any role or agent name. `concourse serve` must sit
//! behind a proxy that authenticates callers and sets (or strips) these
//! headers itself. The default bind address is loopback only.
//!
//! Connected MCP client peers are stored in a shared Vec so the config watcher
//! can broadcast list-changed notifications after each change.

use std::sync::Arc;

use axum::http::request::Parts;
use rmcp::ErrorData as McpError;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    AnnotateAble, CallToolRequestParams, CallToolResult, Content, GetPromptRequestParams,
    GetPromptResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParams, RawResource, ReadResourceRequestParams, ReadResourceResult, Resource,
    ResourceContents, ServerCapabilities, ServerInfo,
};
use rmcp::service::{NotificationContext, Peer, RequestContext, RoleServer};

use crate::error::ConcourseError;
use crate::gateway::Gateway;
use crate::rbac::SessionContext;

/// Header carrying the caller's comma-separated roles.
pub const ROLES_HEADER: &str = "x-concourse-roles";
/// Header carrying the caller's agent name.
pub const AGENT_HEADER: &str = "x-concourse-agent";
/// URI of the built-in JSON status resource.
pub const STATUS_URI: &str = "concourse://status";

/// Connected session peers, shared with the config watcher.
pub type PeerList = Arc<tokio::sync::Mutex<Vec<Peer<RoleServer>>>>;

/// MCP server exposing one gateway to any number of sessions.
///
/// `StreamableHttpService` calls the factory closure per session; every clone
/// shares the same gateway and peer list.
#[derive(Clone)]
pub struct GatewayMcpServer {
    gateway: Arc<Gateway>,
    /// Identity used when the request carries no HTTP parts (STDIO).
    default_identity: SessionContext,
    peers: PeerList,
}

impl GatewayMcpServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            default_identity: SessionContext::default(),
            peers: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn with_identity(mut self, identity: SessionContext) -> Self {
        self.default_identity = identity;
        self
    }

    /// Return the peers handle for the config watcher to broadcast notifications.
    pub fn peers_handle(&self) -> PeerList {
        self.peers.clone()
    }

    fn session_context(&self, context: &RequestContext<RoleServer>) -> SessionContext {
        identity_from_parts(context.extensions.get::<Parts>(), &self.default_identity)
    }

    fn status_resource() -> Resource {
        let mut raw = RawResource::new(STATUS_URI, "concourse-status");
        raw.description = Some("Gateway server, capability and circuit statistics".into());
        raw.mime_type = Some("application/json".into());
        raw.no_annotation()
    }

    fn read_status(&self) -> Result<ReadResourceResult, McpError> {
        let json = serde_json::to_string_pretty(&self.gateway.status())
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(json, STATUS_URI)],
        })
    }
}

/// Caller identity from HTTP request parts, or `default` when there are none.
pub fn identity_from_parts(parts: Option<&Parts>, default: &SessionContext) -> SessionContext {
    let Some(parts) = parts else {
        return default.clone();
    };
    let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
    SessionContext::from_header_values(header(ROLES_HEADER), header(AGENT_HEADER))
}

/// Protocol-level error for failures that are not reported as tool results.
fn to_mcp_error(err: ConcourseError) -> McpError {
    match err {
        ConcourseError::NotFound(_) => McpError::invalid_params(err.to_string(), None),
        ConcourseError::Forbidden(_, _) => McpError::invalid_request(err.to_string(), None),
        _ => McpError::internal_error(err.to_string(), None),
    }
}

impl ServerHandler for GatewayMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: "concourse".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Concourse MCP gateway: tools, resources and prompts from many upstream servers, namespaced as <server>__<name>."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_prompts()
                .enable_prompts_list_changed()
                .enable_resources()
                .enable_resources_list_changed()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let ctx = self.session_context(&context);
        Ok(ListToolsResult {
            tools: self.gateway.list_capabilities(&ctx).tools,
            next_cursor: None,
            meta: None,
        })
    }

    /// Call a tool by namespaced name. Upstream-side failures (timeouts, open
    /// circuits, upstream errors) come back as error tool results.
    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let ctx = self.session_context(&context);
        match self
            .gateway
            .call_tool(&request.name, request.arguments, &ctx)
            .await
        {
            Ok(result) => Ok(result),
            Err(
                e @ (ConcourseError::Upstream(_, _)
                | ConcourseError::CallTimeout(_)
                | ConcourseError::CircuitOpen(_)),
            ) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
            Err(e) => Err(to_mcp_error(e)),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let ctx = self.session_context(&context);
        let mut resources = vec![Self::status_resource()];
        resources.extend(self.gateway.list_capabilities(&ctx).resources);
        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        if request.uri == STATUS_URI {
            return self.read_status();
        }
        let ctx = self.session_context(&context);
        self.gateway
            .read_resource(&request.uri, &ctx)
            .await
            .map_err(to_mcp_error)
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let ctx = self.session_context(&context);
        Ok(ListPromptsResult {
            prompts: self.gateway.list_capabilities(&ctx).prompts,
            next_cursor: None,
            meta: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let ctx = self.session_context(&context);
        self.gateway
            .get_prompt(&request.name, request.arguments, &ctx)
            .await
            .map_err(to_mcp_error)
    }

    /// Store the connected peer for later list-changed notifications.
    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        tracing::info!("MCP client initialized, storing peer for list-changed notifications");
        self.peers.lock().await.push(context.peer.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::test_support::MockConnector;
    use crate::transport::Connector;

    fn make_server() -> GatewayMcpServer {
        let connector: Arc<dyn Connector> = Arc::new(MockConnector::new());
        GatewayMcpServer::new(Arc::new(Gateway::new(&GatewayConfig::default(), connector)))
    }

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = axum::http::Request::builder().uri("/mcp");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_get_info_advertises_all_kinds() {
        let info = make_server().get_info();
        assert_eq!(info.server_info.name, "concourse");
        assert!(info.capabilities.tools.is_some());
        assert!(info.capabilities.resources.is_some());
        assert!(info.capabilities.prompts.is_some());
        assert!(info.instructions.is_some());
    }

    #[test]
    fn test_identity_from_headers() {
        let parts = parts(&[(ROLES_HEADER, "dev, admin"), (AGENT_HEADER, "triage-bot")]);
        let ctx = identity_from_parts(Some(&parts), &SessionContext::default());
        assert!(ctx.roles.contains("dev"));
        assert!(ctx.roles.contains("admin"));
        assert_eq!(ctx.agent_name.as_deref(), Some("triage-bot"));
    }

    #[test]
    fn test_http_request_without_headers_is_anonymous() {
        let default = SessionContext::new(["admin"], Some("cli"));
        let ctx = identity_from_parts(Some(&parts(&[])), &default);
        assert_eq!(ctx, SessionContext::default());
    }

    #[test]
    fn test_stdio_uses_default_identity() {
        let default = SessionContext::new(["ops"], None);
        assert_eq!(identity_from_parts(None, &default), default);
    }

    #[test]
    fn test_status_resource_is_json() {
        let server = make_server();
        let resource = GatewayMcpServer::status_resource();
        assert_eq!(resource.raw.uri, STATUS_URI);
        let result = server.read_status().unwrap();
        match &result.contents[0] {
            ResourceContents::TextResourceContents { text, .. } => {
                let json: serde_json::Value = serde_json::from_str(text).unwrap();
                assert!(json["servers"].is_object());
                assert!(json["circuits"].is_object());
            }
            other => panic!("expected text contents, got {:?}", other),
        }
    }

    #[test]
    fn test_error_mapping() {
        let err = to_mcp_error(ConcourseError::NotFound("x".into()));
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
        let err = to_mcp_error(ConcourseError::Forbidden("x".into(), "no".into()));
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_REQUEST);
        let err = to_mcp_error(ConcourseError::ShuttingDown);
        assert_eq!(err.code, rmcp::model::ErrorCode::INTERNAL_ERROR);
    }

    #[test]
    fn test_peers_handle_is_shared() {
        let server = make_server();
        let peers_handle = server.peers_handle();
        let server_clone = server.clone();

        assert!(Arc::ptr_eq(&server.peers, &peers_handle));
        assert!(Arc::ptr_eq(&server.peers, &server_clone.peers));
    }
}
