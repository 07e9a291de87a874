//! The upstream protocol boundary.
//!
//! [`Upstream`] is everything the gateway needs from one connected MCP
//! server. [`RmcpUpstream`] implements it over an rmcp client session.

use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ErrorCode, GetPromptRequestParams, GetPromptResult,
    JsonObject, Prompt, ReadResourceRequestParams, ReadResourceResult, Resource, Tool,
};
use rmcp::service::RunningService;
use rmcp::{Peer, RoleClient, ServiceError};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::UpstreamError;

/// Discovery and invocation operations offered by one upstream server.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError>;
    async fn list_resources(&self) -> Result<Vec<Resource>, UpstreamError>;
    async fn list_prompts(&self) -> Result<Vec<Prompt>, UpstreamError>;
    async fn call_tool(
        &self,
        name: &str,
        args: Option<JsonObject>,
    ) -> Result<CallToolResult, UpstreamError>;
    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, UpstreamError>;
    async fn get_prompt(
        &self,
        name: &str,
        args: Option<JsonObject>,
    ) -> Result<GetPromptResult, UpstreamError>;
    async fn close(&self) -> Result<(), UpstreamError>;
    /// Resolves once the session has ended, whether through `close` or
    /// because the server went away.
    async fn closed(&self);
}

impl From<ServiceError> for UpstreamError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::McpError(data) if data.code == ErrorCode::METHOD_NOT_FOUND => {
                UpstreamError::MethodNotSupported
            }
            other => UpstreamError::Failed(other.to_string()),
        }
    }
}

/// Longest `close` waits for the rmcp service loop to stop.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// An open rmcp client session with one upstream server.
///
/// The service loop is awaited by a background task; `exited` fires when it
/// ends, which for STDIO servers includes the child closing its stdout. The
/// child process is held here so it is killed on close.
pub struct RmcpUpstream {
    name: String,
    peer: Peer<RoleClient>,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    exited: CancellationToken,
}

impl RmcpUpstream {
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: &str,
        running: RunningService<RoleClient, ()>,
        child: Option<Child>,
        cancel: CancellationToken,
    ) -> Self {
        let peer = running.peer().clone();
        let exited = CancellationToken::new();
        let done = exited.clone();
        let server = name.to_string();
        tokio::spawn(async move {
            match running.waiting().await {
                Ok(reason) => tracing::debug!(server = %server, ?reason, "upstream session ended"),
                Err(e) => tracing::warn!(server = %server, error = %e, "upstream session task failed"),
            }
            done.cancel();
        });
        Self {
            name: name.to_string(),
            peer,
            child: Mutex::new(child),
            cancel,
            exited,
        }
    }
}

#[async_trait]
impl Upstream for RmcpUpstream {
    async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError> {
        Ok(self.peer.list_all_tools().await?)
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, UpstreamError> {
        Ok(self.peer.list_all_resources().await?)
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>, UpstreamError> {
        Ok(self.peer.list_all_prompts().await?)
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Option<JsonObject>,
    ) -> Result<CallToolResult, UpstreamError> {
        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments: args,
            task: None,
            meta: None,
        };
        Ok(self.peer.call_tool(params).await?)
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, UpstreamError> {
        let params = ReadResourceRequestParams {
            uri: uri.to_string(),
            meta: None,
        };
        Ok(self.peer.read_resource(params).await?)
    }

    async fn get_prompt(
        &self,
        name: &str,
        args: Option<JsonObject>,
    ) -> Result<GetPromptResult, UpstreamError> {
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments: args,
            meta: None,
        };
        Ok(self.peer.get_prompt(params).await?)
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.cancel.cancel();
        let result = tokio::time::timeout(CLOSE_GRACE, self.exited.cancelled())
            .await
            .map_err(|_| UpstreamError::Failed("session did not stop in time".to_string()));
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(server = %self.name, error = %e, "failed to kill child process");
            }
        }
        result
    }

    async fn closed(&self) {
        self.exited.cancelled().await;
    }
}
