//! Transport selection for upstream MCP servers.
//!
//! Each submodule opens one transport type and hands back a connected
//! [`RmcpUpstream`](crate::upstream::RmcpUpstream). The [`Connector`] trait is
//! the seam the connection manager opens transports through.

pub mod http;
pub mod stdio;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::RoleClient;
use rmcp::service::RunningService;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, TransportKind};
use crate::error::ConcourseError;
use crate::upstream::{RmcpUpstream, Upstream};

/// Opens a connected upstream session for a server config.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        config: &ServerConfig,
        cancel: CancellationToken,
    ) -> crate::Result<Arc<dyn Upstream>>;
}

/// Production connector: STDIO child processes and Streamable HTTP via rmcp.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmcpConnector;

#[async_trait]
impl Connector for RmcpConnector {
    async fn open(
        &self,
        config: &ServerConfig,
        cancel: CancellationToken,
    ) -> crate::Result<Arc<dyn Upstream>> {
        config.validate()?;
        let upstream = match config.transport {
            TransportKind::Stdio => stdio::open_stdio(config, cancel).await?,
            TransportKind::Http => http::open_http(config, cancel).await?,
        };
        Ok(Arc::new(upstream))
    }
}

/// Await an rmcp client handshake under the server's handshake timeout.
///
/// Any failure cancels `cancel`, which stops the transport's helper tasks and
/// (through `kill_on_drop`) the child process.
pub(crate) async fn finish_handshake<F, E>(
    config: &ServerConfig,
    handshake: F,
    child: Option<Child>,
    cancel: CancellationToken,
) -> crate::Result<RmcpUpstream>
where
    F: Future<Output = Result<RunningService<RoleClient, ()>, E>>,
    E: Display,
{
    let limit = Duration::from_secs(config.handshake_timeout_secs);
    let failure = match tokio::time::timeout(limit, handshake).await {
        Ok(Ok(running)) => {
            tracing::info!(
                server = %config.name,
                transport = ?config.transport,
                "MCP handshake complete"
            );
            return Ok(RmcpUpstream::new(&config.name, running, child, cancel));
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!(
            "MCP handshake timed out after {}s",
            config.handshake_timeout_secs
        ),
    };
    cancel.cancel();
    Err(ConcourseError::InitializationFailed(
        config.name.clone(),
        failure,
    ))
}
