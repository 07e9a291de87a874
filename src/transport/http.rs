//! Streamable HTTP transport for upstream MCP servers.
//!
//! HTTP servers are simpler than STDIO: no subprocess management, no
//! noisy-server filtering. Configured headers are resolved from env refs and
//! attached to every request through a dedicated reqwest client.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::ServiceExt;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, resolve_env_vars};
use crate::error::ConcourseError;
use crate::upstream::RmcpUpstream;

/// Build the header map sent with every request to the upstream.
fn build_headers(config: &ServerConfig) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in resolve_env_vars(&config.headers) {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            ConcourseError::InvalidConfig(config.name.clone(), format!("header '{}': {}", key, e))
        })?;
        let value = HeaderValue::from_str(&value).map_err(|e| {
            ConcourseError::InvalidConfig(config.name.clone(), format!("header '{}': {}", key, e))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Connect to a remote Streamable HTTP MCP server and perform the handshake.
pub async fn open_http(
    config: &ServerConfig,
    cancel: CancellationToken,
) -> crate::Result<RmcpUpstream> {
    let name = config.name.as_str();
    let url = config.url.as_ref().ok_or_else(|| {
        ConcourseError::InvalidConfig(
            name.to_string(),
            "HTTP transport requires 'url' field".to_string(),
        )
    })?;

    let headers = build_headers(config)?;
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| ConcourseError::Transport(name.to_string(), e.to_string()))?;
    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url.as_str()),
    );

    tracing::debug!(server = %name, url = %url, "opening Streamable HTTP session");
    super::finish_handshake(config, ().serve_with_ct(transport, cancel.clone()), None, cancel).await
}
