//! Concourse: session-scoped MCP gateway.
//! Connects to a changing set of upstream MCP servers over STDIO and HTTP,
//! merges their tools, resources and prompts into one namespaced catalog,
//! applies role/agent access control, and proxies calls back upstream behind
//! per-server timeouts, circuit breakers and reconnect backoff.

pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod namespace;
pub mod proxy;
pub mod rbac;
pub mod registry;
pub mod standalone;
pub mod stats;
pub mod transport;
pub mod upstream;

#[cfg(test)]
mod test_support;

pub use bridge::{CapabilityBridge, normalize_schema};
pub use config::{
    GatewayConfig, ProxyConfig, ReconnectConfig, ServerConfig, ServerLifecycle, TransportKind,
    parse_env_ref, resolve_env_vars,
};
pub use error::{ConcourseError, Result, UpstreamError};
pub use gateway::{CapabilityListing, Gateway, StatusReport};
pub use manager::{ConnectionManager, backoff_delay};
pub use proxy::{CircuitSnapshot, CircuitState, ProxyInvoker};
pub use rbac::{AccessDecision, AccessPolicy, SessionContext, evaluate};
pub use registry::{Capability, CapabilityKind, CapabilityRegistry};
pub use standalone::config_watch::{ServerEvent, diff_servers, load_config, run_config_watch};
pub use standalone::server::GatewayMcpServer;
pub use stats::{ServerStatus, StatsCollector, StatsSnapshot};
pub use transport::{Connector, RmcpConnector};
pub use upstream::{RmcpUpstream, Upstream};
