//! Concourse gateway configuration: deserialization and validation.

use crate::error::ConcourseError;
use crate::rbac::AccessPolicy;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Unknown variables resolve to the empty string (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(), // caught by validate(), but handle gracefully
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level gateway configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Upstream servers keyed by server name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Timeout and circuit-breaker settings shared by every upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

/// Reconnect backoff and self-healing monitor settings.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the computed delay applied as ± jitter, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Period of the self-healing monitor. 0 disables it.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

/// Configuration for a single upstream MCP server.
///
/// Immutable per connection attempt; an update replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Filled from the `[servers.<name>]` table key by [`GatewayConfig::from_toml_str`].
    #[serde(default)]
    pub name: String,
    /// `false` means the transport is explicitly disabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub status: ServerLifecycle,
    pub transport: TransportKind,
    // STDIO fields
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    // HTTP fields
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    // Access control
    #[serde(default)]
    pub required_roles: BTreeSet<String>,
    #[serde(default)]
    pub agent_allowlist: BTreeSet<String>,
    /// Item-level policies keyed by the upstream (un-namespaced) capability name.
    #[serde(default)]
    pub capabilities: HashMap<String, AccessPolicy>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

/// Supported upstream transport types.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

/// Lifecycle status supplied by the configuration source.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerLifecycle {
    #[default]
    Active,
    Inactive,
}

fn default_enabled() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_monitor_interval_secs() -> u64 {
    60
}

impl ServerConfig {
    fn blank(name: &str, transport: TransportKind) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            status: ServerLifecycle::Active,
            transport,
            command: None,
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            required_roles: BTreeSet::new(),
            agent_allowlist: BTreeSet::new(),
            capabilities: HashMap::new(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }

    /// A STDIO server launched with `command`.
    pub fn stdio(name: &str, command: &str) -> Self {
        let mut config = Self::blank(name, TransportKind::Stdio);
        config.command = Some(command.to_string());
        config
    }

    /// A Streamable HTTP server reachable at `url`.
    pub fn http(name: &str, url: &str) -> Self {
        let mut config = Self::blank(name, TransportKind::Http);
        config.url = Some(url.to_string());
        config
    }

    /// Whether a connection should be opened for this config at all.
    pub fn is_active(&self) -> bool {
        self.enabled && self.status == ServerLifecycle::Active
    }

    /// Server-level access policy.
    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            required_roles: self.required_roles.clone(),
            agent_allowlist: self.agent_allowlist.clone(),
        }
    }

    /// Item-level access policy for an upstream capability name (empty if unset).
    pub fn item_policy(&self, upstream_name: &str) -> AccessPolicy {
        self.capabilities
            .get(upstream_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Validate a single server config. Inactive or disabled servers are not checked.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        let name = &self.name;

        if name.is_empty()
            || name.contains("__")
            || !name.chars().all(|c| c.is_alphanumeric() || c == '-')
        {
            return Err(ConcourseError::InvalidConfig(
                name.clone(),
                "name must be non-empty alphanumeric with hyphens, no double underscores"
                    .to_string(),
            ));
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(str::is_empty) {
                    return Err(ConcourseError::InvalidConfig(
                        name.clone(),
                        "STDIO transport requires 'command' field".to_string(),
                    ));
                }
                if self.url.is_some() {
                    return Err(ConcourseError::InvalidConfig(
                        name.clone(),
                        "STDIO transport should not have 'url' field".to_string(),
                    ));
                }
            }
            TransportKind::Http => {
                if self.url.as_deref().is_none_or(str::is_empty) {
                    return Err(ConcourseError::InvalidConfig(
                        name.clone(),
                        "HTTP transport requires 'url' field".to_string(),
                    ));
                }
                if self.command.is_some() {
                    return Err(ConcourseError::InvalidConfig(
                        name.clone(),
                        "HTTP transport should not have 'command' field".to_string(),
                    ));
                }
            }
        }

        for (label, map) in [("env", &self.env), ("header", &self.headers)] {
            for (key, value) in map {
                if parse_env_ref(value).is_none() {
                    return Err(ConcourseError::InvalidConfig(
                        name.clone(),
                        format!(
                            "{} value for key '{}' must be a ${{VAR}} reference, got '{}'",
                            label, key, value
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl GatewayConfig {
    /// Parse TOML and fill each server's `name` from its table key.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let mut config: GatewayConfig = toml::from_str(content)
            .map_err(|e| ConcourseError::InvalidConfig("config".into(), e.to_string()))?;
        for (key, server) in config.servers.iter_mut() {
            server.name = key.clone();
        }
        Ok(config)
    }

    /// Validate the config, failing fast on misconfigurations before any servers are opened.
    pub fn validate(&self) -> crate::Result<()> {
        if self.proxy.timeout_ms == 0 || self.proxy.failure_threshold == 0 {
            return Err(ConcourseError::InvalidConfig(
                "proxy".into(),
                "timeout_ms and failure_threshold must be > 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConcourseError::InvalidConfig(
                "reconnect".into(),
                format!("jitter {} must be within [0, 1]", self.reconnect.jitter),
            ));
        }

        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConcourseError::InvalidConfig(
                "reconnect".into(),
                "base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }

        for server in self.servers.values() {
            server.validate()?;
        }

        Ok(())
    }
}
