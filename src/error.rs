//! Error types for Concourse gateway operations.

use thiserror::Error;

/// Main error type for Concourse operations.
///
/// Every caller-visible failure maps to exactly one variant, so the session
/// layer can tell a timeout from an open circuit from an authorization denial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcourseError {
    /// Invalid configuration for a named server
    #[error("invalid config for server '{0}': {1}")]
    InvalidConfig(String, String),

    /// Transport could not be opened for a named server
    #[error("transport error for server '{0}': {1}")]
    Transport(String, String),

    /// MCP handshake failed for a named server
    #[error("initialization failed for server '{0}': {1}")]
    InitializationFailed(String, String),

    /// Call to a named server timed out
    #[error("call timeout for server '{0}'")]
    CallTimeout(String),

    /// Circuit breaker for a named server is open; upstream was not called
    #[error("circuit open for server '{0}'")]
    CircuitOpen(String),

    /// No capability registered under the given ID
    #[error("capability not found: {0}")]
    NotFound(String),

    /// Caller identity is not permitted to use the capability
    #[error("access denied for '{0}': {1}")]
    Forbidden(String, String),

    /// Upstream returned an error (transport or application level)
    #[error("upstream error from server '{0}': {1}")]
    Upstream(String, String),

    /// Gateway is shutting down
    #[error("gateway shutting down")]
    ShuttingDown,
}

/// Failure reported at the upstream protocol boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Upstream does not implement the requested method (JSON-RPC -32601)
    #[error("method not supported")]
    MethodNotSupported,

    /// Any other upstream failure
    #[error("{0}")]
    Failed(String),
}

impl UpstreamError {
    /// Convert into a gateway error attributed to `server`.
    pub fn into_gateway(self, server: &str) -> ConcourseError {
        ConcourseError::Upstream(server.to_string(), self.to_string())
    }
}

/// Result type alias for Concourse operations
pub type Result<T> = std::result::Result<T, ConcourseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = ConcourseError::InvalidConfig(
            "gh".to_string(),
            "STDIO transport requires 'command' field".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid config for server 'gh': STDIO transport requires 'command' field"
        );
    }

    #[test]
    fn test_call_timeout_display() {
        let err = ConcourseError::CallTimeout("gh".to_string());
        assert_eq!(err.to_string(), "call timeout for server 'gh'");
    }

    #[test]
    fn test_circuit_open_is_distinct_from_upstream() {
        let open = ConcourseError::CircuitOpen("gh".to_string());
        let upstream = UpstreamError::Failed("boom".to_string()).into_gateway("gh");
        assert_ne!(open, upstream);
        assert_eq!(upstream.to_string(), "upstream error from server 'gh': boom");
    }
}
