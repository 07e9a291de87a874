//! Resilient upstream invocation: timeout race plus per-server circuit breaking.
//!
//! Breaker state machine per server:
//! - Closed: calls pass; `failure_threshold` consecutive failures open it.
//! - Open: calls fail fast with `CircuitOpen` until `reset_timeout_ms` has
//!   passed since the last failure, then the next call becomes the probe.
//! - HalfOpen: exactly one probe is in flight; its success closes the
//!   circuit, its failure re-opens it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::error::{ConcourseError, UpstreamError};
use crate::stats::StatsCollector;

/// Implemented by upstream responses so the invoker can classify and size them.
pub trait UpstreamResponse {
    /// Whether the payload signals an application-level error.
    fn is_application_error(&self) -> bool {
        false
    }

    /// Message describing an application-level error.
    fn error_message(&self) -> String {
        "upstream reported an error".to_string()
    }

    /// Size of the response for statistics.
    fn response_size(&self) -> Option<usize> {
        None
    }
}

/// Map a raw upstream outcome to a gateway result. Application-level errors
/// in an otherwise successful response become `Upstream` errors.
pub fn classify<T: UpstreamResponse>(
    server: &str,
    outcome: Result<T, UpstreamError>,
) -> crate::Result<T> {
    match outcome {
        Ok(response) if response.is_application_error() => Err(ConcourseError::Upstream(
            server.to_string(),
            response.error_message(),
        )),
        Ok(response) => Ok(response),
        Err(e) => Err(e.into_gateway(server)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-server breaker state. Created lazily in `Closed` with zero failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

enum Admission {
    Pass,
    Probe,
    Reject,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            probe_started_at: None,
        }
    }
}

impl CircuitBreaker {
    fn admit(&mut self, now: Instant, config: &ProxyConfig) -> Admission {
        let reset = Duration::from_millis(config.reset_timeout_ms);
        match self.state {
            CircuitState::Closed => Admission::Pass,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                if elapsed > reset {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started_at = Some(now);
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                // A probe whose caller went away never reports back; after a
                // full call timeout another caller may take over the probe.
                let probe_alive = self.probe_started_at.is_some_and(|at| {
                    now.saturating_duration_since(at) <= Duration::from_millis(config.timeout_ms)
                });
                if probe_alive {
                    Admission::Reject
                } else {
                    self.probe_started_at = Some(now);
                    Admission::Probe
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probe_started_at = None;
    }

    fn record_failure(&mut self, now: Instant, threshold: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        self.probe_started_at = None;
        if self.consecutive_failures >= threshold {
            self.state = CircuitState::Open;
        } else if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Wraps upstream calls with a timeout and per-server circuit breaking.
///
/// Every completed call (success, failure, or timeout) is reported to the
/// statistics collector; fast-failed calls on an open circuit are not.
pub struct ProxyInvoker {
    config: ProxyConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    stats: Arc<StatsCollector>,
}

impl ProxyInvoker {
    pub fn new(config: ProxyConfig, stats: Arc<StatsCollector>) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            stats,
        }
    }

    /// Current breaker state for `server`, if one has been created.
    pub fn circuit(&self, server: &str) -> Option<CircuitSnapshot> {
        self.breakers.lock().get(server).map(CircuitBreaker::snapshot)
    }

    /// All breakers, for status reporting.
    pub fn circuits(&self) -> HashMap<String, CircuitSnapshot> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }

    /// Run `call` against `server` with timeout and circuit breaking.
    ///
    /// The call runs as its own task. If the timeout wins the race the task is
    /// detached, not aborted, and its eventual result is dropped.
    pub async fn invoke<T, Fut>(
        &self,
        server: &str,
        capability_id: &str,
        call: Fut,
    ) -> crate::Result<T>
    where
        T: UpstreamResponse + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        let admission = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(server.to_string()).or_default();
            breaker.admit(Instant::now(), &self.config)
        };

        match admission {
            Admission::Reject => {
                tracing::debug!(server = %server, capability = %capability_id, "circuit open, failing fast");
                return Err(ConcourseError::CircuitOpen(server.to_string()));
            }
            Admission::Probe => {
                tracing::info!(server = %server, capability = %capability_id, "circuit half-open, probing upstream");
            }
            Admission::Pass => {}
        }

        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let handle = tokio::spawn(call);

        let result: crate::Result<T> = tokio::select! {
            joined = handle => match joined {
                Ok(outcome) => classify(server, outcome),
                Err(join_err) => Err(ConcourseError::Upstream(server.to_string(), join_err.to_string())),
            },
            _ = tokio::time::sleep(timeout) => Err(ConcourseError::CallTimeout(server.to_string())),
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.complete(server, capability_id, duration_ms, &result);
        result
    }

    fn complete<T: UpstreamResponse>(
        &self,
        server: &str,
        capability_id: &str,
        duration_ms: u64,
        result: &crate::Result<T>,
    ) {
        let (is_error, size) = match result {
            Ok(response) => (false, response.response_size()),
            Err(_) => (true, None),
        };

        {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(server.to_string()).or_default();
            let was = breaker.state;
            if is_error {
                breaker.record_failure(Instant::now(), self.config.failure_threshold);
            } else {
                breaker.record_success();
            }
            if was != breaker.state {
                tracing::warn!(
                    server = %server,
                    from = ?was,
                    to = ?breaker.state,
                    consecutive_failures = breaker.consecutive_failures,
                    "circuit state changed"
                );
            }
        }

        if let Err(e) = result {
            tracing::warn!(server = %server, capability = %capability_id, error = %e, "upstream call failed");
        }

        self.stats
            .record_call(server, capability_id, duration_ms, is_error, size);
    }
}
