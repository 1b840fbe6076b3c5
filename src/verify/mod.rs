//! Verification of prefiltered candidates.
//!
//! A single attempt ([`Attempt`]) turns one descriptor into one
//! [`Outcome`]. [`pool::VerificationPool`] fans attempts out over a fixed
//! number of workers and [`rank::rank`] orders the successes.

pub mod pool;
pub mod rank;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::descriptor::EndpointDescriptor;
use crate::diagnostics::{DiagnosticEntry, DiagnosticLog};
use crate::engine::{ports, EngineAdapter};
use crate::error::{FailureReason, VerifyError};
use crate::probes::http::LatencyProber;

pub use self::pool::VerificationPool;
pub use self::rank::{rank, RankedEndpoint};

/// Terminal state of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { latency_ms: u64 },
    Failed { reason: FailureReason, detail: String },
}

impl Outcome {
    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        Outcome::Failed {
            reason,
            detail: detail.into(),
        }
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            Outcome::Succeeded { latency_ms } => Some(*latency_ms),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Outcome::Succeeded { .. } => None,
            Outcome::Failed { reason, .. } => Some(*reason),
        }
    }
}

impl From<&VerifyError> for Outcome {
    fn from(e: &VerifyError) -> Self {
        Outcome::failed(e.reason(), e.to_string())
    }
}

/// A descriptor together with the outcome of its attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub descriptor: EndpointDescriptor,
    pub outcome: Outcome,
}

impl ProbeResult {
    /// Pair `descriptor` with `outcome`, recording the latency on success.
    pub fn new(mut descriptor: EndpointDescriptor, outcome: Outcome) -> Self {
        if let Some(ms) = outcome.latency_ms() {
            descriptor.latency_ms = Some(ms);
        }
        Self { descriptor, outcome }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }
}

/// One verification attempt for one descriptor.
///
/// Implementations never fail: every error is folded into
/// [`Outcome::Failed`].
#[async_trait::async_trait]
pub trait Attempt: Send + Sync {
    async fn attempt(&self, descriptor: &EndpointDescriptor) -> Outcome;
}

/// The production attempt: ephemeral port, engine, HTTP probe, teardown.
pub struct EngineAttempt {
    adapter: EngineAdapter,
    prober: LatencyProber,
    diagnostics: Option<Arc<DiagnosticLog>>,
}

impl EngineAttempt {
    pub fn new(adapter: EngineAdapter, prober: LatencyProber) -> Self {
        Self {
            adapter,
            prober,
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, log: Arc<DiagnosticLog>) -> Self {
        self.diagnostics = Some(log);
        self
    }

    async fn record(
        &self,
        attempt_id: &str,
        descriptor: &EndpointDescriptor,
        error: &VerifyError,
        local_port: Option<u16>,
        stderr: &str,
    ) {
        let Some(log) = &self.diagnostics else {
            return;
        };
        let mut entry = DiagnosticEntry::new(attempt_id, descriptor, error.reason(), error.to_string())
            .with_engine_stderr(stderr);
        if let Some(port) = local_port {
            entry = entry.with_local_port(port);
        }
        if let Err(e) = log.record(entry).await {
            warn!(attempt_id, error = %e, "failed to write diagnostic entry");
        }
    }
}

#[async_trait::async_trait]
impl Attempt for EngineAttempt {
    async fn attempt(&self, descriptor: &EndpointDescriptor) -> Outcome {
        let attempt_id = Uuid::new_v4().to_string();
        let attempt_id = attempt_id.as_str();

        let port = match ports::acquire() {
            Ok(port) => port,
            Err(e) => {
                warn!(attempt_id, error = %e, "no local port available");
                return Outcome::from(&e);
            }
        };

        let instance = match self.adapter.launch(descriptor, port, attempt_id).await {
            Ok(instance) => instance,
            Err(e) => {
                let stderr = e.engine_stderr().unwrap_or_default().to_string();
                self.record(attempt_id, descriptor, &e, Some(port), &stderr).await;
                return Outcome::from(&e);
            }
        };

        let local_port = instance.local_port();
        let measured = self.prober.measure(local_port).await;
        let stderr = instance.shutdown().await;

        match measured {
            Ok(latency) => {
                info!(
                    attempt_id,
                    endpoint = %descriptor.address(),
                    latency_ms = latency.millis,
                    attempt = latency.attempt,
                    "endpoint verified"
                );
                Outcome::Succeeded {
                    latency_ms: latency.millis,
                }
            }
            Err(e) => {
                if !e.is_plain_timeout() {
                    self.record(attempt_id, descriptor, &e, Some(local_port), &stderr).await;
                }
                Outcome::from(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Protocol;

    #[test]
    fn test_probe_result_sets_latency_once() {
        let d = EndpointDescriptor::new(Protocol::Vless, "h", 443, "id");
        let ok = ProbeResult::new(d.clone(), Outcome::Succeeded { latency_ms: 87 });
        assert!(ok.is_success());
        assert_eq!(ok.descriptor.latency_ms, Some(87));

        let failed = ProbeResult::new(d, Outcome::failed(FailureReason::ProbeFailure, "503"));
        assert!(!failed.is_success());
        assert_eq!(failed.descriptor.latency_ms, None);
        assert_eq!(failed.outcome.failure_reason(), Some(FailureReason::ProbeFailure));
    }

    #[test]
    fn test_outcome_from_error() {
        let e = VerifyError::StartTimeout {
            port: 1,
            waited_ms: 8000,
            pid: None,
            stderr: String::new(),
        };
        let o = Outcome::from(&e);
        assert_eq!(o.failure_reason(), Some(FailureReason::StartTimeout));
        assert_eq!(o.latency_ms(), None);
    }

    #[test]
    fn test_outcome_json_shape() {
        let v = serde_json::to_value(Outcome::Succeeded { latency_ms: 5 }).unwrap();
        assert_eq!(v, serde_json::json!({"status": "succeeded", "latency_ms": 5}));
        let v = serde_json::to_value(Outcome::failed(FailureReason::DialFailure, "refused")).unwrap();
        assert_eq!(v["reason"], "dial_failure");
    }
}
