//! Error taxonomy for the verification pipeline.
//!
//! [`FailureReason`] is the per-candidate tag carried by a failed
//! [`ProbeResult`](crate::verify::ProbeResult). [`VerifyError`] is what the
//! library functions return; every variant except
//! [`VerifyError::EngineNotFound`] is folded into a `FailureReason` at the
//! attempt boundary and never escapes a single candidate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single candidate failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A TCP connect (prefilter or local proxy) failed or timed out.
    DialFailure,
    /// The engine never opened its local port before the startup deadline.
    StartTimeout,
    /// The engine failed to launch, exited before readiness, or the
    /// candidate could not be rendered into an engine config.
    ProcessError,
    /// The HTTP probe exhausted its retries.
    ProbeFailure,
    /// No local port could be allocated.
    ResourceExhaustion,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DialFailure => "dial_failure",
            FailureReason::StartTimeout => "start_timeout",
            FailureReason::ProcessError => "process_error",
            FailureReason::ProbeFailure => "probe_failure",
            FailureReason::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the pipeline stages.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("probe engine not found at {path}")]
    EngineNotFound { path: String },

    #[error("local port allocation failed: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("cannot build engine outbound: {0}")]
    Outbound(#[from] crate::engine::outbound::OutboundError),

    #[error("failed to write engine config: {0}")]
    ConfigWrite(#[source] std::io::Error),

    #[error("failed to spawn engine '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine exited before readiness ({status})")]
    EarlyExit {
        status: String,
        pid: Option<u32>,
        stderr: String,
    },

    #[error("engine did not open port {port} within {waited_ms}ms")]
    StartTimeout {
        port: u16,
        waited_ms: u64,
        pid: Option<u32>,
        stderr: String,
    },

    #[error("local proxy on port {port} refused connection: {message}")]
    LocalDial { port: u16, message: String },

    #[error("http probe failed after {attempts} attempt(s): {message}")]
    Probe {
        attempts: u32,
        message: String,
        timed_out: bool,
    },
}

impl VerifyError {
    /// Map this error onto the per-candidate failure tag.
    pub fn reason(&self) -> FailureReason {
        match self {
            VerifyError::PortAllocation(_) => FailureReason::ResourceExhaustion,
            VerifyError::StartTimeout { .. } => FailureReason::StartTimeout,
            VerifyError::LocalDial { .. } => FailureReason::DialFailure,
            VerifyError::Probe { .. } => FailureReason::ProbeFailure,
            VerifyError::EngineNotFound { .. }
            | VerifyError::Outbound(_)
            | VerifyError::ConfigWrite(_)
            | VerifyError::Spawn { .. }
            | VerifyError::EarlyExit { .. } => FailureReason::ProcessError,
        }
    }

    /// Captured engine stderr, when the failure came from the child process.
    pub fn engine_stderr(&self) -> Option<&str> {
        match self {
            VerifyError::EarlyExit { stderr, .. } | VerifyError::StartTimeout { stderr, .. } => {
                Some(stderr.as_str())
            }
            _ => None,
        }
    }

    /// Pid of the engine that failed to come up. The process is already
    /// reaped when the error is returned.
    pub fn engine_pid(&self) -> Option<u32> {
        match self {
            VerifyError::EarlyExit { pid, .. } | VerifyError::StartTimeout { pid, .. } => *pid,
            _ => None,
        }
    }

    /// Plain request timeouts are the common case and stay out of the
    /// diagnostic log.
    pub fn is_plain_timeout(&self) -> bool {
        matches!(self, VerifyError::Probe { timed_out: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        let e = VerifyError::StartTimeout {
            port: 1080,
            waited_ms: 8000,
            pid: Some(42),
            stderr: String::new(),
        };
        assert_eq!(e.reason(), FailureReason::StartTimeout);
        assert_eq!(e.engine_pid(), Some(42));

        let e = VerifyError::Probe {
            attempts: 2,
            message: "timeout".into(),
            timed_out: true,
        };
        assert_eq!(e.reason(), FailureReason::ProbeFailure);
        assert!(e.is_plain_timeout());

        let e = VerifyError::PortAllocation(std::io::Error::other("no fds"));
        assert_eq!(e.reason(), FailureReason::ResourceExhaustion);
    }

    #[test]
    fn test_engine_stderr_only_for_child_failures() {
        let e = VerifyError::EarlyExit {
            status: "exit status: 1".into(),
            pid: None,
            stderr: "FATAL bind: address already in use".into(),
        };
        assert_eq!(e.engine_stderr(), Some("FATAL bind: address already in use"));
        let e = VerifyError::LocalDial {
            port: 1,
            message: "refused".into(),
        };
        assert!(e.engine_stderr().is_none());
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::ResourceExhaustion).unwrap();
        assert_eq!(json, "\"resource_exhaustion\"");
        assert_eq!(FailureReason::DialFailure.to_string(), "dial_failure");
    }
}
