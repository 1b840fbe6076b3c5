//! Diagnostic trail of failed verification attempts.
//!
//! Each recorded failure is appended as one JSON line carrying the
//! endpoint, the failure reason, the error text and whatever the engine
//! printed to stderr. Writes go through a `tokio::sync::Mutex` so the log
//! can be shared by every worker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::descriptor::{EndpointDescriptor, Protocol};
use crate::error::FailureReason;

// ---------------------------------------------------------------------------
// DiagnosticEntry
// ---------------------------------------------------------------------------

/// One failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub attempt_id: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub reason: FailureReason,
    pub error: String,
    /// Loopback port the engine was told to listen on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Captured engine stderr, trimmed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_stderr: Option<String>,
}

impl DiagnosticEntry {
    pub fn new(
        attempt_id: impl Into<String>,
        descriptor: &EndpointDescriptor,
        reason: FailureReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            attempt_id: attempt_id.into(),
            protocol: descriptor.protocol,
            host: descriptor.host.clone(),
            port: descriptor.port,
            reason,
            error: error.into(),
            local_port: None,
            engine_stderr: None,
        }
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Attach engine stderr; blank output is not recorded.
    pub fn with_engine_stderr(mut self, stderr: &str) -> Self {
        let trimmed = stderr.trim();
        if !trimmed.is_empty() {
            self.engine_stderr = Some(trimmed.to_string());
        }
        self
    }
}

// ---------------------------------------------------------------------------
// DiagnosticLog
// ---------------------------------------------------------------------------

/// Append-only JSON-lines sink.
pub struct DiagnosticLog {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl DiagnosticLog {
    /// Open (or create) the log at `path` in append mode, creating parent
    /// directories as needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create diagnostic log directory: {}", parent.display())
            })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open diagnostic log: {}", path.display()))?;

        debug!(path = %path.display(), "diagnostic log opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub async fn record(&self, entry: DiagnosticEntry) -> Result<()> {
        let mut line = serde_json::to_string(&entry).context("failed to serialize diagnostic entry")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write diagnostic log: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush diagnostic log: {}", self.path.display()))?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DiagnosticLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticLog").field("path", &self.path).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn endpoint() -> EndpointDescriptor {
        EndpointDescriptor::new(Protocol::Trojan, "t.example", 443, "pw")
    }

    #[tokio::test]
    async fn test_entries_are_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/diag.jsonl");
        let log = DiagnosticLog::open(&path).await.unwrap();

        log.record(
            DiagnosticEntry::new("a-1", &endpoint(), FailureReason::StartTimeout, "no port")
                .with_local_port(40000)
                .with_engine_stderr("FATAL something\n"),
        )
        .await
        .unwrap();
        log.record(DiagnosticEntry::new("a-2", &endpoint(), FailureReason::ProbeFailure, "503"))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: DiagnosticEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.reason, FailureReason::StartTimeout);
        assert_eq!(first.local_port, Some(40000));
        assert_eq!(first.engine_stderr.as_deref(), Some("FATAL something"));

        assert!(!lines[1].contains("engine_stderr"));
        assert!(!lines[1].contains("local_port"));
    }

    #[test]
    fn test_blank_stderr_is_dropped() {
        let e = DiagnosticEntry::new("x", &endpoint(), FailureReason::ProcessError, "exit 1")
            .with_engine_stderr("  \n");
        assert!(e.engine_stderr.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("diag.jsonl");
        let log = Arc::new(DiagnosticLog::open(&path).await.unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let log = Arc::clone(&log);
            tasks.spawn(async move {
                let entry = DiagnosticEntry::new(format!("w-{i}"), &endpoint(), FailureReason::ProbeFailure, "x".repeat(2048));
                log.record(entry).await.unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<DiagnosticEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 16);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("diag.jsonl");
        for id in ["first", "second"] {
            let log = DiagnosticLog::open(&path).await.unwrap();
            log.record(DiagnosticEntry::new(id, &endpoint(), FailureReason::DialFailure, "refused"))
                .await
                .unwrap();
        }
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
