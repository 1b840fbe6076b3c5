//! Run summary and export of ranked endpoints.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::info;

use crate::error::FailureReason;
use crate::verify::{ProbeResult, RankedEndpoint};

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "count", rename_all = "snake_case")]
pub enum Verdict {
    /// Nothing was decoded from the input.
    NoCandidates,
    /// The prefilter dropped every candidate.
    NoneReachable,
    /// Some candidates were reachable, none passed the probe and ranking.
    NoneVerified,
    Verified(usize),
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::NoCandidates => write!(f, "no candidates found"),
            Verdict::NoneReachable => write!(f, "no candidate accepted a TCP connection"),
            Verdict::NoneVerified => write!(f, "no candidate passed verification"),
            Verdict::Verified(n) => write!(f, "{n} endpoint(s) verified"),
        }
    }
}

/// Counts collected across the pipeline stages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Unique candidates handed to the prefilter.
    pub scanned: usize,
    /// Candidates that accepted a TCP connection.
    pub reachable: usize,
    /// Successes under the latency threshold.
    pub verified: usize,
    /// Failure counts by reason.
    pub failures: BTreeMap<FailureReason, usize>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunSummary {
    pub fn new(scanned: usize, reachable: usize) -> Self {
        Self {
            scanned,
            reachable,
            ..Self::default()
        }
    }

    /// Fold in the orchestrator output and the ranked list derived from it.
    pub fn record(&mut self, results: &[ProbeResult], ranked: &[RankedEndpoint]) {
        for reason in results.iter().filter_map(|r| r.outcome.failure_reason()) {
            *self.failures.entry(reason).or_default() += 1;
        }
        self.verified = ranked.len();
    }

    pub fn verdict(&self) -> Verdict {
        if self.scanned == 0 {
            Verdict::NoCandidates
        } else if self.reachable == 0 {
            Verdict::NoneReachable
        } else if self.verified == 0 {
            Verdict::NoneVerified
        } else {
            Verdict::Verified(self.verified)
        }
    }

    /// Human-readable multi-line summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(50);
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Done in {:.1}s: {}", self.elapsed.as_secs_f64(), self.verdict());
        let _ = writeln!(out, "  Scanned:   {}", self.scanned);
        let _ = writeln!(out, "  Reachable: {}", self.reachable);
        let _ = writeln!(out, "  Verified:  {}", self.verified);
        for (reason, count) in &self.failures {
            let _ = writeln!(out, "  {:<21}{}", format!("{reason}:"), count);
        }
        let _ = write!(out, "{rule}");
        out
    }
}

/// `Export_<YYYY-mm-dd_HH-MM>.txt` for `now`.
pub fn export_file_name(now: DateTime<Local>) -> String {
    format!("Export_{}.txt", now.format("%Y-%m-%d_%H-%M"))
}

/// Export body: a two-line header, a blank line, then `[NNNms] <original>`
/// per endpoint.
pub fn render_export(name: &str, ranked: &[RankedEndpoint]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "// proxysieve export | {name}");
    let _ = writeln!(out, "// Count: {} | Sorted by latency", ranked.len());
    out.push('\n');
    for r in ranked {
        let _ = writeln!(out, "[{}ms] {}", r.latency_ms, r.descriptor.original);
    }
    out
}

/// Write `ranked` to `target`, or to a timestamped file in `dir`.
///
/// Returns the path written.
pub fn write_export(dir: &Path, target: Option<&Path>, ranked: &[RankedEndpoint]) -> Result<PathBuf> {
    let path = match target {
        Some(path) => path.to_path_buf(),
        None => dir.join(export_file_name(Local::now())),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    std::fs::write(&path, render_export(&name, ranked))
        .with_context(|| format!("failed to write export: {}", path.display()))?;

    info!(path = %path.display(), count = ranked.len(), "export written");
    Ok(path)
}
