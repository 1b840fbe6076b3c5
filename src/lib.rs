//! proxysieve -- concurrent verification of proxy endpoint descriptors.
//!
//! Candidates (`vmess://`, `vless://`, `trojan://`, `ss://`, `ssr://`) pass a
//! two-stage funnel: a high fan-out TCP reachability prefilter, then a small
//! worker pool that drives each survivor through an ephemeral sing-box
//! instance and measures HTTP latency through it.

pub mod config;
pub mod descriptor;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod probes;
pub mod report;
pub mod retry;
pub mod verify;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::config::SieveConfig;
use crate::descriptor::EndpointDescriptor;
use crate::diagnostics::DiagnosticLog;
use crate::engine::{EngineAdapter, EngineBinary};
use crate::error::VerifyError;
use crate::probes::http::LatencyProber;
use crate::probes::tcp::TcpPrefilter;
use crate::report::RunSummary;
use crate::verify::{EngineAttempt, ProbeResult, RankedEndpoint, VerificationPool};

/// Everything a run produced.
#[derive(Debug)]
pub struct PipelineOutput {
    pub results: Vec<ProbeResult>,
    pub ranked: Vec<RankedEndpoint>,
    pub summary: RunSummary,
}

/// Dedup, prefilter, verify and rank.
pub struct Pipeline {
    config: SieveConfig,
    adapter: EngineAdapter,
    prober: LatencyProber,
    diagnostics: Option<Arc<DiagnosticLog>>,
}

impl Pipeline {
    /// Resolve the engine binary and wire up the stages.
    ///
    /// A missing engine is the only error that aborts a run, and it is
    /// raised here, before any candidate is touched.
    pub fn new(config: SieveConfig) -> Result<Self, VerifyError> {
        let binary = EngineBinary::locate(&config.engine.path)?;
        info!(engine = %binary.path().display(), "using probe engine");

        Ok(Self {
            adapter: EngineAdapter::new(binary, config.engine.clone()),
            prober: LatencyProber::from_config(&config.probe),
            diagnostics: None,
            config,
        })
    }

    /// Record failed attempts in `log`.
    pub fn with_diagnostics(mut self, log: Arc<DiagnosticLog>) -> Self {
        self.diagnostics = Some(log);
        self
    }

    /// Run every stage over `candidates`.
    ///
    /// The worker pool is skipped entirely when nothing survives the
    /// prefilter.
    pub async fn run(
        &self,
        candidates: Vec<EndpointDescriptor>,
        progress: Option<UnboundedSender<()>>,
    ) -> PipelineOutput {
        let started = Instant::now();
        let unique = descriptor::dedup::dedup(candidates);
        let scanned = unique.len();

        let reachable = TcpPrefilter::from_config(&self.config.prefilter).run(unique).await;
        let mut summary = RunSummary::new(scanned, reachable.len());

        let results = if reachable.is_empty() {
            Vec::new()
        } else {
            let mut attempt = EngineAttempt::new(self.adapter.clone(), self.prober.clone());
            if let Some(log) = &self.diagnostics {
                attempt = attempt.with_diagnostics(Arc::clone(log));
            }
            VerificationPool::new(self.config.pool.workers)
                .run(Arc::new(attempt), reachable, progress)
                .await
        };

        let ranked = verify::rank(&results, self.config.ranking.max_latency_ms);
        summary.record(&results, &ranked);
        summary.elapsed = started.elapsed();

        info!(
            scanned = summary.scanned,
            reachable = summary.reachable,
            verified = summary.verified,
            verdict = %summary.verdict(),
            "pipeline finished"
        );

        PipelineOutput {
            results,
            ranked,
            summary,
        }
    }
}
