//! Fixed-size worker pool running one attempt per descriptor.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::{Attempt, Outcome, ProbeResult};
use crate::descriptor::EndpointDescriptor;
use crate::error::FailureReason;

/// Default number of workers (and live engines).
pub const DEFAULT_WORKERS: usize = 20;

/// Runs attempts over a shared queue with at most `workers` in flight.
#[derive(Debug, Clone)]
pub struct VerificationPool {
    workers: usize,
}

impl Default for VerificationPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl VerificationPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Verify every descriptor exactly once.
    ///
    /// Returns one [`ProbeResult`] per input descriptor, in completion order.
    /// `progress` receives one unit per finished attempt.
    pub async fn run<A>(
        &self,
        attempt: Arc<A>,
        descriptors: Vec<EndpointDescriptor>,
        progress: Option<mpsc::UnboundedSender<()>>,
    ) -> Vec<ProbeResult>
    where
        A: Attempt + 'static,
    {
        let total = descriptors.len();
        if total == 0 {
            return Vec::new();
        }
        let started = Instant::now();

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        for descriptor in descriptors {
            // The receiver is alive until the workers finish.
            let _ = queue_tx.send(descriptor);
        }
        drop(queue_tx);
        let queue = Arc::new(Mutex::new(queue_rx));

        let slots = Arc::new(Semaphore::new(self.workers));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        let worker_count = self.workers.min(total);
        info!(total, workers = worker_count, "starting verification");

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let slots = Arc::clone(&slots);
            let attempt = Arc::clone(&attempt);
            let result_tx = result_tx.clone();
            let progress = progress.clone();

            workers.spawn(async move {
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(descriptor) = next else {
                        break;
                    };
                    let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                        break;
                    };

                    let outcome = run_isolated(Arc::clone(&attempt), descriptor.clone()).await;
                    drop(permit);

                    debug!(
                        worker_id,
                        endpoint = %descriptor.address(),
                        outcome = ?outcome,
                        "attempt finished"
                    );
                    let _ = result_tx.send(ProbeResult::new(descriptor, outcome));
                    if let Some(progress) = &progress {
                        let _ = progress.send(());
                    }
                }
            });
        }
        drop(result_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "verification worker failed");
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }

        if results.len() != total {
            error!(expected = total, got = results.len(), "result count mismatch");
        }
        info!(
            total,
            verified = results.iter().filter(|r| r.is_success()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "verification finished"
        );
        results
    }
}

/// Run one attempt on its own task so a panic becomes a failed outcome.
async fn run_isolated<A>(attempt: Arc<A>, descriptor: EndpointDescriptor) -> Outcome
where
    A: Attempt + 'static,
{
    let handle = tokio::spawn(async move { attempt.attempt(&descriptor).await });
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "attempt task aborted");
            Outcome::failed(FailureReason::ProcessError, format!("attempt aborted: {e}"))
        }
    }
}
