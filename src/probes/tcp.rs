//! TCP reachability prefilter.
//!
//! One connect per descriptor under a shared deadline, with at most
//! `ceiling` connects in flight. Survivors come back in completion order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::ProbeType;
use crate::config::PrefilterConfig;
use crate::descriptor::EndpointDescriptor;

/// Default ceiling on simultaneous connects.
pub const DEFAULT_CEILING: usize = 1000;

/// Connect once to `host:port`, returning the connect time on success.
///
/// Name resolution counts against `timeout`. The socket is closed as soon
/// as the handshake completes.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Some(start.elapsed())
        }
        Ok(Err(e)) => {
            debug!(probe = %ProbeType::Tcp, host, port, error = %e, "connect failed");
            None
        }
        Err(_) => {
            debug!(probe = %ProbeType::Tcp, host, port, "connect timed out");
            None
        }
    }
}

/// Concurrent TCP prefilter.
#[derive(Debug, Clone)]
pub struct TcpPrefilter {
    timeout: Duration,
    ceiling: usize,
}

impl TcpPrefilter {
    pub fn new(timeout: Duration) -> Self {
        Self::with_ceiling(timeout, DEFAULT_CEILING)
    }

    pub fn with_ceiling(timeout: Duration, ceiling: usize) -> Self {
        Self {
            timeout,
            ceiling: ceiling.max(1),
        }
    }

    pub fn from_config(config: &PrefilterConfig) -> Self {
        Self::with_ceiling(config.connect_timeout(), config.max_in_flight)
    }

    /// Return the descriptors that accepted a TCP connection.
    ///
    /// Descriptors without a host or with port 0 are dropped up front.
    pub async fn run(&self, descriptors: Vec<EndpointDescriptor>) -> Vec<EndpointDescriptor> {
        let total = descriptors.len();
        let started = Instant::now();
        let slots = Arc::new(Semaphore::new(self.ceiling));
        let mut pending = FuturesUnordered::new();

        for descriptor in descriptors {
            if !descriptor.is_dialable() {
                debug!(host = %descriptor.host, port = descriptor.port, "skipping undialable descriptor");
                continue;
            }
            let slots = Arc::clone(&slots);
            let timeout = self.timeout;
            pending.push(tokio::spawn(async move {
                let _permit = slots.acquire_owned().await.ok()?;
                dial(&descriptor.host, descriptor.port, timeout)
                    .await
                    .map(|_| descriptor)
            }));
        }

        let mut reachable = Vec::new();
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(Some(descriptor)) => reachable.push(descriptor),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "prefilter task failed"),
            }
        }

        info!(
            total,
            reachable = reachable.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tcp prefilter finished"
        );
        reachable
    }
}

/// Prefilter with the default concurrency ceiling.
pub async fn prefilter(
    descriptors: Vec<EndpointDescriptor>,
    per_connect_timeout: Duration,
) -> Vec<EndpointDescriptor> {
    TcpPrefilter::new(per_connect_timeout).run(descriptors).await
}
