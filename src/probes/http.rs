//! HTTP latency probe through a local SOCKS5 inbound.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use reqwest::header::CONNECTION;
use reqwest::{Client, Proxy, StatusCode};
use tracing::debug;

use super::ProbeType;
use crate::config::ProbeConfig;
use crate::error::VerifyError;
use crate::retry::{retry_fixed, Exhausted};

/// A successful measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    /// Milliseconds until response headers arrived, at least 1.
    pub millis: u64,
    /// 1-based attempt that produced the measurement.
    pub attempt: u32,
}

#[derive(Debug)]
enum AttemptError {
    Request(reqwest::Error),
    Status(StatusCode),
}

/// Issues `HEAD <url>` through `socks5h://127.0.0.1:<port>` with bounded
/// retries.
#[derive(Debug, Clone)]
pub struct LatencyProber {
    url: String,
    attempts: u32,
    backoff: Duration,
    request_timeout: Duration,
}

impl LatencyProber {
    pub fn new(url: impl Into<String>, attempts: u32, backoff: Duration, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            attempts: attempts.max(1),
            backoff,
            request_timeout,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.attempts,
            config.backoff(),
            config.request_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn client(&self, local_port: u16) -> Result<Client, VerifyError> {
        let setup_error = |e: reqwest::Error| VerifyError::Probe {
            attempts: 0,
            message: format!("cannot build http client: {e}"),
            timed_out: false,
        };
        let proxy = Proxy::all(format!("socks5h://127.0.0.1:{local_port}")).map_err(setup_error)?;
        Client::builder()
            .proxy(proxy)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(setup_error)
    }

    /// Measure latency through the proxy listening on `local_port`.
    ///
    /// The first 2xx response wins; its own elapsed time is returned. When
    /// every attempt fails, the last attempt's error is reported.
    pub async fn measure(&self, local_port: u16) -> Result<Latency, VerifyError> {
        let client = self.client(local_port)?;
        let url = self.url.as_str();

        let outcome = retry_fixed(self.attempts, self.backoff, |attempt| {
            let client = client.clone();
            async move {
                let start = Instant::now();
                let response = match client.head(url).header(CONNECTION, "close").send().await {
                    Ok(response) => response,
                    Err(e) => return Err(AttemptError::Request(e)),
                };
                let elapsed = start.elapsed();
                let status = response.status();
                debug!(
                    probe = %ProbeType::Http,
                    local_port,
                    attempt,
                    status = status.as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "probe response"
                );
                if status.is_success() {
                    Ok(elapsed)
                } else {
                    Err(AttemptError::Status(status))
                }
            }
        })
        .await;

        match outcome {
            Ok((elapsed, attempt)) => Ok(Latency {
                millis: (elapsed.as_millis() as u64).max(1),
                attempt,
            }),
            Err(exhausted) => Err(self.classify(local_port, exhausted).await),
        }
    }

    async fn classify(&self, local_port: u16, exhausted: Exhausted<AttemptError>) -> VerifyError {
        let attempts = exhausted.attempts;
        match exhausted.last {
            AttemptError::Status(status) => VerifyError::Probe {
                attempts,
                message: format!("unexpected status {status}"),
                timed_out: false,
            },
            AttemptError::Request(e) => {
                let message = error_chain(&e);
                if e.is_timeout() {
                    return VerifyError::Probe {
                        attempts,
                        message,
                        timed_out: true,
                    };
                }
                // Separate a dead local inbound from a remote failure.
                let local = super::tcp::dial(
                    &Ipv4Addr::LOCALHOST.to_string(),
                    local_port,
                    Duration::from_millis(500),
                )
                .await;
                if local.is_none() {
                    VerifyError::LocalDial {
                        port: local_port,
                        message,
                    }
                } else {
                    VerifyError::Probe {
                        attempts,
                        message,
                        timed_out: false,
                    }
                }
            }
        }
    }
}

/// `e` followed by each of its sources, joined with `: `.
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
