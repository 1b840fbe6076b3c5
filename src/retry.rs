//! Small retry and polling combinators shared by engine readiness and the
//! HTTP prober.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::Instant;

/// Last error of an operation that used up every attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Run `step` every `interval` until it breaks or `deadline` has elapsed.
///
/// `step` always runs at least once. Returns `None` when the deadline passes
/// without a break.
pub async fn poll_until<T, F, Fut>(interval: Duration, deadline: Duration, mut step: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<T>>,
{
    let start = Instant::now();
    loop {
        if let ControlFlow::Break(value) = step().await {
            return Some(value);
        }
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return None;
        }
        tokio::time::sleep(interval.min(deadline - elapsed)).await;
    }
}

/// Run `op` up to `attempts` times with a fixed pause between tries.
///
/// `op` receives the 1-based attempt number. On success the value is
/// returned with the attempt that produced it.
pub async fn retry_fixed<T, E, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<(T, u32), Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(last) if attempt >= attempts => return Err(Exhausted { attempts, last }),
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
