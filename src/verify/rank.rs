//! Latency ranking of verified endpoints.

use serde::Serialize;

use super::ProbeResult;
use crate::descriptor::EndpointDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEndpoint {
    pub latency_ms: u64,
    pub descriptor: EndpointDescriptor,
}

/// Successes with latency below `max_latency_ms`, fastest first.
///
/// The sort is stable, so equal latencies keep their result order.
pub fn rank(results: &[ProbeResult], max_latency_ms: u64) -> Vec<RankedEndpoint> {
    let mut ranked: Vec<RankedEndpoint> = results
        .iter()
        .filter_map(|r| {
            let latency_ms = r.outcome.latency_ms()?;
            (latency_ms > 0 && latency_ms < max_latency_ms).then(|| RankedEndpoint {
                latency_ms,
                descriptor: r.descriptor.clone(),
            })
        })
        .collect();
    ranked.sort_by_key(|r| r.latency_ms);
    ranked
}
