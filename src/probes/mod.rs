//! Network probes.
//!
//! - [`tcp`]: raw TCP reachability, used as the cheap first stage.
//! - [`http`]: end-to-end HTTP latency through an engine's SOCKS inbound.

pub mod http;
pub mod tcp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    Tcp,
    Http,
}

impl std::fmt::Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeType::Tcp => write!(f, "tcp"),
            ProbeType::Http => write!(f, "http"),
        }
    }
}
