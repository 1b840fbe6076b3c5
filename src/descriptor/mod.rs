//! Endpoint descriptors: the protocol-tagged candidates fed to the pipeline.

pub mod dedup;
pub mod parse;

use serde::{Deserialize, Serialize};

/// The fixed set of proxy protocol families the engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    #[serde(rename = "shadowsocksr")]
    ShadowsocksR,
}

impl Protocol {
    /// URI scheme used by share links of this family.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "ss",
            Protocol::ShadowsocksR => "ssr",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Some(Protocol::Vmess),
            "vless" => Some(Protocol::Vless),
            "trojan" => Some(Protocol::Trojan),
            "ss" => Some(Protocol::Shadowsocks),
            "ssr" => Some(Protocol::ShadowsocksR),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Vmess => write!(f, "vmess"),
            Protocol::Vless => write!(f, "vless"),
            Protocol::Trojan => write!(f, "trojan"),
            Protocol::Shadowsocks => write!(f, "shadowsocks"),
            Protocol::ShadowsocksR => write!(f, "shadowsocksr"),
        }
    }
}

/// One candidate endpoint.
///
/// `original` is the verbatim share link and is written back out untouched.
/// For the two Shadowsocks families `credential` is an identity string
/// (`method:password`, or the SSR parameter tail); the engine adapter
/// recovers the outbound fields from `original`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub credential: String,
    pub label: String,
    pub original: String,
    /// Measured latency, set once after a successful verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Identity of a descriptor. The label and the verbatim link are cosmetic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub credential: String,
}

impl EndpointDescriptor {
    pub fn new(
        protocol: Protocol,
        host: impl Into<String>,
        port: u16,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            credential: credential.into(),
            label: String::new(),
            original: String::new(),
            latency_ms: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original = original.into();
        self
    }

    pub fn key(&self) -> DescriptorKey {
        DescriptorKey {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            credential: self.credential.clone(),
        }
    }

    /// `host:port` suitable for a TCP connect, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// A descriptor with no host or no port can never be dialed.
    pub fn is_dialable(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}
