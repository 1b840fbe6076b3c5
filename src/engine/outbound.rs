//! Per-protocol outbound sections of the engine configuration.
//!
//! Every [`Protocol`] maps to exactly one [`Outbound`] variant. Shadowsocks
//! and ShadowsocksR credentials are decoded here from the verbatim share
//! link; when that fails the attempt fails instead of sending made-up
//! credentials.

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::descriptor::parse::{decode_base64_str, strip_scheme};
use crate::descriptor::{EndpointDescriptor, Protocol};

/// Tag of the outbound that carries probe traffic.
pub const PROXY_TAG: &str = "proxy";
/// Tag of the direct fallback outbound.
pub const DIRECT_TAG: &str = "direct";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutboundError {
    #[error("{0} endpoint has no credential")]
    MissingCredential(Protocol),

    #[error("cannot decode shadowsocks credentials: {0}")]
    Shadowsocks(&'static str),

    #[error("cannot decode shadowsocksr parameters: {0}")]
    ShadowsocksR(&'static str),
}

/// Remote address shared by all proxy outbounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
}

/// Client TLS settings. Certificates are not verified; only reachability
/// is measured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tls {
    pub enabled: bool,
    pub server_name: String,
    pub insecure: bool,
}

impl Tls {
    fn insecure_for(host: &str) -> Self {
        Self {
            enabled: true,
            server_name: host.to_string(),
            insecure: true,
        }
    }

    /// TLS as requested by the share link.
    ///
    /// vmess reads the `tls`/`sni` JSON fields, vless and trojan the
    /// `security`/`sni` query. Without a security setting only trojan uses
    /// TLS. Descriptors with no share link get TLS towards the host.
    fn for_descriptor(descriptor: &EndpointDescriptor) -> Option<Self> {
        if descriptor.original.is_empty() {
            return Some(Self::insecure_for(&descriptor.host));
        }
        let (security, sni) = match descriptor.protocol {
            Protocol::Vmess => vmess_security(&descriptor.original),
            _ => query_security(&descriptor.original),
        };
        let enabled = match security.as_deref() {
            Some("tls" | "reality" | "xtls") => true,
            Some(_) => false,
            None => descriptor.protocol == Protocol::Trojan,
        };
        enabled.then(|| {
            let name = sni.filter(|s| !s.is_empty());
            Self::insecure_for(name.as_deref().unwrap_or(&descriptor.host))
        })
    }
}

fn vmess_security(original: &str) -> (Option<String>, Option<String>) {
    let Some(value) = decode_base64_str(strip_scheme(original))
        .and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
    else {
        return (None, None);
    };
    let field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
    (field("tls").map(|s| s.to_ascii_lowercase()), field("sni"))
}

fn query_security(original: &str) -> (Option<String>, Option<String>) {
    let Ok(url) = Url::parse(original) else {
        return (None, None);
    };
    let mut security = None;
    let mut sni = None;
    for (key, value) in url.query_pairs() {
        match &*key {
            "security" => security = Some(value.to_ascii_lowercase()),
            "sni" | "peer" if sni.is_none() => sni = Some(value.into_owned()),
            _ => {}
        }
    }
    (security, sni)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vmess {
        #[serde(flatten)]
        server: Server,
        uuid: String,
        security: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<Tls>,
    },
    Vless {
        #[serde(flatten)]
        server: Server,
        uuid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<Tls>,
    },
    Trojan {
        #[serde(flatten)]
        server: Server,
        password: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tls: Option<Tls>,
    },
    Shadowsocks {
        #[serde(flatten)]
        server: Server,
        method: String,
        password: String,
    },
    #[serde(rename = "shadowsocksr")]
    ShadowsocksR {
        #[serde(flatten)]
        server: Server,
        method: String,
        password: String,
        protocol: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        protocol_param: String,
        obfs: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        obfs_param: String,
    },
    Direct {
        tag: String,
    },
}

impl Outbound {
    /// Build the proxy outbound for `descriptor`.
    pub fn from_descriptor(descriptor: &EndpointDescriptor) -> Result<Self, OutboundError> {
        let server = Server {
            tag: PROXY_TAG.to_string(),
            server: descriptor.host.clone(),
            server_port: descriptor.port,
        };
        let credential = || {
            if descriptor.credential.is_empty() {
                Err(OutboundError::MissingCredential(descriptor.protocol))
            } else {
                Ok(descriptor.credential.clone())
            }
        };

        Ok(match descriptor.protocol {
            Protocol::Vmess => Outbound::Vmess {
                uuid: credential()?,
                security: "auto".to_string(),
                tls: Tls::for_descriptor(descriptor),
                server,
            },
            Protocol::Vless => Outbound::Vless {
                uuid: credential()?,
                tls: Tls::for_descriptor(descriptor),
                server,
            },
            Protocol::Trojan => Outbound::Trojan {
                password: credential()?,
                tls: Tls::for_descriptor(descriptor),
                server,
            },
            Protocol::Shadowsocks => {
                let (method, password) = shadowsocks_credentials(&descriptor.original)?;
                Outbound::Shadowsocks {
                    server,
                    method,
                    password,
                }
            }
            Protocol::ShadowsocksR => {
                let p = shadowsocksr_params(&descriptor.original)?;
                Outbound::ShadowsocksR {
                    server,
                    method: p.method,
                    password: p.password,
                    protocol: p.protocol,
                    protocol_param: p.protocol_param,
                    obfs: p.obfs,
                    obfs_param: p.obfs_param,
                }
            }
        })
    }

    pub fn direct() -> Self {
        Outbound::Direct {
            tag: DIRECT_TAG.to_string(),
        }
    }
}

fn split_method_password(userinfo: &str) -> Result<(String, String), OutboundError> {
    let (method, password) = userinfo
        .split_once(':')
        .ok_or(OutboundError::Shadowsocks("userinfo lacks ':'"))?;
    if method.is_empty() || password.is_empty() {
        return Err(OutboundError::Shadowsocks("empty method or password"));
    }
    Ok((method.to_string(), password.to_string()))
}

/// Recover `(method, password)` from an `ss://` link.
///
/// Accepts SIP002 (`base64(method:password)@host:port`, or percent-encoded
/// plain userinfo) and the legacy `base64(method:password@host:port)` form.
fn shadowsocks_credentials(original: &str) -> Result<(String, String), OutboundError> {
    let rest = strip_scheme(original);
    let main = rest.split('#').next().unwrap_or(rest);

    if let Some((userinfo, _)) = main.rsplit_once('@') {
        let plain = percent_encoding::percent_decode_str(userinfo).decode_utf8_lossy();
        if plain.contains(':') {
            return split_method_password(&plain);
        }
        let decoded =
            decode_base64_str(userinfo).ok_or(OutboundError::Shadowsocks("userinfo is not base64"))?;
        return split_method_password(&decoded);
    }

    let encoded = main.split('?').next().unwrap_or(main).trim_end_matches('/');
    let decoded =
        decode_base64_str(encoded).ok_or(OutboundError::Shadowsocks("body is not base64"))?;
    let (userinfo, _) = decoded
        .rsplit_once('@')
        .ok_or(OutboundError::Shadowsocks("decoded body lacks '@'"))?;
    split_method_password(userinfo)
}

#[derive(Debug, PartialEq, Eq)]
struct SsrParams {
    method: String,
    password: String,
    protocol: String,
    protocol_param: String,
    obfs: String,
    obfs_param: String,
}

fn shadowsocksr_params(original: &str) -> Result<SsrParams, OutboundError> {
    let decoded = decode_base64_str(strip_scheme(original))
        .ok_or(OutboundError::ShadowsocksR("body is not base64"))?;
    let (main, query) = match decoded.split_once("/?") {
        Some((m, q)) => (m, q),
        None => (decoded.trim_end_matches('/'), ""),
    };

    let mut parts = main.rsplitn(6, ':');
    let mut next = |what: &'static str| parts.next().ok_or(OutboundError::ShadowsocksR(what));
    let password_b64 = next("password")?;
    let obfs = next("obfs")?.to_string();
    let method = next("method")?.to_string();
    let protocol = next("protocol")?.to_string();
    // host and port were already recovered by the link decoder
    next("port")?;
    next("host")?;

    let password =
        decode_base64_str(password_b64).ok_or(OutboundError::ShadowsocksR("password is not base64"))?;
    if method.is_empty() || password.is_empty() {
        return Err(OutboundError::ShadowsocksR("empty method or password"));
    }

    let mut protocol_param = String::new();
    let mut obfs_param = String::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let slot = match key.as_ref() {
            "protoparam" => &mut protocol_param,
            "obfsparam" => &mut obfs_param,
            _ => continue,
        };
        *slot = decode_base64_str(&value).unwrap_or_default();
    }

    Ok(SsrParams {
        method,
        password,
        protocol,
        protocol_param,
        obfs,
        obfs_param,
    })
}
