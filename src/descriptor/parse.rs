//! Decoding of share links and subscription bodies into descriptors.
//!
//! Only enough is decoded to dial and identify an endpoint. For the two
//! Shadowsocks families `credential` holds the decoded userinfo (or the SSR
//! parameter tail) as an identity string; the engine adapter decodes the
//! actual method and password from `original` when it renders the outbound.

use std::sync::OnceLock;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use percent_encoding::percent_decode_str;
use regex::Regex;
use thiserror::Error;
use tracing::debug;
use url::{Host, Url};

use super::{EndpointDescriptor, Protocol};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported scheme in '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid base64 payload")]
    Base64,

    #[error("invalid vmess json: {0}")]
    VmessJson(String),

    #[error("invalid url: {0}")]
    Url(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid port '{0}'")]
    Port(String),
}

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_allow_trailing_bits(true)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Decode standard or URL-safe base64, padded or not, ignoring whitespace.
pub fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    STANDARD_LENIENT
        .decode(cleaned.as_bytes())
        .or_else(|_| URL_SAFE_LENIENT.decode(cleaned.as_bytes()))
        .ok()
}

/// [`decode_base64`] followed by a UTF-8 check.
pub fn decode_base64_str(input: &str) -> Option<String> {
    decode_base64(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(vmess|vless|trojan|ssr|ss)://[a-zA-Z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+")
            .expect("share link pattern is valid")
    })
}

/// Find the first share link embedded in a line of text.
pub fn extract_link(text: &str) -> Option<&str> {
    link_regex().find(text).map(|m| m.as_str())
}

/// Decode every share link found in `content`.
///
/// `content` may be a plain list (one link per line, `#` comments allowed)
/// or a base64-encoded subscription body. Lines that fail to decode are
/// skipped.
pub fn parse_text(content: &str) -> Vec<EndpointDescriptor> {
    let decoded;
    let body = match decode_base64_str(content) {
        Some(text) if text.contains("://") => {
            decoded = text;
            decoded.as_str()
        }
        _ => content,
    };

    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if line.contains("t.me/proxy") || line.contains("tg://proxy") {
            continue;
        }
        let Some(link) = extract_link(line) else {
            continue;
        };
        match parse_link(link) {
            Ok(descriptor) => out.push(descriptor),
            Err(e) => debug!(error = %e, "skipping undecodable link"),
        }
    }
    out
}

/// Decode a single share link.
pub fn parse_link(link: &str) -> Result<EndpointDescriptor, ParseError> {
    let link = link.trim();
    let scheme = link
        .split_once("://")
        .map(|(s, _)| s)
        .ok_or_else(|| ParseError::UnsupportedScheme(link.chars().take(16).collect()))?;
    let protocol = Protocol::from_scheme(scheme)
        .ok_or_else(|| ParseError::UnsupportedScheme(scheme.to_string()))?;

    let descriptor = match protocol {
        Protocol::Vmess => parse_vmess(link)?,
        Protocol::Vless | Protocol::Trojan => parse_userinfo_url(protocol, link)?,
        Protocol::Shadowsocks => parse_shadowsocks(link)?,
        Protocol::ShadowsocksR => parse_shadowsocksr(link)?,
    };
    Ok(descriptor.with_original(link))
}

/// Everything after `scheme://`.
pub fn strip_scheme(link: &str) -> &str {
    link.split_once("://").map(|(_, rest)| rest).unwrap_or(link)
}

fn decode_label(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| ParseError::Port(raw.to_string()))
}

fn parse_vmess(link: &str) -> Result<EndpointDescriptor, ParseError> {
    let json = decode_base64_str(strip_scheme(link)).ok_or(ParseError::Base64)?;
    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| ParseError::VmessJson(e.to_string()))?;

    let host = value
        .get("add")
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("add"))?;
    let port = match value.get("port") {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ParseError::Port(n.to_string()))?,
        Some(serde_json::Value::String(s)) => parse_port(s)?,
        _ => return Err(ParseError::MissingField("port")),
    };
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or(ParseError::MissingField("id"))?;
    let label = value.get("ps").and_then(|v| v.as_str()).unwrap_or_default();

    Ok(EndpointDescriptor::new(Protocol::Vmess, host, port, id).with_label(label))
}

fn host_of(url: &Url) -> Result<String, ParseError> {
    match url.host() {
        Some(Host::Domain(d)) => Ok(d.to_string()),
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        None => Err(ParseError::MissingField("host")),
    }
}

fn parse_userinfo_url(protocol: Protocol, link: &str) -> Result<EndpointDescriptor, ParseError> {
    let url = Url::parse(link).map_err(|e| ParseError::Url(e.to_string()))?;
    let host = host_of(&url)?;
    let port = url.port().unwrap_or(0);
    let credential = decode_label(url.username());
    if credential.is_empty() {
        return Err(ParseError::MissingField("userinfo"));
    }
    let label = url.fragment().map(decode_label).unwrap_or_default();
    Ok(EndpointDescriptor::new(protocol, host, port, credential).with_label(label))
}

/// Split `host:port` where host may be a bracketed or bare IPv6 literal.
fn split_host_port(raw: &str) -> Result<(String, u16), ParseError> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or(ParseError::MissingField("port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ParseError::MissingField("host"));
    }
    Ok((host.to_string(), parse_port(port)?))
}

fn parse_shadowsocks(link: &str) -> Result<EndpointDescriptor, ParseError> {
    let rest = strip_scheme(link);
    let (main, label) = match rest.split_once('#') {
        Some((m, l)) => (m, decode_label(l)),
        None => (rest, String::new()),
    };
    let (userinfo, server) = if let Some((userinfo, server)) = main.rsplit_once('@') {
        // Plugin options follow the address after '/' or '?'.
        let server = server.split(['/', '?']).next().unwrap_or(server).to_string();
        let userinfo = match decode_base64_str(userinfo) {
            Some(plain) if plain.contains(':') => plain,
            _ => decode_label(userinfo),
        };
        (userinfo, server)
    } else {
        let encoded = main.split('?').next().unwrap_or(main).trim_end_matches('/');
        let decoded = decode_base64_str(encoded).ok_or(ParseError::Base64)?;
        decoded
            .rsplit_once('@')
            .map(|(userinfo, server)| (userinfo.to_string(), server.to_string()))
            .ok_or(ParseError::MissingField("server"))?
    };
    let (host, port) = split_host_port(&server)?;
    Ok(EndpointDescriptor::new(Protocol::Shadowsocks, host, port, userinfo).with_label(label))
}

fn parse_shadowsocksr(link: &str) -> Result<EndpointDescriptor, ParseError> {
    let decoded = decode_base64_str(strip_scheme(link)).ok_or(ParseError::Base64)?;
    let (main, query) = match decoded.split_once("/?") {
        Some((m, q)) => (m, Some(q)),
        None => (decoded.as_str(), None),
    };
    // host:port:protocol:method:obfs:password, host may contain ':'.
    let mut parts = main.rsplitn(6, ':');
    let mut tail = [""; 4];
    for slot in tail.iter_mut().rev() {
        *slot = parts.next().ok_or(ParseError::MissingField("password"))?;
    }
    let port = parts.next().ok_or(ParseError::MissingField("port"))?;
    let host = parts.next().ok_or(ParseError::MissingField("host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    // protocol:method:obfs:password, password still base64.
    let credential = tail.join(":");

    let label = query
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "remarks")
                .and_then(|(_, v)| decode_base64_str(&v))
        })
        .unwrap_or_default();

    Ok(EndpointDescriptor::new(Protocol::ShadowsocksR, host, parse_port(port)?, credential).with_label(label))
}
