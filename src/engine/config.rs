//! The JSON document handed to sing-box for a single probe.

use serde::Serialize;

use super::outbound::{Outbound, OutboundError, DIRECT_TAG, PROXY_TAG};
use crate::config::EngineConfig;
use crate::descriptor::EndpointDescriptor;

#[derive(Debug, Clone, Serialize)]
pub struct SingBoxConfig {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogSection {
    pub level: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<DnsRule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    pub detour: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsRule {
    pub outbound: String,
    pub server: String,
}

/// Local SOCKS listener the prober connects through.
#[derive(Debug, Clone, Serialize)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
}

impl SingBoxConfig {
    /// Render the config for `descriptor` with a SOCKS inbound on
    /// `127.0.0.1:local_port`.
    pub fn build(
        descriptor: &EndpointDescriptor,
        local_port: u16,
        settings: &EngineConfig,
    ) -> Result<Self, OutboundError> {
        let proxy = Outbound::from_descriptor(descriptor)?;

        // All lookups go through the proxy outbound.
        let dns = DnsSection {
            servers: vec![
                DnsServer {
                    tag: "remote".to_string(),
                    address: settings.dns_server.clone(),
                    detour: PROXY_TAG.to_string(),
                },
                DnsServer {
                    tag: "local".to_string(),
                    address: "local".to_string(),
                    detour: DIRECT_TAG.to_string(),
                },
            ],
            rules: vec![DnsRule {
                outbound: "any".to_string(),
                server: "remote".to_string(),
            }],
        };

        Ok(Self {
            log: LogSection {
                level: settings.log_level.clone(),
                output: "stderr".to_string(),
            },
            dns,
            inbounds: vec![Inbound {
                kind: "socks".to_string(),
                tag: "in".to_string(),
                listen: "127.0.0.1".to_string(),
                listen_port: local_port,
            }],
            outbounds: vec![proxy, Outbound::direct()],
        })
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Protocol;

    #[test]
    fn test_config_shape() {
        let d = EndpointDescriptor::new(Protocol::Vless, "edge.example", 443, "id");
        let cfg = SingBoxConfig::build(&d, 40123, &EngineConfig::default()).unwrap();
        let v = serde_json::to_value(&cfg).unwrap();

        assert_eq!(v["log"]["level"], "error");
        assert_eq!(v["log"]["output"], "stderr");

        assert_eq!(v["inbounds"][0]["type"], "socks");
        assert_eq!(v["inbounds"][0]["listen"], "127.0.0.1");
        assert_eq!(v["inbounds"][0]["listen_port"], 40123);

        let outbounds = v["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 2);
        assert_eq!(outbounds[0]["tag"], "proxy");
        assert_eq!(outbounds[0]["server"], "edge.example");
        assert_eq!(outbounds[1]["type"], "direct");

        let servers = v["dns"]["servers"].as_array().unwrap();
        assert_eq!(servers[0]["address"], "8.8.8.8");
        assert_eq!(servers[0]["detour"], "proxy");
        assert_eq!(servers[1]["detour"], "direct");
        assert_eq!(v["dns"]["rules"][0]["outbound"], "any");
        assert_eq!(v["dns"]["rules"][0]["server"], servers[0]["tag"]);
    }

    #[test]
    fn test_dns_server_and_log_level_follow_settings() {
        let settings = EngineConfig {
            dns_server: "1.1.1.1".to_string(),
            log_level: "debug".to_string(),
            ..EngineConfig::default()
        };
        let d = EndpointDescriptor::new(Protocol::Trojan, "t", 443, "pw");
        let json = SingBoxConfig::build(&d, 1, &settings)
            .unwrap()
            .to_json_pretty()
            .unwrap();
        assert!(json.contains("\"1.1.1.1\""));
        assert!(json.contains("\"debug\""));
    }

    #[test]
    fn test_bad_outbound_propagates() {
        let d = EndpointDescriptor::new(Protocol::Vmess, "v", 443, "");
        assert!(SingBoxConfig::build(&d, 1, &EngineConfig::default()).is_err());
    }
}
