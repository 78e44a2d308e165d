//! Typed shape of the configuration file described in §6. Parsing it out
//! of TOML/JSON is a thin `serde` adapter; CLI argv handling is not part
//! of this crate.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// One `listeners.interfaces[]` entry. `ip_address` may be the literal
/// `"auto"`, meaning "pick the system default route address" — resolving
/// that string to a concrete `IpAddr` is left to the caller (the core
/// only carries the configuration shape, not routing-table introspection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub ip_address: String,
    pub external_address: Option<String>,
    #[serde(default = "default_sip_port")]
    pub sip_port: u16,
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default)]
    pub udp_enabled: bool,
    #[serde(default)]
    pub tcp_enabled: bool,
    #[serde(default)]
    pub ws_enabled: bool,
    #[serde(default)]
    pub tls_enabled: bool,
    /// Comma-separated subnet list in the source config; parsed here into
    /// individual CIDR strings so callers don't re-split it.
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub default: bool,
}

fn default_sip_port() -> u16 {
    5060
}
fn default_tls_port() -> u16 {
    5061
}
fn default_ws_port() -> u16 {
    5062
}

impl InterfaceConfig {
    /// Resolves `ip_address` to a concrete address, or `None` for the
    /// `"auto"` sentinel (the caller must supply the system's default
    /// route address; this core has no routing-table access).
    pub fn resolved_ip(&self) -> Option<IpAddr> {
        if self.ip_address.eq_ignore_ascii_case("auto") {
            None
        } else {
            self.ip_address.parse().ok()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_file: Option<String>,
    pub ca_path: Option<String>,
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub cert_password: Option<String>,
    #[serde(default)]
    pub verify_peer: bool,
}

/// One `listeners.packet-rate-white-list[]` entry: either a bare source
/// address or a CIDR network, distinguished at parse time (by the
/// presence of a `/`) rather than in the config shape itself, matching
/// how the source stores both forms as plain strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry(pub String);

/// `listeners.carp-ha-interface[0]`: the core only observes that this
/// yields an additional virtual listener; raising/lowering it in
/// response to interface up/down events is the HA daemon's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarpHaInterface {
    pub virtual_ip: String,
    pub sip_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenersConfig {
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub tls: TlsConfig,
    pub sip_tcp_port_base: Option<u16>,
    pub sip_tcp_port_max: Option<u16>,
    pub sip_ws_port_base: Option<u16>,
    pub sip_ws_port_max: Option<u16>,
    /// `"violation/aggregate/banlife"`, parsed by
    /// `sigcore_transport::RateLimitConfig::parse`.
    pub packet_rate_ratio: Option<String>,
    #[serde(default)]
    pub packet_rate_white_list: Vec<WhitelistEntry>,
    #[serde(default)]
    pub auto_null_route_on_ban: bool,
    /// Forces every response to go back to the request's source address,
    /// ignoring the top Via's `sent-by`/`received`/`rport` resolution
    /// (§4.3's `on_route_response`). Useful for peers behind a NAT this
    /// deployment already knows not to trust for addressing.
    #[serde(default)]
    pub use_source_address_for_responses: bool,
    #[serde(default)]
    pub carp_ha_interface: Vec<CarpHaInterface>,
}

/// The typed configuration this crate accepts. Reading one from a TOML
/// file is a convenience (`StackConfig::from_toml_str`); the core never
/// reads argv or a file path itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub listeners: ListenersConfig,
    /// Worker pool bounds (§5): `min..=max` concurrently running
    /// transaction-user callbacks.
    #[serde(default = "default_worker_min")]
    pub worker_pool_min: usize,
    #[serde(default = "default_worker_max")]
    pub worker_pool_max: usize,
}

fn default_worker_min() -> usize {
    2
}
fn default_worker_max() -> usize {
    1024
}

impl StackConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let mut config = StackConfig::default();
        config.listeners.interfaces.push(InterfaceConfig {
            ip_address: "auto".to_string(),
            external_address: None,
            sip_port: 5060,
            tls_port: 5061,
            ws_port: 5062,
            udp_enabled: true,
            tcp_enabled: true,
            ws_enabled: false,
            tls_enabled: false,
            subnets: vec!["10.0.0.0/24".to_string()],
            default: true,
        });
        let text = config.to_toml_string().unwrap();
        let parsed = StackConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.listeners.interfaces.len(), 1);
        assert!(parsed.listeners.interfaces[0].resolved_ip().is_none());
    }

    #[test]
    fn worker_pool_bounds_default_per_the_concurrency_model() {
        let config = StackConfig::default();
        assert_eq!(config.worker_pool_min, 2);
        assert_eq!(config.worker_pool_max, 1024);
    }
}
