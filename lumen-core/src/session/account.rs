use super::retry::CommRetryParams;
use crate::attr::AttrSet;
use crate::error::CoreError;
use crate::exchange::ExchangeConfig;
use crate::observe::ObserveConfig;
use lumen_coap::ContentFormat;
use std::time::Duration;

/// Transport binding of the account. The core speaks CoAP/UDP; queue mode
/// is a separate flag rather than a binding letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    #[default]
    Udp,
}

impl Binding {
    pub fn letter(self) -> &'static str {
        match self {
            Binding::Udp => "U",
        }
    }
}

/// Everything the core knows about its one server account.
#[derive(Debug, Clone)]
pub struct ServerAccount {
    /// Short server id; the reserved bootstrap value never registers.
    pub ssid: u16,
    /// `coap://host[:port]` URI of the server.
    pub uri: String,
    /// Registration lifetime in seconds.
    pub lifetime: u32,
    pub binding: Binding,
    pub queue_mode: bool,
    /// Suspension length after Execute on the Disable resource.
    pub disable_timeout: Duration,
    /// Account-level notification attribute defaults (pmin/pmax/con).
    pub default_attrs: AttrSet,
    /// Disables the LwM2M Send operation; carried for the Server object,
    /// not consulted by this core.
    pub mute_send: bool,
    /// This account talks to a bootstrap server.
    pub bootstrap: bool,
    pub retry: CommRetryParams,
}

impl ServerAccount {
    pub fn new(ssid: u16, uri: impl Into<String>) -> ServerAccount {
        ServerAccount {
            ssid,
            uri: uri.into(),
            lifetime: 86_400,
            binding: Binding::Udp,
            queue_mode: false,
            disable_timeout: Duration::from_secs(86_400),
            default_attrs: AttrSet::default(),
            mute_send: false,
            bootstrap: false,
            retry: CommRetryParams::default(),
        }
    }
}

/// Constructor-time configuration of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint_name: String,
    pub account: ServerAccount,
    pub exchange: ExchangeConfig,
    pub observe: ObserveConfig,
    /// `pct=` preference sent to the bootstrap server and the fallback
    /// format for structured payloads.
    pub preferred_format: ContentFormat,
    /// Enabler version advertised as `lwm2m=`.
    pub lwm2m_version: &'static str,
    /// TX silence before queue mode entry.
    pub queue_mode_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint_name: impl Into<String>, account: ServerAccount) -> SessionConfig {
        SessionConfig {
            endpoint_name: endpoint_name.into(),
            account,
            exchange: ExchangeConfig::default(),
            observe: ObserveConfig::default(),
            preferred_format: ContentFormat::SENML_CBOR,
            lwm2m_version: "1.1",
            queue_mode_timeout: crate::exchange::MAX_TRANSMIT_WAIT,
        }
    }
}

/// Splits a `coap://` / `coaps://` URI into host and port.
pub fn parse_coap_uri(uri: &str) -> Result<(&str, u16), CoreError> {
    let bad = || CoreError::BadServerUri(uri.to_string());
    let (scheme, rest) = uri.split_once("://").ok_or_else(bad)?;
    let default_port = match scheme {
        "coap" => 5683,
        "coaps" => 5684,
        _ => return Err(bad()),
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(bad());
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(']') || host.ends_with(']') => {
            let port: u16 = port.parse().map_err(|_| bad())?;
            Ok((host, port))
        }
        _ => Ok((authority, default_port)),
    }
}
