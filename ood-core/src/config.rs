//! Stack configuration handed to the bootstrap. Validated before any side effect.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// NON service address used when the host does not supply one.
pub const DEFAULT_NON_ADDRESS: &str = "127.0.0.1:1318";
/// WebSocket event address used when the host does not supply one.
pub const DEFAULT_WS_ADDRESS: &str = "127.0.0.1:1319";
/// BDT (relay/transport) port of an OOD.
pub const DEFAULT_BDT_PORT: u16 = 8050;

/// Network stack configuration. Immutable once passed to `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// On-disk location for stack-local persistent data. Required.
    pub storage_path: PathBuf,
    /// NON (named object) service address, `ip:port`. Required.
    #[serde(default = "default_non_address")]
    pub non_address: String,
    /// WebSocket event address, `ip:port`.
    #[serde(default)]
    pub websocket_address: Option<String>,
    /// Relay/transport port. 0 lets the OS choose.
    #[serde(default = "default_bdt_port")]
    pub bdt_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Local attachment point (Wi-Fi interface IP).
    #[serde(default)]
    pub wifi_address: Option<String>,
}

fn default_non_address() -> String {
    DEFAULT_NON_ADDRESS.to_owned()
}
fn default_bdt_port() -> u16 {
    DEFAULT_BDT_PORT
}
fn default_log_level() -> String {
    "info".to_owned()
}

impl StackConfig {
    pub fn new(storage_path: impl Into<PathBuf>, non_address: impl Into<String>) -> Self {
        Self {
            storage_path: storage_path.into(),
            non_address: non_address.into(),
            websocket_address: None,
            bdt_port: default_bdt_port(),
            log_level: default_log_level(),
            wifi_address: None,
        }
    }

    /// Config for the device-control role, which only knows its storage path and log level.
    /// The port is left to the OS, so a stack started separately keeps the default one.
    pub fn for_ood(storage_path: impl Into<PathBuf>, log_level: impl Into<String>) -> Self {
        Self {
            websocket_address: Some(DEFAULT_WS_ADDRESS.to_owned()),
            bdt_port: 0,
            log_level: log_level.into(),
            ..Self::new(storage_path, DEFAULT_NON_ADDRESS)
        }
    }

    pub fn with_websocket_address(mut self, addr: impl Into<String>) -> Self {
        self.websocket_address = Some(addr.into());
        self
    }

    pub fn with_bdt_port(mut self, port: u16) -> Self {
        self.bdt_port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_wifi_address(mut self, addr: impl Into<String>) -> Self {
        self.wifi_address = Some(addr.into());
        self
    }

    /// Check required fields and address formats.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.storage_path.as_os_str().is_empty() {
            return Err(ValidationError::MissingField("storage_path"));
        }
        if self.non_address.trim().is_empty() {
            return Err(ValidationError::MissingField("non_address"));
        }
        parse_socket_addr("non_address", &self.non_address)?;
        if let Some(ws) = &self.websocket_address {
            parse_socket_addr("websocket_address", ws)?;
        }
        if let Some(wifi) = &self.wifi_address {
            parse_ip_addr("wifi_address", wifi)?;
        }
        parse_log_level(&self.log_level)?;
        Ok(())
    }

    /// Level filter for the logging bridge; unparsable levels fall back to `Info`
    /// (validation reports them separately).
    pub fn level_filter(&self) -> LevelFilter {
        parse_log_level(&self.log_level).unwrap_or(LevelFilter::Info)
    }

    /// Parsed Wi-Fi address, if one is configured and well-formed.
    pub fn wifi_ip(&self) -> Option<IpAddr> {
        self.wifi_address
            .as_deref()
            .and_then(|s| parse_ip_addr("wifi_address", s).ok())
    }
}

/// Parse a log level name (`off`, `error`, `warn`, `info`, `debug`, `trace`; case-insensitive).
/// Empty means `info`.
pub fn parse_log_level(s: &str) -> Result<LevelFilter, ValidationError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(LevelFilter::Info);
    }
    LevelFilter::from_str(s).map_err(|_| ValidationError::InvalidLogLevel(s.to_owned()))
}

pub fn parse_socket_addr(field: &'static str, value: &str) -> Result<SocketAddr, ValidationError> {
    value
        .trim()
        .parse::<SocketAddr>()
        .map_err(|_| ValidationError::InvalidAddress {
            field,
            value: value.to_owned(),
        })
}

pub fn parse_ip_addr(field: &'static str, value: &str) -> Result<IpAddr, ValidationError> {
    value
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::InvalidAddress {
            field,
            value: value.to_owned(),
        })
}

/// Port as received from a host with a wider integer type.
pub fn port_from_raw(raw: i64) -> Result<u16, ValidationError> {
    u16::try_from(raw).map_err(|_| ValidationError::InvalidPort(raw))
}

/// Bad config, reported before any stateful side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {value:?}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("port out of range: {0}")]
    InvalidPort(i64),
    #[error("invalid log level: {0:?}")]
    InvalidLogLevel(String),
}
