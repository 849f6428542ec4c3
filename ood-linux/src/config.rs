//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ood_core::config::{DEFAULT_BDT_PORT, DEFAULT_NON_ADDRESS};
use ood_core::{BindPolicy, PerfOptions, StackConfig};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/ood/config.toml or /etc/ood/config.toml.
/// Env overrides: OOD_STORAGE_PATH, OOD_NON_ADDRESS, OOD_BDT_PORT, OOD_LOG_LEVEL, OOD_WIFI_ADDRESS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_non_address")]
    pub non_address: String,
    #[serde(default)]
    pub websocket_address: Option<String>,
    #[serde(default = "default_bdt_port")]
    pub bdt_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub wifi_address: Option<String>,
    #[serde(default)]
    pub bind: BindSection,
    #[serde(default)]
    pub perf: PerfSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Give up on the bind handshake after this long. Unset waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerfSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub dec_id: String,
    #[serde(default)]
    pub client_address: String,
    /// The perf client runs its own stack; 0 lets the OS choose its port.
    #[serde(default)]
    pub bdt_port: u16,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_span_minutes")]
    pub span_minutes: u32,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/ood")
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
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_max_failures() -> u32 {
    10
}
fn default_flush_interval_secs() -> u64 {
    60
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_span_minutes() -> u32 {
    60
}

impl Default for BindSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_failures: default_max_failures(),
            timeout_secs: None,
        }
    }
}

impl Default for PerfSection {
    fn default() -> Self {
        Self {
            enabled: false,
            owner_id: String::new(),
            dec_id: String::new(),
            client_address: String::new(),
            bdt_port: 0,
            flush_interval_secs: default_flush_interval_secs(),
            queue_capacity: default_queue_capacity(),
            span_minutes: default_span_minutes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            non_address: default_non_address(),
            websocket_address: None,
            bdt_port: default_bdt_port(),
            log_level: default_log_level(),
            wifi_address: None,
            bind: BindSection::default(),
            perf: PerfSection::default(),
        }
    }
}

impl Config {
    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            storage_path: self.storage_path.clone(),
            non_address: self.non_address.clone(),
            websocket_address: self.websocket_address.clone(),
            bdt_port: self.bdt_port,
            log_level: self.log_level.clone(),
            wifi_address: self.wifi_address.clone(),
        }
    }

    /// Same as the device stack, on the perf client's own port.
    pub fn perf_stack_config(&self) -> StackConfig {
        StackConfig {
            bdt_port: self.perf.bdt_port,
            ..self.stack_config()
        }
    }

    pub fn bind_policy(&self) -> BindPolicy {
        BindPolicy {
            poll_interval: Duration::from_millis(self.bind.poll_interval_ms.max(1)),
            max_failures: self.bind.max_failures,
            timeout: self.bind.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn perf_options(&self) -> PerfOptions {
        PerfOptions {
            queue_capacity: self.perf.queue_capacity,
            flush_interval: Duration::from_secs(self.perf.flush_interval_secs.max(1)),
            span_minutes: self.perf.span_minutes,
            ..PerfOptions::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ood/config.toml"));
    }
    out.push(PathBuf::from("/etc/ood/config.toml"));
    out
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parse config {}", path.display()))
}

/// Apply `OOD_*` overrides. Unparsable ports are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("OOD_STORAGE_PATH") {
        c.storage_path = PathBuf::from(s);
    }
    if let Some(s) = var("OOD_NON_ADDRESS") {
        c.non_address = s;
    }
    if let Some(s) = var("OOD_BDT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.bdt_port = p;
        }
    }
    if let Some(s) = var("OOD_LOG_LEVEL") {
        c.log_level = s;
    }
    if let Some(s) = var("OOD_WIFI_ADDRESS") {
        c.wifi_address = Some(s).filter(|s| !s.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        assert!(c.stack_config().validate().is_ok());
        assert_eq!(c.bind_policy().timeout, None);
        assert!(!c.perf.enabled);
    }

    #[test]
    fn file_with_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
storage_path = "/data/ood"
bdt_port = 9000
log_level = "debug"

[bind]
timeout_secs = 30

[perf]
enabled = true
owner_id = "owner-1"
dec_id = "dec-1"
flush_interval_secs = 10
"#,
        )
        .unwrap();
        let c = load_file(&path).unwrap();
        let stack = c.stack_config();
        assert_eq!(stack.storage_path, PathBuf::from("/data/ood"));
        assert_eq!(stack.bdt_port, 9000);
        assert_eq!(stack.non_address, DEFAULT_NON_ADDRESS);
        assert_eq!(c.bind_policy().timeout, Some(Duration::from_secs(30)));
        assert!(c.perf.enabled);
        assert_eq!(c.perf_stack_config().bdt_port, 0);
        assert_eq!(c.perf_options().flush_interval, Duration::from_secs(10));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OOD_STORAGE_PATH", "/tmp/ood-env"),
            ("OOD_BDT_PORT", "not-a-port"),
            ("OOD_LOG_LEVEL", "trace"),
            ("OOD_WIFI_ADDRESS", "192.168.0.3"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.storage_path, PathBuf::from("/tmp/ood-env"));
        assert_eq!(c.bdt_port, DEFAULT_BDT_PORT);
        assert_eq!(c.log_level, "trace");
        assert_eq!(c.wifi_address.as_deref(), Some("192.168.0.3"));
    }
}
