//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use doors_core::backoff::BackoffConfig;
use doors_core::ControllerConfig;

/// Client configuration. File: ~/.config/doors/client.toml or /etc/doors/client.toml.
/// Env overrides: DOORS_BASE_URL, DOORS_INSTANCE, DOORS_TTL_MS, DOORS_PING_MS,
/// DOORS_REQUEST_TIMEOUT_MS, DOORS_DISCONNECT_AFTER_MS.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server origin, e.g. `http://127.0.0.1:8080`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Instance id the page was rendered with.
    #[serde(default)]
    pub instance: String,
    /// Path prefix of the sync and hook endpoints (default `d00r`).
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_disconnect_after_ms")]
    pub disconnect_after_ms: u64,
    #[serde(default = "default_ping_ms")]
    pub ping_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_prefix() -> String {
    "d00r".to_string()
}
fn default_ttl_ms() -> u64 {
    15 * 60 * 1000
}
fn default_disconnect_after_ms() -> u64 {
    30_000
}
fn default_ping_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_max_sessions() -> usize {
    6
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            instance: String::new(),
            prefix: default_prefix(),
            ttl_ms: default_ttl_ms(),
            disconnect_after_ms: default_disconnect_after_ms(),
            ping_ms: default_ping_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `PUT` target of sync sessions.
    pub fn sync_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.prefix,
            self.instance
        )
    }

    /// `POST` target of one hook.
    pub fn hook_url(&self, door: u64, hook: u64) -> String {
        format!("{}/{}/{}", self.sync_url(), door, hook)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            disconnect_after: Duration::from_millis(self.disconnect_after_ms),
            ping: Duration::from_millis(self.ping_ms),
            max_sessions: self.max_sessions.max(1),
            backoff: BackoffConfig::default(),
            ..ControllerConfig::default()
        }
    }
}

/// Load config: explicit path, else the first default path found, else
/// defaults; then env vars on top. An explicit path must exist and parse.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file()?.unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

/// Apply `DOORS_*` overrides; unparsable numbers are ignored.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(s) = lookup("DOORS_BASE_URL") {
        c.base_url = s;
    }
    if let Some(s) = lookup("DOORS_INSTANCE") {
        c.instance = s;
    }
    let numbers: [(&str, &mut u64); 4] = [
        ("DOORS_TTL_MS", &mut c.ttl_ms),
        ("DOORS_PING_MS", &mut c.ping_ms),
        ("DOORS_REQUEST_TIMEOUT_MS", &mut c.request_timeout_ms),
        ("DOORS_DISCONNECT_AFTER_MS", &mut c.disconnect_after_ms),
    ];
    for (key, slot) in numbers {
        if let Some(v) = lookup(key).and_then(|s| s.parse::<u64>().ok()) {
            *slot = v;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/doors/client.toml"));
    }
    out.push(PathBuf::from("/etc/doors/client.toml"));
    out
}

fn load_file() -> Result<Option<Config>, ConfigError> {
    for p in config_paths() {
        if p.exists() {
            return read_file(&p).map(Some);
        }
    }
    Ok(None)
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
