//! Daemon configuration: TOML file merged under command-line flags

use anyhow::{Context, Result};
use roomsync_log::LogConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7422;

/// Contents of `roomlogd.toml`
///
/// ```toml
/// bind = "127.0.0.1"
/// port = 7422
/// log_level = "debug"
///
/// [log]
/// native_rollup = false
/// max_entries_per_topic = 10000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub log: LogConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }
}

/// Flags that override the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub no_rollup: bool,
    pub max_entries: Option<usize>,
}

/// Effective daemon settings
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub addr: SocketAddr,
    pub log_level: String,
    pub log: LogConfig,
}

impl DaemonConfig {
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let bind = overrides.bind.or(file.bind).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let port = overrides.port.or(file.port).unwrap_or(DEFAULT_PORT);
        let addr: SocketAddr = format!("{}:{}", bind, port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", bind, port))?;

        let mut log = file.log;
        if overrides.no_rollup {
            log.native_rollup = false;
        }
        if overrides.max_entries.is_some() {
            log.max_entries_per_topic = overrides.max_entries;
        }
        if log.live_buffer == 0 {
            anyhow::bail!("log.live_buffer must be at least 1");
        }

        Ok(Self {
            addr,
            log_level: overrides
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            log,
        })
    }
}
