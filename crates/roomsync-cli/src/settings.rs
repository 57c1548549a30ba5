//! Participant settings file

use anyhow::{Context, Result};
use roomsync_core::EngineConfig;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_SERVER: &str = "ws://127.0.0.1:7422";
pub const DEFAULT_BASE_URL: &str = "http://localhost:5173/";

/// Contents of `roomsync.toml`
///
/// ```toml
/// server = "ws://maps.example.com:7422"
/// base_url = "https://maps.example.com/"
///
/// [engine]
/// compaction = "marker"
///
/// [engine.backoff]
/// max_attempts = 20
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: Option<String>,
    pub base_url: Option<String>,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }
}
