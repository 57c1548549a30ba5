//! Roomsync Log - ordered topic logs for room traffic
//!
//! Each topic is an append-only sequence of entries numbered from 1. A
//! publish carrying the rollup header purges everything before it, which is
//! how a room's `clear` compacts its history. Subscribers replay retained
//! entries and then follow live appends with no gap between the two.

pub mod memory;
mod topic;

use serde::{Deserialize, Serialize};

/// Log behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Honor the rollup header; when off, rollup publishes are rejected
    pub native_rollup: bool,
    /// Oldest entries are dropped beyond this many per topic
    pub max_entries_per_topic: Option<usize>,
    /// Live entries buffered per subscriber before it is reported lagged
    pub live_buffer: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            native_rollup: true,
            max_entries_per_topic: None,
            live_buffer: 1024,
        }
    }
}

/// Log statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub topic_count: usize,
    pub entry_count: usize,
    pub total_payload_bytes: usize,
}

pub use memory::{MemoryConnector, MemoryLog};
