//! Publish metadata carried alongside a payload

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rollup directive understood by logs with native compaction
pub const ROLLUP_HEADER: &str = "Nats-Rollup";

/// Roll up the whole subject (topic)
pub const ROLLUP_SUBJECT: &str = "sub";

/// Compaction marker for logs without native rollup
pub const COMPACTION_HEADER: &str = "Roomsync-Compaction";

pub const COMPACTION_MARKER: &str = "marker";

/// String headers attached to a published entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers asking the log to purge everything before this entry
    pub fn rollup() -> Self {
        let mut headers = Self::new();
        headers.insert(ROLLUP_HEADER, ROLLUP_SUBJECT);
        headers
    }

    /// Headers marking a compaction point for new subscribers to resume from
    pub fn compaction_marker() -> Self {
        let mut headers = Self::new();
        headers.insert(COMPACTION_HEADER, COMPACTION_MARKER);
        headers
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_rollup(&self) -> bool {
        self.get(ROLLUP_HEADER) == Some(ROLLUP_SUBJECT)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
