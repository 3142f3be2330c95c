//! Engine configuration

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Tunables of the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Depth used by `get`/`get_bulk` callers that have no preference
    pub default_depth: usize,
    /// Prefix of table names in translated SQL
    pub table_prefix: String,
    /// Capacity of each notification delivery channel
    pub notification_buffer: usize,
    pub log_level: String,
}

impl EngineConfig {
    pub fn new() -> Self {
        EngineConfig {
            default_depth: 1,
            table_prefix: "o_".to_string(),
            notification_buffer: 100,
            log_level: "info".to_string(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| EngineError::Internal(format!("Invalid engine config: {}", e)))
    }

    pub fn with_table_prefix(mut self, prefix: &str) -> Self {
        self.table_prefix = prefix.to_string();
        self
    }

    pub fn with_notification_buffer(mut self, capacity: usize) -> Self {
        self.notification_buffer = capacity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
