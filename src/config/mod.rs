//! Configuration for the selection transfer engine
//!
//! This module handles loading, parsing, and validating the engine's
//! tunables from TOML. Everything has a sensible default; a host embedding
//! the engine usually nests this table inside its own configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables for selection transfers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionConfig {
    /// Quiescence window before an inactive transfer is aborted (milliseconds)
    #[serde(default = "SelectionConfig::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,

    /// Accumulation buffer size for outbound value delivery (bytes)
    #[serde(default = "SelectionConfig::default_transfer_buffer_size")]
    pub transfer_buffer_size: usize,

    /// Upper bound on conversion requests deferred behind a busy
    /// (requestor, property) pair; overflow refuses the newcomer
    #[serde(default = "SelectionConfig::default_max_queued_requests")]
    pub max_queued_requests: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            transfer_buffer_size: Self::default_transfer_buffer_size(),
            max_queued_requests: Self::default_max_queued_requests(),
        }
    }
}

impl SelectionConfig {
    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    fn default_transfer_buffer_size() -> usize {
        64 * 1024
    }

    fn default_max_queued_requests() -> usize {
        64
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: SelectionConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.transfer_timeout_ms == 0 {
            anyhow::bail!("Invalid transfer_timeout_ms: must be nonzero");
        }

        // Property data travels in 32-bit units; anything smaller than one
        // unit cannot make forward progress.
        if self.transfer_buffer_size < 4 {
            anyhow::bail!("Invalid transfer_buffer_size: must be at least 4 bytes");
        }

        Ok(())
    }
}
