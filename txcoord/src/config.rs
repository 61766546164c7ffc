// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoordinatorError, Result};

/// Settings for a [`crate::TransactionCoordinator`]
///
/// Durations are written as milliseconds in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Directory holding the transaction log segments
    pub log_dir: PathBuf,

    /// Timeout applied when `begin` is called without one
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Maximum number of transactions that have not reached a terminal state
    pub max_active_transactions: usize,

    /// Bound on every single prepare/commit/rollback call
    #[serde(with = "duration_millis")]
    pub participant_call_timeout: Duration,

    /// How often the watchdog scans deadlines
    #[serde(with = "duration_millis")]
    pub watchdog_interval: Duration,

    /// How long `shutdown` waits for in-flight transactions
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// How long committed/rolled back transactions stay visible in the registry
    #[serde(with = "duration_millis")]
    pub completed_retention: Duration,

    /// How often the watchdog compacts the log
    #[serde(with = "duration_millis")]
    pub checkpoint_interval: Duration,

    /// Size at which the log rolls over to a new segment (bytes)
    pub max_segment_size: u64,

    /// Pending operations queued per transaction
    pub command_queue_depth: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("txlog"),
            default_timeout: Duration::from_secs(120),
            max_active_transactions: 1024,
            participant_call_timeout: Duration::from_secs(30),
            watchdog_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(30),
            completed_retention: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(300),
            max_segment_size: 64 * 1024 * 1024, // 64MB
            command_queue_depth: 32,
        }
    }
}

impl CoordinatorConfig {
    /// Default settings with the log stored in `log_dir`
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            CoordinatorError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_active_transactions == 0 {
            return Err(CoordinatorError::Config(
                "max_active_transactions must be at least 1".to_string(),
            ));
        }
        if self.command_queue_depth == 0 {
            return Err(CoordinatorError::Config(
                "command_queue_depth must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("default_timeout", self.default_timeout),
            ("participant_call_timeout", self.participant_call_timeout),
            ("watchdog_interval", self.watchdog_interval),
        ] {
            if value.is_zero() {
                return Err(CoordinatorError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.max_segment_size < 4096 {
            return Err(CoordinatorError::Config(
                "max_segment_size must be at least 4096 bytes".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
