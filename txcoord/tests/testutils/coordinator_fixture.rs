//! Test fixture for txcoord integration tests
//!
//! Uses only the public crate API.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use txcoord::{CoordinatorConfig, ResourceManager, TransactionCoordinator, TransactionHandle, TransactionStatus};

/// A coordinator on a temporary log directory
pub struct CoordinatorFixture {
    coordinator: Arc<TransactionCoordinator>,
    log_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl CoordinatorFixture {
    /// Start with no resources registered for recovery
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_resources(vec![]).await
    }

    pub async fn with_resources(
        resources: Vec<Arc<dyn ResourceManager>>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let temp_dir = tempfile::tempdir()?;
        let log_dir = temp_dir.path().join("txlog");
        let coordinator = TransactionCoordinator::start(fast_config(&log_dir), resources).await?;
        Ok(Self {
            coordinator,
            log_dir,
            _temp_dir: temp_dir,
        })
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Shut down and start a fresh coordinator on the same log
    pub async fn restart(
        &mut self,
        resources: Vec<Arc<dyn ResourceManager>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.coordinator.shutdown().await;
        self.coordinator = TransactionCoordinator::start(fast_config(&self.log_dir), resources).await?;
        Ok(())
    }
}

/// Configuration with short intervals for tests
pub fn fast_config(log_dir: &Path) -> CoordinatorConfig {
    init_logging();
    CoordinatorConfig {
        watchdog_interval: Duration::from_millis(10),
        participant_call_timeout: Duration::from_millis(500),
        shutdown_grace: Duration::from_millis(100),
        max_segment_size: 64 * 1024,
        ..CoordinatorConfig::new(log_dir)
    }
}

/// Honour RUST_LOG in tests
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll until the transaction reaches `status` or `within` elapses
pub async fn wait_for_status(
    txn: &TransactionHandle,
    status: TransactionStatus,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if txn.status() == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    txn.status() == status
}
