// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Deadline watchdog
//!
//! Periodically scans the registered transactions. An ACTIVE transaction past
//! its deadline is told to roll back through its own command queue, so the
//! driver stays the only writer of its state. A transaction already past the
//! point of decision is never aborted; it gets one warning instead.

use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::state::{TransactionId, TransactionStatus};
use super::transaction::TransactionHandle;
use crate::coordinator::TransactionCoordinator;

/// What one watchdog pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogScan {
    /// ACTIVE transactions that were sent a timeout
    pub timed_out: Vec<TransactionId>,
    /// Transactions past their deadline during completion, reported once each
    pub overdue: Vec<TransactionId>,
}

impl WatchdogScan {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.overdue.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutWatchdog {
    interval: Duration,
    checkpoint_interval: Duration,
}

impl TimeoutWatchdog {
    pub fn new(interval: Duration, checkpoint_interval: Duration) -> Self {
        Self {
            interval,
            checkpoint_interval,
        }
    }

    /// Check every deadline in `transactions` against `now`
    pub fn scan(&self, transactions: &[TransactionHandle], now: Instant) -> WatchdogScan {
        let mut scan = WatchdogScan::default();

        for txn in transactions {
            let shared = txn.shared();
            let status = shared.status();
            if status.is_terminal() || now < shared.deadline() {
                continue;
            }

            match status {
                TransactionStatus::Active => {
                    if txn.signal_timeout() {
                        log::debug!("Transaction {} passed its deadline; rolling back", txn.id());
                        scan.timed_out.push(txn.id());
                    }
                }
                status if status.is_in_completion() => {
                    if !shared
                        .overdue_reported
                        .swap(true, std::sync::atomic::Ordering::AcqRel)
                    {
                        log::warn!(
                            "Transaction {} passed its deadline while {}; letting it complete",
                            txn.id(),
                            status
                        );
                        scan.overdue.push(txn.id());
                    }
                }
                // Rolling back already
                _ => {}
            }
        }

        scan
    }

    /// Run until `shutdown` flips or the coordinator is dropped
    pub(crate) fn spawn(
        self,
        coordinator: Weak<TransactionCoordinator>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_checkpoint = Instant::now();
            let mut checkpoint_task: Option<JoinHandle<()>> = None;
            log::debug!("Watchdog started with interval {:?}", self.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };

                let now = Instant::now();
                self.scan(&coordinator.snapshot(), now);

                let checkpoint_running = checkpoint_task
                    .as_ref()
                    .map_or(false, |task| !task.is_finished());
                if !checkpoint_running
                    && now.duration_since(last_checkpoint) >= self.checkpoint_interval
                {
                    last_checkpoint = now;
                    // Log rewrites and fsyncs stay off the scan path
                    checkpoint_task = Some(tokio::task::spawn_blocking(move || {
                        if let Err(e) = coordinator.checkpoint() {
                            log::warn!("Periodic checkpoint failed: {}", e);
                        }
                    }));
                }
            }

            if let Some(task) = checkpoint_task {
                if let Err(e) = task.await {
                    log::warn!("Periodic checkpoint did not finish: {}", e);
                }
            }
            log::debug!("Watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::testing::MockResource;
    use crate::txn::transaction::DriverContext;
    use crate::txn::wal::TransactionLog;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(temp_dir: &TempDir) -> DriverContext {
        let config = CoordinatorConfig::new(temp_dir.path());
        DriverContext {
            log: Arc::new(TransactionLog::open(temp_dir.path(), config.max_segment_size).unwrap()),
            config: Arc::new(config),
            epoch: Instant::now(),
        }
    }

    async fn wait_for_status(txn: &TransactionHandle, status: TransactionStatus) {
        for _ in 0..100 {
            if txn.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transaction stuck in {}", txn.status());
    }

    #[tokio::test]
    async fn test_expired_active_transaction_is_signalled_once() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let watchdog = TimeoutWatchdog::new(Duration::from_millis(10), Duration::from_secs(60));

        let now = Instant::now();
        let expired = TransactionHandle::spawn(TransactionId::new(), now, ctx.clone());
        let live = TransactionHandle::spawn(
            TransactionId::new(),
            now + Duration::from_secs(60),
            ctx.clone(),
        );
        let snapshot = vec![expired.clone(), live.clone()];

        let scan = watchdog.scan(&snapshot, Instant::now());
        assert_eq!(scan.timed_out, vec![expired.id()]);

        wait_for_status(&expired, TransactionStatus::RolledBack).await;
        assert_eq!(live.status(), TransactionStatus::Active);

        // Terminal transactions are skipped
        assert!(watchdog.scan(&snapshot, Instant::now()).is_empty());
    }

    #[tokio::test]
    async fn test_transaction_in_completion_is_only_reported() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let watchdog = TimeoutWatchdog::new(Duration::from_millis(10), Duration::from_secs(60));

        let txn = TransactionHandle::spawn(
            TransactionId::new(),
            Instant::now() + Duration::from_millis(30),
            ctx,
        );
        let slow = Arc::new(
            MockResource::new("slow").with_prepare_delay(Duration::from_millis(150)),
        );
        txn.enlist(slow.clone()).await.unwrap();
        txn.enlist(Arc::new(MockResource::new("fast"))).await.unwrap();

        let committer = txn.clone();
        let commit = tokio::spawn(async move { committer.commit().await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let snapshot = vec![txn.clone()];

        let scan = watchdog.scan(&snapshot, Instant::now());
        assert!(scan.timed_out.is_empty());
        assert_eq!(scan.overdue, vec![txn.id()]);
        assert!(watchdog.scan(&snapshot, Instant::now()).overdue.is_empty());

        commit.await.unwrap().unwrap();
        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert_eq!(slow.commit_count(), 1);
    }
}
