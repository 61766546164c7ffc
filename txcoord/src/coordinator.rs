// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction coordinator
//!
//! Owns the transaction log, the registry of live transactions and the
//! deadline watchdog. Recovery runs inside [`TransactionCoordinator::start`],
//! before any new transaction can begin.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::txn::recovery::{InDoubtTransaction, RecoveryManager, RecoveryReport};
use crate::txn::resource::ResourceManager;
use crate::txn::state::{deadline_after, RollbackCause, TransactionId, TransactionStatus};
use crate::txn::transaction::{DriverContext, Enlistment, TransactionHandle};
use crate::txn::wal::{LogPhase, TransactionLog};
use crate::txn::watchdog::{TimeoutWatchdog, WatchdogScan};

/// Coordinates two-phase commit across registered resource managers
pub struct TransactionCoordinator {
    config: Arc<CoordinatorConfig>,
    log: Arc<TransactionLog>,
    /// Reference point for deadlines stored as offsets
    epoch: Instant,
    /// Live and recently completed transactions
    transactions: RwLock<HashMap<TransactionId, TransactionHandle>>,
    /// Transactions recovery could not close
    in_doubt: RwLock<HashMap<TransactionId, InDoubtTransaction>>,
    resources: HashMap<String, Arc<dyn ResourceManager>>,
    accepting: AtomicBool,
    shutdown_signal: watch::Sender<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    recovery_report: RecoveryReport,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("log_dir", &self.config.log_dir)
            .field("transactions", &self.transactions.read().len())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransactionCoordinator {
    /// Open the log, recover, and start the watchdog
    ///
    /// `resources` are the resource managers recovery may need to contact;
    /// resources enlisted later do not have to be listed here.
    pub async fn start(
        config: CoordinatorConfig,
        resources: Vec<Arc<dyn ResourceManager>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let mut registry: HashMap<String, Arc<dyn ResourceManager>> = HashMap::new();
        for resource in resources {
            let resource_id = resource.resource_id().to_string();
            if registry.insert(resource_id.clone(), resource).is_some() {
                return Err(CoordinatorError::Config(format!(
                    "resource {} registered twice",
                    resource_id
                )));
            }
        }

        let log = Arc::new(TransactionLog::open(&config.log_dir, config.max_segment_size)?);
        let recovery_report =
            RecoveryManager::new(&log, &registry, config.participant_call_timeout)
                .recover()
                .await?;

        let in_doubt = recovery_report
            .heuristic
            .iter()
            .chain(recovery_report.unresolved.iter())
            .map(|entry| (entry.transaction_id, entry.clone()))
            .collect();

        let (shutdown_signal, shutdown_receiver) = watch::channel(false);
        let watchdog = TimeoutWatchdog::new(config.watchdog_interval, config.checkpoint_interval);

        let coordinator = Arc::new(Self {
            config: Arc::new(config),
            log,
            epoch: Instant::now(),
            transactions: RwLock::new(HashMap::new()),
            in_doubt: RwLock::new(in_doubt),
            resources: registry,
            accepting: AtomicBool::new(true),
            shutdown_signal,
            watchdog: Mutex::new(None),
            recovery_report,
        });

        let handle = watchdog.spawn(Arc::downgrade(&coordinator), shutdown_receiver);
        *coordinator.watchdog.lock() = Some(handle);

        log::info!(
            "Transaction coordinator started (log: {})",
            coordinator.config.log_dir.display()
        );
        Ok(coordinator)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    /// Resource managers registered at startup
    pub fn registered_resources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.resources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a new ACTIVE transaction
    ///
    /// `None` or a zero timeout uses the configured default.
    pub fn begin(&self, timeout: Option<Duration>) -> Result<TransactionHandle> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CoordinatorError::IllegalState(
                "coordinator is shutting down".to_string(),
            ));
        }

        let timeout = match timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.config.default_timeout,
        };

        // Count and insert under one write lock so the cap cannot be overshot
        let mut transactions = self.transactions.write();
        let active = transactions
            .values()
            .filter(|txn| !txn.status().is_terminal())
            .count();
        if active >= self.config.max_active_transactions {
            return Err(CoordinatorError::ResourceExhausted {
                active,
                limit: self.config.max_active_transactions,
            });
        }

        let id = TransactionId::new();
        let deadline = deadline_after(Instant::now(), timeout);
        let handle = TransactionHandle::spawn(id, deadline, self.driver_context());
        transactions.insert(id, handle.clone());

        log::debug!("Began transaction {} with timeout {:?}", id, timeout);
        Ok(handle)
    }

    pub fn get_transaction(&self, id: TransactionId) -> Result<TransactionHandle> {
        self.transactions
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoordinatorError::NotFound(id))
    }

    pub async fn enlist(
        &self,
        id: TransactionId,
        resource: Arc<dyn ResourceManager>,
    ) -> Result<Enlistment> {
        self.get_transaction(id)?.enlist(resource).await
    }

    pub async fn commit(&self, id: TransactionId) -> Result<()> {
        self.get_transaction(id)?.commit().await
    }

    pub async fn rollback(&self, id: TransactionId) -> Result<()> {
        self.get_transaction(id)?.rollback().await
    }

    pub async fn set_rollback_only(&self, id: TransactionId) -> Result<()> {
        self.get_transaction(id)?.set_rollback_only().await
    }

    /// Returns `false` when the transaction is no longer ACTIVE
    pub async fn set_transaction_timeout(&self, id: TransactionId, timeout: Duration) -> Result<bool> {
        self.get_transaction(id)?
            .set_transaction_timeout(timeout)
            .await
    }

    /// Transactions that have not reached a terminal state
    pub fn active_count(&self) -> usize {
        self.transactions
            .read()
            .values()
            .filter(|txn| !txn.status().is_terminal())
            .count()
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.read().keys().copied().collect()
    }

    /// Status counts over the registry
    pub fn statistics(&self) -> CoordinatorStatistics {
        let mut stats = CoordinatorStatistics {
            in_doubt_transactions: self.in_doubt.read().len() as u64,
            ..CoordinatorStatistics::default()
        };

        for txn in self.transactions.read().values() {
            stats.total_transactions += 1;
            match txn.status() {
                TransactionStatus::Active => stats.active_transactions += 1,
                TransactionStatus::Committed => stats.committed_transactions += 1,
                TransactionStatus::RolledBack => stats.rolled_back_transactions += 1,
                TransactionStatus::HeuristicMixed | TransactionStatus::HeuristicHazard => {
                    stats.heuristic_transactions += 1
                }
                _ => stats.completing_transactions += 1,
            }
        }

        stats
    }

    /// Transactions waiting for an operator: runtime heuristics and what
    /// recovery left open
    pub fn heuristic_transactions(&self) -> Vec<InDoubtTransaction> {
        let mut entries: Vec<InDoubtTransaction> = self
            .transactions
            .read()
            .values()
            .filter_map(|txn| {
                let status = txn.status();
                if !status.is_heuristic() {
                    return None;
                }
                LogPhase::for_status(status).map(|phase| InDoubtTransaction {
                    transaction_id: txn.id(),
                    phase,
                    participants: txn.participant_ids(),
                    logged_at: None,
                    reason: "heuristic outcome".to_string(),
                })
            })
            .collect();

        entries.extend(self.in_doubt.read().values().cloned());
        entries.sort_by_key(|entry| entry.transaction_id);
        entries
    }

    /// Acknowledge a heuristic or in-doubt transaction and drop it
    pub fn forget(&self, id: TransactionId) -> Result<()> {
        let live = self.transactions.read().get(&id).cloned();
        if let Some(txn) = live {
            let status = txn.status();
            if !status.is_heuristic() {
                return Err(CoordinatorError::illegal_state(id, "forget", status));
            }
            self.log
                .append(id, LogPhase::Forgotten, &txn.participant_ids())?;
            self.transactions.write().remove(&id);
            log::info!("Forgot transaction {} ({})", id, status);
            return Ok(());
        }

        let recovered = self.in_doubt.read().get(&id).cloned();
        if let Some(entry) = recovered {
            self.log
                .append(id, LogPhase::Forgotten, &entry.participants)?;
            self.in_doubt.write().remove(&id);
            log::info!("Forgot recovered transaction {} ({})", id, entry.phase);
            return Ok(());
        }

        Err(CoordinatorError::NotFound(id))
    }

    /// Evict old completed transactions and compact the log
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        let now = Instant::now();
        let retention = self.config.completed_retention;

        let evicted = {
            let mut transactions = self.transactions.write();
            let before = transactions.len();
            transactions.retain(|_, txn| {
                let status = txn.status();
                let expired = txn
                    .shared()
                    .completed_for(now)
                    .map_or(false, |age| age >= retention);
                // Heuristic outcomes stay until forgotten
                status.is_heuristic() || !expired
            });
            before - transactions.len()
        };

        let compaction = self.log.checkpoint()?;
        log::debug!(
            "Checkpoint: evicted {} transactions, retained {} records, removed {} segments",
            evicted,
            compaction.records_retained,
            compaction.segments_removed
        );

        Ok(CheckpointReport {
            evicted_transactions: evicted,
            records_retained: compaction.records_retained,
            segments_removed: compaction.segments_removed,
        })
    }

    /// Run one watchdog pass now
    pub fn scan_timeouts(&self) -> WatchdogScan {
        TimeoutWatchdog::new(self.config.watchdog_interval, self.config.checkpoint_interval)
            .scan(&self.snapshot(), Instant::now())
    }

    /// Stop accepting work, let in-flight transactions finish, roll back the rest
    ///
    /// Transactions past the point of decision are never rolled back; they
    /// are reported and left to finish or to be recovered on the next start.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.accepting.store(false, Ordering::Release);
        log::info!("Transaction coordinator shutting down");

        let grace_end = Instant::now() + self.config.shutdown_grace;
        loop {
            let open = self.open_transactions();
            let now = Instant::now();
            if open.is_empty() || now >= grace_end {
                break;
            }
            let pause = self.config.watchdog_interval.min(grace_end - now);
            tokio::time::sleep(pause).await;
        }

        let mut report = ShutdownReport::default();
        for txn in self.open_transactions() {
            let id = txn.id();
            if txn.status() != TransactionStatus::Active {
                log::warn!(
                    "Transaction {} still {} at shutdown; leaving it to complete",
                    id,
                    txn.status()
                );
                report.still_completing.push(id);
                continue;
            }

            match txn.rollback_with_cause(RollbackCause::Shutdown).await {
                Ok(()) => report.rolled_back.push(id),
                // Moved into completion since the status was read
                Err(CoordinatorError::IllegalState(_)) => report.still_completing.push(id),
                Err(e) => {
                    log::error!("Rollback of transaction {} at shutdown failed: {}", id, e);
                    report.failed.push(id);
                }
            }
        }

        let _ = self.shutdown_signal.send(true);
        let watchdog = self.watchdog.lock().take();
        if let Some(handle) = watchdog {
            if let Err(e) = handle.await {
                log::warn!("Watchdog task ended abnormally: {}", e);
            }
        }

        log::info!(
            "Transaction coordinator stopped: {} rolled back, {} still completing, {} failed",
            report.rolled_back.len(),
            report.still_completing.len(),
            report.failed.len()
        );
        report
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> Vec<TransactionHandle> {
        self.transactions.read().values().cloned().collect()
    }

    fn open_transactions(&self) -> Vec<TransactionHandle> {
        self.transactions
            .read()
            .values()
            .filter(|txn| !txn.status().is_terminal())
            .cloned()
            .collect()
    }

    fn driver_context(&self) -> DriverContext {
        DriverContext {
            log: self.log.clone(),
            config: self.config.clone(),
            epoch: self.epoch,
        }
    }
}

/// Registry counts for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStatistics {
    pub total_transactions: u64,
    pub active_transactions: u64,
    /// Preparing, prepared, committing or rolling back
    pub completing_transactions: u64,
    pub committed_transactions: u64,
    pub rolled_back_transactions: u64,
    pub heuristic_transactions: u64,
    /// Left open by recovery
    pub in_doubt_transactions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    pub evicted_transactions: usize,
    pub records_retained: usize,
    pub segments_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// ACTIVE transactions rolled back because the grace period ran out
    pub rolled_back: Vec<TransactionId>,
    /// Transactions past the point of decision, left running
    pub still_completing: Vec<TransactionId>,
    pub failed: Vec<TransactionId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockResource;
    use crate::txn::resource::ResourceError;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> CoordinatorConfig {
        CoordinatorConfig {
            watchdog_interval: Duration::from_millis(10),
            participant_call_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_millis(50),
            ..CoordinatorConfig::new(temp_dir.path())
        }
    }

    #[tokio::test]
    async fn test_begin_and_commit_by_id() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = TransactionCoordinator::start(test_config(&temp_dir), vec![])
            .await
            .unwrap();

        let txn = coordinator.begin(None).unwrap();
        let id = txn.id();
        let db1 = Arc::new(MockResource::new("db1"));
        let db2 = Arc::new(MockResource::new("db2"));
        coordinator.enlist(id, db1.clone()).await.unwrap();
        coordinator.enlist(id, db2.clone()).await.unwrap();

        assert_eq!(coordinator.active_count(), 1);
        coordinator.commit(id).await.unwrap();

        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(coordinator.statistics().committed_transactions, 1);
        assert_eq!(db1.commit_count(), 1);
        assert_eq!(db2.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = TransactionCoordinator::start(test_config(&temp_dir), vec![])
            .await
            .unwrap();

        let id = TransactionId::new();
        assert!(matches!(
            coordinator.commit(id).await,
            Err(CoordinatorError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(
            coordinator.set_transaction_timeout(id, Duration::from_secs(1)).await,
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_with_huge_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = TransactionCoordinator::start(test_config(&temp_dir), vec![])
            .await
            .unwrap();

        let txn = coordinator
            .begin(Some(Duration::from_millis(u64::MAX)))
            .unwrap();
        assert!(txn.deadline() > Instant::now() + Duration::from_secs(3600));

        // Several watchdog passes go by without a timeout
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(txn.status(), TransactionStatus::Active);
        assert!(coordinator.scan_timeouts().is_empty());

        coordinator.rollback(txn.id()).await.unwrap();
        assert_eq!(txn.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_active_cap() {
        let temp_dir = TempDir::new().unwrap();
        let config = CoordinatorConfig {
            max_active_transactions: 2,
            ..test_config(&temp_dir)
        };
        let coordinator = TransactionCoordinator::start(config, vec![]).await.unwrap();

        let first = coordinator.begin(None).unwrap();
        coordinator.begin(None).unwrap();
        assert!(matches!(
            coordinator.begin(None),
            Err(CoordinatorError::ResourceExhausted { active: 2, limit: 2 })
        ));

        // Completed transactions do not count
        first.rollback().await.unwrap();
        coordinator.begin(None).unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_resource_registration_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = TransactionCoordinator::start(
            test_config(&temp_dir),
            vec![
                Arc::new(MockResource::new("db1")) as Arc<dyn ResourceManager>,
                Arc::new(MockResource::new("db1")),
            ],
        )
        .await;
        assert!(matches!(result, Err(CoordinatorError::Config(_))));
    }

    #[tokio::test]
    async fn test_forget_heuristic_transaction() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = TransactionCoordinator::start(test_config(&temp_dir), vec![])
            .await
            .unwrap();

        let txn = coordinator.begin(None).unwrap();
        txn.enlist(Arc::new(MockResource::new("db1"))).await.unwrap();
        txn.enlist(Arc::new(
            MockResource::new("db2").failing_commit(ResourceError::Unavailable("down".to_string())),
        ))
        .await
        .unwrap();

        assert!(matches!(
            txn.commit().await,
            Err(CoordinatorError::Heuristic {
                status: TransactionStatus::HeuristicMixed,
                ..
            })
        ));

        let pending = coordinator.heuristic_transactions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase, LogPhase::HeuristicMixed);

        // Checkpoints keep heuristic transactions around
        coordinator.checkpoint().unwrap();
        assert!(coordinator.get_transaction(txn.id()).is_ok());

        coordinator.forget(txn.id()).unwrap();
        assert!(coordinator.heuristic_transactions().is_empty());
        assert!(matches!(
            coordinator.get_transaction(txn.id()),
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_forget_rejects_healthy_transaction() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = TransactionCoordinator::start(test_config(&temp_dir), vec![])
            .await
            .unwrap();

        let txn = coordinator.begin(None).unwrap();
        assert!(matches!(
            coordinator.forget(txn.id()),
            Err(CoordinatorError::IllegalState(_))
        ));
        assert!(matches!(
            coordinator.forget(TransactionId::new()),
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_evicts_expired_completions() {
        let temp_dir = TempDir::new().unwrap();
        let config = CoordinatorConfig {
            completed_retention: Duration::ZERO,
            ..test_config(&temp_dir)
        };
        let coordinator = TransactionCoordinator::start(config, vec![]).await.unwrap();

        let done = coordinator.begin(None).unwrap();
        done.commit().await.unwrap();
        let open = coordinator.begin(None).unwrap();

        let report = coordinator.checkpoint().unwrap();
        assert_eq!(report.evicted_transactions, 1);
        assert_eq!(coordinator.transaction_ids(), vec![open.id()]);
    }

    #[tokio::test]
    async fn test_watchdog_runs_periodic_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let config = CoordinatorConfig {
            checkpoint_interval: Duration::from_millis(20),
            completed_retention: Duration::ZERO,
            ..test_config(&temp_dir)
        };
        let coordinator = TransactionCoordinator::start(config, vec![]).await.unwrap();

        let txn = coordinator.begin(None).unwrap();
        txn.commit().await.unwrap();

        let mut evicted = false;
        for _ in 0..50 {
            if coordinator.get_transaction(txn.id()).is_err() {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(evicted);

        // Scans keep running alongside the checkpoints
        let expiring = coordinator.begin(Some(Duration::from_millis(30))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(expiring.status(), TransactionStatus::RolledBack);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rolls_back_idle_transactions() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = TransactionCoordinator::start(test_config(&temp_dir), vec![])
            .await
            .unwrap();

        let db1 = Arc::new(MockResource::new("db1"));
        let idle = coordinator.begin(None).unwrap();
        idle.enlist(db1.clone()).await.unwrap();

        let report = coordinator.shutdown().await;
        assert_eq!(report.rolled_back, vec![idle.id()]);
        assert!(report.still_completing.is_empty());
        assert_eq!(idle.status(), TransactionStatus::RolledBack);
        assert_eq!(db1.rollback_count(), 1);

        assert!(!coordinator.is_accepting());
        assert!(matches!(
            coordinator.begin(None),
            Err(CoordinatorError::IllegalState(_))
        ));
    }
}
