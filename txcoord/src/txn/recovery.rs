// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Crash recovery for the transaction log
//!
//! Runs once on startup, before the coordinator accepts new transactions.
//!
//! 1. Analysis: read every segment and keep the last record per transaction.
//! 2. Replay: transactions with a logged decision get that decision
//!    redelivered; transactions without one (crash while preparing) are
//!    rolled back. Heuristic records are left for the operator.
//! 3. Reconcile: every registered resource lists what it still holds
//!    prepared; anything not known to have committed is rolled back.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::resource::{ResourceError, ResourceManager};
use super::state::{Outcome, TransactionId};
use super::wal::{LogError, LogPhase, TransactionLog, TransactionLogRecord};

/// A transaction recovery could not close on its own
#[derive(Debug, Clone, PartialEq)]
pub struct InDoubtTransaction {
    pub transaction_id: TransactionId,
    pub phase: LogPhase,
    pub participants: Vec<String>,
    /// When the last record was written, if known
    pub logged_at: Option<DateTime<Utc>>,
    pub reason: String,
}

impl InDoubtTransaction {
    fn from_record(record: &TransactionLogRecord, reason: impl Into<String>) -> Self {
        Self {
            transaction_id: record.transaction_id,
            phase: record.phase,
            participants: record.participants.clone(),
            logged_at: Some(DateTime::<Utc>::from(record.timestamp)),
            reason: reason.into(),
        }
    }
}

/// Report of a recovery run
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    pub records_read: usize,
    pub committed: Vec<TransactionId>,
    pub rolled_back: Vec<TransactionId>,
    /// Heuristic outcomes waiting for operator reconciliation
    pub heuristic: Vec<InDoubtTransaction>,
    /// Decided or undecided transactions some participant could not be told about
    pub unresolved: Vec<InDoubtTransaction>,
    pub orphans_committed: usize,
    pub orphans_rolled_back: usize,
    pub orphans_failed: usize,
    /// Resources whose `recover` call failed
    pub unavailable_resources: Vec<String>,
    pub elapsed_ms: u64,
}

impl RecoveryReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            records_read: 0,
            committed: Vec::new(),
            rolled_back: Vec::new(),
            heuristic: Vec::new(),
            unresolved: Vec::new(),
            orphans_committed: 0,
            orphans_rolled_back: 0,
            orphans_failed: 0,
            unavailable_resources: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Nothing was found that needed work
    pub fn is_clean(&self) -> bool {
        self.committed.is_empty()
            && self.rolled_back.is_empty()
            && self.heuristic.is_empty()
            && self.unresolved.is_empty()
            && self.orphans_committed + self.orphans_rolled_back + self.orphans_failed == 0
    }
}

/// Recovery manager for the coordinator's transaction log
pub struct RecoveryManager<'a> {
    log: &'a TransactionLog,
    resources: &'a HashMap<String, Arc<dyn ResourceManager>>,
    call_timeout: Duration,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(
        log: &'a TransactionLog,
        resources: &'a HashMap<String, Arc<dyn ResourceManager>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            log,
            resources,
            call_timeout,
        }
    }

    pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
        let started = Instant::now();
        let mut report = RecoveryReport::new();

        let records = self.log.read_all()?;
        report.records_read = records.len();
        let latest = TransactionLog::latest_by_transaction(records);
        log::debug!(
            "Recovery analysis: {} records, {} transactions",
            report.records_read,
            latest.len()
        );

        let mut open: Vec<&TransactionLogRecord> = latest
            .values()
            .filter(|record| !record.phase.is_closed())
            .collect();
        open.sort_by_key(|record| record.position);

        let mut left_open: HashSet<TransactionId> = HashSet::new();
        for record in open {
            let id = record.transaction_id;

            if record.phase.is_heuristic() {
                log::warn!(
                    "Transaction {} was left {}; waiting for operator reconciliation",
                    id,
                    record.phase
                );
                report.heuristic.push(InDoubtTransaction::from_record(
                    record,
                    "heuristic outcome",
                ));
                left_open.insert(id);
                continue;
            }

            // No decision logged means nobody can have committed: presume abort
            let outcome = record.phase.decided_outcome().unwrap_or(Outcome::Rollback);
            log::info!(
                "Recovering transaction {} from {}: replaying {:?}",
                id,
                record.phase,
                outcome
            );

            match self.replay(record, outcome).await {
                Ok(()) => {
                    let phase = match outcome {
                        Outcome::Commit => LogPhase::Committed,
                        Outcome::Rollback => LogPhase::RolledBack,
                    };
                    self.log.append(id, phase, &record.participants)?;
                    match outcome {
                        Outcome::Commit => report.committed.push(id),
                        Outcome::Rollback => report.rolled_back.push(id),
                    }
                }
                Err(reason) => {
                    log::warn!("Transaction {} stays in doubt: {}", id, reason);
                    report
                        .unresolved
                        .push(InDoubtTransaction::from_record(record, reason));
                    left_open.insert(id);
                }
            }
        }

        self.reconcile_resources(&latest, &left_open, &mut report)
            .await;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "Recovery complete in {} ms: {} committed, {} rolled back, {} heuristic, {} unresolved",
            report.elapsed_ms,
            report.committed.len(),
            report.rolled_back.len(),
            report.heuristic.len(),
            report.unresolved.len()
        );

        Ok(report)
    }

    /// Redeliver `outcome` to every participant listed in the record
    async fn replay(
        &self,
        record: &TransactionLogRecord,
        outcome: Outcome,
    ) -> Result<(), String> {
        let mut failures = Vec::new();

        for resource_id in &record.participants {
            let Some(resource) = self.resources.get(resource_id) else {
                failures.push(format!("resource {} is not registered", resource_id));
                continue;
            };
            match self.deliver(resource, record.transaction_id, outcome).await {
                // Already resolved on the resource's side
                Ok(()) | Err(ResourceError::UnknownTransaction) => {}
                Err(e) => failures.push(format!("{}: {}", resource_id, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    /// Resolve transactions resources still hold prepared
    async fn reconcile_resources(
        &self,
        latest: &HashMap<TransactionId, TransactionLogRecord>,
        left_open: &HashSet<TransactionId>,
        report: &mut RecoveryReport,
    ) {
        let mut resource_ids: Vec<&String> = self.resources.keys().collect();
        resource_ids.sort();

        for resource_id in resource_ids {
            let resource = &self.resources[resource_id];

            let in_doubt = match tokio::time::timeout(self.call_timeout, resource.recover()).await
            {
                Ok(Ok(xids)) => xids,
                Ok(Err(e)) => {
                    log::warn!("Resource {} could not list in-doubt transactions: {}", resource_id, e);
                    report.unavailable_resources.push(resource_id.clone());
                    continue;
                }
                Err(_) => {
                    log::warn!("Resource {} timed out listing in-doubt transactions", resource_id);
                    report.unavailable_resources.push(resource_id.clone());
                    continue;
                }
            };

            for xid in in_doubt {
                if left_open.contains(&xid) {
                    continue;
                }
                let outcome = match latest.get(&xid).map(|record| record.phase) {
                    Some(LogPhase::Committing) | Some(LogPhase::Committed) => Outcome::Commit,
                    _ => Outcome::Rollback,
                };

                match self.deliver(resource, xid, outcome).await {
                    Ok(()) | Err(ResourceError::UnknownTransaction) => {
                        log::info!(
                            "Resolved in-doubt transaction {} at {} with {:?}",
                            xid,
                            resource_id,
                            outcome
                        );
                        match outcome {
                            Outcome::Commit => report.orphans_committed += 1,
                            Outcome::Rollback => report.orphans_rolled_back += 1,
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Could not resolve in-doubt transaction {} at {}: {}",
                            xid,
                            resource_id,
                            e
                        );
                        report.orphans_failed += 1;
                    }
                }
            }
        }
    }

    async fn deliver(
        &self,
        resource: &Arc<dyn ResourceManager>,
        xid: TransactionId,
        outcome: Outcome,
    ) -> Result<(), ResourceError> {
        let call = async {
            match outcome {
                Outcome::Commit => resource.commit(xid, false).await,
                Outcome::Rollback => resource.rollback(xid).await,
            }
        };
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ResourceError::Timeout(self.call_timeout)),
        }
    }
}

/// Recovery-specific errors
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Recovery log error: {0}")]
    Log(#[from] LogError),
}
