// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction state management
//!
//! This module defines transaction identifiers, the lifecycle states of the
//! two-phase commit state machine and the shared snapshot the timeout
//! watchdog reads without taking any lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Globally unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a fresh random transaction id
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }

    /// Raw 16 byte form used by the transaction log
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuild an id read back from the transaction log
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TransactionId(Uuid::from_bytes(bytes))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TransactionId)
    }
}

/// Transaction lifecycle states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Transaction is active and accepts enlistments
    Active = 0,
    /// Votes are being collected (2PC first phase)
    Preparing = 1,
    /// Every participant voted to commit
    Prepared = 2,
    /// Commit decision is durable and being delivered
    Committing = 3,
    /// Transaction has been committed successfully
    Committed = 4,
    /// Rollback is being delivered
    RollingBack = 5,
    /// Transaction has been rolled back
    RolledBack = 6,
    /// Some participants committed while others did not
    HeuristicMixed = 7,
    /// The outcome at one or more participants is unknown
    HeuristicHazard = 8,
}

impl TransactionStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => TransactionStatus::Active,
            1 => TransactionStatus::Preparing,
            2 => TransactionStatus::Prepared,
            3 => TransactionStatus::Committing,
            4 => TransactionStatus::Committed,
            5 => TransactionStatus::RollingBack,
            6 => TransactionStatus::RolledBack,
            7 => TransactionStatus::HeuristicMixed,
            8 => TransactionStatus::HeuristicHazard,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::Preparing => "PREPARING",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RollingBack => "ROLLING_BACK",
            TransactionStatus::RolledBack => "ROLLED_BACK",
            TransactionStatus::HeuristicMixed => "HEURISTIC_MIXED",
            TransactionStatus::HeuristicHazard => "HEURISTIC_HAZARD",
        }
    }

    /// No further transitions happen from a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::RolledBack
                | TransactionStatus::HeuristicMixed
                | TransactionStatus::HeuristicHazard
        )
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            TransactionStatus::HeuristicMixed | TransactionStatus::HeuristicHazard
        )
    }

    /// States in which a commit is in flight and the watchdog must not abort
    pub fn is_in_completion(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Preparing
                | TransactionStatus::Prepared
                | TransactionStatus::Committing
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coordinator's decision for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Commit,
    Rollback,
}

/// Why a transaction was rolled back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackCause {
    /// The application asked for it
    Requested,
    /// The deadline passed before a commit decision
    Timeout,
    /// The transaction was marked rollback-only
    RollbackOnly,
    /// A participant voted to abort during prepare
    Vote { resource_id: String },
    /// A participant call failed before the decision
    ParticipantFailure { resource_id: String, reason: String },
    /// The decision could not be made durable
    LogFailure(String),
    /// The coordinator was shutting down
    Shutdown,
}

impl std::fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackCause::Requested => write!(f, "rollback requested"),
            RollbackCause::Timeout => write!(f, "transaction timed out"),
            RollbackCause::RollbackOnly => write!(f, "transaction marked rollback-only"),
            RollbackCause::Vote { resource_id } => {
                write!(f, "participant {} voted to abort", resource_id)
            }
            RollbackCause::ParticipantFailure {
                resource_id,
                reason,
            } => write!(f, "participant {} failed: {}", resource_id, reason),
            RollbackCause::LogFailure(msg) => write!(f, "transaction log failure: {}", msg),
            RollbackCause::Shutdown => write!(f, "coordinator shutdown"),
        }
    }
}

/// Longest deadline the coordinator tracks; larger timeouts are clamped
pub(crate) const MAX_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + timeout`, clamped to [`MAX_TIMEOUT`]
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    let timeout = timeout.min(MAX_TIMEOUT);
    now.checked_add(timeout)
        .or_else(|| now.checked_add(Duration::from_secs(365 * 24 * 60 * 60)))
        .unwrap_or(now)
}

/// State shared between a transaction's driver task and its observers.
///
/// Only the driver writes `status` and `participants`. The watchdog reads
/// `status` and the deadline through atomics.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) id: TransactionId,
    epoch: Instant,
    status: AtomicU8,
    /// Deadline in milliseconds since `epoch`
    deadline_ms: AtomicU64,
    /// Completion time in milliseconds since `epoch`, zero while open
    completed_ms: AtomicU64,
    pub(crate) timeout_signalled: AtomicBool,
    pub(crate) overdue_reported: AtomicBool,
    participants: RwLock<Vec<String>>,
}

impl SharedState {
    pub(crate) fn new(id: TransactionId, epoch: Instant, deadline: Instant) -> Self {
        let shared = Self {
            id,
            epoch,
            status: AtomicU8::new(TransactionStatus::Active as u8),
            deadline_ms: AtomicU64::new(0),
            completed_ms: AtomicU64::new(0),
            timeout_signalled: AtomicBool::new(false),
            overdue_reported: AtomicBool::new(false),
            participants: RwLock::new(Vec::new()),
        };
        shared.set_deadline(deadline);
        shared
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(TransactionStatus::HeuristicHazard)
    }

    pub(crate) fn set_status(&self, status: TransactionStatus) {
        self.status.store(status as u8, Ordering::Release);
        if status.is_terminal() {
            // Never store zero so "completed" stays distinguishable from "open"
            let elapsed = self.millis_since_epoch(Instant::now()).max(1);
            self.completed_ms.store(elapsed, Ordering::Release);
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        let offset = Duration::from_millis(self.deadline_ms.load(Ordering::Acquire));
        self.epoch
            .checked_add(offset)
            .unwrap_or_else(|| deadline_after(self.epoch, MAX_TIMEOUT))
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        let millis = self.millis_since_epoch(deadline);
        self.deadline_ms.store(millis, Ordering::Release);
    }

    /// Time spent in a terminal state, `None` while the transaction is open
    pub(crate) fn completed_for(&self, now: Instant) -> Option<Duration> {
        match self.completed_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(now.saturating_duration_since(self.epoch + Duration::from_millis(ms))),
        }
    }

    pub(crate) fn participants(&self) -> Vec<String> {
        self.participants.read().clone()
    }

    pub(crate) fn push_participant(&self, resource_id: String) {
        self.participants.write().push(resource_id);
    }

    fn millis_since_epoch(&self, at: Instant) -> u64 {
        // Round up so a deadline is never observed earlier than requested
        let since = at.saturating_duration_since(self.epoch);
        let millis = u64::try_from(since.as_millis()).unwrap_or(u64::MAX);
        if since.subsec_nanos() % 1_000_000 != 0 {
            millis.saturating_add(1)
        } else {
            millis
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_u8() {
        for value in 0..=8u8 {
            let status = TransactionStatus::from_u8(value).unwrap();
            assert_eq!(status as u8, value);
        }
        assert!(TransactionStatus::from_u8(9).is_none());
    }

    #[test]
    fn test_terminal_and_heuristic_classification() {
        assert!(!TransactionStatus::Active.is_terminal());
        assert!(!TransactionStatus::Committing.is_terminal());
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::HeuristicMixed.is_terminal());
        assert!(TransactionStatus::HeuristicHazard.is_heuristic());
        assert!(!TransactionStatus::RolledBack.is_heuristic());
        assert!(TransactionStatus::Prepared.is_in_completion());
        assert!(!TransactionStatus::Active.is_in_completion());
    }

    #[test]
    fn test_transaction_id_parses_its_display_form() {
        let id = TransactionId::new();
        let parsed: TransactionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(TransactionId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_shared_state_tracks_deadline_and_completion() {
        let epoch = Instant::now();
        let deadline = epoch + Duration::from_millis(250);
        let shared = SharedState::new(TransactionId::new(), epoch, deadline);

        assert_eq!(shared.status(), TransactionStatus::Active);
        assert!(shared.deadline() >= deadline);
        assert!(shared.deadline() <= deadline + Duration::from_millis(1));
        assert!(shared.completed_for(Instant::now()).is_none());

        shared.set_status(TransactionStatus::RolledBack);
        assert_eq!(shared.status(), TransactionStatus::RolledBack);
        assert!(shared.completed_for(Instant::now()).is_some());
    }

    #[test]
    fn test_oversized_deadline_is_clamped() {
        let epoch = Instant::now();
        let deadline = deadline_after(epoch, Duration::from_millis(u64::MAX));
        assert!(deadline > epoch + Duration::from_secs(3600));
        assert!(deadline <= epoch + MAX_TIMEOUT);

        let shared = SharedState::new(TransactionId::new(), epoch, deadline);
        assert!(shared.deadline() >= deadline);
    }
}
