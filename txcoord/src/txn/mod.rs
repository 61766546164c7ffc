// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Two-phase commit machinery
//!
//! This module holds everything below the coordinator facade.
//!
//! # Features
//! - Per-transaction state machine driven by a single task
//! - Durable phase log with checksummed records and segment rotation
//! - One-phase optimization for a single participant
//! - Deadline watchdog that never aborts a transaction past its decision
//! - Presumed-abort crash recovery

pub mod recovery;
pub mod resource;
pub mod state;
pub mod transaction;
pub mod wal;
pub mod watchdog;

pub use recovery::{InDoubtTransaction, RecoveryError, RecoveryManager, RecoveryReport};
pub use resource::{ResourceError, ResourceManager, ResourceParticipant, Vote};
pub use state::{Outcome, RollbackCause, TransactionId, TransactionStatus};
pub use transaction::{Enlistment, TransactionHandle};
pub use wal::{LogCompaction, LogError, LogPhase, TransactionLog, TransactionLogRecord};
pub use watchdog::{TimeoutWatchdog, WatchdogScan};
