// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! txcoord - A two-phase commit transaction coordinator
//!
//! txcoord drives distributed transactions across independent resource
//! managers so that either all of them commit or all of them roll back.
//!
//! # Features
//!
//! - **Two-Phase Commit**: prepare/commit with read-only and abort votes
//! - **One-Phase Optimization**: a single participant is committed directly
//! - **Durable Decisions**: every phase is logged and fsynced before it is acted on
//! - **Timeouts**: per-transaction deadlines and per-call participant timeouts
//! - **Crash Recovery**: presumed abort, replay of logged decisions
//! - **Heuristic Reporting**: mixed or unknown outcomes are surfaced, never hidden
//!
//! # Usage
//!
//! ```ignore
//! let coordinator = TransactionCoordinator::start(CoordinatorConfig::new("./txlog"), vec![]).await?;
//! let txn = coordinator.begin(None)?;
//! txn.enlist(orders_db).await?;
//! txn.enlist(billing_db).await?;
//! txn.commit().await?;
//! ```
//!
//! The `txcoord` binary inspects a log directory offline:
//!
//! ```bash
//! txcoord inspect --log-dir ./txlog
//! txcoord in-doubt --log-dir ./txlog
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod testing;
pub mod txn;

pub use config::CoordinatorConfig;
pub use coordinator::{CheckpointReport, CoordinatorStatistics, ShutdownReport, TransactionCoordinator};
pub use error::{CoordinatorError, Result};
pub use txn::{
    Enlistment, InDoubtTransaction, LogPhase, RecoveryReport, ResourceError, ResourceManager,
    RollbackCause, TransactionHandle, TransactionId, TransactionLog, TransactionLogRecord,
    TransactionStatus, Vote,
};

/// txcoord version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
