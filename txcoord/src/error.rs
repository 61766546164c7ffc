// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Coordinator error types

use crate::txn::recovery::RecoveryError;
use crate::txn::resource::ResourceError;
use crate::txn::state::{RollbackCause, TransactionId, TransactionStatus};
use crate::txn::wal::LogError;
use thiserror::Error;

/// Errors surfaced to callers of the coordinator and of transaction handles
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Transaction {0} not found")]
    NotFound(TransactionId),

    #[error("Resource exhausted: {active} active transactions, limit {limit}")]
    ResourceExhausted { active: usize, limit: usize },

    #[error("Participant {resource_id} failed: {source}")]
    ParticipantFailure {
        resource_id: String,
        #[source]
        source: ResourceError,
    },

    #[error("Transaction {id} ended in heuristic state {status}; operator reconciliation required")]
    Heuristic {
        id: TransactionId,
        status: TransactionStatus,
    },

    #[error("Transaction {id} rolled back: {cause}")]
    RolledBack {
        id: TransactionId,
        cause: RollbackCause,
    },

    #[error("Transaction log error: {0}")]
    Log(#[from] LogError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinatorError {
    pub(crate) fn illegal_state(id: TransactionId, operation: &str, status: TransactionStatus) -> Self {
        CoordinatorError::IllegalState(format!(
            "cannot {} transaction {} in state {}",
            operation, id, status
        ))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CoordinatorError>;
