// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Resource manager contract
//!
//! A resource manager is an external transactional participant (a database
//! connection, a message queue session) reached through a capability object.
//! The coordinator only needs the XA-style calls below; how the resource is
//! reached on the wire is its own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::state::TransactionId;
use crate::error::CoordinatorError;

/// A participant's answer to `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// Prepared, ready to commit or roll back on request
    Ok,
    /// Nothing was written, the participant needs no second phase
    ReadOnly,
    /// Cannot commit; the participant has already rolled back
    Abort,
}

/// Errors reported by a resource manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("resource rolled back: {0}")]
    RolledBack(String),

    #[error("transaction unknown to resource")]
    UnknownTransaction,

    #[error("resource unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// The contract every participant implements
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Stable identity of the underlying physical resource
    fn resource_id(&self) -> &str;

    async fn prepare(&self, xid: TransactionId) -> Result<Vote, ResourceError>;

    /// `one_phase` is set when the coordinator skipped prepare because this
    /// is the only participant
    async fn commit(&self, xid: TransactionId, one_phase: bool) -> Result<(), ResourceError>;

    async fn rollback(&self, xid: TransactionId) -> Result<(), ResourceError>;

    /// Transactions this resource holds prepared and unresolved
    async fn recover(&self) -> Result<Vec<TransactionId>, ResourceError>;

    /// Propagate the transaction timeout to the resource.
    ///
    /// Returns `Ok(true)` when the resource applied it, `Ok(false)` when it
    /// does not support timeouts.
    fn set_transaction_timeout(&self, _timeout: Duration) -> Result<bool, ResourceError> {
        Ok(false)
    }
}

/// Whether two capability objects refer to the same resource instance
pub(crate) fn same_instance(a: &Arc<dyn ResourceManager>, b: &Arc<dyn ResourceManager>) -> bool {
    // Compare data pointers only, vtable pointers are not guaranteed unique
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// A resource enlisted in one transaction
pub struct ResourceParticipant {
    resource: Arc<dyn ResourceManager>,
    resource_id: String,
    vote: Option<Vote>,
}

impl std::fmt::Debug for ResourceParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceParticipant")
            .field("resource_id", &self.resource_id)
            .field("vote", &self.vote)
            .finish()
    }
}

impl ResourceParticipant {
    pub fn new(resource: Arc<dyn ResourceManager>) -> Self {
        let resource_id = resource.resource_id().to_string();
        Self {
            resource,
            resource_id,
            vote: None,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn vote(&self) -> Option<Vote> {
        self.vote
    }

    pub fn resource(&self) -> &Arc<dyn ResourceManager> {
        &self.resource
    }

    /// Ask for a vote; an error or a timeout counts as a failed prepare
    pub async fn prepare(
        &mut self,
        xid: TransactionId,
        call_timeout: Duration,
    ) -> Result<Vote, CoordinatorError> {
        let vote = self
            .bounded(call_timeout, self.resource.prepare(xid))
            .await?;
        self.vote = Some(vote);
        Ok(vote)
    }

    pub async fn commit(
        &self,
        xid: TransactionId,
        one_phase: bool,
        call_timeout: Duration,
    ) -> Result<(), CoordinatorError> {
        self.bounded(call_timeout, self.resource.commit(xid, one_phase))
            .await
    }

    pub async fn rollback(
        &self,
        xid: TransactionId,
        call_timeout: Duration,
    ) -> Result<(), CoordinatorError> {
        self.bounded(call_timeout, self.resource.rollback(xid))
            .await
    }

    async fn bounded<T>(
        &self,
        call_timeout: Duration,
        call: impl std::future::Future<Output = Result<T, ResourceError>>,
    ) -> Result<T, CoordinatorError> {
        let result = match tokio::time::timeout(call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ResourceError::Timeout(call_timeout)),
        };
        result.map_err(|source| CoordinatorError::ParticipantFailure {
            resource_id: self.resource_id.clone(),
            source,
        })
    }
}
