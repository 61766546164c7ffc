// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Scriptable in-memory resource manager
//!
//! `MockResource` records every call it receives and answers according to a
//! script set up with its builder methods. It keeps track of the
//! transactions it holds prepared so `recover` behaves like a real resource.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::txn::resource::{ResourceError, ResourceManager, Vote};
use crate::txn::state::TransactionId;

/// A call received by a [`MockResource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Prepare(TransactionId),
    Commit {
        xid: TransactionId,
        one_phase: bool,
    },
    Rollback(TransactionId),
    Recover,
    SetTransactionTimeout(Duration),
}

#[derive(Debug)]
pub struct MockResource {
    resource_id: String,
    vote: Vote,
    prepare_delay: Option<Duration>,
    commit_delay: Option<Duration>,
    prepare_error: Option<ResourceError>,
    commit_error: Option<ResourceError>,
    rollback_error: Option<ResourceError>,
    recover_error: Option<ResourceError>,
    timeout_support: Option<Result<bool, ResourceError>>,
    calls: Mutex<Vec<MockCall>>,
    in_doubt: Mutex<BTreeSet<TransactionId>>,
}

impl MockResource {
    /// A resource that votes OK and succeeds at everything
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            vote: Vote::Ok,
            prepare_delay: None,
            commit_delay: None,
            prepare_error: None,
            commit_error: None,
            rollback_error: None,
            recover_error: None,
            timeout_support: None,
            calls: Mutex::new(Vec::new()),
            in_doubt: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_vote(mut self, vote: Vote) -> Self {
        self.vote = vote;
        self
    }

    /// Sleep before answering `prepare`
    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = Some(delay);
        self
    }

    /// Sleep before answering `commit`
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    pub fn failing_prepare(mut self, error: ResourceError) -> Self {
        self.prepare_error = Some(error);
        self
    }

    pub fn failing_commit(mut self, error: ResourceError) -> Self {
        self.commit_error = Some(error);
        self
    }

    pub fn failing_rollback(mut self, error: ResourceError) -> Self {
        self.rollback_error = Some(error);
        self
    }

    pub fn failing_recover(mut self, error: ResourceError) -> Self {
        self.recover_error = Some(error);
        self
    }

    /// Answer `set_transaction_timeout` with this result instead of "unsupported"
    pub fn with_timeout_support(mut self, result: Result<bool, ResourceError>) -> Self {
        self.timeout_support = Some(result);
        self
    }

    /// Pretend these transactions were left prepared by an earlier run
    pub fn with_in_doubt(self, xids: impl IntoIterator<Item = TransactionId>) -> Self {
        self.in_doubt.lock().extend(xids);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Calls concerning one transaction, in arrival order
    pub fn calls_for(&self, xid: TransactionId) -> Vec<MockCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| match call {
                MockCall::Prepare(id) | MockCall::Rollback(id) => *id == xid,
                MockCall::Commit { xid: id, .. } => *id == xid,
                _ => false,
            })
            .cloned()
            .collect()
    }

    pub fn commit_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::Commit { .. }))
    }

    pub fn prepare_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::Prepare(_)))
    }

    pub fn rollback_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::Rollback(_)))
    }

    pub fn in_doubt(&self) -> Vec<TransactionId> {
        self.in_doubt.lock().iter().copied().collect()
    }

    fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ResourceManager for MockResource {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    async fn prepare(&self, xid: TransactionId) -> Result<Vote, ResourceError> {
        self.record(MockCall::Prepare(xid));
        if let Some(delay) = self.prepare_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.prepare_error {
            return Err(error.clone());
        }
        if self.vote == Vote::Ok {
            self.in_doubt.lock().insert(xid);
        }
        Ok(self.vote)
    }

    async fn commit(&self, xid: TransactionId, one_phase: bool) -> Result<(), ResourceError> {
        self.record(MockCall::Commit { xid, one_phase });
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.commit_error {
            return Err(error.clone());
        }
        self.in_doubt.lock().remove(&xid);
        Ok(())
    }

    async fn rollback(&self, xid: TransactionId) -> Result<(), ResourceError> {
        self.record(MockCall::Rollback(xid));
        if let Some(error) = &self.rollback_error {
            return Err(error.clone());
        }
        self.in_doubt.lock().remove(&xid);
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<TransactionId>, ResourceError> {
        self.record(MockCall::Recover);
        if let Some(error) = &self.recover_error {
            return Err(error.clone());
        }
        Ok(self.in_doubt())
    }

    fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool, ResourceError> {
        self.record(MockCall::SetTransactionTimeout(timeout));
        self.timeout_support.clone().unwrap_or(Ok(false))
    }
}
