// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction state machine
//!
//! Each transaction is driven by its own task. Callers, the watchdog and the
//! coordinator talk to it through a [`TransactionHandle`], which queues
//! commands for the driver; the driver executes them one at a time, so the
//! state machine has a single writer.
//!
//! Every phase transition is appended to the transaction log before the
//! participants are told about it.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use super::resource::{same_instance, ResourceManager, ResourceParticipant, Vote};
use super::state::{
    deadline_after, Outcome, RollbackCause, SharedState, TransactionId, TransactionStatus,
};
use super::wal::{LogError, LogPhase, TransactionLog};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};

/// Result of a successful enlistment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enlistment {
    /// The resource joined the transaction as a new participant
    Enlisted,
    /// The same resource was already enlisted; nothing changed
    Joined,
}

/// What a driver needs from its coordinator
#[derive(Debug, Clone)]
pub(crate) struct DriverContext {
    pub(crate) log: Arc<TransactionLog>,
    pub(crate) config: Arc<CoordinatorConfig>,
    pub(crate) epoch: Instant,
}

enum Command {
    Enlist {
        resource: Arc<dyn ResourceManager>,
        reply: oneshot::Sender<Result<Enlistment>>,
    },
    Commit {
        reply: oneshot::Sender<Result<()>>,
    },
    Rollback {
        cause: RollbackCause,
        reply: oneshot::Sender<Result<()>>,
    },
    SetRollbackOnly {
        reply: oneshot::Sender<Result<()>>,
    },
    SetTimeout {
        timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    /// Sent by the watchdog when the deadline passed while ACTIVE
    Timeout,
}

/// Caller-side handle to a transaction
///
/// Cloning the handle is cheap; all clones talk to the same driver.
#[derive(Clone)]
pub struct TransactionHandle {
    shared: Arc<SharedState>,
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.shared.id)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl TransactionHandle {
    /// Start the driver task for a new ACTIVE transaction
    pub(crate) fn spawn(id: TransactionId, deadline: Instant, ctx: DriverContext) -> Self {
        let shared = Arc::new(SharedState::new(id, ctx.epoch, deadline));
        let (commands, receiver) = mpsc::channel(ctx.config.command_queue_depth);

        let driver = TransactionDriver {
            shared: shared.clone(),
            ctx,
            participants: Vec::new(),
            outcome: None,
            rollback_only: false,
            rollback_cause: None,
        };
        tokio::spawn(driver.run(receiver));

        Self { shared, commands }
    }

    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.shared.status()
    }

    pub fn deadline(&self) -> Instant {
        self.shared.deadline()
    }

    /// Resource ids in enlistment order
    pub fn participant_ids(&self) -> Vec<String> {
        self.shared.participants()
    }

    pub async fn enlist(&self, resource: Arc<dyn ResourceManager>) -> Result<Enlistment> {
        self.request("enlist in", |reply| Command::Enlist { resource, reply })
            .await?
    }

    /// Run the commit protocol; `Ok` only when the transaction COMMITTED
    pub async fn commit(&self) -> Result<()> {
        self.request("commit", |reply| Command::Commit { reply })
            .await?
    }

    pub async fn rollback(&self) -> Result<()> {
        self.rollback_with_cause(RollbackCause::Requested).await
    }

    pub(crate) async fn rollback_with_cause(&self, cause: RollbackCause) -> Result<()> {
        self.request("roll back", |reply| Command::Rollback { cause, reply })
            .await?
    }

    /// Make any later commit roll back instead
    pub async fn set_rollback_only(&self) -> Result<()> {
        self.request("mark rollback-only", |reply| Command::SetRollbackOnly {
            reply,
        })
        .await?
    }

    /// Reset the deadline to now + `timeout`; zero restores the default.
    ///
    /// Returns `true` if applied, `false` once the transaction left ACTIVE.
    pub async fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool> {
        // Answer without queueing behind a commit in flight; the driver re-checks
        if self.status() != TransactionStatus::Active {
            return Ok(false);
        }
        self.request("set timeout of", |reply| Command::SetTimeout {
            timeout,
            reply,
        })
        .await
    }

    pub(crate) fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Queue a timeout without waiting; `false` if one was already queued
    pub(crate) fn signal_timeout(&self) -> bool {
        use std::sync::atomic::Ordering;

        if self.shared.timeout_signalled.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.commands.try_send(Command::Timeout) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Retry on the next scan
                self.shared.timeout_signalled.store(false, Ordering::Release);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn request<T>(
        &self,
        operation: &str,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| self.driver_stopped(operation))?;
        response.await.map_err(|_| self.driver_stopped(operation))
    }

    fn driver_stopped(&self, operation: &str) -> CoordinatorError {
        CoordinatorError::IllegalState(format!(
            "cannot {} transaction {}: driver stopped",
            operation, self.shared.id
        ))
    }
}

/// Owns the state machine of one transaction
struct TransactionDriver {
    shared: Arc<SharedState>,
    ctx: DriverContext,
    participants: Vec<ResourceParticipant>,
    outcome: Option<Outcome>,
    rollback_only: bool,
    rollback_cause: Option<RollbackCause>,
}

impl TransactionDriver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Enlist { resource, reply } => {
                    let _ = reply.send(self.enlist(resource));
                }
                Command::Commit { reply } => {
                    // The protocol runs to completion even if the caller went away
                    let result = self.commit().await;
                    let _ = reply.send(result);
                }
                Command::Rollback { cause, reply } => {
                    let result = self.rollback(cause).await;
                    let _ = reply.send(result);
                }
                Command::SetRollbackOnly { reply } => {
                    let _ = reply.send(self.set_rollback_only());
                }
                Command::SetTimeout { timeout, reply } => {
                    let _ = reply.send(self.set_timeout(timeout));
                }
                Command::Timeout => self.on_timeout().await,
            }
        }
        log::trace!("Driver for transaction {} stopped", self.id());
    }

    fn id(&self) -> TransactionId {
        self.shared.id
    }

    fn status(&self) -> TransactionStatus {
        self.shared.status()
    }

    fn call_timeout(&self) -> Duration {
        self.ctx.config.participant_call_timeout
    }

    fn transition(&self, status: TransactionStatus) {
        log::debug!(
            "Transaction {}: {} -> {}",
            self.id(),
            self.status(),
            status
        );
        self.shared.set_status(status);
    }

    fn decide(&mut self, outcome: Outcome) {
        debug_assert!(self.outcome.is_none(), "outcome decided twice");
        self.outcome = Some(outcome);
    }

    /// Append a phase record for this transaction, durably
    fn record(&self, phase: LogPhase) -> std::result::Result<(), LogError> {
        let participants: Vec<String> = self
            .participants
            .iter()
            .map(|p| p.resource_id().to_string())
            .collect();
        self.ctx
            .log
            .append(self.id(), phase, &participants)
            .map(|_| ())
    }

    fn enlist(&mut self, resource: Arc<dyn ResourceManager>) -> Result<Enlistment> {
        let status = self.status();
        if status != TransactionStatus::Active {
            return Err(CoordinatorError::illegal_state(self.id(), "enlist in", status));
        }

        let resource_id = resource.resource_id().to_string();
        if let Some(existing) = self
            .participants
            .iter()
            .find(|p| p.resource_id() == resource_id)
        {
            if same_instance(existing.resource(), &resource) {
                log::debug!("Resource {} rejoined transaction {}", resource_id, self.id());
                return Ok(Enlistment::Joined);
            }
            return Err(CoordinatorError::IllegalState(format!(
                "resource id {} is already enlisted in transaction {} by a different resource",
                resource_id,
                self.id()
            )));
        }

        let remaining = self
            .shared
            .deadline()
            .saturating_duration_since(Instant::now());
        match resource.set_transaction_timeout(remaining) {
            Ok(applied) => log::debug!(
                "{}.set_transaction_timeout({}): {}",
                resource_id,
                remaining.as_secs(),
                if applied { "TRUE" } else { "FALSE" }
            ),
            Err(e) => log::debug!(
                "{}.set_transaction_timeout({}): {}",
                resource_id,
                remaining.as_secs(),
                e
            ),
        }

        self.participants.push(ResourceParticipant::new(resource));
        self.shared.push_participant(resource_id);
        Ok(Enlistment::Enlisted)
    }

    async fn commit(&mut self) -> Result<()> {
        match self.status() {
            TransactionStatus::Active => {}
            TransactionStatus::RolledBack => return Err(self.rolled_back_error()),
            other => return Err(CoordinatorError::illegal_state(self.id(), "commit", other)),
        }

        if self.rollback_only {
            self.rollback_participants(RollbackCause::RollbackOnly)
                .await;
        } else if Instant::now() >= self.shared.deadline() {
            log::warn!(
                "Transaction {} passed its deadline before commit, rolling back",
                self.id()
            );
            self.rollback_participants(RollbackCause::Timeout).await;
        } else {
            match self.participants.len() {
                0 => {
                    self.decide(Outcome::Commit);
                    self.finish(TransactionStatus::Committed);
                }
                1 => self.commit_one_phase().await,
                _ => self.commit_two_phase().await,
            }
        }

        self.completion_result()
    }

    /// A single participant decides the outcome on its own
    async fn commit_one_phase(&mut self) {
        let id = self.id();
        self.transition(TransactionStatus::Committing);

        let result = self.participants[0]
            .commit(id, true, self.call_timeout())
            .await;
        match result {
            Ok(()) => {
                self.decide(Outcome::Commit);
                self.finish(TransactionStatus::Committed);
            }
            Err(CoordinatorError::ParticipantFailure {
                resource_id,
                source: super::resource::ResourceError::RolledBack(reason),
            }) => {
                self.decide(Outcome::Rollback);
                self.rollback_cause = Some(RollbackCause::ParticipantFailure {
                    resource_id,
                    reason,
                });
                self.finish(TransactionStatus::RolledBack);
            }
            Err(e) => {
                log::error!(
                    "One-phase commit of transaction {} failed, outcome unknown: {}",
                    id,
                    e
                );
                self.finish(TransactionStatus::HeuristicHazard);
            }
        }
    }

    async fn commit_two_phase(&mut self) {
        let id = self.id();
        let call_timeout = self.call_timeout();

        if let Err(e) = self.record(LogPhase::Preparing) {
            log::error!("Failed to log PREPARING for transaction {}: {}", id, e);
            self.rollback_participants(RollbackCause::LogFailure(e.to_string()))
                .await;
            return;
        }
        self.transition(TransactionStatus::Preparing);

        let mut abort_cause = None;
        for participant in self.participants.iter_mut() {
            match participant.prepare(id, call_timeout).await {
                Ok(Vote::Abort) => {
                    log::debug!("{} voted ABORT for {}", participant.resource_id(), id);
                    abort_cause = Some(RollbackCause::Vote {
                        resource_id: participant.resource_id().to_string(),
                    });
                    break;
                }
                Ok(vote) => {
                    log::debug!("{} voted {:?} for {}", participant.resource_id(), vote, id);
                }
                Err(e) => {
                    log::warn!("Prepare of transaction {} failed: {}", id, e);
                    abort_cause = Some(failure_cause(participant.resource_id(), e));
                    break;
                }
            }
        }
        if let Some(cause) = abort_cause {
            self.rollback_participants(cause).await;
            return;
        }

        if let Err(e) = self.record(LogPhase::Prepared) {
            log::error!("Failed to log PREPARED for transaction {}: {}", id, e);
            self.rollback_participants(RollbackCause::LogFailure(e.to_string()))
                .await;
            return;
        }
        self.transition(TransactionStatus::Prepared);

        if let Err(e) = self.record(LogPhase::Committing) {
            log::error!("Failed to log the commit decision for {}: {}", id, e);
            self.rollback_participants(RollbackCause::LogFailure(e.to_string()))
                .await;
            return;
        }
        self.decide(Outcome::Commit);
        self.transition(TransactionStatus::Committing);

        let mut committed = 0usize;
        let mut failed = 0usize;
        for participant in &self.participants {
            if participant.vote() != Some(Vote::Ok) {
                continue;
            }
            match participant.commit(id, false, call_timeout).await {
                Ok(()) => committed += 1,
                Err(e) => {
                    log::error!("Commit of transaction {} failed: {}", id, e);
                    failed += 1;
                }
            }
        }

        let status = if failed == 0 {
            TransactionStatus::Committed
        } else if committed > 0 {
            TransactionStatus::HeuristicMixed
        } else {
            TransactionStatus::HeuristicHazard
        };
        self.finish(status);
    }

    async fn rollback(&mut self, cause: RollbackCause) -> Result<()> {
        let status = self.status();
        if status != TransactionStatus::Active {
            return Err(CoordinatorError::illegal_state(self.id(), "roll back", status));
        }
        self.rollback_participants(cause).await;

        match self.status() {
            TransactionStatus::RolledBack => Ok(()),
            _ => self.completion_result(),
        }
    }

    /// Tell every participant that may hold work to roll back.
    ///
    /// READ_ONLY voters are finished and ABORT voters already rolled back.
    /// Everyone else, including participants never asked to prepare and
    /// those whose prepare call failed, receives `rollback`.
    async fn rollback_participants(&mut self, cause: RollbackCause) {
        let id = self.id();
        let call_timeout = self.call_timeout();

        log::debug!("Rolling back transaction {}: {}", id, cause);
        self.rollback_cause = Some(cause);
        self.decide(Outcome::Rollback);

        if let Err(e) = self.record(LogPhase::RollingBack) {
            // Rollback is the presumed outcome, so carry on without the record
            log::warn!("Failed to log ROLLING_BACK for transaction {}: {}", id, e);
        }
        self.transition(TransactionStatus::RollingBack);

        let mut failed = 0usize;
        for participant in &self.participants {
            if matches!(participant.vote(), Some(Vote::ReadOnly) | Some(Vote::Abort)) {
                continue;
            }
            if let Err(e) = participant.rollback(id, call_timeout).await {
                log::error!("Rollback of transaction {} failed: {}", id, e);
                failed += 1;
            }
        }

        self.finish(if failed == 0 {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::HeuristicHazard
        });
    }

    fn set_rollback_only(&mut self) -> Result<()> {
        let status = self.status();
        if status != TransactionStatus::Active {
            return Err(CoordinatorError::illegal_state(
                self.id(),
                "mark rollback-only",
                status,
            ));
        }
        self.rollback_only = true;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> bool {
        use std::sync::atomic::Ordering;

        if self.status() != TransactionStatus::Active {
            return false;
        }
        let timeout = if timeout.is_zero() {
            self.ctx.config.default_timeout
        } else {
            timeout
        };
        self.shared.set_deadline(deadline_after(Instant::now(), timeout));
        self.shared.timeout_signalled.store(false, Ordering::Release);
        self.shared.overdue_reported.store(false, Ordering::Release);
        true
    }

    async fn on_timeout(&mut self) {
        if self.status() != TransactionStatus::Active {
            return;
        }
        // The deadline may have been extended after the watchdog fired
        if Instant::now() < self.shared.deadline() {
            return;
        }
        log::warn!(
            "Transaction {} timed out while active, rolling back",
            self.id()
        );
        self.rollback_participants(RollbackCause::Timeout).await;
    }

    /// Record the terminal state and release the participants
    fn finish(&mut self, status: TransactionStatus) {
        if let Some(phase) = LogPhase::for_status(status) {
            if let Err(e) = self.record(phase) {
                log::error!(
                    "Failed to log {} for transaction {}: {}; recovery will redeliver the outcome",
                    phase,
                    self.id(),
                    e
                );
            }
        }
        self.transition(status);

        if status.is_heuristic() {
            log::error!(
                "Transaction {} ended {} (decision {:?}); participants {:?} need operator reconciliation",
                self.id(),
                status,
                self.outcome,
                self.shared.participants()
            );
        }
        self.participants.clear();
    }

    fn completion_result(&self) -> Result<()> {
        match self.status() {
            TransactionStatus::Committed => Ok(()),
            TransactionStatus::RolledBack => Err(self.rolled_back_error()),
            status if status.is_heuristic() => Err(CoordinatorError::Heuristic {
                id: self.id(),
                status,
            }),
            status => Err(CoordinatorError::IllegalState(format!(
                "transaction {} did not complete, state {}",
                self.id(),
                status
            ))),
        }
    }

    fn rolled_back_error(&self) -> CoordinatorError {
        CoordinatorError::RolledBack {
            id: self.id(),
            cause: self
                .rollback_cause
                .clone()
                .unwrap_or(RollbackCause::Requested),
        }
    }
}

fn failure_cause(resource_id: &str, error: CoordinatorError) -> RollbackCause {
    let reason = match error {
        CoordinatorError::ParticipantFailure { source, .. } => source.to_string(),
        other => other.to_string(),
    };
    RollbackCause::ParticipantFailure {
        resource_id: resource_id.to_string(),
        reason,
    }
}
