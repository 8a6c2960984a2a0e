//! Approval engine
//!
//! The engine owns the store, the clock and the notification dispatcher and
//! is the only place proposals change state. Every mutating operation:
//!
//! - takes the proposal's lock, so transitions on one proposal never interleave
//!   (delegation changes take the user's lock the same way)
//! - reloads the proposal inside the lock
//! - applies a transition rule and persists row and history together
//! - emits an [`ApprovalEvent`] and dispatches notifications afterwards

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use super::resolver::ApproverResolver;
use crate::clock::Clock;
use crate::delegation::{ActingRequest, User};
use crate::error::{AppError, Result};
use crate::models::{
    Actor, DbId, HistoryEntry, NewProposal, Proposal, ProposalAttributes, ProposalStatus,
    StageHold,
};
use crate::notify::{Dispatcher, Notification};
use crate::store::Store;
use crate::workflow::{select_workflow, WorkflowDefinition};

/// Days a waiting proposal may sit untouched before the idle sweep closes it
pub const DEFAULT_IDLE_DAYS: i64 = 60;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub idle_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::days(DEFAULT_IDLE_DAYS),
        }
    }
}

/// Emitted after a change has been persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalEvent {
    Submitted {
        proposal_id: DbId,
        workflow_id: DbId,
    },
    Approved {
        proposal_id: DbId,
        approver_id: DbId,
        from_stage: i32,
        to_stage: i32,
    },
    Completed {
        proposal_id: DbId,
    },
    Rejected {
        proposal_id: DbId,
        approver_id: DbId,
    },
    AutoRejected {
        proposal_id: DbId,
    },
    Bypassed {
        proposal_id: DbId,
        actor_id: DbId,
        from_stage: i32,
        to_stage: Option<i32>,
    },
    FeedbackAdded {
        proposal_id: DbId,
        author_id: DbId,
    },
    HoldReleased {
        proposal_id: DbId,
        hold: StageHold,
    },
    DelegationStarted {
        user_id: DbId,
        acting_role_id: DbId,
    },
    DelegationCleared {
        user_id: DbId,
    },
}

/// One mutex per id currently being worked on
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<DbId, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, id: DbId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct ApprovalEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    resolver: ApproverResolver,
    dispatcher: Dispatcher,
    config: EngineConfig,
    proposal_locks: KeyedLocks,
    user_locks: KeyedLocks,
    event_tx: broadcast::Sender<ApprovalEvent>,
}

impl ApprovalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        dispatcher: Dispatcher,
        config: EngineConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            resolver: ApproverResolver::new(store.clone()),
            store,
            clock,
            dispatcher,
            config,
            proposal_locks: KeyedLocks::default(),
            user_locks: KeyedLocks::default(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.event_tx.subscribe()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn emit(&self, event: ApprovalEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn lock_proposal(&self, id: DbId) -> OwnedMutexGuard<()> {
        self.proposal_locks.acquire(id).await
    }

    async fn load_proposal(&self, id: DbId) -> Result<Proposal> {
        self.store
            .get_proposal(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} not found", id)))
    }

    async fn load_user(&self, id: DbId) -> Result<User> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))
    }

    async fn load_workflow(&self, id: DbId) -> Result<WorkflowDefinition> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workflow {} not found", id)))
    }

    // Proposals

    pub async fn create_proposal(&self, new: NewProposal) -> Result<Proposal> {
        if new.title.trim().is_empty() {
            return Err(AppError::Validation("title is required".to_string()));
        }
        if new.submitted_cost < 0 {
            return Err(AppError::Validation(format!(
                "cost must not be negative (got {})",
                new.submitted_cost
            )));
        }
        self.load_user(new.initiator_id).await?;

        let proposal = self.store.insert_proposal(&new, self.now()).await?;
        tracing::info!(
            proposal_id = proposal.id,
            code = proposal.code.as_deref().unwrap_or_default(),
            initiator = proposal.initiator_id,
            "Proposal created"
        );
        Ok(proposal)
    }

    pub async fn get_proposal(&self, id: DbId) -> Result<Proposal> {
        self.load_proposal(id).await
    }

    pub async fn history(&self, id: DbId) -> Result<Vec<HistoryEntry>> {
        self.load_proposal(id).await?;
        self.store.history(id).await
    }

    /// The workflow a proposal with these attributes would follow
    pub async fn select_workflow(&self, attrs: &ProposalAttributes) -> Result<WorkflowDefinition> {
        let definitions = self.store.active_workflows().await?;
        select_workflow(&definitions, attrs)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No workflow matches a proposal with cost {}",
                    attrs.cost
                ))
            })
    }

    pub async fn resolve_approvers(
        &self,
        workflow_id: DbId,
        stage_number: i32,
        division_id: Option<&str>,
        department_id: Option<&str>,
    ) -> Result<Vec<User>> {
        self.resolver
            .resolve(workflow_id, stage_number, division_id, department_id, self.now())
            .await
    }

    /// Who may act on the proposal's pending stage right now. Empty when no
    /// stage is pending.
    pub async fn approvers_for(&self, id: DbId) -> Result<Vec<User>> {
        let proposal = self.load_proposal(id).await?;
        match proposal.pending_stage() {
            Some(stage) => {
                self.resolver
                    .resolve_for_proposal(&proposal, stage, self.now())
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    async fn authorize(
        &self,
        proposal: &Proposal,
        stage: i32,
        actor_id: DbId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let approvers = self
            .resolver
            .resolve_for_proposal(proposal, stage, now)
            .await?;
        if approvers.iter().any(|u| u.id == actor_id) {
            return Ok(());
        }
        Err(AppError::NotAuthorized(format!(
            "user {} is not an approver for stage {} of proposal {}",
            actor_id, stage, proposal.id
        )))
    }

    /// Approvers of the pending stage for notification purposes. The
    /// transition is already persisted, so a lookup failure is only logged.
    async fn pending_recipients(&self, proposal: &Proposal, now: DateTime<Utc>) -> Vec<User> {
        let Some(stage) = proposal.pending_stage() else {
            return Vec::new();
        };
        match self.resolver.resolve_for_proposal(proposal, stage, now).await {
            Ok(approvers) => approvers,
            Err(e) => {
                tracing::warn!(
                    proposal_id = proposal.id,
                    stage,
                    error = %e,
                    "Failed to resolve approvers for notification"
                );
                Vec::new()
            }
        }
    }

    /// Tell the approvers of the pending stage, if any, that it is their turn
    async fn announce_pending(&self, proposal: &Proposal, now: DateTime<Utc>) {
        if proposal.pending_stage().is_none() {
            return;
        }
        let approvers = self.pending_recipients(proposal, now).await;
        self.dispatcher.dispatch(Notification::Submitted {
            proposal: proposal.clone(),
            approvers,
        });
    }

    pub async fn submit(&self, id: DbId, actor_id: DbId) -> Result<Proposal> {
        let _guard = self.lock_proposal(id).await;
        let now = self.now();
        let mut proposal = self.load_proposal(id).await?;

        if proposal.initiator_id != actor_id {
            return Err(AppError::NotAuthorized(format!(
                "only the initiator may submit proposal {}",
                id
            )));
        }
        if proposal.status != ProposalStatus::Draft {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} was already submitted",
                id
            )));
        }

        let workflow = self.select_workflow(&proposal.attributes()).await?;
        let entry = proposal.submit(Actor::User(actor_id), &workflow, now)?;
        self.store.apply_transition(&proposal, &entry).await?;

        tracing::info!(
            proposal_id = id,
            workflow_id = workflow.id,
            max_stage = proposal.max_stage,
            "Proposal submitted"
        );
        self.emit(ApprovalEvent::Submitted {
            proposal_id: id,
            workflow_id: workflow.id,
        });
        self.announce_pending(&proposal, now).await;

        Ok(proposal)
    }

    pub async fn approve(
        &self,
        id: DbId,
        actor_id: DbId,
        comment: Option<String>,
    ) -> Result<Proposal> {
        let _guard = self.lock_proposal(id).await;
        let now = self.now();
        let mut proposal = self.load_proposal(id).await?;

        let stage = proposal.ensure_decidable()?;
        self.authorize(&proposal, stage, actor_id, now).await?;

        let workflow_id = proposal.workflow_id.ok_or_else(|| {
            AppError::Internal(format!("proposal {} is waiting without a workflow", id))
        })?;
        let hold = self
            .load_workflow(workflow_id)
            .await?
            .stage(stage)
            .and_then(|s| s.hold_after);

        let entry = proposal.approve(Actor::User(actor_id), hold, comment, now)?;
        self.store.apply_transition(&proposal, &entry).await?;

        tracing::info!(
            proposal_id = id,
            approver = actor_id,
            from = entry.from_stage,
            to = proposal.current_stage,
            status = %proposal.status,
            "Stage approved"
        );
        self.emit(ApprovalEvent::Approved {
            proposal_id: id,
            approver_id: actor_id,
            from_stage: entry.from_stage,
            to_stage: proposal.current_stage,
        });
        if proposal.is_completed() {
            self.emit(ApprovalEvent::Completed { proposal_id: id });
        }

        self.dispatcher.dispatch(Notification::Approved {
            proposal: proposal.clone(),
            actor: Actor::User(actor_id),
        });
        self.announce_pending(&proposal, now).await;

        Ok(proposal)
    }

    pub async fn reject(&self, id: DbId, actor_id: DbId, reason: &str) -> Result<Proposal> {
        let _guard = self.lock_proposal(id).await;
        let now = self.now();
        let mut proposal = self.load_proposal(id).await?;

        let stage = proposal.ensure_decidable()?;
        self.authorize(&proposal, stage, actor_id, now).await?;

        let entry = proposal.reject(Actor::User(actor_id), reason, now)?;
        self.store.apply_transition(&proposal, &entry).await?;

        tracing::info!(proposal_id = id, approver = actor_id, stage, "Proposal rejected");
        self.emit(ApprovalEvent::Rejected {
            proposal_id: id,
            approver_id: actor_id,
        });
        self.dispatcher.dispatch(Notification::Rejected {
            proposal: proposal.clone(),
            actor: Actor::User(actor_id),
            reason: entry.comment.clone().unwrap_or_default(),
        });

        Ok(proposal)
    }

    /// Record reviewer commentary. Goes to the initiator and the approvers of
    /// the pending stage, never back to the author.
    pub async fn feedback(&self, id: DbId, actor_id: DbId, comment: &str) -> Result<HistoryEntry> {
        let _guard = self.lock_proposal(id).await;
        let now = self.now();
        let proposal = self.load_proposal(id).await?;
        self.load_user(actor_id).await?;

        let entry = proposal.record_feedback(Actor::User(actor_id), comment, now)?;
        self.store.apply_transition(&proposal, &entry).await?;

        let mut recipients = self.pending_recipients(&proposal, now).await;
        match self.store.get_user(proposal.initiator_id).await {
            Ok(Some(initiator)) if !recipients.iter().any(|u| u.id == initiator.id) => {
                recipients.push(initiator)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(proposal_id = id, error = %e, "Failed to load initiator"),
        }
        recipients.retain(|u| u.id != actor_id);

        tracing::info!(proposal_id = id, author = actor_id, "Feedback recorded");
        self.emit(ApprovalEvent::FeedbackAdded {
            proposal_id: id,
            author_id: actor_id,
        });
        self.dispatcher.dispatch(Notification::Feedback {
            proposal,
            actor: Actor::User(actor_id),
            comment: entry.comment.clone().unwrap_or_default(),
            recipients,
        });

        Ok(entry)
    }

    /// Administrative jump. Whether `actor_id` may bypass is decided by the caller.
    pub async fn bypass(
        &self,
        id: DbId,
        actor_id: DbId,
        target_stage: i32,
        reason: &str,
    ) -> Result<Proposal> {
        let _guard = self.lock_proposal(id).await;
        let now = self.now();
        let mut proposal = self.load_proposal(id).await?;
        self.load_user(actor_id).await?;

        let entry = proposal.bypass(Actor::User(actor_id), target_stage, reason, now)?;
        self.store.apply_transition(&proposal, &entry).await?;

        tracing::warn!(
            proposal_id = id,
            actor = actor_id,
            from = entry.from_stage,
            to = ?entry.to_stage,
            reason = entry.comment.as_deref().unwrap_or_default(),
            "Approval chain bypassed"
        );
        self.emit(ApprovalEvent::Bypassed {
            proposal_id: id,
            actor_id,
            from_stage: entry.from_stage,
            to_stage: entry.to_stage,
        });
        if proposal.is_completed() {
            self.emit(ApprovalEvent::Completed { proposal_id: id });
            self.dispatcher.dispatch(Notification::Approved {
                proposal: proposal.clone(),
                actor: Actor::User(actor_id),
            });
        } else {
            self.announce_pending(&proposal, now).await;
        }

        Ok(proposal)
    }

    /// Collaborator signal that a stage hold has been satisfied
    pub async fn release_hold(&self, id: DbId, hold: StageHold) -> Result<Proposal> {
        let _guard = self.lock_proposal(id).await;
        let now = self.now();
        let mut proposal = self.load_proposal(id).await?;

        proposal.release_hold(hold, now)?;
        self.store.update_proposal(&proposal).await?;

        tracing::info!(proposal_id = id, hold = hold.as_str(), "Stage hold released");
        self.emit(ApprovalEvent::HoldReleased {
            proposal_id: id,
            hold,
        });
        self.announce_pending(&proposal, now).await;

        Ok(proposal)
    }

    /// Close a proposal that has been idle past the threshold. The idle check
    /// is repeated under the lock; `Ok(false)` means a human action got there
    /// first or the proposal is not eligible.
    pub async fn auto_reject(&self, id: DbId) -> Result<bool> {
        let _guard = self.lock_proposal(id).await;
        let now = self.now();
        let mut proposal = self.load_proposal(id).await?;
        let idle_since = proposal.idle_since();

        if !proposal.is_idle(now, self.config.idle_threshold) {
            tracing::debug!(proposal_id = id, "No longer idle; skipping auto-reject");
            return Ok(false);
        }

        let entry = proposal.auto_reject(now, self.config.idle_threshold)?;
        self.store.apply_transition(&proposal, &entry).await?;

        tracing::info!(
            proposal_id = id,
            stage = proposal.current_stage,
            idle_since = ?idle_since,
            "Idle proposal auto-rejected"
        );
        self.emit(ApprovalEvent::AutoRejected { proposal_id: id });
        self.dispatcher.dispatch(Notification::Rejected {
            proposal: proposal.clone(),
            actor: Actor::System,
            reason: entry.comment.clone().unwrap_or_default(),
        });

        Ok(true)
    }

    // Delegation

    pub async fn start_delegation(&self, user_id: DbId, request: ActingRequest) -> Result<User> {
        let _guard = self.user_locks.acquire(user_id).await;
        let mut user = self.load_user(user_id).await?;
        let replaced = user.delegation_expired(self.now());
        user.start_acting(request, self.now())?;
        self.store.save_user(&user).await?;

        if let Some(acting) = user.acting() {
            tracing::info!(
                user_id,
                home_role = acting.home_role_id,
                acting_role = acting.acting_role_id,
                start = %acting.window.start,
                end = %acting.window.end,
                replaced_expired = replaced,
                "Acting assignment started"
            );
            self.emit(ApprovalEvent::DelegationStarted {
                user_id,
                acting_role_id: acting.acting_role_id,
            });
        }
        Ok(user)
    }

    pub async fn stop_delegation(&self, user_id: DbId) -> Result<User> {
        let _guard = self.user_locks.acquire(user_id).await;
        let mut user = self.load_user(user_id).await?;
        self.clear_delegation(&mut user).await?;
        Ok(user)
    }

    /// Clear an acting assignment only if its window has closed. The check
    /// runs under the user's lock on the record that gets saved, so an
    /// assignment renewed in the meantime is left alone.
    pub async fn clear_expired_delegation(&self, user_id: DbId) -> Result<bool> {
        let _guard = self.user_locks.acquire(user_id).await;
        let mut user = self.load_user(user_id).await?;
        if !user.delegation_expired(self.now()) {
            tracing::debug!(user_id, "Acting assignment no longer expired; skipping");
            return Ok(false);
        }
        self.clear_delegation(&mut user).await?;
        Ok(true)
    }

    /// Caller holds the user's lock
    async fn clear_delegation(&self, user: &mut User) -> Result<()> {
        let cleared = user.stop_acting()?;
        self.store.save_user(user).await?;

        tracing::info!(
            user_id = user.id,
            restored_role = cleared.home_role_id,
            "Acting assignment cleared"
        );
        self.emit(ApprovalEvent::DelegationCleared { user_id: user.id });
        Ok(())
    }
}
