//! Approval engine integration tests

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use common::*;
use ideaflow::approval::{ApprovalEvent, IdleSweeper};
use ideaflow::delegation::{ActingRequest, DelegationSweeper, RoleAssignment, User};
use ideaflow::error::{AppError, Result};
use ideaflow::models::{
    Actor, DbId, HistoryAction, HistoryEntry, NewProposal, Proposal, ProposalAttributes,
    ProposalStatus, StageHold,
};
use ideaflow::store::{Candidates, MemoryStore, SqliteStore, Store};
use ideaflow::workflow::{ApproverGroup, Stage, WorkflowDefinition};

fn attrs(cost: i64) -> ProposalAttributes {
    ProposalAttributes {
        cost,
        division_id: Some("D01".to_string()),
        ..ProposalAttributes::default()
    }
}

async fn actions(world: &World, id: DbId) -> Vec<(HistoryAction, i32, Option<i32>)> {
    world
        .engine
        .history(id)
        .await
        .unwrap()
        .iter()
        .map(|e| (e.action, e.from_stage, e.to_stage))
        .collect()
}

// Workflow selection

#[tokio::test]
async fn test_select_workflow_by_cost() {
    let world = World::new().await;
    let large = world.engine.select_workflow(&attrs(25_000)).await.unwrap();
    assert_eq!(large.id, LARGE_SPEND);
    let boundary = world.engine.select_workflow(&attrs(20_000)).await.unwrap();
    assert_eq!(boundary.id, LARGE_SPEND);
    let small = world.engine.select_workflow(&attrs(15_000)).await.unwrap();
    assert_eq!(small.id, STANDARD);
}

#[tokio::test]
async fn test_submit_without_any_workflow_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    seed(&store).await;
    // Replace the default with a conditioned copy so nothing matches cheap ideas
    let mut standard = store.get_workflow(STANDARD).await.unwrap().unwrap();
    standard.is_active = false;
    store.insert_workflow(standard).await.unwrap();
    let world = World::assemble(store.clone(), store, RecordingNotifier::default());

    let draft = world.draft(500).await;
    let err = world.engine.submit(draft.id, INITIATOR).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let unchanged = world.engine.get_proposal(draft.id).await.unwrap();
    assert_eq!(unchanged.status, ProposalStatus::Draft);
    assert!(world.engine.history(draft.id).await.unwrap().is_empty());
}

// Submission

#[tokio::test]
async fn test_create_proposal_validates_input() {
    let world = World::new().await;
    let mut new = NewProposal {
        title: "  ".to_string(),
        initiator_id: INITIATOR,
        division_id: "D01".to_string(),
        department_id: "P01".to_string(),
        category_id: "OPS".to_string(),
        event_id: None,
        submitted_cost: 10,
        related_division_ids: vec![],
    };
    assert!(matches!(
        world.engine.create_proposal(new.clone()).await,
        Err(AppError::Validation(_))
    ));

    new.title = "Ok".to_string();
    new.submitted_cost = -1;
    assert!(matches!(
        world.engine.create_proposal(new.clone()).await,
        Err(AppError::Validation(_))
    ));

    new.submitted_cost = 1;
    new.initiator_id = 9999;
    assert!(matches!(
        world.engine.create_proposal(new).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_submit_routes_to_first_stage() {
    let world = World::new().await;
    let draft = world.draft(25_000).await;
    assert!(draft.code.as_deref().unwrap().starts_with("IDEA-2026-"));

    let proposal = world.engine.submit(draft.id, INITIATOR).await.unwrap();
    assert_eq!(proposal.workflow_id, Some(LARGE_SPEND));
    assert_eq!(proposal.max_stage, 4);
    assert_eq!(proposal.current_stage, 0);
    assert_eq!(proposal.status, ProposalStatus::WaitingApproval(1));
    assert_eq!(proposal.submitted_date, Some(t0()));
    assert_eq!(
        actions(&world, proposal.id).await,
        vec![(HistoryAction::Submitted, 0, Some(0))]
    );

    let sent = world.notifier.wait_for(1).await;
    assert_eq!(sent[0].kind, "submitted");
    assert_eq!(sent[0].recipients, vec![MANAGER_D01, MANAGER_D01_B]);
}

#[tokio::test]
async fn test_only_initiator_submits_once() {
    let world = World::new().await;
    let draft = world.draft(100).await;

    assert!(matches!(
        world.engine.submit(draft.id, MANAGER_D01).await,
        Err(AppError::NotAuthorized(_))
    ));
    assert_ok!(world.engine.submit(draft.id, INITIATOR).await);
    assert!(matches!(
        world.engine.submit(draft.id, INITIATOR).await,
        Err(AppError::InvariantViolation(_))
    ));
    assert!(matches!(
        world.engine.submit(4242, INITIATOR).await,
        Err(AppError::NotFound(_))
    ));
}

// Approval chain

#[tokio::test]
async fn test_full_chain_with_team_assignment_hold() {
    let world = World::new().await;
    let p = world.submitted(30_000).await;

    let p1 = world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();
    assert_eq!(p1.current_stage, 1);
    assert_eq!(p1.status, ProposalStatus::WaitingApproval(2));

    let p2 = world
        .engine
        .approve(p.id, DIRECTOR_D01, Some("fund it".to_string()))
        .await
        .unwrap();
    assert_eq!(p2.current_stage, 2);
    assert_eq!(p2.status, ProposalStatus::OnHold(StageHold::TeamAssignment));
    assert!(world.engine.approvers_for(p.id).await.unwrap().is_empty());

    assert!(matches!(
        world.engine.approve(p.id, FINANCE_D01, None).await,
        Err(AppError::InvariantViolation(_))
    ));
    assert!(matches!(
        world.engine.release_hold(p.id, StageHold::MilestoneCreation).await,
        Err(AppError::InvariantViolation(_))
    ));

    let released = world
        .engine
        .release_hold(p.id, StageHold::TeamAssignment)
        .await
        .unwrap();
    assert_eq!(released.status, ProposalStatus::WaitingApproval(3));
    assert_eq!(released.current_stage, 2);

    let approvers: Vec<DbId> = world
        .engine
        .approvers_for(p.id)
        .await
        .unwrap()
        .iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(approvers, vec![FINANCE_D01]);

    world.clock.advance(Duration::hours(2));
    world.engine.approve(p.id, FINANCE_D01, None).await.unwrap();
    let done = world.engine.approve(p.id, DIRECTOR_D02, None).await.unwrap();

    assert_eq!(done.status, ProposalStatus::Completed);
    assert_eq!(done.current_stage, done.max_stage);
    assert_eq!(done.completed_date, Some(t0() + Duration::hours(2)));

    assert_eq!(
        actions(&world, p.id).await,
        vec![
            (HistoryAction::Submitted, 0, Some(0)),
            (HistoryAction::Approved, 0, Some(1)),
            (HistoryAction::Approved, 1, Some(2)),
            (HistoryAction::Approved, 2, Some(3)),
            (HistoryAction::Approved, 3, Some(4)),
        ]
    );

    assert!(matches!(
        world.engine.approve(p.id, DIRECTOR_D02, None).await,
        Err(AppError::InvariantViolation(_))
    ));
    let after = world.engine.get_proposal(p.id).await.unwrap();
    assert!(after.current_stage <= after.max_stage);
}

#[tokio::test]
async fn test_approve_requires_resolved_approver() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;

    // Manager of another division, a director, and the initiator
    for outsider in [MANAGER_D02, DIRECTOR_D01, INITIATOR] {
        assert!(matches!(
            world.engine.approve(p.id, outsider, None).await,
            Err(AppError::NotAuthorized(_))
        ));
        assert!(matches!(
            world.engine.reject(p.id, outsider, "no").await,
            Err(AppError::NotAuthorized(_))
        ));
    }

    assert_eq!(actions(&world, p.id).await.len(), 1);
    let unchanged = world.engine.get_proposal(p.id).await.unwrap();
    assert_eq!(unchanged.current_stage, 0);
}

#[tokio::test]
async fn test_reject_is_terminal_and_not_repeatable() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;
    world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();

    let rejected = world
        .engine
        .reject(p.id, DIRECTOR_D01, "duplicate of IDEA-2025-00012")
        .await
        .unwrap();
    assert!(rejected.is_rejected);
    assert_eq!(rejected.status, ProposalStatus::Rejected);
    assert_eq!(rejected.current_stage, 1);
    assert!(rejected.completed_date.is_some());

    let second = world.engine.reject(p.id, DIRECTOR_D01, "again").await;
    assert!(matches!(second, Err(AppError::InvariantViolation(_))));

    let after = world.engine.get_proposal(p.id).await.unwrap();
    assert_eq!(after, rejected);
    let history = actions(&world, p.id).await;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2], (HistoryAction::Rejected, 1, None));

    let sent = world.notifier.wait_for(4).await;
    let rejection = sent.iter().find(|s| s.kind == "rejected").unwrap();
    assert_eq!(rejection.actor, Some(Actor::User(DIRECTOR_D01)));
}

#[tokio::test]
async fn test_reject_with_blank_reason_stores_none() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;
    let rejected = world.engine.reject(p.id, MANAGER_D01, " ").await.unwrap();
    assert!(rejected.is_rejected);
    assert_eq!(rejected.rejected_reason, None);

    let last = world.engine.history(p.id).await.unwrap().pop().unwrap();
    assert_eq!((last.action, last.comment), (HistoryAction::Rejected, None));
}

// Feedback

#[tokio::test]
async fn test_feedback_leaves_stage_and_notifies_others() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;
    world.notifier.wait_for(1).await;

    let entry = world
        .engine
        .feedback(p.id, MANAGER_D01, "Please attach a quote")
        .await
        .unwrap();
    assert_eq!(entry.action, HistoryAction::Feedback);
    assert_eq!((entry.from_stage, entry.to_stage), (0, Some(0)));

    let after = world.engine.get_proposal(p.id).await.unwrap();
    assert_eq!(after.status, ProposalStatus::WaitingApproval(1));
    assert_eq!(after.current_stage, 0);

    let sent = world.notifier.wait_for(2).await;
    let feedback = sent.iter().find(|s| s.kind == "feedback").unwrap();
    assert_eq!(feedback.recipients, vec![MANAGER_D01_B, INITIATOR]);

    assert!(matches!(
        world.engine.feedback(p.id, MANAGER_D01, "").await,
        Err(AppError::Validation(_))
    ));
}

// Bypass

#[tokio::test]
async fn test_bypass_from_stage_two_to_max_completes() {
    let world = World::new().await;
    let p = world.submitted(30_000).await;
    world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();
    world.engine.approve(p.id, DIRECTOR_D01, None).await.unwrap();

    let done = world.engine.bypass(p.id, ADMIN, 4, "urgent").await.unwrap();
    assert_eq!(done.status, ProposalStatus::Completed);
    assert!(done.completed_date.is_some());

    let last = world.engine.history(p.id).await.unwrap().pop().unwrap();
    assert_eq!(last.action, HistoryAction::Bypassed);
    assert_eq!(last.from_stage, 2);
    assert_eq!(last.to_stage, None);
    assert_eq!(last.comment.as_deref(), Some("urgent"));
    assert_eq!(last.actor, Actor::User(ADMIN));
}

#[tokio::test]
async fn test_bypass_validation_and_terminal_guard() {
    let world = World::new().await;
    let p = world.submitted(30_000).await;

    for (target, reason) in [(0, "same stage"), (5, "past the end"), (-1, "negative"), (2, "")] {
        assert!(matches!(
            world.engine.bypass(p.id, ADMIN, target, reason).await,
            Err(AppError::Validation(_))
        ));
    }
    assert_eq!(actions(&world, p.id).await.len(), 1);

    world.engine.reject(p.id, MANAGER_D01, "no budget").await.unwrap();
    assert!(matches!(
        world.engine.bypass(p.id, ADMIN, 3, "override").await,
        Err(AppError::InvariantViolation(_))
    ));
}

#[tokio::test]
async fn test_bypass_forward_notifies_new_stage() {
    let world = World::new().await;
    let p = world.submitted(30_000).await;
    world.notifier.wait_for(1).await;

    let moved = world.engine.bypass(p.id, ADMIN, 2, "pre-approved at board").await.unwrap();
    assert_eq!(moved.status, ProposalStatus::WaitingApproval(3));

    let sent = world.notifier.wait_for(2).await;
    assert!(sent
        .iter()
        .any(|s| s.kind == "submitted" && s.recipients == vec![FINANCE_D01]));
}

// Delegation

#[tokio::test]
async fn test_acting_manager_can_approve_for_acting_division() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;

    let user = world
        .engine
        .start_delegation(
            MANAGER_D02,
            ActingRequest {
                acting_role_id: MANAGER,
                start: t0(),
                end: t0() + Duration::days(10),
                division_id: Some("D01".to_string()),
                department_id: None,
            },
        )
        .await
        .unwrap();
    assert!(user.is_currently_acting(t0()));

    world.clock.advance(Duration::days(5));
    let approvers: Vec<DbId> = world
        .engine
        .approvers_for(p.id)
        .await
        .unwrap()
        .iter()
        .map(|u| u.id)
        .collect();
    assert!(approvers.contains(&MANAGER_D02));
    assert_ok!(world.engine.approve(p.id, MANAGER_D02, None).await);

    // Once the window closes the override no longer applies
    let q = world.submitted(1_000).await;
    world.clock.advance(Duration::days(6));
    assert!(matches!(
        world.engine.approve(q.id, MANAGER_D02, None).await,
        Err(AppError::NotAuthorized(_))
    ));
}

#[tokio::test]
async fn test_delegation_lifecycle_errors() {
    let world = World::new().await;
    let request = || ActingRequest {
        acting_role_id: DIRECTOR,
        start: t0(),
        end: t0() + Duration::days(1),
        division_id: None,
        department_id: None,
    };

    assert_err!(world.engine.stop_delegation(MANAGER_D01).await);
    assert_ok!(world.engine.start_delegation(MANAGER_D01, request()).await);
    assert!(matches!(
        world.engine.start_delegation(MANAGER_D01, request()).await,
        Err(AppError::InvariantViolation(_))
    ));

    let restored = world.engine.stop_delegation(MANAGER_D01).await.unwrap();
    assert!(restored.acting().is_none());
    assert_eq!(restored.home_role_id(), MANAGER);

    let backwards = ActingRequest {
        end: t0() - Duration::days(1),
        ..request()
    };
    assert!(matches!(
        world.engine.start_delegation(MANAGER_D01, backwards).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        world.engine.start_delegation(9999, request()).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delegation_sweeper_clears_only_expired() {
    let world = World::new().await;
    for (user, days) in [(MANAGER_D01, 1), (MANAGER_D02, 30)] {
        world
            .engine
            .start_delegation(
                user,
                ActingRequest {
                    acting_role_id: DIRECTOR,
                    start: t0(),
                    end: t0() + Duration::days(days),
                    division_id: None,
                    department_id: None,
                },
            )
            .await
            .unwrap();
    }

    let sweeper = DelegationSweeper::new(world.engine.clone());
    world.clock.advance(Duration::days(2));

    let report = sweeper.run_once().await.unwrap();
    assert_eq!((report.scanned, report.applied, report.failed), (1, 1, 0));

    let cleared = world.store.get_user(MANAGER_D01).await.unwrap().unwrap();
    assert!(cleared.acting().is_none());
    assert_eq!(cleared.home_role_id(), MANAGER);
    let still_acting = world.store.get_user(MANAGER_D02).await.unwrap().unwrap();
    assert!(still_acting.acting().is_some());

    let again = sweeper.run_once().await.unwrap();
    assert_eq!(again.scanned, 0);
}

fn acting_for(role_id: DbId, start: DateTime<Utc>, days: i64) -> ActingRequest {
    ActingRequest {
        acting_role_id: role_id,
        start,
        end: start + Duration::days(days),
        division_id: None,
        department_id: None,
    }
}

#[tokio::test]
async fn test_start_delegation_replaces_unswept_expired_assignment() {
    let world = World::new().await;
    world
        .engine
        .start_delegation(MANAGER_D01, acting_for(DIRECTOR, t0(), 1))
        .await
        .unwrap();
    world.clock.advance(Duration::days(3));

    // The sweeper has not run yet
    let renewed = world
        .engine
        .start_delegation(MANAGER_D01, acting_for(FINANCE, world.engine.now(), 5))
        .await
        .unwrap();
    let acting = renewed.acting().unwrap();
    assert_eq!(acting.acting_role_id, FINANCE);
    assert_eq!(acting.home_role_id, MANAGER);
    assert_eq!(renewed.effective_role(world.engine.now()), FINANCE);

    let restored = world.engine.stop_delegation(MANAGER_D01).await.unwrap();
    assert_eq!(restored.assignment, RoleAssignment::Home { role_id: MANAGER });
}

#[tokio::test]
async fn test_clear_expired_leaves_renewed_assignment() {
    let world = World::new().await;
    world
        .engine
        .start_delegation(MANAGER_D01, acting_for(DIRECTOR, t0(), 1))
        .await
        .unwrap();
    world.clock.advance(Duration::days(2));

    // Sweeper lists the user, then an administrator renews before it clears
    let listed = world.store.expired_delegations(world.engine.now()).await.unwrap();
    assert_eq!(listed.len(), 1);
    world.engine.stop_delegation(MANAGER_D01).await.unwrap();
    world
        .engine
        .start_delegation(MANAGER_D01, acting_for(DIRECTOR, world.engine.now(), 7))
        .await
        .unwrap();

    assert!(!world.engine.clear_expired_delegation(MANAGER_D01).await.unwrap());
    let user = world.store.get_user(MANAGER_D01).await.unwrap().unwrap();
    assert!(user.is_currently_acting(world.engine.now()));
    assert_eq!(user.acting().unwrap().window.end, world.engine.now() + Duration::days(7));
}

#[tokio::test]
async fn test_concurrent_renew_and_clear_never_lose_renewal() {
    let world = World::new().await;
    world
        .engine
        .start_delegation(MANAGER_D01, acting_for(DIRECTOR, t0(), 1))
        .await
        .unwrap();
    world.clock.advance(Duration::days(2));
    let now = world.engine.now();

    let clearing = {
        let engine = world.engine.clone();
        tokio::spawn(async move { engine.clear_expired_delegation(MANAGER_D01).await })
    };
    let renewing = {
        let engine = world.engine.clone();
        tokio::spawn(async move {
            engine
                .start_delegation(MANAGER_D01, acting_for(DIRECTOR, now, 7))
                .await
        })
    };
    let cleared = clearing.await.unwrap().unwrap();
    assert_ok!(renewing.await.unwrap());

    // Whichever ran first, the renewal survives
    let user = world.store.get_user(MANAGER_D01).await.unwrap().unwrap();
    assert!(user.is_currently_acting(now), "cleared first: {}", cleared);
    assert_eq!(user.home_role_id(), MANAGER);
}

// Idle sweep

#[tokio::test]
async fn test_idle_sweep_auto_rejects_once() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;
    world.clock.advance(Duration::days(65));

    let sweeper = IdleSweeper::new(world.engine.clone());
    let first = sweeper.run_once().await.unwrap();
    assert_eq!((first.scanned, first.applied), (1, 1));
    let second = sweeper.run_once().await.unwrap();
    assert_eq!((second.scanned, second.applied), (0, 0));

    let after = world.engine.get_proposal(p.id).await.unwrap();
    assert!(after.is_rejected);
    assert_eq!(after.status, ProposalStatus::Inactive);
    assert_eq!(after.status.label(), "Inactive");

    let history = world.engine.history(p.id).await.unwrap();
    let auto: Vec<&HistoryEntry> = history
        .iter()
        .filter(|e| e.action == HistoryAction::AutoRejected)
        .collect();
    assert_eq!(auto.len(), 1);
    assert_eq!((auto[0].from_stage, auto[0].to_stage), (0, None));
    assert_eq!(auto[0].actor, Actor::System);

    let sent = world.notifier.wait_for(2).await;
    let rejection = sent.iter().find(|s| s.kind == "rejected").unwrap();
    assert_eq!(rejection.actor, Some(Actor::System));
}

#[tokio::test]
async fn test_idle_sweep_uses_last_update_after_first_stage() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;

    world.clock.advance(Duration::days(30));
    world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();
    world.clock.advance(Duration::days(35));

    let sweeper = IdleSweeper::new(world.engine.clone());
    let report = sweeper.run_once().await.unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(
        world.engine.get_proposal(p.id).await.unwrap().status,
        ProposalStatus::WaitingApproval(2)
    );

    world.clock.advance(Duration::days(30));
    assert_eq!(sweeper.run_once().await.unwrap().applied, 1);
    let last = world.engine.history(p.id).await.unwrap().pop().unwrap();
    assert_eq!((last.action, last.from_stage), (HistoryAction::AutoRejected, 1));
}

#[tokio::test]
async fn test_idle_sweep_includes_held_proposals() {
    let world = World::new().await;
    let p = world.submitted(30_000).await;
    world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();
    world.engine.approve(p.id, DIRECTOR_D01, None).await.unwrap();
    world.clock.advance(Duration::days(61));

    let report = IdleSweeper::new(world.engine.clone()).run_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(
        world.engine.get_proposal(p.id).await.unwrap().status,
        ProposalStatus::Inactive
    );
}

#[tokio::test]
async fn test_auto_reject_yields_to_recent_human_action() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;
    world.clock.advance(Duration::days(61));

    // A human approval lands before the sweep reaches the proposal
    world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();
    assert!(!world.engine.auto_reject(p.id).await.unwrap());
    assert!(!world.engine.get_proposal(p.id).await.unwrap().is_rejected);
}

/// Store whose transitions fail for one proposal
struct FlakyStore {
    inner: Arc<MemoryStore>,
    broken: DbId,
}

#[async_trait]
impl Store for FlakyStore {
    async fn active_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.inner.active_workflows().await
    }

    async fn get_workflow(&self, id: DbId) -> Result<Option<WorkflowDefinition>> {
        self.inner.get_workflow(id).await
    }

    async fn get_stage(&self, workflow_id: DbId, stage_number: i32) -> Result<Option<Stage>> {
        self.inner.get_stage(workflow_id, stage_number).await
    }

    async fn group_role_ids(&self, group_id: DbId) -> Result<Vec<DbId>> {
        self.inner.group_role_ids(group_id).await
    }

    async fn get_user(&self, id: DbId) -> Result<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn users_for_role(&self, role_id: DbId) -> Result<Vec<User>> {
        self.inner.users_for_role(role_id).await
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.inner.save_user(user).await
    }

    async fn expired_delegations(&self, now: DateTime<Utc>) -> Result<Candidates<User>> {
        self.inner.expired_delegations(now).await
    }

    async fn insert_proposal(&self, new: &NewProposal, now: DateTime<Utc>) -> Result<Proposal> {
        self.inner.insert_proposal(new, now).await
    }

    async fn get_proposal(&self, id: DbId) -> Result<Option<Proposal>> {
        self.inner.get_proposal(id).await
    }

    async fn waiting_proposals(&self) -> Result<Candidates<Proposal>> {
        self.inner.waiting_proposals().await
    }

    async fn update_proposal(&self, proposal: &Proposal) -> Result<()> {
        self.inner.update_proposal(proposal).await
    }

    async fn apply_transition(&self, proposal: &Proposal, entry: &HistoryEntry) -> Result<()> {
        if proposal.id == self.broken && entry.action == HistoryAction::AutoRejected {
            return Err(AppError::Internal("disk full".to_string()));
        }
        self.inner.apply_transition(proposal, entry).await
    }

    async fn history(&self, proposal_id: DbId) -> Result<Vec<HistoryEntry>> {
        self.inner.history(proposal_id).await
    }
}

#[tokio::test]
async fn test_idle_sweep_continues_past_failed_item() {
    let inner = Arc::new(MemoryStore::new());
    seed(&inner).await;
    // The first proposal created gets id 1
    let flaky = Arc::new(FlakyStore {
        inner: inner.clone(),
        broken: 1,
    });
    let world = World::assemble(inner, flaky, RecordingNotifier::default());

    let broken = world.submitted(1_000).await;
    let healthy = world.submitted(2_000).await;
    assert_eq!(broken.id, 1);
    world.clock.advance(Duration::days(70));

    let sweeper = IdleSweeper::new(world.engine.clone());
    let report = sweeper.run_once().await.unwrap();
    assert_eq!((report.scanned, report.applied, report.failed), (2, 1, 1));

    let broken_after = world.engine.get_proposal(broken.id).await.unwrap();
    assert_eq!(broken_after.status, ProposalStatus::WaitingApproval(1));
    assert_eq!(world.engine.history(broken.id).await.unwrap().len(), 1);
    assert_eq!(
        world.engine.get_proposal(healthy.id).await.unwrap().status,
        ProposalStatus::Inactive
    );

    // Still eligible next pass
    let retry = sweeper.run_once().await.unwrap();
    assert_eq!((retry.scanned, retry.failed), (1, 1));
}

// Concurrency, events, notification isolation

#[tokio::test]
async fn test_concurrent_approvals_advance_once() {
    let world = World::new().await;
    let p = world.submitted(1_000).await;

    let id = p.id;
    let engine_a = world.engine.clone();
    let engine_b = world.engine.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { engine_a.approve(id, MANAGER_D01, None).await }),
        tokio::spawn(async move { engine_b.approve(id, MANAGER_D01_B, None).await }),
    );
    let results = [a.unwrap(), b.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    let after = world.engine.get_proposal(p.id).await.unwrap();
    assert_eq!(after.current_stage, 1);
    let approved: Vec<_> = actions(&world, p.id)
        .await
        .into_iter()
        .filter(|(a, _, _)| *a == HistoryAction::Approved)
        .collect();
    assert_eq!(approved, vec![(HistoryAction::Approved, 0, Some(1))]);
}

#[tokio::test]
async fn test_events_follow_persisted_transitions() {
    let world = World::new().await;
    let mut events = world.engine.subscribe();

    let p = world.submitted(1_000).await;
    world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();
    world.engine.approve(p.id, DIRECTOR_D01, None).await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        ApprovalEvent::Submitted {
            proposal_id: p.id,
            workflow_id: STANDARD
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ApprovalEvent::Approved {
            proposal_id: p.id,
            approver_id: MANAGER_D01,
            from_stage: 0,
            to_stage: 1
        }
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        ApprovalEvent::Approved { to_stage: 2, .. }
    ));
    assert_eq!(
        events.recv().await.unwrap(),
        ApprovalEvent::Completed { proposal_id: p.id }
    );
}

#[tokio::test]
async fn test_failing_notifier_never_fails_transition() {
    let world = World::with_notifier(RecordingNotifier::failing()).await;
    let p = world.submitted(1_000).await;
    let approved = world.engine.approve(p.id, MANAGER_D01, None).await;
    assert_ok!(approved);
    // Each notification was attempted exactly once
    let sent = world.notifier.wait_for(3).await;
    assert_eq!(sent.len(), 3);
}

// SQLite-backed engine

/// Engine over a migrated in-memory SQLite store with one single-stage
/// workflow. The pool is returned for raw edits.
async fn sqlite_world() -> (World, SqlitePool) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    let sqlite = SqliteStore::new(pool.clone());
    sqlite.migrate().await.unwrap();

    sqlite
        .insert_group(&ApproverGroup {
            id: 10,
            name: "Managers".to_string(),
            role_ids: vec![MANAGER],
        })
        .await
        .unwrap();
    sqlite
        .insert_workflow(&WorkflowDefinition::new(1, "Only", 0).with_stage(10))
        .await
        .unwrap();
    for user in [
        staff(INITIATOR, STAFF, "D01", "P01"),
        staff(MANAGER_D01, MANAGER, "D01", "P01"),
        staff(MANAGER_D02, MANAGER, "D02", "P01"),
    ] {
        sqlite.insert_user(&user).await.unwrap();
    }

    let world = World::assemble(
        Arc::new(MemoryStore::new()),
        Arc::new(sqlite),
        RecordingNotifier::default(),
    );
    (world, pool)
}

#[tokio::test]
async fn test_sqlite_backed_engine_end_to_end() {
    let (world, _pool) = sqlite_world().await;
    let p = world.submitted(10).await;
    let done = world.engine.approve(p.id, MANAGER_D01, None).await.unwrap();
    assert_eq!(done.status, ProposalStatus::Completed);
    assert_eq!(
        actions(&world, p.id).await,
        vec![
            (HistoryAction::Submitted, 0, Some(0)),
            (HistoryAction::Approved, 0, Some(1)),
        ]
    );
}

#[tokio::test]
async fn test_idle_sweep_skips_unreadable_proposal_row() {
    let (world, pool) = sqlite_world().await;
    let corrupt = world.submitted(10).await;
    let healthy = world.submitted(20).await;
    sqlx::query("UPDATE proposals SET current_status = 'Waiting Legal Review' WHERE id = ?")
        .bind(corrupt.id)
        .execute(&pool)
        .await
        .unwrap();
    world.clock.advance(Duration::days(70));

    let sweeper = IdleSweeper::new(world.engine.clone());
    let report = sweeper.run_once().await.unwrap();
    assert_eq!(
        (report.scanned, report.applied, report.skipped, report.failed),
        (2, 1, 0, 1)
    );

    let rejected = world.engine.get_proposal(healthy.id).await.unwrap();
    assert_eq!(rejected.status, ProposalStatus::Inactive);
    assert!(rejected.is_rejected);

    let status: String = sqlx::query_scalar("SELECT current_status FROM proposals WHERE id = ?")
        .bind(corrupt.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "Waiting Legal Review");
}

#[tokio::test]
async fn test_delegation_sweep_skips_unreadable_user_row() {
    let (world, pool) = sqlite_world().await;
    for user in [MANAGER_D01, MANAGER_D02] {
        world
            .engine
            .start_delegation(user, acting_for(DIRECTOR, t0(), 1))
            .await
            .unwrap();
    }
    // Zero-length window fails to decode
    sqlx::query("UPDATE users SET acting_end_date = acting_start_date WHERE id = ?")
        .bind(MANAGER_D01)
        .execute(&pool)
        .await
        .unwrap();
    world.clock.advance(Duration::days(2));

    let sweeper = DelegationSweeper::new(world.engine.clone());
    let report = sweeper.run_once().await.unwrap();
    assert_eq!(
        (report.scanned, report.applied, report.skipped, report.failed),
        (2, 1, 0, 1)
    );

    let cleared = world.engine.store().get_user(MANAGER_D02).await.unwrap().unwrap();
    assert_eq!(cleared.assignment, RoleAssignment::Home { role_id: MANAGER });
    assert_err!(world.engine.store().get_user(MANAGER_D01).await);
}
