//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ideaflow::approval::{ApprovalEngine, EngineConfig};
use ideaflow::clock::ManualClock;
use ideaflow::delegation::{Employee, User};
use ideaflow::error::{AppError, Result};
use ideaflow::models::{Actor, DbId, NewProposal, Proposal, StageHold};
use ideaflow::notify::{Dispatcher, Notifier};
use ideaflow::store::{MemoryStore, Store};
use ideaflow::workflow::{
    ApproverGroup, Condition, ConditionField, LocationScope, Operator, Stage, WorkflowDefinition,
};

pub const MANAGER: DbId = 1;
pub const DIRECTOR: DbId = 2;
pub const STAFF: DbId = 3;
pub const FINANCE: DbId = 4;

pub const INITIATOR: DbId = 100;
pub const MANAGER_D01: DbId = 1;
pub const MANAGER_D02: DbId = 2;
pub const DIRECTOR_D01: DbId = 3;
pub const DIRECTOR_D02: DbId = 4;
pub const FINANCE_D01: DbId = 5;
pub const ADMIN: DbId = 6;
pub const MANAGER_D01_B: DbId = 7;

pub const LARGE_SPEND: DbId = 1;
pub const STANDARD: DbId = 2;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
}

/// One delivered notification
#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub kind: &'static str,
    pub proposal_id: DbId,
    pub actor: Option<Actor>,
    pub recipients: Vec<DbId>,
}

/// Records every notification; optionally fails each one after recording
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn record(&self, sent: Sent) -> Result<()> {
        self.sent.lock().unwrap().push(sent);
        if self.fail {
            return Err(AppError::Notification("channel down".to_string()));
        }
        Ok(())
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait for the dispatcher's tasks to deliver at least `n` notifications
    pub async fn wait_for(&self, n: usize) -> Vec<Sent> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} notifications, got {:?}", n, self.sent());
    }
}

fn ids(users: &[User]) -> Vec<DbId> {
    users.iter().map(|u| u.id).collect()
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_submitted(&self, proposal: &Proposal, approvers: &[User]) -> Result<()> {
        self.record(Sent {
            kind: "submitted",
            proposal_id: proposal.id,
            actor: None,
            recipients: ids(approvers),
        })
    }

    async fn notify_approved(&self, proposal: &Proposal, actor: Actor) -> Result<()> {
        self.record(Sent {
            kind: "approved",
            proposal_id: proposal.id,
            actor: Some(actor),
            recipients: vec![],
        })
    }

    async fn notify_rejected(&self, proposal: &Proposal, actor: Actor, _reason: &str) -> Result<()> {
        self.record(Sent {
            kind: "rejected",
            proposal_id: proposal.id,
            actor: Some(actor),
            recipients: vec![],
        })
    }

    async fn notify_feedback(
        &self,
        proposal: &Proposal,
        actor: Actor,
        _comment: &str,
        recipients: &[User],
    ) -> Result<()> {
        self.record(Sent {
            kind: "feedback",
            proposal_id: proposal.id,
            actor: Some(actor),
            recipients: ids(recipients),
        })
    }
}

pub fn staff(id: DbId, role: DbId, division: &str, department: &str) -> User {
    User::new(
        id,
        format!("user-{}", id),
        role,
        Some(Employee {
            division_id: division.to_string(),
            department_id: department.to_string(),
            is_active: true,
        }),
    )
}

/// Two workflows:
///
/// - "Large spend" (priority 2, cost >= 20000): managers (division),
///   directors (division, then team assignment), finance (global),
///   directors (global)
/// - "Standard" (priority 0, no conditions): managers, directors
pub async fn seed(store: &MemoryStore) {
    for (id, name, role) in [
        (10, "Managers", MANAGER),
        (11, "Directors", DIRECTOR),
        (12, "Finance", FINANCE),
    ] {
        store
            .insert_group(ApproverGroup {
                id,
                name: name.to_string(),
                role_ids: vec![role],
            })
            .await;
    }

    store
        .insert_workflow(
            WorkflowDefinition::new(LARGE_SPEND, "Large spend", 2)
                .with_condition(Condition::new(ConditionField::Cost, Operator::Gte, "20000"))
                .with_stage(10)
                .with_stage_def(Stage::new(LARGE_SPEND, 2, 11).with_hold(StageHold::TeamAssignment))
                .with_stage_def(Stage::new(LARGE_SPEND, 3, 12).with_scope(LocationScope::Global))
                .with_stage_def(Stage::new(LARGE_SPEND, 4, 11).with_scope(LocationScope::Global)),
        )
        .await
        .unwrap();
    store
        .insert_workflow(
            WorkflowDefinition::new(STANDARD, "Standard", 0)
                .with_stage(10)
                .with_stage(11),
        )
        .await
        .unwrap();

    for user in [
        staff(INITIATOR, STAFF, "D01", "P01"),
        staff(MANAGER_D01, MANAGER, "D01", "P01"),
        staff(MANAGER_D02, MANAGER, "D02", "P01"),
        staff(DIRECTOR_D01, DIRECTOR, "D01", "P02"),
        staff(DIRECTOR_D02, DIRECTOR, "D02", "P02"),
        staff(FINANCE_D01, FINANCE, "D01", "P09"),
        staff(ADMIN, STAFF, "D03", "P01"),
        staff(MANAGER_D01_B, MANAGER, "D01", "P03"),
    ] {
        store.insert_user(user).await;
    }
}

pub struct World {
    pub engine: Arc<ApprovalEngine>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
}

impl World {
    pub async fn new() -> Self {
        Self::with_notifier(RecordingNotifier::default()).await
    }

    pub async fn with_notifier(notifier: RecordingNotifier) -> Self {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        Self::assemble(store.clone(), store, notifier)
    }

    /// Engine over an arbitrary store; `seeded` is the memory store behind it
    pub fn assemble(
        seeded: Arc<MemoryStore>,
        store: Arc<dyn Store>,
        notifier: RecordingNotifier,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let notifier = Arc::new(notifier);
        let engine = Arc::new(ApprovalEngine::new(
            store,
            clock.clone(),
            Dispatcher::new(notifier.clone()),
            EngineConfig::default(),
        ));
        Self {
            engine,
            store: seeded,
            clock,
            notifier,
        }
    }

    pub async fn draft(&self, cost: i64) -> Proposal {
        self.engine
            .create_proposal(NewProposal {
                title: format!("Idea costing {}", cost),
                initiator_id: INITIATOR,
                division_id: "D01".to_string(),
                department_id: "P01".to_string(),
                category_id: "OPERATIONS".to_string(),
                event_id: None,
                submitted_cost: cost,
                related_division_ids: vec![],
            })
            .await
            .unwrap()
    }

    pub async fn submitted(&self, cost: i64) -> Proposal {
        let draft = self.draft(cost).await;
        self.engine.submit(draft.id, INITIATOR).await.unwrap()
    }
}
