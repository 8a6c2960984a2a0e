//! In-memory store
//!
//! Tables are plain maps behind `tokio::sync::RwLock`s. Transitions take the
//! proposal and history locks together so the two writes land as one unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{proposal_code, Candidates, Store};
use crate::delegation::User;
use crate::error::{AppError, Result};
use crate::models::{DbId, HistoryEntry, NewProposal, Proposal, ProposalStatus};
use crate::workflow::{ApproverGroup, Stage, WorkflowDefinition};

#[derive(Default)]
pub struct MemoryStore {
    /// Ordered by id so listings are deterministic
    workflows: RwLock<BTreeMap<DbId, WorkflowDefinition>>,
    groups: RwLock<HashMap<DbId, ApproverGroup>>,
    users: RwLock<BTreeMap<DbId, User>>,
    proposals: RwLock<BTreeMap<DbId, Proposal>>,
    history: RwLock<HashMap<DbId, Vec<HistoryEntry>>>,
    next_proposal_id: RwLock<DbId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding (master data lives outside the engine)

    pub async fn insert_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        workflow.validate()?;
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id, workflow);
        Ok(())
    }

    pub async fn insert_group(&self, group: ApproverGroup) {
        let mut groups = self.groups.write().await;
        groups.insert(group.id, group);
    }

    pub async fn insert_user(&self, user: User) {
        let mut users = self.users.write().await;
        users.insert(user.id, user);
    }

    /// Overwrite a proposal row without touching history. Test fixtures use
    /// this to age proposals.
    pub async fn put_proposal(&self, proposal: Proposal) {
        let mut proposals = self.proposals.write().await;
        proposals.insert(proposal.id, proposal);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let workflows = self.workflows.read().await;
        Ok(workflows.values().filter(|w| w.is_active).cloned().collect())
    }

    async fn get_workflow(&self, id: DbId) -> Result<Option<WorkflowDefinition>> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(&id).cloned())
    }

    async fn get_stage(&self, workflow_id: DbId, stage_number: i32) -> Result<Option<Stage>> {
        let workflows = self.workflows.read().await;
        Ok(workflows
            .get(&workflow_id)
            .and_then(|w| w.stage(stage_number))
            .cloned())
    }

    async fn group_role_ids(&self, group_id: DbId) -> Result<Vec<DbId>> {
        let groups = self.groups.read().await;
        Ok(groups
            .get(&group_id)
            .map(|g| g.role_ids.clone())
            .unwrap_or_default())
    }

    async fn get_user(&self, id: DbId) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&id).cloned())
    }

    async fn users_for_role(&self, role_id: DbId) -> Result<Vec<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .filter(|u| {
                u.home_role_id() == role_id
                    || u.acting().is_some_and(|a| a.acting_role_id == role_id)
            })
            .cloned()
            .collect())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        let mut users = self.users.write().await;
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("User {} not found", user.id))),
        }
    }

    async fn expired_delegations(&self, now: DateTime<Utc>) -> Result<Candidates<User>> {
        let users = self.users.read().await;
        let expired: Vec<User> = users
            .values()
            .filter(|u| u.delegation_expired(now))
            .cloned()
            .collect();
        Ok(expired.into())
    }

    async fn insert_proposal(&self, new: &NewProposal, now: DateTime<Utc>) -> Result<Proposal> {
        let id = {
            let mut next = self.next_proposal_id.write().await;
            *next += 1;
            *next
        };

        let proposal = Proposal {
            id,
            code: Some(proposal_code(id, now)),
            title: new.title.clone(),
            initiator_id: new.initiator_id,
            division_id: new.division_id.clone(),
            department_id: new.department_id.clone(),
            category_id: new.category_id.clone(),
            event_id: new.event_id.clone(),
            submitted_cost: new.submitted_cost,
            validated_cost: None,
            workflow_id: None,
            current_stage: 0,
            max_stage: 0,
            status: ProposalStatus::Draft,
            is_rejected: false,
            rejected_reason: None,
            is_deleted: false,
            related_division_ids: new.related_division_ids.clone(),
            created_at: now,
            submitted_date: None,
            updated_date: None,
            completed_date: None,
        };

        let mut proposals = self.proposals.write().await;
        proposals.insert(id, proposal.clone());
        Ok(proposal)
    }

    async fn get_proposal(&self, id: DbId) -> Result<Option<Proposal>> {
        let proposals = self.proposals.read().await;
        Ok(proposals.get(&id).cloned())
    }

    async fn waiting_proposals(&self) -> Result<Candidates<Proposal>> {
        let proposals = self.proposals.read().await;
        let waiting: Vec<Proposal> = proposals
            .values()
            .filter(|p| !p.is_deleted && !p.is_rejected && p.status.is_waiting())
            .cloned()
            .collect();
        Ok(waiting.into())
    }

    async fn update_proposal(&self, proposal: &Proposal) -> Result<()> {
        let mut proposals = self.proposals.write().await;
        let existing = proposals
            .get_mut(&proposal.id)
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} not found", proposal.id)))?;
        *existing = proposal.clone();
        Ok(())
    }

    async fn apply_transition(&self, proposal: &Proposal, entry: &HistoryEntry) -> Result<()> {
        let mut proposals = self.proposals.write().await;
        let mut history = self.history.write().await;

        let existing = proposals
            .get_mut(&proposal.id)
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} not found", proposal.id)))?;
        if entry.proposal_id != proposal.id {
            return Err(AppError::Internal(format!(
                "history entry for proposal {} applied to proposal {}",
                entry.proposal_id, proposal.id
            )));
        }

        *existing = proposal.clone();
        history.entry(proposal.id).or_default().push(entry.clone());
        Ok(())
    }

    async fn history(&self, proposal_id: DbId) -> Result<Vec<HistoryEntry>> {
        let history = self.history.read().await;
        Ok(history.get(&proposal_id).cloned().unwrap_or_default())
    }
}
