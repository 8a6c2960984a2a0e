//! Approver resolution
//!
//! Who may act on a stage is computed from the stage's approver group, the
//! roles in that group and each candidate's *effective* role and location at
//! the evaluation instant. Nothing is cached: a result is only valid for the
//! `now` it was computed at, since delegation windows open and close.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::delegation::User;
use crate::error::Result;
use crate::models::{DbId, Proposal};
use crate::store::Store;
use crate::workflow::Stage;

pub struct ApproverResolver {
    store: Arc<dyn Store>,
}

impl ApproverResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Approvers for `(workflow_id, stage_number)` restricted to the given
    /// location ids. An unknown stage or an empty group yields an empty set.
    pub async fn resolve(
        &self,
        workflow_id: DbId,
        stage_number: i32,
        division_id: Option<&str>,
        department_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        let Some(stage) = self.store.get_stage(workflow_id, stage_number).await? else {
            tracing::warn!(workflow_id, stage = stage_number, "No stage definition; no approvers");
            return Ok(Vec::new());
        };
        self.resolve_stage(&stage, division_id, department_id, now)
            .await
    }

    /// Approvers for one stage of a submitted proposal. The stage's location
    /// scope decides which of the proposal's location ids apply.
    pub async fn resolve_for_proposal(
        &self,
        proposal: &Proposal,
        stage_number: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        let Some(workflow_id) = proposal.workflow_id else {
            return Ok(Vec::new());
        };
        let Some(stage) = self.store.get_stage(workflow_id, stage_number).await? else {
            tracing::warn!(
                proposal_id = proposal.id,
                workflow_id,
                stage = stage_number,
                "No stage definition; no approvers"
            );
            return Ok(Vec::new());
        };

        let scope = stage.location_scope;
        let division = scope
            .uses_division()
            .then_some(proposal.division_id.as_str())
            .filter(|d| !d.trim().is_empty());
        let department = scope
            .uses_department()
            .then_some(proposal.department_id.as_str())
            .filter(|d| !d.trim().is_empty());

        self.resolve_stage(&stage, division, department, now).await
    }

    async fn resolve_stage(
        &self,
        stage: &Stage,
        division_id: Option<&str>,
        department_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>> {
        let role_ids = self.store.group_role_ids(stage.approver_group_id).await?;
        let candidates = try_join_all(role_ids.iter().map(|role_id| self.store.users_for_role(*role_id))).await?;

        // Keyed by id: a user reachable through several roles appears once
        let mut approvers: BTreeMap<DbId, User> = BTreeMap::new();
        for (role_id, users) in role_ids.iter().zip(candidates) {
            for user in users {
                if eligible(&user, *role_id, division_id, department_id, now) {
                    approvers.entry(user.id).or_insert(user);
                }
            }
        }

        if approvers.is_empty() {
            tracing::warn!(
                workflow_id = stage.workflow_id,
                stage = stage.stage_number,
                group_id = stage.approver_group_id,
                division = ?division_id,
                department = ?department_id,
                "Stage has no resolvable approvers"
            );
        }
        Ok(approvers.into_values().collect())
    }
}

fn eligible(
    user: &User,
    role_id: DbId,
    division_id: Option<&str>,
    department_id: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    if !user.is_employed() || user.effective_role(now) != role_id {
        return false;
    }
    if let Some(division) = division_id {
        if user.effective_division(now) != Some(division) {
            return false;
        }
    }
    if let Some(department) = department_id {
        if user.effective_department(now) != Some(department) {
            return false;
        }
    }
    true
}
