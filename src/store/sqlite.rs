//! SQLite-backed store
//!
//! Rows are read into `*Row` structs and converted with `TryFrom`, so a
//! corrupt row surfaces as an error instead of a half-built model.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use super::{proposal_code, Candidates, Store};
use crate::delegation::{Acting, ActingWindow, Employee, RoleAssignment, User};
use crate::error::{AppError, Result};
use crate::models::{Actor, DbId, HistoryEntry, NewProposal, Proposal};
use crate::workflow::{ApproverGroup, Condition, Stage, WorkflowDefinition};

const USER_COLUMNS: &str = r#"
    u.id, u.name, u.email, u.role_id, u.is_acting, u.current_role_id,
    u.acting_start_date, u.acting_end_date, u.acting_division_id, u.acting_department_id,
    e.division_id, e.department_id, e.is_active AS employee_active
    FROM users u
    LEFT JOIN employees e ON e.user_id = u.id
"#;

const PROPOSAL_COLUMNS: &str = r#"
    id, code, title, initiator_id, division_id, department_id, category_id, event_id,
    submitted_cost, validated_cost, workflow_id, current_stage, max_stage, current_status,
    is_rejected, rejected_reason, is_deleted, related_division_ids,
    created_at, submitted_date, updated_date, completed_date
    FROM proposals
"#;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("Migration failed: {}", e)))
    }

    // Seeding

    /// Insert or replace a definition together with its conditions and stages
    pub async fn insert_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        workflow.validate()?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM workflow_conditions WHERE workflow_id = ?")
            .bind(workflow.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_stages WHERE workflow_id = ?")
            .bind(workflow.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, name, is_active, priority)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE
            SET name = excluded.name, is_active = excluded.is_active, priority = excluded.priority
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.is_active)
        .bind(workflow.priority)
        .execute(&mut *tx)
        .await?;

        for condition in &workflow.conditions {
            sqlx::query(
                r#"
                INSERT INTO workflow_conditions (workflow_id, condition_type, operator, value, is_active)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(workflow.id)
            .bind(condition.condition_type())
            .bind(condition.operator())
            .bind(&condition.value)
            .bind(condition.is_active)
            .execute(&mut *tx)
            .await?;
        }

        for stage in &workflow.stages {
            sqlx::query(
                r#"
                INSERT INTO workflow_stages
                    (workflow_id, stage_number, approver_group_id, is_mandatory, is_parallel, location_scope, hold_after)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(workflow.id)
            .bind(stage.stage_number)
            .bind(stage.approver_group_id)
            .bind(stage.is_mandatory)
            .bind(stage.is_parallel)
            .bind(stage.location_scope.as_str())
            .bind(stage.hold_after.map(|h| h.as_str()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_group(&self, group: &ApproverGroup) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approver_groups (id, name) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(group.id)
        .bind(&group.name)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM approver_group_roles WHERE group_id = ?")
            .bind(group.id)
            .execute(&mut *tx)
            .await?;
        for role_id in &group.role_ids {
            sqlx::query("INSERT INTO approver_group_roles (group_id, role_id) VALUES (?, ?)")
                .bind(group.id)
                .bind(*role_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_user(&self, user: &User) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO users (id, name, email, role_id) VALUES (?, ?, ?, ?)")
            .bind(user.id)
            .bind(&user.name)
            .bind(&user.email)
            .bind(user.home_role_id())
            .execute(&mut *tx)
            .await?;
        if let Some(employee) = &user.employee {
            sqlx::query(
                r#"
                INSERT INTO employees (user_id, division_id, department_id, is_active)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(user.id)
            .bind(&employee.division_id)
            .bind(&employee.department_id)
            .bind(employee.is_active)
            .execute(&mut *tx)
            .await?;
        }
        write_assignment(&mut tx, user).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_definitions(&self, rows: Vec<WorkflowRow>) -> Result<Vec<WorkflowDefinition>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let conditions = sqlx::query_as::<_, ConditionRow>(
            r#"
            SELECT workflow_id, condition_type, operator, value, is_active
            FROM workflow_conditions
            ORDER BY workflow_id, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let stages = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT workflow_id, stage_number, approver_group_id, is_mandatory, is_parallel, location_scope, hold_after
            FROM workflow_stages
            ORDER BY workflow_id, stage_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut conditions_by_workflow: HashMap<DbId, Vec<Condition>> = HashMap::new();
        for row in conditions {
            conditions_by_workflow
                .entry(row.workflow_id)
                .or_default()
                .push(row.into());
        }
        let mut stages_by_workflow: HashMap<DbId, Vec<Stage>> = HashMap::new();
        for row in stages {
            stages_by_workflow
                .entry(row.workflow_id)
                .or_default()
                .push(row.try_into()?);
        }

        Ok(rows
            .into_iter()
            .map(|row| WorkflowDefinition {
                conditions: conditions_by_workflow.remove(&row.id).unwrap_or_default(),
                stages: stages_by_workflow.remove(&row.id).unwrap_or_default(),
                id: row.id,
                name: row.name,
                is_active: row.is_active,
                priority: row.priority,
            })
            .collect())
    }
}

/// Write the acting columns for a user. The home role moves to
/// `current_role_id` while acting.
async fn write_assignment(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user: &User,
) -> Result<u64> {
    let result = match &user.assignment {
        RoleAssignment::Home { role_id } => {
            sqlx::query(
                r#"
                UPDATE users
                SET role_id = ?, is_acting = 0, current_role_id = NULL,
                    acting_start_date = NULL, acting_end_date = NULL,
                    acting_division_id = NULL, acting_department_id = NULL
                WHERE id = ?
                "#,
            )
            .bind(*role_id)
            .bind(user.id)
            .execute(&mut **tx)
            .await?
        }
        RoleAssignment::Acting(acting) => {
            sqlx::query(
                r#"
                UPDATE users
                SET role_id = ?, is_acting = 1, current_role_id = ?,
                    acting_start_date = ?, acting_end_date = ?,
                    acting_division_id = ?, acting_department_id = ?
                WHERE id = ?
                "#,
            )
            .bind(acting.acting_role_id)
            .bind(acting.home_role_id)
            .bind(acting.window.start)
            .bind(acting.window.end)
            .bind(&acting.division_id)
            .bind(&acting.department_id)
            .bind(user.id)
            .execute(&mut **tx)
            .await?
        }
    };
    Ok(result.rows_affected())
}

#[async_trait]
impl Store for SqliteStore {
    async fn active_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, name, is_active, priority
            FROM workflow_definitions
            WHERE is_active = 1
            ORDER BY priority DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        self.load_definitions(rows).await
    }

    async fn get_workflow(&self, id: DbId) -> Result<Option<WorkflowDefinition>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, name, is_active, priority FROM workflow_definitions WHERE id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.load_definitions(rows).await?.into_iter().next())
    }

    async fn get_stage(&self, workflow_id: DbId, stage_number: i32) -> Result<Option<Stage>> {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT workflow_id, stage_number, approver_group_id, is_mandatory, is_parallel, location_scope, hold_after
            FROM workflow_stages
            WHERE workflow_id = ? AND stage_number = ?
            "#,
        )
        .bind(workflow_id)
        .bind(stage_number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Stage::try_from).transpose()
    }

    async fn group_role_ids(&self, group_id: DbId) -> Result<Vec<DbId>> {
        let ids = sqlx::query_scalar::<_, DbId>(
            "SELECT role_id FROM approver_group_roles WHERE group_id = ? ORDER BY role_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn get_user(&self, id: DbId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!("SELECT {} WHERE u.id = ?", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(User::try_from).transpose()
    }

    async fn users_for_role(&self, role_id: DbId) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} WHERE u.role_id = ? OR u.current_role_id = ? ORDER BY u.id",
            USER_COLUMNS
        ))
        .bind(role_id)
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if write_assignment(&mut tx, user).await? == 0 {
            return Err(AppError::NotFound(format!("User {} not found", user.id)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn expired_delegations(&self, now: DateTime<Utc>) -> Result<Candidates<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} WHERE u.is_acting = 1 ORDER BY u.id",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        // Compare in Rust rather than on the stored text form
        let mut listed: Candidates<User> = decode_listing(rows, "user", |r| r.id);
        listed.items.retain(|u| u.delegation_expired(now));
        Ok(listed)
    }

    async fn insert_proposal(&self, new: &NewProposal, now: DateTime<Utc>) -> Result<Proposal> {
        let related = serde_json::to_string(&new.related_division_ids)
            .map_err(|e| AppError::Internal(format!("Invalid related divisions: {}", e)))?;
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r#"
            INSERT INTO proposals
                (title, initiator_id, division_id, department_id, category_id, event_id,
                 submitted_cost, current_status, related_division_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'Draft', ?, ?)
            "#,
        )
        .bind(&new.title)
        .bind(new.initiator_id)
        .bind(&new.division_id)
        .bind(&new.department_id)
        .bind(&new.category_id)
        .bind(&new.event_id)
        .bind(new.submitted_cost)
        .bind(&related)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE proposals SET code = ? WHERE id = ?")
            .bind(proposal_code(id, now))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, ProposalRow>(&format!("SELECT {} WHERE id = ?", PROPOSAL_COLUMNS))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        row.try_into()
    }

    async fn get_proposal(&self, id: DbId) -> Result<Option<Proposal>> {
        let row = sqlx::query_as::<_, ProposalRow>(&format!("SELECT {} WHERE id = ?", PROPOSAL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Proposal::try_from).transpose()
    }

    async fn waiting_proposals(&self) -> Result<Candidates<Proposal>> {
        let rows = sqlx::query_as::<_, ProposalRow>(&format!(
            r#"SELECT {}
            WHERE is_deleted = 0 AND is_rejected = 0 AND current_status LIKE 'Waiting%'
            ORDER BY id"#,
            PROPOSAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut listed: Candidates<Proposal> = decode_listing(rows, "proposal", |r| r.id);
        listed.items.retain(|p| p.status.is_waiting());
        Ok(listed)
    }

    async fn update_proposal(&self, proposal: &Proposal) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_proposal(&mut tx, proposal).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_transition(&self, proposal: &Proposal, entry: &HistoryEntry) -> Result<()> {
        if entry.proposal_id != proposal.id {
            return Err(AppError::Internal(format!(
                "history entry for proposal {} applied to proposal {}",
                entry.proposal_id, proposal.id
            )));
        }

        let mut tx = self.pool.begin().await?;
        write_proposal(&mut tx, proposal).await?;
        sqlx::query(
            r#"
            INSERT INTO proposal_history (id, proposal_id, actor_id, from_stage, to_stage, action, comment, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.proposal_id)
        .bind(entry.actor.user_id())
        .bind(entry.from_stage)
        .bind(entry.to_stage)
        .bind(entry.action.as_str())
        .bind(&entry.comment)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn history(&self, proposal_id: DbId) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, proposal_id, actor_id, from_stage, to_stage, action, comment, created_at
            FROM proposal_history
            WHERE proposal_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(proposal_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

/// Fails with `NotFound` (rolling back with the dropped transaction) when
/// the row does not exist
async fn write_proposal(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    proposal: &Proposal,
) -> Result<()> {
    let related = serde_json::to_string(&proposal.related_division_ids)
        .map_err(|e| AppError::Internal(format!("Invalid related divisions: {}", e)))?;

    let result = sqlx::query(
        r#"
        UPDATE proposals
        SET title = ?, validated_cost = ?, workflow_id = ?, current_stage = ?, max_stage = ?,
            current_status = ?, is_rejected = ?, rejected_reason = ?, is_deleted = ?,
            related_division_ids = ?, submitted_date = ?, updated_date = ?, completed_date = ?
        WHERE id = ?
        "#,
    )
    .bind(&proposal.title)
    .bind(proposal.validated_cost)
    .bind(proposal.workflow_id)
    .bind(proposal.current_stage)
    .bind(proposal.max_stage)
    .bind(proposal.status.label())
    .bind(proposal.is_rejected)
    .bind(&proposal.rejected_reason)
    .bind(proposal.is_deleted)
    .bind(&related)
    .bind(proposal.submitted_date)
    .bind(proposal.updated_date)
    .bind(proposal.completed_date)
    .bind(proposal.id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Proposal {} not found", proposal.id)));
    }
    Ok(())
}

// Database row types

/// Convert listing rows one at a time; a row that fails is logged and
/// reported by id.
fn decode_listing<R, T>(rows: Vec<R>, kind: &str, id_of: impl Fn(&R) -> DbId) -> Candidates<T>
where
    T: TryFrom<R, Error = AppError>,
{
    let mut listed = Candidates::default();
    for row in rows {
        let id = id_of(&row);
        match T::try_from(row) {
            Ok(item) => listed.items.push(item),
            Err(e) => {
                tracing::warn!(id, kind, error = %e, "Skipping unreadable row");
                listed.unreadable.push(id);
            }
        }
    }
    listed
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: DbId,
    name: String,
    is_active: bool,
    priority: i32,
}

#[derive(sqlx::FromRow)]
struct ConditionRow {
    workflow_id: DbId,
    condition_type: String,
    operator: String,
    value: String,
    is_active: bool,
}

impl From<ConditionRow> for Condition {
    fn from(row: ConditionRow) -> Self {
        let mut condition = Condition::from_raw(&row.condition_type, &row.operator, row.value);
        condition.is_active = row.is_active;
        condition
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    workflow_id: DbId,
    stage_number: i32,
    approver_group_id: DbId,
    is_mandatory: bool,
    is_parallel: bool,
    location_scope: String,
    hold_after: Option<String>,
}

impl TryFrom<StageRow> for Stage {
    type Error = AppError;

    fn try_from(row: StageRow) -> Result<Self> {
        Ok(Stage {
            workflow_id: row.workflow_id,
            stage_number: row.stage_number,
            approver_group_id: row.approver_group_id,
            is_mandatory: row.is_mandatory,
            is_parallel: row.is_parallel,
            location_scope: row.location_scope.parse().map_err(AppError::Internal)?,
            hold_after: row
                .hold_after
                .map(|h| h.parse())
                .transpose()
                .map_err(AppError::Internal)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: DbId,
    name: String,
    email: Option<String>,
    role_id: DbId,
    is_acting: bool,
    current_role_id: Option<DbId>,
    acting_start_date: Option<DateTime<Utc>>,
    acting_end_date: Option<DateTime<Utc>>,
    acting_division_id: Option<String>,
    acting_department_id: Option<String>,
    division_id: Option<String>,
    department_id: Option<String>,
    employee_active: Option<bool>,
}

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self> {
        let assignment = if row.is_acting {
            let (home_role_id, start, end) =
                match (row.current_role_id, row.acting_start_date, row.acting_end_date) {
                    (Some(home), Some(start), Some(end)) => (home, start, end),
                    _ => {
                        return Err(AppError::Internal(format!(
                            "User {} is flagged acting without a home role or window",
                            row.id
                        )))
                    }
                };
            let window = ActingWindow::new(start, end)
                .map_err(|e| AppError::Internal(format!("User {}: {}", row.id, e)))?;
            RoleAssignment::Acting(Acting {
                home_role_id,
                acting_role_id: row.role_id,
                window,
                division_id: row.acting_division_id,
                department_id: row.acting_department_id,
            })
        } else {
            RoleAssignment::Home {
                role_id: row.role_id,
            }
        };

        let employee = match (row.division_id, row.department_id) {
            (Some(division_id), Some(department_id)) => Some(Employee {
                division_id,
                department_id,
                is_active: row.employee_active.unwrap_or(false),
            }),
            _ => None,
        };

        Ok(User {
            id: row.id,
            name: row.name,
            email: row.email,
            assignment,
            employee,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProposalRow {
    id: DbId,
    code: Option<String>,
    title: String,
    initiator_id: DbId,
    division_id: String,
    department_id: String,
    category_id: String,
    event_id: Option<String>,
    submitted_cost: i64,
    validated_cost: Option<i64>,
    workflow_id: Option<DbId>,
    current_stage: i32,
    max_stage: i32,
    current_status: String,
    is_rejected: bool,
    rejected_reason: Option<String>,
    is_deleted: bool,
    related_division_ids: String,
    created_at: DateTime<Utc>,
    submitted_date: Option<DateTime<Utc>>,
    updated_date: Option<DateTime<Utc>>,
    completed_date: Option<DateTime<Utc>>,
}

impl TryFrom<ProposalRow> for Proposal {
    type Error = AppError;

    fn try_from(row: ProposalRow) -> Result<Self> {
        Ok(Proposal {
            id: row.id,
            code: row.code,
            title: row.title,
            initiator_id: row.initiator_id,
            division_id: row.division_id,
            department_id: row.department_id,
            category_id: row.category_id,
            event_id: row.event_id,
            submitted_cost: row.submitted_cost,
            validated_cost: row.validated_cost,
            workflow_id: row.workflow_id,
            current_stage: row.current_stage,
            max_stage: row.max_stage,
            status: row.current_status.parse().map_err(AppError::Internal)?,
            is_rejected: row.is_rejected,
            rejected_reason: row.rejected_reason,
            is_deleted: row.is_deleted,
            related_division_ids: serde_json::from_str(&row.related_division_ids).map_err(
                |e| AppError::Internal(format!("Invalid related divisions: {}", e)),
            )?,
            created_at: row.created_at,
            submitted_date: row.submitted_date,
            updated_date: row.updated_date,
            completed_date: row.completed_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: String,
    proposal_id: DbId,
    actor_id: Option<DbId>,
    from_stage: i32,
    to_stage: Option<i32>,
    action: String,
    comment: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = AppError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(HistoryEntry {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?,
            proposal_id: row.proposal_id,
            actor: row.actor_id.map(Actor::User).unwrap_or(Actor::System),
            from_stage: row.from_stage,
            to_stage: row.to_stage,
            action: row.action.parse().map_err(AppError::Internal)?,
            comment: row.comment,
            created_at: row.created_at,
        })
    }
}
