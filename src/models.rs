//! Data models for proposals and their approval history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Primary key of proposals, users, roles, groups and workflow definitions.
pub type DbId = i64;

/// Master-data codes (divisions, departments, categories, events) are opaque strings.
pub type LocationId = String;

/// A point in a business stage where routing pauses until an outside
/// collaborator reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageHold {
    TeamAssignment,
    MilestoneCreation,
}

impl StageHold {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageHold::TeamAssignment => "team_assignment",
            StageHold::MilestoneCreation => "milestone_creation",
        }
    }

    /// Human-readable status label
    pub fn label(&self) -> &'static str {
        match self {
            StageHold::TeamAssignment => "Waiting Team Assignment",
            StageHold::MilestoneCreation => "Waiting Milestone Creation",
        }
    }
}

impl std::str::FromStr for StageHold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "team_assignment" => Ok(StageHold::TeamAssignment),
            "milestone_creation" => Ok(StageHold::MilestoneCreation),
            _ => Err(format!("Invalid stage hold: {}", s)),
        }
    }
}

/// Where a proposal sits in its approval chain.
///
/// `WaitingApproval(n)` means stage `n` is the next one to act, so it always
/// pairs with `current_stage == n - 1`. `OnHold` keeps `current_stage` at the
/// stage that was just approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    WaitingApproval(i32),
    OnHold(StageHold),
    Completed,
    Rejected,
    /// Auto-rejected by the idle sweep
    Inactive,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Completed | ProposalStatus::Rejected | ProposalStatus::Inactive
        )
    }

    /// The "Waiting ..." family the idle sweep looks at
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ProposalStatus::WaitingApproval(_) | ProposalStatus::OnHold(_)
        )
    }

    pub fn label(&self) -> String {
        match self {
            ProposalStatus::Draft => "Draft".to_string(),
            ProposalStatus::WaitingApproval(stage) => format!("Waiting Approval S{}", stage),
            ProposalStatus::OnHold(hold) => hold.label().to_string(),
            ProposalStatus::Completed => "Completed".to_string(),
            ProposalStatus::Rejected => "Rejected".to_string(),
            ProposalStatus::Inactive => "Inactive".to_string(),
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Draft" => Ok(ProposalStatus::Draft),
            "Completed" => Ok(ProposalStatus::Completed),
            "Rejected" => Ok(ProposalStatus::Rejected),
            "Inactive" => Ok(ProposalStatus::Inactive),
            "Waiting Team Assignment" => Ok(ProposalStatus::OnHold(StageHold::TeamAssignment)),
            "Waiting Milestone Creation" => {
                Ok(ProposalStatus::OnHold(StageHold::MilestoneCreation))
            }
            other => other
                .strip_prefix("Waiting Approval S")
                .and_then(|n| n.parse::<i32>().ok())
                .filter(|n| *n >= 1)
                .map(ProposalStatus::WaitingApproval)
                .ok_or_else(|| format!("Invalid proposal status: {}", s)),
        }
    }
}

/// A submitted idea routed through an approval chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: DbId,
    /// Display id, assigned once after creation and never changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub title: String,
    pub initiator_id: DbId,
    pub division_id: LocationId,
    pub department_id: LocationId,
    pub category_id: LocationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<LocationId>,
    pub submitted_cost: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated_cost: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<DbId>,
    pub current_stage: i32,
    pub max_stage: i32,
    pub status: ProposalStatus,
    pub is_rejected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<String>,
    pub is_deleted: bool,
    /// Informational fan-out list, not part of routing
    #[serde(default)]
    pub related_division_ids: Vec<LocationId>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<DateTime<Utc>>,
}

impl Proposal {
    /// Cost used for routing: the validated figure once there is one
    pub fn effective_cost(&self) -> i64 {
        self.validated_cost.unwrap_or(self.submitted_cost)
    }

    pub fn attributes(&self) -> ProposalAttributes {
        ProposalAttributes {
            cost: self.effective_cost(),
            category_id: non_empty(&self.category_id),
            division_id: non_empty(&self.division_id),
            department_id: non_empty(&self.department_id),
            event_id: self.event_id.as_deref().and_then(non_empty),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ProposalStatus::Completed
    }

    /// The stage whose approvers act next, if the chain is still open
    pub fn pending_stage(&self) -> Option<i32> {
        match self.status {
            ProposalStatus::WaitingApproval(stage) => Some(stage),
            _ => None,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// The proposal fields workflow conditions can look at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalAttributes {
    pub cost: i64,
    pub category_id: Option<String>,
    pub division_id: Option<String>,
    pub department_id: Option<String>,
    pub event_id: Option<String>,
}

/// Request to create a new proposal
#[derive(Debug, Clone, Deserialize)]
pub struct NewProposal {
    pub title: String,
    /// Filled from the authenticated actor on the HTTP surface
    #[serde(default)]
    pub initiator_id: DbId,
    pub division_id: LocationId,
    pub department_id: LocationId,
    pub category_id: LocationId,
    #[serde(default)]
    pub event_id: Option<LocationId>,
    pub submitted_cost: i64,
    #[serde(default)]
    pub related_division_ids: Vec<LocationId>,
}

/// Who performed a history-producing action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Actor {
    User(DbId),
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<DbId> {
        match self {
            Actor::User(id) => Some(*id),
            Actor::System => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::System => f.write_str("system"),
        }
    }
}

/// Action recorded in a proposal's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    Submitted,
    Approved,
    Rejected,
    Bypassed,
    Feedback,
    #[serde(rename = "Auto-Rejected")]
    AutoRejected,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Submitted => "Submitted",
            HistoryAction::Approved => "Approved",
            HistoryAction::Rejected => "Rejected",
            HistoryAction::Bypassed => "Bypassed",
            HistoryAction::Feedback => "Feedback",
            HistoryAction::AutoRejected => "Auto-Rejected",
        }
    }
}

impl std::str::FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Submitted" => Ok(HistoryAction::Submitted),
            "Approved" => Ok(HistoryAction::Approved),
            "Rejected" => Ok(HistoryAction::Rejected),
            "Bypassed" => Ok(HistoryAction::Bypassed),
            "Feedback" => Ok(HistoryAction::Feedback),
            "Auto-Rejected" => Ok(HistoryAction::AutoRejected),
            _ => Err(format!("Invalid history action: {}", s)),
        }
    }
}

/// Append-only record of one change to a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub proposal_id: DbId,
    pub actor: Actor,
    pub from_stage: i32,
    pub to_stage: Option<i32>,
    pub action: HistoryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        proposal_id: DbId,
        actor: Actor,
        action: HistoryAction,
        from_stage: i32,
        to_stage: Option<i32>,
        comment: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            actor,
            from_stage,
            to_stage,
            action,
            comment,
            created_at,
        }
    }
}
