//! Workflow definitions, stages and approver groups

use serde::{Deserialize, Serialize};

use super::condition::Condition;
use crate::error::{AppError, Result};
use crate::models::{DbId, StageHold};

/// Which of a proposal's target location ids restrict a stage's approvers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationScope {
    Global,
    #[default]
    Division,
    Department,
    DivisionAndDepartment,
}

impl LocationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationScope::Global => "global",
            LocationScope::Division => "division",
            LocationScope::Department => "department",
            LocationScope::DivisionAndDepartment => "division_and_department",
        }
    }

    pub fn uses_division(&self) -> bool {
        matches!(
            self,
            LocationScope::Division | LocationScope::DivisionAndDepartment
        )
    }

    pub fn uses_department(&self) -> bool {
        matches!(
            self,
            LocationScope::Department | LocationScope::DivisionAndDepartment
        )
    }
}

impl std::str::FromStr for LocationScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "global" => Ok(LocationScope::Global),
            "division" => Ok(LocationScope::Division),
            "department" => Ok(LocationScope::Department),
            "division_and_department" => Ok(LocationScope::DivisionAndDepartment),
            _ => Err(format!("Invalid location scope: {}", s)),
        }
    }
}

/// One position in a workflow chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub workflow_id: DbId,
    /// 1-based, contiguous within a workflow
    pub stage_number: i32,
    pub approver_group_id: DbId,
    pub is_mandatory: bool,
    /// Stored but not evaluated by the transition rules
    pub is_parallel: bool,
    #[serde(default)]
    pub location_scope: LocationScope,
    /// Pause routing after this stage is approved until a collaborator releases it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_after: Option<StageHold>,
}

impl Stage {
    pub fn new(workflow_id: DbId, stage_number: i32, approver_group_id: DbId) -> Self {
        Self {
            workflow_id,
            stage_number,
            approver_group_id,
            is_mandatory: true,
            is_parallel: false,
            location_scope: LocationScope::default(),
            hold_after: None,
        }
    }

    pub fn with_scope(mut self, scope: LocationScope) -> Self {
        self.location_scope = scope;
        self
    }

    pub fn with_hold(mut self, hold: StageHold) -> Self {
        self.hold_after = Some(hold);
        self
    }
}

/// A named bundle of roles eligible to approve a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverGroup {
    pub id: DbId,
    pub name: String,
    pub role_ids: Vec<DbId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DbId,
    pub name: String,
    pub is_active: bool,
    /// Higher is evaluated first
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub stages: Vec<Stage>,
}

impl WorkflowDefinition {
    pub fn new(id: DbId, name: impl Into<String>, priority: i32) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: true,
            priority,
            conditions: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Append a stage bound to `approver_group_id`, numbered after the last one
    pub fn with_stage(mut self, approver_group_id: DbId) -> Self {
        let number = self.stages.len() as i32 + 1;
        self.stages.push(Stage::new(self.id, number, approver_group_id));
        self
    }

    pub fn with_stage_def(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn active_conditions(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter().filter(|c| c.is_active)
    }

    /// No active conditions: the fallback for its priority tier
    pub fn is_default(&self) -> bool {
        self.active_conditions().next().is_none()
    }

    pub fn max_stage(&self) -> i32 {
        self.stages.len() as i32
    }

    pub fn stage(&self, stage_number: i32) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_number == stage_number)
    }

    /// Stage numbers must be exactly 1..=N
    pub fn validate(&self) -> Result<()> {
        let mut numbers: Vec<i32> = self.stages.iter().map(|s| s.stage_number).collect();
        numbers.sort_unstable();
        for (expected, actual) in (1..).zip(numbers.iter()) {
            if *actual != expected {
                return Err(AppError::Validation(format!(
                    "workflow {} stages must be numbered 1..={} without gaps or duplicates",
                    self.id,
                    numbers.len()
                )));
            }
        }
        if self.stages.iter().any(|s| s.workflow_id != self.id) {
            return Err(AppError::Validation(format!(
                "workflow {} contains a stage owned by another workflow",
                self.id
            )));
        }
        Ok(())
    }
}
