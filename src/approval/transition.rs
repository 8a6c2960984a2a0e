//! Transition rules for a proposal's position in its approval chain
//!
//! Every method checks all of its preconditions before touching the
//! proposal, so a failed call leaves it exactly as it was. Successful
//! stage-affecting calls return the history entry the caller must persist
//! together with the mutated proposal.

use chrono::{DateTime, Duration, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    Actor, HistoryAction, HistoryEntry, Proposal, ProposalStatus, StageHold,
};
use crate::workflow::WorkflowDefinition;

impl Proposal {
    fn ensure_not_deleted(&self) -> Result<()> {
        if self.is_deleted {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} has been deleted",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_not_terminal(&self) -> Result<()> {
        if self.is_rejected {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} is already rejected",
                self.id
            )));
        }
        if self.status.is_terminal() {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} is already {}",
                self.id,
                self.status.label().to_lowercase()
            )));
        }
        Ok(())
    }

    /// The stage a human decision would act on right now
    pub fn ensure_decidable(&self) -> Result<i32> {
        self.ensure_not_deleted()?;
        self.ensure_not_terminal()?;
        match self.status {
            ProposalStatus::WaitingApproval(stage) if self.current_stage < self.max_stage => {
                Ok(stage)
            }
            ProposalStatus::WaitingApproval(_) => Err(AppError::InvariantViolation(format!(
                "proposal {} is already at its last stage",
                self.id
            ))),
            ProposalStatus::OnHold(hold) => Err(AppError::InvariantViolation(format!(
                "proposal {} is {}",
                self.id,
                hold.label().to_lowercase()
            ))),
            ProposalStatus::Draft => Err(AppError::InvariantViolation(format!(
                "proposal {} has not been submitted",
                self.id
            ))),
            ProposalStatus::Completed | ProposalStatus::Rejected | ProposalStatus::Inactive => {
                Err(AppError::InvariantViolation(format!(
                    "proposal {} is closed",
                    self.id
                )))
            }
        }
    }

    /// Enter the chain selected for this proposal
    pub fn submit(
        &mut self,
        actor: Actor,
        workflow: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Result<HistoryEntry> {
        self.ensure_not_deleted()?;
        if self.status != ProposalStatus::Draft {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} was already submitted",
                self.id
            )));
        }
        if workflow.max_stage() < 1 {
            return Err(AppError::Validation(format!(
                "workflow {} has no stages",
                workflow.id
            )));
        }

        self.workflow_id = Some(workflow.id);
        self.max_stage = workflow.max_stage();
        self.current_stage = 0;
        self.status = ProposalStatus::WaitingApproval(1);
        self.submitted_date = Some(now);
        self.updated_date = Some(now);

        Ok(HistoryEntry::new(
            self.id,
            actor,
            HistoryAction::Submitted,
            0,
            Some(0),
            None,
            now,
        ))
    }

    /// Approve the pending stage. `hold_after` is the hold configured on
    /// that stage, if any.
    pub fn approve(
        &mut self,
        actor: Actor,
        hold_after: Option<StageHold>,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<HistoryEntry> {
        self.ensure_decidable()?;

        let from = self.current_stage;
        let to = from + 1;
        self.current_stage = to;
        self.updated_date = Some(now);
        if to >= self.max_stage {
            self.status = ProposalStatus::Completed;
            self.completed_date = Some(now);
        } else if let Some(hold) = hold_after {
            self.status = ProposalStatus::OnHold(hold);
        } else {
            self.status = ProposalStatus::WaitingApproval(to + 1);
        }

        Ok(HistoryEntry::new(
            self.id,
            actor,
            HistoryAction::Approved,
            from,
            Some(to),
            comment.filter(|c| !c.trim().is_empty()),
            now,
        ))
    }

    /// A blank reason is stored as `None`
    pub fn reject(
        &mut self,
        actor: Actor,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<HistoryEntry> {
        self.ensure_decidable()?;
        let reason = Some(reason.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        self.is_rejected = true;
        self.status = ProposalStatus::Rejected;
        self.rejected_reason = reason.clone();
        self.completed_date = Some(now);
        self.updated_date = Some(now);

        Ok(HistoryEntry::new(
            self.id,
            actor,
            HistoryAction::Rejected,
            self.current_stage,
            None,
            reason,
            now,
        ))
    }

    /// Reviewer commentary. Leaves stage and status alone.
    pub fn record_feedback(
        &self,
        actor: Actor,
        comment: &str,
        now: DateTime<Utc>,
    ) -> Result<HistoryEntry> {
        self.ensure_not_deleted()?;
        let comment = required_text(comment, "feedback comment")?;

        Ok(HistoryEntry::new(
            self.id,
            actor,
            HistoryAction::Feedback,
            self.current_stage,
            Some(self.current_stage),
            Some(comment),
            now,
        ))
    }

    /// Administrative jump to any stage in `[0, max_stage]`
    pub fn bypass(
        &mut self,
        actor: Actor,
        target: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<HistoryEntry> {
        self.ensure_not_deleted()?;
        self.ensure_not_terminal()?;
        if self.status == ProposalStatus::Draft {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} has not been submitted",
                self.id
            )));
        }
        let reason = required_text(reason, "bypass reason")?;
        if target < 0 || target > self.max_stage {
            return Err(AppError::Validation(format!(
                "target stage {} is outside 0..={}",
                target, self.max_stage
            )));
        }
        if target == self.current_stage {
            return Err(AppError::Validation(format!(
                "proposal {} is already at stage {}",
                self.id, target
            )));
        }

        let from = self.current_stage;
        self.current_stage = target;
        self.updated_date = Some(now);
        let to = if target >= self.max_stage {
            self.status = ProposalStatus::Completed;
            self.completed_date = Some(now);
            None
        } else {
            self.status = ProposalStatus::WaitingApproval(target + 1);
            self.completed_date = None;
            Some(target)
        };

        Ok(HistoryEntry::new(
            self.id,
            actor,
            HistoryAction::Bypassed,
            from,
            to,
            Some(reason),
            now,
        ))
    }

    /// Collaborator reports the hold is done; routing continues with the next stage
    pub fn release_hold(&mut self, hold: StageHold, now: DateTime<Utc>) -> Result<()> {
        self.ensure_not_deleted()?;
        if self.status != ProposalStatus::OnHold(hold) {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} is not {} (status: {})",
                self.id,
                hold.label().to_lowercase(),
                self.status
            )));
        }
        self.status = ProposalStatus::WaitingApproval(self.current_stage + 1);
        self.updated_date = Some(now);
        Ok(())
    }

    /// Start of the current idle period
    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        if self.current_stage == 0 {
            self.submitted_date
        } else {
            self.updated_date.or(self.submitted_date)
        }
    }

    /// Open proposal that has not moved for longer than `threshold`
    pub fn is_idle(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.is_deleted || self.is_rejected || !self.status.is_waiting() {
            return false;
        }
        self.idle_since()
            .is_some_and(|since| now.signed_duration_since(since) > threshold)
    }

    /// Force an idle proposal into the `Inactive` terminal state
    pub fn auto_reject(&mut self, now: DateTime<Utc>, threshold: Duration) -> Result<HistoryEntry> {
        self.ensure_not_deleted()?;
        self.ensure_not_terminal()?;
        if !self.is_idle(now, threshold) {
            return Err(AppError::InvariantViolation(format!(
                "proposal {} is not idle",
                self.id
            )));
        }

        let reason = format!(
            "Automatically rejected after {} days without activity",
            threshold.num_days()
        );
        self.is_rejected = true;
        self.status = ProposalStatus::Inactive;
        self.rejected_reason = Some(reason.clone());
        self.completed_date = Some(now);
        self.updated_date = Some(now);

        Ok(HistoryEntry::new(
            self.id,
            Actor::System,
            HistoryAction::AutoRejected,
            self.current_stage,
            None,
            Some(reason),
            now,
        ))
    }
}

fn required_text(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{} is required", what)));
    }
    Ok(trimmed.to_string())
}
