//! Users and the acting (delegation) overlay
//!
//! A user normally approves under their home role and home location. An
//! administrator can install a time-bounded acting assignment that swaps in
//! another role and, optionally, another division and/or department. All
//! authorization and approver resolution reads role and location through the
//! `effective_*` methods here, evaluated at an explicit instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{DbId, LocationId};

/// Half-open validity window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ActingWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(AppError::Validation(format!(
                "acting window must start before it ends ({} >= {})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

/// A live acting assignment. The home role is kept alongside so that clearing
/// the assignment restores it exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acting {
    pub home_role_id: DbId,
    pub acting_role_id: DbId,
    pub window: ActingWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub division_id: Option<LocationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_id: Option<LocationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleAssignment {
    Home { role_id: DbId },
    Acting(Acting),
}

/// Home employment record of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub division_id: LocationId,
    pub department_id: LocationId,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: DbId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub assignment: RoleAssignment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee: Option<Employee>,
}

/// Administrative request to put a user into an acting assignment
#[derive(Debug, Clone, Deserialize)]
pub struct ActingRequest {
    pub acting_role_id: DbId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub division_id: Option<LocationId>,
    #[serde(default)]
    pub department_id: Option<LocationId>,
}

impl User {
    pub fn new(id: DbId, name: impl Into<String>, role_id: DbId, employee: Option<Employee>) -> Self {
        Self {
            id,
            name: name.into(),
            email: None,
            assignment: RoleAssignment::Home { role_id },
            employee,
        }
    }

    pub fn home_role_id(&self) -> DbId {
        match &self.assignment {
            RoleAssignment::Home { role_id } => *role_id,
            RoleAssignment::Acting(acting) => acting.home_role_id,
        }
    }

    pub fn acting(&self) -> Option<&Acting> {
        match &self.assignment {
            RoleAssignment::Acting(acting) => Some(acting),
            RoleAssignment::Home { .. } => None,
        }
    }

    pub fn is_employed(&self) -> bool {
        self.employee.as_ref().is_some_and(|e| e.is_active)
    }

    pub fn is_currently_acting(&self, now: DateTime<Utc>) -> bool {
        self.live_acting(now).is_some()
    }

    fn live_acting(&self, now: DateTime<Utc>) -> Option<&Acting> {
        self.acting().filter(|a| a.window.contains(now))
    }

    /// Acting role inside the window, home role everywhere else
    pub fn effective_role(&self, now: DateTime<Utc>) -> DbId {
        match self.live_acting(now) {
            Some(acting) => acting.acting_role_id,
            None => self.home_role_id(),
        }
    }

    /// Per-field fallback: an acting override only replaces the axis it names.
    pub fn effective_division(&self, now: DateTime<Utc>) -> Option<&str> {
        self.live_acting(now)
            .and_then(|a| a.division_id.as_deref())
            .or_else(|| self.employee.as_ref().map(|e| e.division_id.as_str()))
    }

    pub fn effective_department(&self, now: DateTime<Utc>) -> Option<&str> {
        self.live_acting(now)
            .and_then(|a| a.department_id.as_deref())
            .or_else(|| self.employee.as_ref().map(|e| e.department_id.as_str()))
    }

    /// Calendar days until the acting window closes. Negative once it has.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.acting()
            .map(|a| (a.window.end.date_naive() - now.date_naive()).num_days())
    }

    /// True only while `0 < days_remaining <= within_days`
    pub fn is_expiring_soon(&self, now: DateTime<Utc>, within_days: i64) -> bool {
        matches!(self.days_remaining(now), Some(d) if d > 0 && d <= within_days)
    }

    /// Acting assignment whose window has closed but which has not been cleared yet
    pub fn delegation_expired(&self, now: DateTime<Utc>) -> bool {
        self.acting().is_some_and(|a| a.window.end <= now)
    }

    /// Install an acting assignment, stashing the home role. An assignment
    /// whose window closed before `now` is replaced; a live or future one is not.
    pub fn start_acting(&mut self, request: ActingRequest, now: DateTime<Utc>) -> Result<()> {
        let home_role_id = match &self.assignment {
            RoleAssignment::Home { role_id } => *role_id,
            RoleAssignment::Acting(acting) if acting.window.end <= now => acting.home_role_id,
            RoleAssignment::Acting(_) => {
                return Err(AppError::InvariantViolation(format!(
                    "user {} already has an acting assignment",
                    self.id
                )))
            }
        };
        let window = ActingWindow::new(request.start, request.end)?;

        self.assignment = RoleAssignment::Acting(Acting {
            home_role_id,
            acting_role_id: request.acting_role_id,
            window,
            division_id: request.division_id.filter(|d| !d.trim().is_empty()),
            department_id: request.department_id.filter(|d| !d.trim().is_empty()),
        });
        Ok(())
    }

    /// Clear the acting assignment and restore the home role
    pub fn stop_acting(&mut self) -> Result<Acting> {
        let role_id = self.home_role_id();
        match std::mem::replace(&mut self.assignment, RoleAssignment::Home { role_id }) {
            RoleAssignment::Acting(acting) => Ok(acting),
            home @ RoleAssignment::Home { .. } => {
                self.assignment = home;
                Err(AppError::InvariantViolation(format!(
                    "user {} has no acting assignment",
                    self.id
                )))
            }
        }
    }
}
