//! Persistence contract for the approval engine
//!
//! The engine only needs equality/range filters and foreign-key loads, so any
//! storage engine can sit behind [`Store`]. Two implementations ship with the
//! crate: [`MemoryStore`] for tests and embedding, [`SqliteStore`] for the
//! server.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

use crate::delegation::User;
use crate::error::Result;
use crate::models::{DbId, HistoryEntry, NewProposal, Proposal};
use crate::workflow::{Stage, WorkflowDefinition};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    // Workflow definitions

    /// Active definitions with their conditions and stages loaded
    async fn active_workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    async fn get_workflow(&self, id: DbId) -> Result<Option<WorkflowDefinition>>;

    async fn get_stage(&self, workflow_id: DbId, stage_number: i32) -> Result<Option<Stage>>;

    async fn group_role_ids(&self, group_id: DbId) -> Result<Vec<DbId>>;

    // Users

    async fn get_user(&self, id: DbId) -> Result<Option<User>>;

    /// Users whose home or acting role is `role_id`. Callers filter by
    /// effective role themselves.
    async fn users_for_role(&self, role_id: DbId) -> Result<Vec<User>>;

    async fn save_user(&self, user: &User) -> Result<()>;

    /// Users still flagged as acting whose window ended at or before `now`
    async fn expired_delegations(&self, now: DateTime<Utc>) -> Result<Candidates<User>>;

    // Proposals

    /// Insert a draft and assign its display code
    async fn insert_proposal(&self, new: &NewProposal, now: DateTime<Utc>) -> Result<Proposal>;

    async fn get_proposal(&self, id: DbId) -> Result<Option<Proposal>>;

    /// Non-deleted, non-rejected proposals in the "Waiting ..." family
    async fn waiting_proposals(&self) -> Result<Candidates<Proposal>>;

    /// Persist a change that does not move the stage counter
    async fn update_proposal(&self, proposal: &Proposal) -> Result<()>;

    /// Persist the proposal and append its history entry as one unit
    async fn apply_transition(&self, proposal: &Proposal, entry: &HistoryEntry) -> Result<()>;

    /// History for a proposal, oldest first
    async fn history(&self, proposal_id: DbId) -> Result<Vec<HistoryEntry>>;
}

/// Result of a sweep listing. Rows that could not be decoded are reported by
/// id instead of failing the whole listing.
#[derive(Debug, Clone)]
pub struct Candidates<T> {
    pub items: Vec<T>,
    pub unreadable: Vec<DbId>,
}

impl<T> Candidates<T> {
    /// Decoded items plus unreadable rows
    pub fn len(&self) -> usize {
        self.items.len() + self.unreadable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Candidates<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            unreadable: Vec::new(),
        }
    }
}

impl<T> From<Vec<T>> for Candidates<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items,
            unreadable: Vec::new(),
        }
    }
}

/// Display code assigned after the row id is known
pub fn proposal_code(id: DbId, created_at: DateTime<Utc>) -> String {
    format!("IDEA-{}-{:05}", created_at.year(), id)
}
