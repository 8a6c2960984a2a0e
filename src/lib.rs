//! Ideaflow - dynamic workflow selection and multi-stage approval for
//! submitted proposals

pub mod api;
pub mod approval;
pub mod clock;
pub mod config;
pub mod delegation;
pub mod error;
pub mod models;
pub mod notify;
pub mod schedule;
pub mod store;
pub mod workflow;

use std::sync::Arc;

use crate::approval::ApprovalEngine;

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<ApprovalEngine>,
}

impl AppState {
    pub fn new(engine: Arc<ApprovalEngine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }
}
