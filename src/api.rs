//! HTTP surface over the approval engine
//!
//! Identity is established upstream; the authenticated user id arrives in the
//! `x-actor-id` header.

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::delegation::{ActingRequest, User};
use crate::error::{AppError, Result};
use crate::models::{DbId, HistoryEntry, NewProposal, Proposal, ProposalAttributes, StageHold};
use crate::workflow::WorkflowDefinition;
use crate::AppState;

pub const ACTOR_HEADER: &str = "x-actor-id";

/// The authenticated user performing a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorId(pub DbId);

#[async_trait]
impl<S> FromRequestParts<S> for ActorId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let value = parts
            .headers
            .get(ACTOR_HEADER)
            .ok_or_else(|| AppError::Validation(format!("missing {} header", ACTOR_HEADER)))?;
        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<DbId>().ok())
            .map(ActorId)
            .ok_or_else(|| AppError::Validation(format!("invalid {} header", ACTOR_HEADER)))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub comment: String,
}

#[derive(Debug, Deserialize)]
pub struct BypassBody {
    pub target_stage: i32,
    pub reason: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/proposals", post(create_proposal))
        .route("/proposals/:id", get(get_proposal))
        .route("/proposals/:id/history", get(history))
        .route("/proposals/:id/approvers", get(approvers))
        .route("/proposals/:id/submit", post(submit))
        .route("/proposals/:id/approve", post(approve))
        .route("/proposals/:id/reject", post(reject))
        .route("/proposals/:id/feedback", post(feedback))
        .route("/proposals/:id/bypass", post(bypass))
        .route("/proposals/:id/holds/:hold/release", post(release_hold))
        .route("/workflows/select", post(select_workflow))
        .route(
            "/users/:id/delegation",
            post(start_delegation).delete(stop_delegation),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn create_proposal(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Json(mut body): Json<NewProposal>,
) -> Result<(StatusCode, Json<Proposal>)> {
    // The initiator is whoever is signed in
    body.initiator_id = actor;
    let proposal = state.engine.create_proposal(body).await?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

async fn get_proposal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DbId>,
) -> Result<Json<Proposal>> {
    Ok(Json(state.engine.get_proposal(id).await?))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DbId>,
) -> Result<Json<Vec<HistoryEntry>>> {
    Ok(Json(state.engine.history(id).await?))
}

async fn approvers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DbId>,
) -> Result<Json<Vec<User>>> {
    let mut users = state.engine.approvers_for(id).await?;
    users.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    Ok(Json(users))
}

async fn submit(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<DbId>,
) -> Result<Json<Proposal>> {
    Ok(Json(state.engine.submit(id, actor).await?))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<DbId>,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<Proposal>> {
    let comment = body.and_then(|Json(b)| b.comment);
    Ok(Json(state.engine.approve(id, actor, comment).await?))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<DbId>,
    Json(body): Json<RejectBody>,
) -> Result<Json<Proposal>> {
    Ok(Json(state.engine.reject(id, actor, &body.reason).await?))
}

async fn feedback(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<DbId>,
    Json(body): Json<FeedbackBody>,
) -> Result<(StatusCode, Json<HistoryEntry>)> {
    let entry = state.engine.feedback(id, actor, &body.comment).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn bypass(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<DbId>,
    Json(body): Json<BypassBody>,
) -> Result<Json<Proposal>> {
    let proposal = state
        .engine
        .bypass(id, actor, body.target_stage, &body.reason)
        .await?;
    Ok(Json(proposal))
}

async fn release_hold(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path((id, hold)): Path<(DbId, String)>,
) -> Result<Json<Proposal>> {
    let hold: StageHold = hold.parse().map_err(AppError::Validation)?;
    tracing::debug!(proposal_id = id, actor, hold = hold.as_str(), "Hold release requested");
    Ok(Json(state.engine.release_hold(id, hold).await?))
}

async fn select_workflow(
    State(state): State<Arc<AppState>>,
    Json(attrs): Json<ProposalAttributes>,
) -> Result<Json<WorkflowDefinition>> {
    Ok(Json(state.engine.select_workflow(&attrs).await?))
}

async fn start_delegation(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(user_id): Path<DbId>,
    Json(request): Json<ActingRequest>,
) -> Result<Json<User>> {
    tracing::debug!(user_id, actor, "Acting assignment requested");
    Ok(Json(state.engine.start_delegation(user_id, request).await?))
}

async fn stop_delegation(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(user_id): Path<DbId>,
) -> Result<Json<User>> {
    tracing::debug!(user_id, actor, "Acting assignment clear requested");
    Ok(Json(state.engine.stop_delegation(user_id).await?))
}
