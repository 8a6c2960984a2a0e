//! Outbound notifications
//!
//! Transitions hand a [`Notification`] to the [`Dispatcher`], which sends it
//! on its own task. Delivery failures are logged and dropped: they never
//! reach the caller of the transition and are never retried.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::delegation::User;
use crate::error::{AppError, Result};
use crate::models::{Actor, DbId, Proposal};

/// HTTP request timeout for a single webhook delivery
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_submitted(&self, proposal: &Proposal, approvers: &[User]) -> Result<()>;

    async fn notify_approved(&self, proposal: &Proposal, actor: Actor) -> Result<()>;

    async fn notify_rejected(&self, proposal: &Proposal, actor: Actor, reason: &str) -> Result<()>;

    async fn notify_feedback(
        &self,
        proposal: &Proposal,
        actor: Actor,
        comment: &str,
        recipients: &[User],
    ) -> Result<()>;
}

/// An owned snapshot of everything one notification needs
#[derive(Debug, Clone)]
pub enum Notification {
    Submitted {
        proposal: Proposal,
        approvers: Vec<User>,
    },
    Approved {
        proposal: Proposal,
        actor: Actor,
    },
    Rejected {
        proposal: Proposal,
        actor: Actor,
        reason: String,
    },
    Feedback {
        proposal: Proposal,
        actor: Actor,
        comment: String,
        recipients: Vec<User>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Submitted { .. } => "submitted",
            Notification::Approved { .. } => "approved",
            Notification::Rejected { .. } => "rejected",
            Notification::Feedback { .. } => "feedback",
        }
    }

    pub fn proposal_id(&self) -> DbId {
        match self {
            Notification::Submitted { proposal, .. }
            | Notification::Approved { proposal, .. }
            | Notification::Rejected { proposal, .. }
            | Notification::Feedback { proposal, .. } => proposal.id,
        }
    }

    async fn send(&self, notifier: &dyn Notifier) -> Result<()> {
        match self {
            Notification::Submitted {
                proposal,
                approvers,
            } => notifier.notify_submitted(proposal, approvers).await,
            Notification::Approved { proposal, actor } => {
                notifier.notify_approved(proposal, *actor).await
            }
            Notification::Rejected {
                proposal,
                actor,
                reason,
            } => notifier.notify_rejected(proposal, *actor, reason).await,
            Notification::Feedback {
                proposal,
                actor,
                comment,
                recipients,
            } => {
                notifier
                    .notify_feedback(proposal, *actor, comment, recipients)
                    .await
            }
        }
    }
}

/// Fire-and-forget front for a [`Notifier`]
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Send on a fresh task. The handle is only useful to tests that want to
    /// wait for delivery.
    pub fn dispatch(&self, notification: Notification) -> JoinHandle<()> {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notification.send(notifier.as_ref()).await {
                tracing::warn!(
                    kind = notification.kind(),
                    proposal_id = notification.proposal_id(),
                    error = %e,
                    "Notification delivery failed"
                );
            }
        })
    }
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_submitted(&self, proposal: &Proposal, approvers: &[User]) -> Result<()> {
        let ids: Vec<DbId> = approvers.iter().map(|u| u.id).collect();
        tracing::info!(
            proposal_id = proposal.id,
            status = %proposal.status,
            approvers = ?ids,
            "Proposal awaiting approval"
        );
        Ok(())
    }

    async fn notify_approved(&self, proposal: &Proposal, actor: Actor) -> Result<()> {
        tracing::info!(
            proposal_id = proposal.id,
            stage = proposal.current_stage,
            status = %proposal.status,
            %actor,
            "Proposal approved"
        );
        Ok(())
    }

    async fn notify_rejected(&self, proposal: &Proposal, actor: Actor, reason: &str) -> Result<()> {
        tracing::info!(proposal_id = proposal.id, %actor, reason, "Proposal rejected");
        Ok(())
    }

    async fn notify_feedback(
        &self,
        proposal: &Proposal,
        actor: Actor,
        comment: &str,
        recipients: &[User],
    ) -> Result<()> {
        let ids: Vec<DbId> = recipients.iter().map(|u| u.id).collect();
        tracing::info!(
            proposal_id = proposal.id,
            %actor,
            comment,
            recipients = ?ids,
            "Feedback recorded"
        );
        Ok(())
    }
}

/// Error type for webhook delivery failures
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Network, DNS, timeout
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

impl From<WebhookError> for AppError {
    fn from(e: WebhookError) -> Self {
        AppError::Notification(e.to_string())
    }
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    id: DbId,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    proposal_id: DbId,
    #[serde(skip_serializing_if = "Option::is_none")]
    proposal_code: Option<&'a str>,
    title: &'a str,
    status: String,
    current_stage: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<Actor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
    recipients: Vec<Recipient<'a>>,
}

impl<'a> WebhookPayload<'a> {
    fn new(event: &'static str, proposal: &'a Proposal) -> Self {
        Self {
            event,
            proposal_id: proposal.id,
            proposal_code: proposal.code.as_deref(),
            title: &proposal.title,
            status: proposal.status.label(),
            current_stage: proposal.current_stage,
            actor: None,
            comment: None,
            recipients: Vec::new(),
        }
    }

    fn actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    fn comment(mut self, comment: &'a str) -> Self {
        self.comment = Some(comment);
        self
    }

    fn recipients(mut self, users: &'a [User]) -> Self {
        self.recipients = users
            .iter()
            .map(|u| Recipient {
                id: u.id,
                name: &u.name,
                email: u.email.as_deref(),
            })
            .collect();
        self
    }
}

/// POSTs each notification as JSON to a single endpoint
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> std::result::Result<(), WebhookError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        tracing::debug!(
            event = payload.event,
            proposal_id = payload.proposal_id,
            "Webhook delivered"
        );
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_submitted(&self, proposal: &Proposal, approvers: &[User]) -> Result<()> {
        let payload = WebhookPayload::new("submitted", proposal).recipients(approvers);
        Ok(self.post(&payload).await?)
    }

    async fn notify_approved(&self, proposal: &Proposal, actor: Actor) -> Result<()> {
        let payload = WebhookPayload::new("approved", proposal).actor(actor);
        Ok(self.post(&payload).await?)
    }

    async fn notify_rejected(&self, proposal: &Proposal, actor: Actor, reason: &str) -> Result<()> {
        let payload = WebhookPayload::new("rejected", proposal)
            .actor(actor)
            .comment(reason);
        Ok(self.post(&payload).await?)
    }

    async fn notify_feedback(
        &self,
        proposal: &Proposal,
        actor: Actor,
        comment: &str,
        recipients: &[User],
    ) -> Result<()> {
        let payload = WebhookPayload::new("feedback", proposal)
            .actor(actor)
            .comment(comment)
            .recipients(recipients);
        Ok(self.post(&payload).await?)
    }
}
