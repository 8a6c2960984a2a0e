//! Idle sweep
//!
//! One pass lists every open proposal in the waiting family and auto-rejects
//! the ones idle past the engine's threshold. Each proposal is handled on its
//! own under its own lock; a failure is logged and the pass moves on, so the
//! proposal is simply picked up again next time.

use std::sync::Arc;

use super::engine::ApprovalEngine;
use crate::error::Result;
use crate::schedule::SweepReport;

pub struct IdleSweeper {
    engine: Arc<ApprovalEngine>,
}

impl IdleSweeper {
    pub fn new(engine: Arc<ApprovalEngine>) -> Self {
        Self { engine }
    }

    /// Fails only when the candidate query itself fails
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = self.engine.now();
        let threshold = self.engine.config().idle_threshold;
        let candidates = self.engine.store().waiting_proposals().await?;

        // Rows the store could not decode count as failures
        let mut report = SweepReport {
            scanned: candidates.len(),
            failed: candidates.unreadable.len(),
            ..SweepReport::default()
        };

        for proposal in candidates.items {
            if !proposal.is_idle(now, threshold) {
                continue;
            }
            match self.engine.auto_reject(proposal.id).await {
                Ok(true) => report.applied += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        proposal_id = proposal.id,
                        error = %e,
                        "Auto-reject failed; will retry next pass"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            rejected = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            threshold_days = threshold.num_days(),
            "Idle sweep finished"
        );
        Ok(report)
    }
}
