//! Delegation sweep
//!
//! Clears acting assignments whose window has closed. Reads never depend on
//! this running, since effective role and location already fall back to the
//! home values outside the window; the sweep only tidies the stored record.

use std::sync::Arc;

use crate::approval::ApprovalEngine;
use crate::error::Result;
use crate::schedule::SweepReport;

pub struct DelegationSweeper {
    engine: Arc<ApprovalEngine>,
}

impl DelegationSweeper {
    pub fn new(engine: Arc<ApprovalEngine>) -> Self {
        Self { engine }
    }

    /// Fails only when the expired query itself fails. Unreadable user rows
    /// are counted as failed.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = self.engine.now();
        let expired = self.engine.store().expired_delegations(now).await?;

        let mut report = SweepReport {
            scanned: expired.len(),
            failed: expired.unreadable.len(),
            ..SweepReport::default()
        };

        for user in expired.items {
            match self.engine.clear_expired_delegation(user.id).await {
                Ok(true) => report.applied += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        user_id = user.id,
                        error = %e,
                        "Failed to clear expired acting assignment; will retry next pass"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                expired = report.scanned,
                cleared = report.applied,
                failed = report.failed,
                "Delegation sweep finished"
            );
        } else {
            tracing::debug!("Delegation sweep: nothing expired");
        }
        Ok(report)
    }
}
