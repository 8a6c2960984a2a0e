//! Periodic drivers for the two sweeps
//!
//! The idle sweep runs once a day at a fixed local time, the delegation sweep
//! on a fixed interval. Both loops stop when the shutdown channel flips or
//! its sender is dropped.

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::approval::IdleSweeper;
use crate::delegation::DelegationSweeper;

/// Outcome counts of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Candidates returned by the store
    pub scanned: usize,
    pub applied: usize,
    /// Eligible when listed, no longer eligible under the lock
    pub skipped: usize,
    pub failed: usize,
}

/// Time from `now` until the next wall-clock occurrence of `at` in `now`'s zone
pub fn until_next<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> Duration {
    let tz = now.timezone();
    let today = now.date_naive();

    // A DST gap can swallow `at` on one day; look a couple of days ahead
    for offset in 0..3 {
        let Some(date) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        if let Some(next) = tz.from_local_datetime(&date.and_time(at)).earliest() {
            if next > *now {
                return (next.naive_utc() - now.naive_utc())
                    .to_std()
                    .unwrap_or_default();
            }
        }
    }
    Duration::from_secs(24 * 60 * 60)
}

pub async fn run_idle_sweeper(
    sweeper: IdleSweeper,
    at: NaiveTime,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(at = %at, "Idle sweep scheduled daily");

    loop {
        let wait = until_next(&Local::now(), at);
        tracing::debug!(wait_secs = wait.as_secs(), "Next idle sweep");

        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("Idle sweep stopping");
                break;
            }
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = sweeper.run_once().await {
                    tracing::error!(error = %e, "Idle sweep failed");
                }
            }
        }
    }
}

pub async fn run_delegation_sweeper(
    sweeper: DelegationSweeper,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(interval_secs = every.as_secs(), "Delegation sweep started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("Delegation sweep stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = sweeper.run_once().await {
                    tracing::error!(error = %e, "Delegation sweep failed");
                }
            }
        }
    }
}
