//! Periodic sweeps: retention cleanup, security-state pruning and quota
//! resets.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use studio_core::{ResetClass, Studio};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawn every maintenance loop. Abort the handles to stop them.
pub fn spawn(studio: Arc<Studio>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(sweep_loop(Arc::clone(&studio))),
        tokio::spawn(reset_loop(Arc::clone(&studio), ResetClass::Daily)),
        tokio::spawn(reset_loop(studio, ResetClass::Monthly)),
    ]
}

async fn sweep_loop(studio: Arc<Studio>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep_once(&studio).await;
    }
}

/// One pass of the hourly sweep.
pub async fn sweep_once(studio: &Studio) {
    match studio.cleanup_expired_tasks().await {
        Ok(report) => info!(
            removed_tasks = report.removed_tasks,
            removed_artifacts = report.removed_artifacts,
            "retention sweep finished"
        ),
        Err(err) => warn!(error = %err, "retention sweep failed"),
    }
    let pruned = studio.sweep_security();
    info!(pruned, "security state pruned");
}

async fn reset_loop(studio: Arc<Studio>, class: ResetClass) {
    loop {
        let Some(wait) = until_next_reset(class, studio.clock().now()) else {
            return;
        };
        tokio::time::sleep(wait).await;
        let cleared = studio.reset_quotas(class);
        info!(%class, cleared, "scheduled quota reset");
    }
}

/// Time from `now` to the next reset of `class`, never shorter than one
/// second so a reset is not repeated within the same boundary. `None` for
/// classes that never reset.
pub fn until_next_reset(class: ResetClass, now: DateTime<Utc>) -> Option<Duration> {
    let next = class.next_reset(now)?;
    let wait = (next - now).to_std().unwrap_or_default();
    Some(wait.max(Duration::from_secs(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_reset_waits_until_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 23, 0, 0).unwrap();
        assert_eq!(
            until_next_reset(ResetClass::Daily, now),
            Some(Duration::from_secs(3_600))
        );
    }

    #[test]
    fn monthly_reset_rolls_over_the_year() {
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 12, 0, 0).unwrap();
        assert_eq!(
            until_next_reset(ResetClass::Monthly, now),
            Some(Duration::from_secs(12 * 3_600))
        );
    }

    #[test]
    fn never_class_is_not_scheduled() {
        assert_eq!(until_next_reset(ResetClass::Never, Utc::now()), None);
    }
}
