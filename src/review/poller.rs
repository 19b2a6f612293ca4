use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::services::ReviewService;
use crate::state::{ReviewDecision, ReviewStatus};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 120_000;
pub const DEFAULT_MAX_POLL_DURATION_MS: u64 = 1_800_000;

/// Polling cadence and advisory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_duration_ms")]
    pub max_poll_duration_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_poll_duration_ms() -> u64 {
    DEFAULT_MAX_POLL_DURATION_MS
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_poll_duration_ms: DEFAULT_MAX_POLL_DURATION_MS,
        }
    }
}

impl PollConfig {
    /// Nominal time spent polling after `poll_count` polls.
    pub fn elapsed_ms(&self, poll_count: u32) -> u64 {
        (poll_count as u64).saturating_mul(self.poll_interval_ms)
    }

    /// Polls that fit in the budget; a zero interval counts as 1 ms.
    pub fn max_polls(&self) -> u64 {
        self.max_poll_duration_ms.div_ceil(self.poll_interval_ms.max(1))
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub decision: ReviewDecision,
    pub blocking_count: u32,
    pub poll_count: u32,
    pub elapsed_ms: u64,
    pub continue_polling: bool,
    /// Budget exhausted without a decision; advisory only
    pub timed_out: bool,
}

pub struct ReviewPoller {
    config: PollConfig,
    service: Arc<dyn ReviewService>,
}

impl ReviewPoller {
    pub fn new(config: PollConfig, service: Arc<dyn ReviewService>) -> Self {
        Self { config, service }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Query the review system once and fold the answer into `status`.
    ///
    /// A failed query leaves `status` untouched and does not count as a poll.
    pub async fn check_once(
        &self,
        status: &mut ReviewStatus,
        change_set: &str,
    ) -> Result<PollReport, ServiceError> {
        let snapshot = self
            .service
            .get_review_status(change_set, status.reviews_since)
            .await?;

        status.poll_count += 1;
        status.last_checked_at = Some(Utc::now());
        status.decision = Some(snapshot.decision);
        status.blocking_count = snapshot.blocking_count;

        let report = self.report(status);
        debug!(
            change_set,
            poll = report.poll_count,
            elapsed_ms = report.elapsed_ms,
            decision = %report.decision,
            "Polled review"
        );
        if report.timed_out {
            warn!(
                change_set,
                elapsed_ms = report.elapsed_ms,
                max_ms = self.config.max_poll_duration_ms,
                "Review polling budget exhausted; check the change-set manually"
            );
        }
        Ok(report)
    }

    /// Derive a report from the persisted status without polling.
    pub fn report(&self, status: &ReviewStatus) -> PollReport {
        let decision = status.decision.unwrap_or(ReviewDecision::Pending);
        let elapsed_ms = self.config.elapsed_ms(status.poll_count);
        let decided = decision != ReviewDecision::Pending;
        let exhausted = elapsed_ms >= self.config.max_poll_duration_ms;

        PollReport {
            decision,
            blocking_count: status.blocking_count,
            poll_count: status.poll_count,
            elapsed_ms,
            continue_polling: !decided && !exhausted,
            timed_out: !decided && exhausted,
        }
    }

    /// Check if the advisory budget is spent without a decision.
    pub fn timed_out(&self, status: &ReviewStatus) -> bool {
        self.report(status).timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ReviewSnapshot;
    use crate::services::memory::MemoryReview;

    fn poller(review: Arc<MemoryReview>) -> ReviewPoller {
        ReviewPoller::new(PollConfig::default(), review)
    }

    #[test]
    fn test_default_config() {
        let config = PollConfig::default();
        assert_eq!(config.poll_interval_ms, 120_000);
        assert_eq!(config.max_poll_duration_ms, 1_800_000);
        assert_eq!(config.max_polls(), 15);
    }

    #[tokio::test]
    async fn test_fifteen_pending_polls_exhaust_budget() {
        let review = Arc::new(MemoryReview::new());
        let poller = poller(review.clone());
        let mut status = ReviewStatus::default();

        for _ in 0..14 {
            let report = poller.check_once(&mut status, "1").await.unwrap();
            assert!(report.continue_polling);
            assert!(!report.timed_out);
        }

        let report = poller.check_once(&mut status, "1").await.unwrap();
        assert_eq!(report.poll_count, 15);
        assert_eq!(report.elapsed_ms, 1_800_000);
        assert!(!report.continue_polling);
        assert!(report.timed_out);
        assert!(poller.timed_out(&status));
        assert_eq!(review.calls(), 15);
    }

    #[tokio::test]
    async fn test_decision_stops_polling() {
        let review = Arc::new(MemoryReview::new());
        review.script(
            "9",
            vec![
                ReviewSnapshot::pending(),
                ReviewSnapshot {
                    decision: ReviewDecision::ChangesRequested,
                    blocking_count: 2,
                },
            ],
        );
        let poller = poller(review);
        let mut status = ReviewStatus::default();

        assert!(poller.check_once(&mut status, "9").await.unwrap().continue_polling);
        let report = poller.check_once(&mut status, "9").await.unwrap();

        assert_eq!(report.decision, ReviewDecision::ChangesRequested);
        assert_eq!(report.blocking_count, 2);
        assert!(!report.continue_polling);
        assert!(!report.timed_out);
        assert_eq!(status.poll_count, 2);
        assert!(status.last_checked_at.is_some());
    }

    #[test]
    fn test_report_is_derived_from_persisted_status() {
        let review = Arc::new(MemoryReview::new());
        let poller = poller(review.clone());
        let status = ReviewStatus {
            poll_count: 20,
            ..Default::default()
        };

        assert!(poller.timed_out(&status));
        assert_eq!(review.calls(), 0);
    }
}
