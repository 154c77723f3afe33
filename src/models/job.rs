use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::annotation::AnnotationSet;
use crate::models::tier::ServiceTier;

/// Number of recent item durations kept for the ETA moving average.
const DURATION_WINDOW: usize = 20;

/// Lifecycle status of a batch job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Terminal states never move again. A job cancelled before any worker
    /// dequeued an item goes straight from `Pending` to `Cancelled`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// Status of one item inside a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Success | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// Audit record for a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub item_id: String,
    pub error: String,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// Per-item processing state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: String,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub output: Option<AnnotationSet>,
}

impl ItemResult {
    fn new(item_id: String) -> Self {
        Self {
            item_id,
            status: ItemStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            output: None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JobStateError {
    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("item {index} cannot move from {from} to {to}")]
    InvalidItemTransition {
        index: usize,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("job has no item at index {0}")]
    UnknownItem(usize),
}

/// Run of consecutive terminal failures sharing one transport-level error.
#[derive(Debug, Clone, Default)]
struct TransportStreak {
    count: u32,
    signature: Option<String>,
}

/// One batch submission and everything recorded while processing it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub item_ids: Vec<String>,
    pub tier: ServiceTier,
    pub concurrency: usize,
    pub rate_limit_per_minute: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub cancelled_items: usize,
    /// Terminal per-item failures, one entry per failed item.
    pub errors: Vec<ItemError>,
    /// Every failed attempt, including ones a later retry recovered from.
    pub attempt_history: Vec<ItemError>,
    pub items: Vec<ItemResult>,
    pub cancel_requested: bool,
    pub failure_reason: Option<String>,
    transport_streak: TransportStreak,
    recent_durations_ms: VecDeque<i64>,
}

impl Job {
    pub fn new(
        id: Uuid,
        item_ids: Vec<String>,
        tier: ServiceTier,
        concurrency: usize,
        rate_limit_per_minute: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let items = item_ids.iter().cloned().map(ItemResult::new).collect();
        Self {
            id,
            item_ids,
            tier,
            concurrency,
            rate_limit_per_minute,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            cancelled_items: 0,
            errors: Vec::new(),
            attempt_history: Vec::new(),
            items,
            cancel_requested: false,
            failure_reason: None,
            transport_streak: TransportStreak::default(),
            recent_durations_ms: VecDeque::with_capacity(DURATION_WINDOW),
        }
    }

    pub fn total_items(&self) -> usize {
        self.item_ids.len()
    }

    /// Items neither processed nor cancelled yet.
    pub fn remaining_items(&self) -> usize {
        self.total_items()
            .saturating_sub(self.processed_items + self.cancelled_items)
    }

    pub fn recent_durations_ms(&self) -> impl Iterator<Item = i64> + '_ {
        self.recent_durations_ms.iter().copied()
    }

    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), JobStateError> {
        if !self.status.can_transition_to(next) {
            return Err(JobStateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == JobStatus::Processing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    fn move_item(&mut self, index: usize, next: ItemStatus) -> Result<&mut ItemResult, JobStateError> {
        let item = self
            .items
            .get_mut(index)
            .ok_or(JobStateError::UnknownItem(index))?;
        if !item.status.can_transition_to(next) {
            return Err(JobStateError::InvalidItemTransition {
                index,
                from: item.status,
                to: next,
            });
        }
        item.status = next;
        Ok(item)
    }

    /// Marks a dequeued item as in progress.
    pub fn begin_item(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), JobStateError> {
        let item = self.move_item(index, ItemStatus::Processing)?;
        item.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Counts one more attempt against an in-progress item, returning its number.
    pub fn start_attempt(&mut self, index: usize) -> Result<u32, JobStateError> {
        let item = self
            .items
            .get_mut(index)
            .ok_or(JobStateError::UnknownItem(index))?;
        item.attempts += 1;
        Ok(item.attempts)
    }

    /// Records a failed attempt in the history without finishing the item.
    pub fn record_attempt_failure(&mut self, index: usize, error: ItemError) -> Result<(), JobStateError> {
        let item = self
            .items
            .get_mut(index)
            .ok_or(JobStateError::UnknownItem(index))?;
        item.last_error = Some(error.error.clone());
        self.updated_at = error.timestamp;
        self.attempt_history.push(error);
        Ok(())
    }

    pub fn complete_success(
        &mut self,
        index: usize,
        output: AnnotationSet,
        now: DateTime<Utc>,
    ) -> Result<(), JobStateError> {
        let item = self.move_item(index, ItemStatus::Success)?;
        item.completed_at = Some(now);
        item.output = Some(output);
        let started = item.started_at;

        self.processed_items += 1;
        self.successful_items += 1;
        self.transport_streak = TransportStreak::default();
        self.push_duration(started, now);
        self.updated_at = now;
        Ok(())
    }

    /// Finishes an item as failed. `transport` names the kind of transport
    /// failure, if it was one. Returns the length of the current run of
    /// failures with that same kind, which is zero for other errors.
    pub fn complete_failure(
        &mut self,
        index: usize,
        error: ItemError,
        transport: Option<&str>,
    ) -> Result<u32, JobStateError> {
        let now = error.timestamp;
        let item = self.move_item(index, ItemStatus::Failed)?;
        item.completed_at = Some(now);
        item.last_error = Some(error.error.clone());
        let started = item.started_at;

        self.processed_items += 1;
        self.failed_items += 1;

        match transport {
            Some(signature) if self.transport_streak.signature.as_deref() == Some(signature) => {
                self.transport_streak.count += 1;
            }
            Some(signature) => {
                self.transport_streak = TransportStreak {
                    count: 1,
                    signature: Some(signature.to_string()),
                };
            }
            None => self.transport_streak = TransportStreak::default(),
        }

        self.errors.push(error);
        self.push_duration(started, now);
        self.updated_at = now;
        Ok(self.transport_streak.count)
    }

    pub fn cancel_item(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), JobStateError> {
        let item = self.move_item(index, ItemStatus::Cancelled)?;
        item.completed_at = Some(now);
        self.cancelled_items += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Marks every item that never reached a terminal state as cancelled.
    pub fn cancel_remaining(&mut self, now: DateTime<Utc>) -> usize {
        let open: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.status.is_terminal())
            .map(|(index, _)| index)
            .collect();
        for index in &open {
            // Non-terminal items can always be cancelled.
            let _ = self.cancel_item(*index, now);
        }
        open.len()
    }

    fn push_duration(&mut self, started: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let Some(started) = started else { return };
        if self.recent_durations_ms.len() == DURATION_WINDOW {
            self.recent_durations_ms.pop_front();
        }
        let elapsed = (now - started).num_milliseconds().max(0);
        self.recent_durations_ms.push_back(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(items: &[&str]) -> Job {
        Job::new(
            Uuid::new_v4(),
            items.iter().map(|s| s.to_string()).collect(),
            ServiceTier::Paid,
            2,
            60,
            Utc::now(),
        )
    }

    fn set(id: &str) -> AnnotationSet {
        AnnotationSet {
            item_id: id.to_string(),
            annotations: vec![],
            model: None,
        }
    }

    fn err(id: &str, msg: &str, at: DateTime<Utc>) -> ItemError {
        ItemError {
            item_id: id.to_string(),
            error: msg.to_string(),
            attempt_number: 1,
            timestamp: at,
        }
    }

    #[test]
    fn test_terminal_states_never_regress() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_counters_stay_consistent() {
        let now = Utc::now();
        let mut job = job(&["a", "b", "c"]);
        job.transition(JobStatus::Processing, now).unwrap();

        job.begin_item(0, now).unwrap();
        job.complete_success(0, set("a"), now + Duration::milliseconds(300)).unwrap();
        job.begin_item(1, now).unwrap();
        job.complete_failure(1, err("b", "bad input", now), None).unwrap();

        assert_eq!(job.processed_items, job.successful_items + job.failed_items);
        assert_eq!(job.processed_items, 2);
        assert_eq!(job.remaining_items(), 1);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.recent_durations_ms().collect::<Vec<_>>(), vec![300, 0]);
    }

    #[test]
    fn test_item_cannot_finish_twice() {
        let now = Utc::now();
        let mut job = job(&["a"]);
        job.begin_item(0, now).unwrap();
        job.complete_success(0, set("a"), now).unwrap();

        let again = job.complete_success(0, set("a"), now);
        assert!(matches!(again, Err(JobStateError::InvalidItemTransition { .. })));
        assert_eq!(job.successful_items, 1);
    }

    #[test]
    fn test_transport_streak_counts_identical_errors_only() {
        let now = Utc::now();
        let mut job = job(&["a", "b", "c", "d"]);
        for i in 0..4 {
            job.begin_item(i, now).unwrap();
        }
        let refused = Some("unavailable");
        assert_eq!(job.complete_failure(0, err("a", "connection refused", now), refused).unwrap(), 1);
        assert_eq!(job.complete_failure(1, err("b", "connection reset", now), refused).unwrap(), 2);
        assert_eq!(job.complete_failure(2, err("c", "timed out", now), Some("timeout")).unwrap(), 1);
        assert_eq!(job.complete_failure(3, err("d", "bad input", now), None).unwrap(), 0);
    }

    #[test]
    fn test_cancel_remaining_skips_finished_items() {
        let now = Utc::now();
        let mut job = job(&["a", "b", "c"]);
        job.begin_item(0, now).unwrap();
        job.complete_success(0, set("a"), now).unwrap();
        job.begin_item(1, now).unwrap();

        assert_eq!(job.cancel_remaining(now), 2);
        assert_eq!(job.cancelled_items, 2);
        assert_eq!(job.items[0].status, ItemStatus::Success);
        assert_eq!(job.items[2].status, ItemStatus::Cancelled);
        assert_eq!(job.remaining_items(), 0);
    }
}
