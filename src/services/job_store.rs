use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

/// Outcome of asking the store to flag a job as cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    Accepted,
    AlreadyRequested,
    AlreadyTerminal,
    NotFound,
}

/// In-memory registry of jobs. Each job sits behind its own lock so the
/// counters and item states a worker touches change together, and pollers
/// never see a half-applied update.
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<Uuid, Arc<RwLock<Job>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id, Arc::new(RwLock::new(job)));
    }

    fn entry(&self, id: Uuid) -> Option<Arc<RwLock<Job>>> {
        // Clone the handle out so the map shard is not held while locking the job.
        self.jobs.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Full copy of a job record.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.read(id, Job::clone)
    }

    pub fn read<R>(&self, id: Uuid, f: impl FnOnce(&Job) -> R) -> Option<R> {
        let entry = self.entry(id)?;
        let job = entry.read();
        Some(f(&job))
    }

    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let entry = self.entry(id)?;
        let mut job = entry.write();
        Some(f(&mut job))
    }

    /// Flags a running job as cancelled. The flag is what finalization reads,
    /// so it is set under the same lock that terminal transitions take.
    pub fn request_cancel(&self, id: Uuid, now: DateTime<Utc>) -> CancelRequest {
        self.update(id, |job| {
            if job.status.is_terminal() {
                CancelRequest::AlreadyTerminal
            } else if job.cancel_requested {
                CancelRequest::AlreadyRequested
            } else {
                job.cancel_requested = true;
                job.updated_at = now;
                CancelRequest::Accepted
            }
        })
        .unwrap_or(CancelRequest::NotFound)
    }

    /// Maps every non-terminal job through `f`, oldest first.
    pub fn list_active<R>(&self, f: impl Fn(&Job) -> R) -> Vec<R> {
        let entries: Vec<Arc<RwLock<Job>>> =
            self.jobs.iter().map(|e| Arc::clone(e.value())).collect();

        let mut active: Vec<(DateTime<Utc>, R)> = entries
            .iter()
            .filter_map(|entry| {
                let job = entry.read();
                (!job.status.is_terminal()).then(|| (job.created_at, f(&job)))
            })
            .collect();
        active.sort_by_key(|(created_at, _)| *created_at);
        active.into_iter().map(|(_, r)| r).collect()
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|e| !e.value().read().status.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drops terminal jobs that finished before `cutoff`. Returns how many went.
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| {
            let job = entry.read();
            !(job.status.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        before - self.jobs.len()
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.read(id, |job| job.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tier::ServiceTier;
    use chrono::Duration;

    fn new_job(now: DateTime<Utc>) -> Job {
        Job::new(
            Uuid::new_v4(),
            vec!["img-1".into(), "img-2".into()],
            ServiceTier::Free,
            1,
            10,
            now,
        )
    }

    #[test]
    fn test_cancel_request_is_idempotent() {
        let store = JobStore::new();
        let now = Utc::now();
        let job = new_job(now);
        let id = job.id;
        store.insert(job);

        assert_eq!(store.request_cancel(id, now), CancelRequest::Accepted);
        assert_eq!(store.request_cancel(id, now), CancelRequest::AlreadyRequested);
        assert_eq!(store.request_cancel(Uuid::new_v4(), now), CancelRequest::NotFound);

        store.update(id, |job| job.transition(JobStatus::Cancelled, now).unwrap());
        assert_eq!(store.request_cancel(id, now), CancelRequest::AlreadyTerminal);
    }

    #[test]
    fn test_list_active_skips_terminal_jobs() {
        let store = JobStore::new();
        let now = Utc::now();

        let older = new_job(now - Duration::seconds(5));
        let newer = new_job(now);
        let done = new_job(now);
        let (older_id, newer_id, done_id) = (older.id, newer.id, done.id);
        store.insert(newer);
        store.insert(older);
        store.insert(done);
        store.update(done_id, |job| {
            job.transition(JobStatus::Processing, now).unwrap();
            job.transition(JobStatus::Completed, now).unwrap();
        });

        let active = store.list_active(|job| job.id);
        assert_eq!(active, vec![older_id, newer_id]);
        assert_eq!(store.active_count(), 2);
    }

    #[test]
    fn test_purge_only_removes_old_terminal_jobs() {
        let store = JobStore::new();
        let now = Utc::now();

        let finished = new_job(now);
        let running = new_job(now);
        let (finished_id, running_id) = (finished.id, running.id);
        store.insert(finished);
        store.insert(running);
        store.update(finished_id, |job| {
            job.transition(JobStatus::Cancelled, now - Duration::hours(2)).unwrap();
        });

        assert_eq!(store.purge_finished(now - Duration::hours(1)), 1);
        assert!(!store.contains(finished_id));
        assert!(store.contains(running_id));
    }
}
