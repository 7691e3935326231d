//! The job table and its execution lease.
//!
//! [`JobStore`] owns every job record. Callers only ever receive snapshot
//! clones. Status changes for a running job go through [`JobStore::transition`],
//! which requires the caller to hold the job's lease.
//!
//! The lease is a flag on the record itself. [`JobStore::try_lease`] checks and
//! sets it while holding the map entry's shard lock, so two workers racing for
//! the same id cannot both win.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::job::{Job, JobError, JobId, JobStatus};
use crate::error::{JobforgeError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub scheduled: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl QueueStats {
    /// Count for a single status.
    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Scheduled => self.scheduled,
            JobStatus::Processing => self.processing,
            JobStatus::Retrying => self.retrying,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Scheduled => self.scheduled += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Retrying => self.retrying += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
        self.total += 1;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transitions
// ═══════════════════════════════════════════════════════════════════════════════

/// A state change applied by the lease holder.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Processing: a new attempt begins
    Started,
    /// Processing -> Completed
    Completed(serde_json::Value),
    /// Processing -> Retrying
    Retrying(JobError),
    /// Retrying -> Pending
    Requeued,
    /// Processing -> Failed
    Failed(JobError),
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed(_) => "completed",
            Self::Retrying(_) => "retrying",
            Self::Requeued => "requeued",
            Self::Failed(_) => "failed",
        }
    }

    fn expected_status(&self) -> JobStatus {
        match self {
            Self::Requeued => JobStatus::Retrying,
            _ => JobStatus::Processing,
        }
    }

    fn apply(self, job: &mut Job, now: DateTime<Utc>) {
        match self {
            Self::Started => {
                job.attempts += 1;
                job.started_at = Some(now);
                job.error = None;
                job.result = None;
            }
            Self::Completed(result) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.result = Some(result);
                job.error = None;
            }
            Self::Retrying(error) => {
                job.status = JobStatus::Retrying;
                job.error = Some(error);
            }
            Self::Requeued => {
                job.status = JobStatus::Pending;
                job.error = None;
            }
            Self::Failed(error) => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error = Some(error);
                job.result = None;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct JobSlot {
    job: Job,
    leased: bool,
}

/// Concurrent job table.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<JobId, JobSlot>,
    sequence: AtomicU64,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Fails on a duplicate id or an invalid config.
    pub fn insert(&self, mut job: Job) -> Result<JobId> {
        job.config.validate()?;

        let id = job.id;
        match self.jobs.entry(id) {
            Entry::Occupied(_) => Err(JobforgeError::duplicate_job(id)),
            Entry::Vacant(entry) => {
                job.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                entry.insert(JobSlot { job, leased: false });
                Ok(id)
            }
        }
    }

    /// Snapshot of one job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|slot| slot.job.clone())
    }

    /// Snapshot of every job in `status`, in dispatch order.
    pub fn list_by_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|slot| slot.job.status == status)
            .map(|slot| slot.job.clone())
            .collect();
        jobs.sort_by(Job::dispatch_cmp);
        jobs
    }

    /// The best pending job nobody holds a lease on.
    pub fn next_candidate(&self) -> Option<JobId> {
        self.jobs
            .iter()
            .filter(|slot| !slot.leased && slot.job.status == JobStatus::Pending)
            .map(|slot| {
                let job = &slot.job;
                (
                    (Reverse(job.config.priority), job.created_at, job.sequence),
                    job.id,
                )
            })
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, id)| id)
    }

    /// Claim a pending job for execution.
    ///
    /// On success the job is `Processing` and leased to the caller. On failure
    /// nothing changes.
    pub fn try_lease(&self, id: &JobId) -> bool {
        let Some(mut slot) = self.jobs.get_mut(id) else {
            return false;
        };
        if slot.leased || slot.job.status != JobStatus::Pending {
            return false;
        }
        slot.leased = true;
        slot.job.status = JobStatus::Processing;
        true
    }

    /// Apply a transition to a leased job and return the updated snapshot.
    pub fn transition(&self, id: &JobId, transition: Transition) -> Result<Job> {
        let mut slot = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobforgeError::job_not_found(*id))?;

        if !slot.leased {
            return Err(JobforgeError::conflict(*id, "job is not leased"));
        }
        let expected = transition.expected_status();
        if slot.job.status != expected {
            return Err(JobforgeError::conflict(
                *id,
                format!(
                    "cannot apply {} while {} (expected {})",
                    transition.name(),
                    slot.job.status,
                    expected
                ),
            ));
        }

        transition.apply(&mut slot.job, Utc::now());
        Ok(slot.job.clone())
    }

    /// Drop the lease on a job. Safe to call on any id.
    ///
    /// A job released while still `Processing` or `Retrying` was abandoned
    /// mid-attempt and goes back to `Pending`.
    pub fn release_lease(&self, id: &JobId) {
        let Some(mut slot) = self.jobs.get_mut(id) else {
            return;
        };
        if !slot.leased {
            return;
        }
        slot.leased = false;

        if matches!(slot.job.status, JobStatus::Processing | JobStatus::Retrying) {
            tracing::warn!(
                job_id = %id,
                job_name = %slot.job.name,
                status = %slot.job.status,
                "Lease released mid-attempt, returning job to pending"
            );
            slot.job.status = JobStatus::Pending;
            slot.job.error = None;
        }
    }

    /// Whether a worker currently holds the lease on `id`.
    pub fn is_leased(&self, id: &JobId) -> bool {
        self.jobs.get(id).map_or(false, |slot| slot.leased)
    }

    /// Delete a job that is not leased.
    pub fn remove(&self, id: &JobId) -> Result<Job> {
        match self.jobs.entry(*id) {
            Entry::Occupied(entry) if entry.get().leased => {
                Err(JobforgeError::conflict(*id, "job is being executed"))
            }
            Entry::Occupied(entry) => Ok(entry.remove().job),
            Entry::Vacant(_) => Err(JobforgeError::job_not_found(*id)),
        }
    }

    /// Delete every completed job, returning how many were removed.
    pub fn clear_completed(&self) -> usize {
        let mut removed = 0;
        self.jobs.retain(|_, slot| {
            let keep = slot.job.status != JobStatus::Completed;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Move scheduled jobs that are due at `now` to pending.
    pub fn promote_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut promoted = Vec::new();
        for mut slot in self.jobs.iter_mut() {
            if slot.leased || slot.job.status != JobStatus::Scheduled || !slot.job.is_due(now) {
                continue;
            }
            slot.job.status = JobStatus::Pending;
            promoted.push(slot.job.clone());
        }
        promoted.sort_by(Job::dispatch_cmp);
        promoted
    }

    /// Return a failed job to pending with a fresh attempt budget.
    pub fn reset_failed(&self, id: &JobId) -> Result<Job> {
        let mut slot = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobforgeError::job_not_found(*id))?;

        if slot.leased || !slot.job.status.can_retry() {
            return Err(JobforgeError::conflict(
                *id,
                format!("only failed jobs can be retried (status: {})", slot.job.status),
            ));
        }

        let job = &mut slot.job;
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.error = None;
        job.result = None;
        job.started_at = None;
        job.completed_at = None;
        Ok(job.clone())
    }

    /// Count jobs per status.
    pub fn counts(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for slot in self.jobs.iter() {
            stats.record(slot.job.status);
        }
        stats
    }

    /// Number of jobs currently leased.
    pub fn leased_count(&self) -> usize {
        self.jobs.iter().filter(|slot| slot.leased).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lease Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// An execution lease that is released when dropped.
#[derive(Debug)]
pub struct JobLease {
    store: Arc<JobStore>,
    id: JobId,
}

impl JobLease {
    /// Try to lease `id`. Returns `None` if the job is not pending or already leased.
    pub fn acquire(store: &Arc<JobStore>, id: JobId) -> Option<Self> {
        store.try_lease(&id).then(|| Self {
            store: Arc::clone(store),
            id,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Apply a transition to the leased job.
    pub fn transition(&self, transition: Transition) -> Result<Job> {
        self.store.transition(&self.id, transition)
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.store.release_lease(&self.id);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::JobConfig;
    use serde_json::json;

    fn pending(name: &str) -> Job {
        Job::new(name, json!({}), JobConfig::default())
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let store = JobStore::new();
        let job = pending("a");
        store.insert(job.clone()).unwrap();
        let err = store.insert(job).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_try_lease_only_once() {
        let store = JobStore::new();
        let id = store.insert(pending("a")).unwrap();

        assert!(store.try_lease(&id));
        assert!(!store.try_lease(&id));
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Processing);
        assert_eq!(store.leased_count(), 1);

        store.release_lease(&id);
        assert!(!store.is_leased(&id));
    }

    #[test]
    fn test_try_lease_ignores_non_pending() {
        let store = JobStore::new();
        let later = Utc::now() + chrono::Duration::seconds(30);
        let id = store
            .insert(Job::new("a", json!({}), JobConfig::default().scheduled_for(later)))
            .unwrap();
        assert!(!store.try_lease(&id));
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Scheduled);
        assert!(!store.try_lease(&JobId::new()));
    }

    #[test]
    fn test_transition_requires_lease() {
        let store = JobStore::new();
        let id = store.insert(pending("a")).unwrap();
        let err = store.transition(&id, Transition::Started).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = store.transition(&JobId::new(), Transition::Started).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_transition_lifecycle() {
        let store = Arc::new(JobStore::new());
        let id = store.insert(pending("a")).unwrap();
        let lease = JobLease::acquire(&store, id).unwrap();

        let job = lease.transition(Transition::Started).unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        let job = lease
            .transition(Transition::Retrying(JobError::new("boom")))
            .unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert!(job.error.is_some());
        assert!(job.completed_at.is_none());

        let err = lease
            .transition(Transition::Completed(json!(1)))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let job = lease.transition(Transition::Requeued).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        drop(lease);

        let lease = JobLease::acquire(&store, id).unwrap();
        lease.transition(Transition::Started).unwrap();
        let job = lease.transition(Transition::Completed(json!({"ok": true}))).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_dropped_lease_returns_job_to_pending() {
        let store = Arc::new(JobStore::new());
        let id = store.insert(pending("a")).unwrap();
        {
            let lease = JobLease::acquire(&store, id).unwrap();
            lease.transition(Transition::Started).unwrap();
        }
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(store.leased_count(), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let store = Arc::new(JobStore::new());
        let leased = store.insert(pending("a")).unwrap();
        let idle = store.insert(pending("b")).unwrap();

        let lease = JobLease::acquire(&store, leased).unwrap();
        assert_eq!(store.remove(&leased).unwrap_err().code(), ErrorCode::Conflict);
        assert_eq!(store.remove(&idle).unwrap().id, idle);
        assert_eq!(store.remove(&idle).unwrap_err().code(), ErrorCode::NotFound);

        lease.transition(Transition::Started).unwrap();
        lease.transition(Transition::Completed(json!(null))).unwrap();
        drop(lease);

        store.insert(pending("c")).unwrap();
        assert_eq!(store.clear_completed(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&leased).is_none());
    }

    #[test]
    fn test_reset_failed() {
        let store = Arc::new(JobStore::new());
        let id = store.insert(pending("a")).unwrap();
        assert_eq!(store.reset_failed(&id).unwrap_err().code(), ErrorCode::Conflict);

        let lease = JobLease::acquire(&store, id).unwrap();
        lease.transition(Transition::Started).unwrap();
        lease.transition(Transition::Failed(JobError::new("x"))).unwrap();
        assert_eq!(store.reset_failed(&id).unwrap_err().code(), ErrorCode::Conflict);
        drop(lease);

        let job = store.reset_failed(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_none());
        assert_eq!(store.reset_failed(&JobId::new()).unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_promote_due() {
        let store = JobStore::new();
        let now = Utc::now();
        let soon = now + chrono::Duration::milliseconds(200);
        let later = now + chrono::Duration::seconds(60);
        let a = store
            .insert(Job::new("a", json!({}), JobConfig::default().scheduled_for(soon)))
            .unwrap();
        let b = store
            .insert(Job::new("b", json!({}), JobConfig::default().scheduled_for(later)))
            .unwrap();

        assert!(store.promote_due(now).is_empty());
        let promoted = store.promote_due(soon);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, a);
        assert_eq!(store.get(&a).unwrap().status, JobStatus::Pending);
        assert_eq!(store.get(&b).unwrap().status, JobStatus::Scheduled);
    }

    #[test]
    fn test_counts() {
        let store = JobStore::new();
        store.insert(pending("a")).unwrap();
        store.insert(pending("b")).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(60);
        store
            .insert(Job::new("c", json!({}), JobConfig::default().scheduled_for(later)))
            .unwrap();

        let stats = store.counts();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(JobStatus::Pending), 2);
    }
}
