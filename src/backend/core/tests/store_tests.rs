//! Tests for the job store and its execution lease.
//!
//! Tests cover:
//! - Lease exclusivity under concurrent contention
//! - Dispatch ordering
//! - Record invariants across transitions

use jobforge_core::error::ErrorCode;
use jobforge_core::jobs::{
    Job, JobConfig, JobError, JobId, JobLease, JobPriority, JobStatus, JobStore, Transition,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn job(name: &str, priority: JobPriority) -> Job {
    Job::new(name, json!({}), JobConfig::default().with_priority(priority))
}

fn assert_invariants(job: &Job) {
    assert_eq!(
        job.completed_at.is_some(),
        job.status.is_terminal(),
        "completed_at must be set iff terminal: {:?}",
        job
    );
    assert_eq!(
        job.result.is_some(),
        job.status == JobStatus::Completed,
        "result must be set iff completed: {:?}",
        job
    );
    assert_eq!(
        job.error.is_some(),
        matches!(job.status, JobStatus::Failed | JobStatus::Retrying),
        "error must be set iff failed or retrying: {:?}",
        job
    );
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_try_lease_has_single_winner() {
    let store = Arc::new(JobStore::new());
    let ids: Vec<JobId> = (0..200)
        .map(|i| store.insert(job(&format!("job-{}", i), JobPriority::Normal)).unwrap())
        .collect();
    let ids = Arc::new(ids);
    let winners = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            let ids = ids.clone();
            let winners = winners.clone();
            tokio::spawn(async move {
                for id in ids.iter() {
                    if store.try_lease(id) {
                        winners.lock().push(*id);
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let winners = winners.lock();
    assert_eq!(winners.len(), 200);
    let unique: HashSet<_> = winners.iter().collect();
    assert_eq!(unique.len(), 200);
    assert_eq!(store.leased_count(), 200);
    assert_eq!(store.counts().processing, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_workers_never_share_a_job() {
    let store = Arc::new(JobStore::new());
    for i in 0..500 {
        store.insert(job(&format!("job-{}", i), JobPriority::Normal)).unwrap();
    }
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let executions = Arc::new(Mutex::new(HashMap::<JobId, u32>::new()));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let store = store.clone();
            let in_flight = in_flight.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                while let Some(id) = store.next_candidate() {
                    let Some(lease) = JobLease::acquire(&store, id) else {
                        continue;
                    };
                    assert!(in_flight.lock().insert(id), "job {} leased twice", id);
                    lease.transition(Transition::Started).unwrap();
                    *executions.lock().entry(id).or_default() += 1;
                    tokio::task::yield_now().await;
                    lease.transition(Transition::Completed(json!(null))).unwrap();
                    in_flight.lock().remove(&id);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let executions = executions.lock();
    assert_eq!(executions.len(), 500);
    assert!(executions.values().all(|&n| n == 1));
    assert_eq!(store.counts().completed, 500);
    assert_eq!(store.leased_count(), 0);
    for id in executions.keys() {
        let job = store.get(id).unwrap();
        assert_eq!(job.attempts, 1);
        assert_invariants(&job);
    }
}

// ============================================================================
// Ordering Tests
// ============================================================================

#[test]
fn test_next_candidate_prefers_priority_then_age() {
    let store = Arc::new(JobStore::new());
    let low = store.insert(job("low", JobPriority::Low)).unwrap();
    let first_normal = store.insert(job("n1", JobPriority::Normal)).unwrap();
    let second_normal = store.insert(job("n2", JobPriority::Normal)).unwrap();
    let critical = store.insert(job("crit", JobPriority::Critical)).unwrap();

    let mut order = Vec::new();
    while let Some(id) = store.next_candidate() {
        let lease = JobLease::acquire(&store, id).unwrap();
        lease.transition(Transition::Started).unwrap();
        lease.transition(Transition::Completed(json!(null))).unwrap();
        order.push(id);
    }

    assert_eq!(order, vec![critical, first_normal, second_normal, low]);
}

#[test]
fn test_next_candidate_skips_leased_and_scheduled() {
    let store = Arc::new(JobStore::new());
    let later = chrono::Utc::now() + chrono::Duration::seconds(60);
    store
        .insert(Job::new(
            "scheduled",
            json!({}),
            JobConfig::default()
                .with_priority(JobPriority::Critical)
                .scheduled_for(later),
        ))
        .unwrap();
    let leased = store.insert(job("leased", JobPriority::High)).unwrap();
    let free = store.insert(job("free", JobPriority::Low)).unwrap();

    let _lease = JobLease::acquire(&store, leased).unwrap();
    assert_eq!(store.next_candidate(), Some(free));
}

#[test]
fn test_list_by_status_is_dispatch_ordered() {
    let store = JobStore::new();
    store.insert(job("low", JobPriority::Low)).unwrap();
    store.insert(job("high", JobPriority::High)).unwrap();
    store.insert(job("normal", JobPriority::Normal)).unwrap();

    let names: Vec<String> = store
        .list_by_status(JobStatus::Pending)
        .into_iter()
        .map(|j| j.name)
        .collect();
    assert_eq!(names, vec!["high", "normal", "low"]);
}

// ============================================================================
// Invariant Tests
// ============================================================================

#[test]
fn test_invariants_hold_through_failure_path() {
    let store = Arc::new(JobStore::new());
    let id = store.insert(job("flaky", JobPriority::Normal)).unwrap();
    assert_invariants(&store.get(&id).unwrap());

    let lease = JobLease::acquire(&store, id).unwrap();
    assert_invariants(&lease.transition(Transition::Started).unwrap());
    assert_invariants(
        &lease
            .transition(Transition::Retrying(JobError::new("first")))
            .unwrap(),
    );
    assert_invariants(&lease.transition(Transition::Requeued).unwrap());
    drop(lease);

    let lease = JobLease::acquire(&store, id).unwrap();
    lease.transition(Transition::Started).unwrap();
    let failed = lease
        .transition(Transition::Failed(JobError::new("second")))
        .unwrap();
    assert_invariants(&failed);
    assert_eq!(failed.attempts, 2);
    drop(lease);

    let reset = store.reset_failed(&id).unwrap();
    assert_invariants(&reset);
    assert_eq!(reset.attempts, 0);
}

#[test]
fn test_transition_from_wrong_state_is_conflict() {
    let store = Arc::new(JobStore::new());
    let id = store.insert(job("a", JobPriority::Normal)).unwrap();
    let lease = JobLease::acquire(&store, id).unwrap();

    let err = lease.transition(Transition::Requeued).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    let job = store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 0);
}

#[test]
fn test_release_unknown_or_unleased_is_noop() {
    let store = JobStore::new();
    store.release_lease(&JobId::new());

    let id = store.insert(job("a", JobPriority::Normal)).unwrap();
    store.release_lease(&id);
    assert_eq!(store.get(&id).unwrap().status, JobStatus::Pending);
}

#[test]
fn test_insert_rejects_invalid_config() {
    let store = JobStore::new();
    let bad = Job::new(
        "bad",
        json!({}),
        JobConfig::default().with_timeout(std::time::Duration::ZERO),
    );
    let err = store.insert(bad).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(store.is_empty());
}
