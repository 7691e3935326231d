//! Worker pool executing leased jobs.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::events::{EventBus, JobEvent};
use super::job::{HandlerResult, Job, JobContext, JobError, JobErrorKind};
use super::registry::HandlerRegistry;
use super::store::{JobLease, JobStore, Transition};
use crate::telemetry::JobMetrics;

/// Statistics shared by every worker of a queue.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Attempts finished, whatever the outcome
    pub processed: Arc<AtomicU64>,
    /// Attempts that completed their job
    pub succeeded: Arc<AtomicU64>,
    /// Jobs that failed for good
    pub failed: Arc<AtomicU64>,
    /// Failed attempts followed by a retry
    pub retried: Arc<AtomicU64>,
    /// Attempts that hit their deadline
    pub timed_out: Arc<AtomicU64>,
    /// Attempts currently executing
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Everything a worker needs to run jobs.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    pub(crate) store: Arc<JobStore>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) events: EventBus,
    pub(crate) wakeup: Arc<Notify>,
    pub(crate) stats: WorkerStats,
    pub(crate) idle_interval: Duration,
    pub(crate) queue_name: String,
}

impl Dispatcher {
    /// Lease the best pending job, retrying when another worker wins the race.
    fn next_lease(&self) -> Option<JobLease> {
        loop {
            let id = self.store.next_candidate()?;
            if let Some(lease) = JobLease::acquire(&self.store, id) {
                return Some(lease);
            }
        }
    }

    /// Run one attempt of a leased job and settle its outcome.
    async fn execute(&self, lease: JobLease, worker_id: usize, shutdown: &mut watch::Receiver<bool>) {
        let job = match lease.transition(Transition::Started) {
            Ok(job) => job,
            Err(e) => {
                e.log();
                return;
            }
        };

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        JobMetrics::record_started(&self.queue_name);
        self.events.emit(JobEvent::Started {
            job_id: job.id,
            name: job.name.clone(),
            attempt: job.attempts,
        });
        tracing::debug!(
            worker_id,
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts,
            "Job started"
        );

        let started = Instant::now();
        let outcome = self.invoke(&job).await;
        let elapsed = started.elapsed();

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(result) => self.complete(&lease, &job, result, elapsed, worker_id),
            Err(error) if job.has_retries_left() => {
                self.retry(&lease, &job, error, elapsed, worker_id, shutdown).await
            }
            Err(error) => self.fail(&lease, &job, error, elapsed, worker_id),
        }

        drop(lease);
        self.wakeup.notify_one();
    }

    /// Look up the handler and run it against the job's deadline.
    async fn invoke(&self, job: &Job) -> HandlerResult {
        let handler = self
            .registry
            .lookup(&job.name)
            .map_err(|_| JobError::handler_not_found(&job.name))?;

        let ctx = JobContext::from_job(job);
        let mut task = tokio::spawn(async move { handler.handle(ctx).await });

        match tokio::time::timeout(job.config.timeout(), &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                Err(JobError::panicked(message))
            }
            Err(_) => {
                // The handler task is left running; dropping the handle detaches it.
                tracing::warn!(
                    job_id = %job.id,
                    job_name = %job.name,
                    timeout_ms = job.config.timeout_ms,
                    "Job exceeded its deadline"
                );
                Err(JobError::timed_out(job.config.timeout_ms))
            }
        }
    }

    fn complete(
        &self,
        lease: &JobLease,
        job: &Job,
        result: serde_json::Value,
        elapsed: Duration,
        worker_id: usize,
    ) {
        if let Err(e) = lease.transition(Transition::Completed(result.clone())) {
            e.log();
            return;
        }

        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        JobMetrics::record_completed(&self.queue_name, &job.name, elapsed.as_secs_f64());
        tracing::info!(
            worker_id,
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts,
            duration_ms = elapsed.as_millis() as u64,
            "Job completed"
        );
        self.events.emit(JobEvent::Completed {
            job_id: job.id,
            name: job.name.clone(),
            result,
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    async fn retry(
        &self,
        lease: &JobLease,
        job: &Job,
        error: JobError,
        elapsed: Duration,
        worker_id: usize,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        self.record_timeout(job, &error);
        if let Err(e) = lease.transition(Transition::Retrying(error.clone())) {
            e.log();
            return;
        }

        let delay = job.config.retry_delay();
        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        JobMetrics::record_retried(&self.queue_name, &job.name, elapsed.as_secs_f64());
        tracing::warn!(
            worker_id,
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts,
            max_retries = job.config.max_retries,
            delay_ms = job.config.retry_delay_ms,
            error = %error,
            "Job attempt failed, retrying"
        );
        self.events.emit(JobEvent::Retrying {
            job_id: job.id,
            name: job.name.clone(),
            error,
            attempt: job.attempts,
            delay_ms: job.config.retry_delay_ms,
        });

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(shutdown) => {
                    tracing::debug!(job_id = %job.id, "Retry delay cut short by shutdown");
                }
            }
        }

        if let Err(e) = lease.transition(Transition::Requeued) {
            e.log();
        }
    }

    fn fail(&self, lease: &JobLease, job: &Job, error: JobError, elapsed: Duration, worker_id: usize) {
        self.record_timeout(job, &error);
        if let Err(e) = lease.transition(Transition::Failed(error.clone())) {
            e.log();
            return;
        }

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        let kind = serde_json::to_value(error.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        JobMetrics::record_failed(&self.queue_name, &job.name, &kind, elapsed.as_secs_f64());
        tracing::error!(
            worker_id,
            job_id = %job.id,
            job_name = %job.name,
            attempts = job.attempts,
            error = %error,
            "Job failed"
        );
        self.events.emit(JobEvent::Failed {
            job_id: job.id,
            name: job.name.clone(),
            error,
            attempts: job.attempts,
        });
    }

    fn record_timeout(&self, job: &Job, error: &JobError) {
        if error.kind == JobErrorKind::TimedOut {
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            JobMetrics::record_timed_out(&self.queue_name, &job.name);
        }
    }
}

/// Resolves once `shutdown` is true or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_worker(dispatcher: Arc<Dispatcher>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!(queue = %dispatcher.queue_name, worker_id, "Worker started");

    while !*shutdown.borrow() {
        if let Some(lease) = dispatcher.next_lease() {
            dispatcher.execute(lease, worker_id, &mut shutdown).await;
            continue;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = dispatcher.wakeup.notified() => {}
            _ = tokio::time::sleep(dispatcher.idle_interval) => {}
        }
    }

    tracing::debug!(queue = %dispatcher.queue_name, worker_id, "Worker stopped");
}

/// A fixed set of worker tasks.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        dispatcher: Arc<Dispatcher>,
        workers: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(Arc::clone(&dispatcher), worker_id, shutdown.clone()))
            })
            .collect();

        tracing::info!(queue = %dispatcher.queue_name, workers, "Worker pool started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        let results = futures::future::join_all(self.handles).await;
        for (worker_id, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                tracing::error!(worker_id, error = %e, "Worker task terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobConfig, JobStatus};
    use serde_json::json;

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            store: Arc::new(JobStore::new()),
            registry: Arc::new(HandlerRegistry::new()),
            events: EventBus::new(64),
            wakeup: Arc::new(Notify::new()),
            stats: WorkerStats::new(),
            idle_interval: Duration::from_millis(10),
            queue_name: "test".into(),
        })
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.succeeded(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.retried(), 0);
        assert_eq!(stats.timed_out(), 0);
        assert_eq!(stats.active(), 0);

        let shared = stats.clone();
        shared.processed.fetch_add(2, Ordering::Relaxed);
        assert_eq!(stats.processed(), 2);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic");
    }

    #[tokio::test]
    async fn test_execute_missing_handler_fails() {
        let dispatcher = dispatcher();
        let (_tx, mut rx) = watch::channel(false);
        let id = dispatcher
            .store
            .insert(Job::new("nobody", json!({}), JobConfig::default().with_max_retries(0)))
            .unwrap();

        let lease = dispatcher.next_lease().unwrap();
        dispatcher.execute(lease, 0, &mut rx).await;

        let job = dispatcher.store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::HandlerNotFound);
        assert_eq!(dispatcher.stats.failed(), 1);
        assert_eq!(dispatcher.store.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_panicking_handler_is_a_failure() {
        let dispatcher = dispatcher();
        dispatcher.registry.register("panics", |_ctx: JobContext| async {
            if true {
                panic!("handler exploded");
            }
            Ok(json!(null))
        });
        let (_tx, mut rx) = watch::channel(false);
        let id = dispatcher
            .store
            .insert(Job::new("panics", json!({}), JobConfig::default().with_max_retries(0)))
            .unwrap();

        let lease = dispatcher.next_lease().unwrap();
        dispatcher.execute(lease, 0, &mut rx).await;

        let error = dispatcher.store.get(&id).unwrap().error.unwrap();
        assert_eq!(error.kind, JobErrorKind::Handler);
        assert!(error.message.contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_retry_delay_cut_short_on_shutdown() {
        let dispatcher = dispatcher();
        dispatcher
            .registry
            .register("fails", |_ctx: JobContext| async { Err(JobError::new("nope")) });
        let (tx, mut rx) = watch::channel(false);
        let config = JobConfig::default()
            .with_max_retries(5)
            .with_retry_delay(Duration::from_secs(60));
        let id = dispatcher.store.insert(Job::new("fails", json!({}), config)).unwrap();

        tx.send(true).unwrap();
        let lease = dispatcher.next_lease().unwrap();
        tokio::time::timeout(Duration::from_secs(5), dispatcher.execute(lease, 0, &mut rx))
            .await
            .expect("retry sleep should end on shutdown");

        let job = dispatcher.store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.error.is_none());
        assert!(!dispatcher.store.is_leased(&id));
    }
}
