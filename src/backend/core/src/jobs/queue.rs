//! The public job queue.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use super::events::{EventBus, JobEvent};
use super::job::{Job, JobConfig, JobId, JobStatus};
use super::registry::{HandlerRegistry, JobHandler};
use super::scheduler::{ScheduleSpec, Scheduler};
use super::store::{JobStore, QueueStats};
use super::worker::{Dispatcher, WorkerPool, WorkerStats};
use crate::config::{Config, QueueConfig};
use crate::error::{JobforgeError, Result};
use crate::telemetry::JobMetrics;

/// Tasks owned by a started queue.
struct RunningQueue {
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    workers: WorkerPool,
}

/// In-process job queue.
///
/// Owns its store, handler registry, event bus and worker tasks. Jobs can be
/// enqueued before [`start`](Self::start); they wait as `Pending` until
/// workers exist.
pub struct JobQueue {
    config: QueueConfig,
    defaults: JobConfig,
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    events: EventBus,
    wakeup: Arc<Notify>,
    stats: WorkerStats,
    running: Mutex<Option<RunningQueue>>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.config.name)
            .field("workers", &self.config.workers)
            .field("jobs", &self.store.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl JobQueue {
    /// Create a queue with default job policy.
    pub fn new(config: QueueConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Create a queue from loaded application configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::builder()
            .config(config.queue.clone())
            .job_defaults(config.defaults.to_job_config())
            .build()
    }

    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Job policy used by [`enqueue_default`](Self::enqueue_default).
    pub fn job_defaults(&self) -> &JobConfig {
        &self.defaults
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a handler for `name`, replacing any previous one.
    pub fn register<H: JobHandler>(&self, name: impl Into<String>, handler: H) {
        self.registry.register(name, handler);
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Submit a job.
    ///
    /// The job is `Scheduled` if `config.scheduled_at` lies in the future and
    /// `Pending` otherwise.
    pub fn enqueue(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        config: JobConfig,
    ) -> Result<JobId> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(JobforgeError::validation("Job name must not be empty"));
        }

        let job = Job::new(name, payload, config);
        let status = job.status;
        let name = job.name.clone();
        let id = self.store.insert(job)?;

        JobMetrics::record_enqueued(&self.config.name, &name);
        tracing::debug!(
            queue = %self.config.name,
            job_id = %id,
            job_name = %name,
            status = %status,
            "Job enqueued"
        );
        self.events.emit(JobEvent::Added { job_id: id, name });

        if status == JobStatus::Pending {
            self.wakeup.notify_one();
        }
        Ok(id)
    }

    /// Submit a job with the queue's default policy.
    pub fn enqueue_default(&self, name: impl Into<String>, payload: serde_json::Value) -> Result<JobId> {
        self.enqueue(name, payload, self.defaults.clone())
    }

    /// Submit a job that becomes runnable after `delay`.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        delay: Duration,
        config: JobConfig,
    ) -> Result<JobId> {
        self.schedule_with(name, payload, ScheduleSpec::Delay(delay), config)
    }

    /// Submit a job that becomes runnable at the schedule's next fire time.
    pub fn schedule_with(
        &self,
        name: impl Into<String>,
        payload: serde_json::Value,
        spec: ScheduleSpec,
        config: JobConfig,
    ) -> Result<JobId> {
        let at = spec.next_fire(Utc::now())?;
        self.enqueue(name, payload, config.scheduled_for(at))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        self.store.get(id)
    }

    /// Jobs in `status`, in dispatch order.
    pub fn get_jobs_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.store.list_by_status(status)
    }

    pub fn get_stats(&self) -> QueueStats {
        self.store.counts()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    /// Receive lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a failed job again with a fresh attempt budget.
    pub fn retry_job(&self, id: &JobId) -> Result<Job> {
        let job = self.store.reset_failed(id)?;
        tracing::info!(queue = %self.config.name, job_id = %id, job_name = %job.name, "Job reset for retry");
        self.wakeup.notify_one();
        Ok(job)
    }

    /// Delete a job that is not currently executing.
    pub fn remove_job(&self, id: &JobId) -> Result<Job> {
        self.store.remove(id)
    }

    /// Delete every completed job.
    pub fn clear_completed(&self) -> usize {
        let removed = self.store.clear_completed();
        if removed > 0 {
            tracing::debug!(queue = %self.config.name, removed, "Cleared completed jobs");
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the scheduler and workers. Calling it on a running queue does nothing.
    ///
    /// # Errors
    ///
    /// Fails outside a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        tokio::runtime::Handle::try_current().map_err(|e| {
            JobforgeError::internal("JobQueue::start requires a Tokio runtime").with_source(e)
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            Arc::clone(&self.store),
            self.events.clone(),
            Arc::clone(&self.wakeup),
            self.config.tick_interval,
            self.config.name.clone(),
        )
        .spawn(shutdown_rx.clone());

        let dispatcher = Arc::new(Dispatcher {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            wakeup: Arc::clone(&self.wakeup),
            stats: self.stats.clone(),
            idle_interval: self.config.idle_interval,
            queue_name: self.config.name.clone(),
        });
        let workers = WorkerPool::spawn(dispatcher, self.config.workers, &shutdown_rx);

        *running = Some(RunningQueue {
            shutdown,
            scheduler,
            workers,
        });

        tracing::info!(
            queue = %self.config.name,
            workers = self.config.workers,
            "Job queue started"
        );
        Ok(())
    }

    /// Stop the queue and wait for it to drain.
    ///
    /// Workers finish the attempt they are running. A worker waiting out a
    /// retry delay requeues the job immediately. Returns once every worker and
    /// the scheduler have exited. Calling it on a stopped queue does nothing.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        tracing::info!(queue = %self.config.name, "Stopping job queue");
        let _ = running.shutdown.send(true);

        if let Err(e) = running.scheduler.await {
            tracing::error!(queue = %self.config.name, error = %e, "Scheduler task terminated abnormally");
        }
        running.workers.join().await;

        let stats = self.store.counts();
        tracing::info!(
            queue = %self.config.name,
            pending = stats.pending,
            scheduled = stats.scheduled,
            completed = stats.completed,
            failed = stats.failed,
            processed = self.stats.processed(),
            "Job queue stopped"
        );
        self.events.emit(JobEvent::Stopped);
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`JobQueue`].
#[derive(Debug, Default)]
pub struct JobQueueBuilder {
    config: QueueConfig,
    defaults: JobConfig,
    registry: Option<Arc<HandlerRegistry>>,
}

impl JobQueueBuilder {
    /// Replace the whole queue config.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.config.idle_interval = interval;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Policy for [`JobQueue::enqueue_default`].
    pub fn job_defaults(mut self, defaults: JobConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Share a registry with other queues.
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<JobQueue> {
        self.config.validate()?;
        self.defaults.validate()?;

        Ok(JobQueue {
            events: EventBus::new(self.config.event_capacity),
            config: self.config,
            defaults: self.defaults,
            store: Arc::new(JobStore::new()),
            registry: self.registry.unwrap_or_default(),
            wakeup: Arc::new(Notify::new()),
            stats: WorkerStats::new(),
            running: Mutex::new(None),
        })
    }
}
