//! Background job execution engine.
//!
//! - **Registry**: named async handlers, bound at dispatch time
//! - **Store**: authoritative job table with an exclusive execution lease
//! - **Scheduler**: periodic tick promoting due delayed jobs
//! - **Worker**: fixed pool leasing jobs, enforcing deadlines, retrying failures
//! - **Events**: broadcast stream of lifecycle notifications
//! - **Queue**: the public facade composing the above
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               JobQueue                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  enqueue/schedule ──▶ ┌──────────┐ ◀── promote ── ┌───────────┐          │
//! │                       │ JobStore │                │ Scheduler │          │
//! │                       └──────────┘                └───────────┘          │
//! │                            ▲ try_lease / transition                      │
//! │                            │                                             │
//! │  ┌──────────┐  lookup ┌──────────┐  emit  ┌──────────┐                   │
//! │  │ Registry │ ◀────── │ Workers  │ ─────▶ │ EventBus │ ──▶ subscribers   │
//! │  └──────────┘         └──────────┘        └──────────┘                   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use jobforge_core::jobs::{JobConfig, JobContext, JobQueue};
//! use jobforge_core::config::QueueConfig;
//!
//! # async fn run() -> jobforge_core::Result<()> {
//! let queue = JobQueue::new(QueueConfig::default())?;
//! queue.register("echo", |ctx: JobContext| async move { Ok(ctx.into_payload()) });
//! queue.start()?;
//!
//! let id = queue.enqueue("echo", serde_json::json!({ "x": 1 }), JobConfig::default())?;
//! # let _ = id;
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod events;
pub mod job;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use builtin::{register_builtins, EchoHandler, SleepHandler};
pub use events::{EventBus, JobEvent};
pub use job::{
    HandlerResult, Job, JobConfig, JobContext, JobError, JobErrorKind, JobId, JobPriority,
    JobStatus,
};
pub use queue::{JobQueue, JobQueueBuilder};
pub use registry::{HandlerRegistry, JobHandler};
pub use scheduler::{ScheduleSpec, Scheduler};
pub use store::{JobLease, JobStore, QueueStats, Transition};
pub use worker::{WorkerPool, WorkerStats};
