#![allow(clippy::result_large_err)]
//! # Jobforge Core
//!
//! Concurrent background job execution engine.
//!
//! ## Architecture
//!
//! - **Jobs**: handler registry, job store with execution leases, scheduler,
//!   worker pool and the [`JobQueue`](jobs::JobQueue) facade
//! - **Config**: layered file and environment configuration
//! - **Error**: error type with stable machine-readable codes
//! - **Telemetry**: structured logging and Prometheus job metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, JobforgeError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, JobDefaults, QueueConfig};
    pub use crate::error::{ErrorCode, ErrorContext, JobforgeError, Result};
    pub use crate::jobs::{
        EventBus, HandlerRegistry, HandlerResult, Job, JobConfig, JobContext, JobError,
        JobErrorKind, JobEvent, JobHandler, JobId, JobPriority, JobQueue, JobStatus, QueueStats,
        ScheduleSpec, WorkerStats,
    };
}
