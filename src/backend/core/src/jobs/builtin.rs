//! Built-in job handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{HandlerRegistry, HandlerResult, JobContext, JobError, JobHandler};

/// Handler: return the payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl EchoHandler {
    pub const NAME: &'static str = "echo";
}

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        ctx.log_info("Echoing payload");
        Ok(ctx.into_payload())
    }
}

/// Payload for [`SleepHandler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepPayload {
    /// How long to sleep, in milliseconds
    pub ms: u64,
    /// Fail after sleeping instead of succeeding
    #[serde(default)]
    pub fail: bool,
}

/// Handler: sleep for `ms` milliseconds, then report how long it slept.
#[derive(Debug, Clone, Copy)]
pub struct SleepHandler {
    /// Upper bound on a single sleep
    pub max_sleep: Duration,
}

impl SleepHandler {
    pub const NAME: &'static str = "sleep";

    pub fn new() -> Self {
        Self {
            max_sleep: Duration::from_secs(300),
        }
    }
}

impl Default for SleepHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        let payload: SleepPayload = ctx.payload_as()?;
        let duration = Duration::from_millis(payload.ms);
        if duration > self.max_sleep {
            return Err(JobError::new(format!(
                "Requested sleep of {}ms exceeds the {}ms limit",
                payload.ms,
                self.max_sleep.as_millis()
            )));
        }

        ctx.log_info(&format!("Sleeping for {}ms", payload.ms));
        tokio::time::sleep(duration).await;

        if payload.fail {
            return Err(JobError::new("Sleep finished with requested failure"));
        }
        Ok(serde_json::json!({ "slept_ms": payload.ms }))
    }
}

/// Register every built-in handler under its default name.
pub fn register_builtins(registry: &HandlerRegistry) {
    registry.register(EchoHandler::NAME, EchoHandler);
    registry.register(SleepHandler::NAME, SleepHandler::new());
}
