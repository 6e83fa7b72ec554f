use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use ::futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{ActivityHandler, Runtime};
use crate::{ActivityError, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, RetryPolicy};

/// Metadata handed to an activity for one attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    call_index: u64,
    activity_name: String,
    attempt: u32,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, call_index: u64, activity_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            call_index,
            activity_name: activity_name.into(),
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn call_index(&self) -> u64 {
        self.call_index
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "durable_pipeline::activity",
            instance_id = %self.instance_id,
            call_index = self.call_index,
            activity_name = %self.activity_name,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "durable_pipeline::activity",
            instance_id = %self.instance_id,
            call_index = self.call_index,
            activity_name = %self.activity_name,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ActivityWorkItem {
    pub instance: String,
    pub call_index: u64,
    pub name: String,
    pub input: String,
}

pub(crate) fn spawn_workers(rt: Arc<Runtime>, rx: mpsc::UnboundedReceiver<ActivityWorkItem>) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..rt.options().worker_concurrency.max(1))
        .map(|worker_id| {
            let rt = rt.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(item) = next else {
                        break;
                    };
                    run_work_item(&rt, worker_id, item).await;
                }
            })
        })
        .collect()
}

async fn run_work_item(rt: &Runtime, worker_id: usize, item: ActivityWorkItem) {
    if rt.is_terminated(&item.instance).await {
        tracing::debug!(
            target: "durable_pipeline::runtime",
            instance_id = %item.instance,
            call_index = item.call_index,
            activity_name = %item.name,
            "instance was terminated; skipping activity"
        );
        return;
    }

    let event = match rt.activity_handler(&item.name) {
        Some(handler) => {
            let policy = handler
                .retry_policy()
                .unwrap_or_else(|| rt.options().activity_retry.clone());
            match execute_with_retry(&handler, &item, &policy, worker_id).await {
                Ok(output) => Event::Completed {
                    call_index: item.call_index,
                    output,
                },
                Err(err) => Event::Failed {
                    call_index: item.call_index,
                    details: ErrorDetails::Application {
                        kind: AppErrorKind::ActivityFailed,
                        message: err.message,
                        retryable: err.retryable,
                        call_index: None,
                    },
                },
            }
        }
        None => Event::Failed {
            call_index: item.call_index,
            details: ErrorDetails::configuration(ConfigErrorKind::UnregisteredActivity, &item.name, None),
        },
    };
    rt.deliver(&item.instance, event);
}

/// Run attempts until success, a permanent failure, or the policy's attempt
/// budget is spent. Returns the last error on failure.
pub(crate) async fn execute_with_retry(
    handler: &Arc<dyn ActivityHandler>,
    item: &ActivityWorkItem,
    policy: &RetryPolicy,
    worker_id: usize,
) -> Result<String, ActivityError> {
    let mut attempt = 1;
    loop {
        let ctx = ActivityContext::new(&item.instance, item.call_index, &item.name, attempt);
        let started = Instant::now();
        let invocation = AssertUnwindSafe(handler.invoke(ctx, item.input.clone())).catch_unwind();
        let outcome = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Ok(Err(ActivityError::retryable(format!(
                    "attempt timed out after {} ms",
                    limit.as_millis()
                )))),
            },
            None => invocation.await,
        };
        let outcome = outcome.unwrap_or_else(|_| Err(ActivityError::permanent("activity panicked")));
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                tracing::debug!(
                    target: "durable_pipeline::runtime",
                    instance_id = %item.instance,
                    call_index = item.call_index,
                    activity_name = %item.name,
                    worker_id,
                    attempt,
                    outcome = "success",
                    duration_ms,
                    "activity completed"
                );
                return Ok(output);
            }
            Err(err) if err.retryable && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    target: "durable_pipeline::runtime",
                    instance_id = %item.instance,
                    call_index = item.call_index,
                    activity_name = %item.name,
                    worker_id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "activity attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                tracing::warn!(
                    target: "durable_pipeline::runtime",
                    instance_id = %item.instance,
                    call_index = item.call_index,
                    activity_name = %item.name,
                    worker_id,
                    attempt,
                    outcome = "failed",
                    retryable = err.retryable,
                    duration_ms,
                    error = %err,
                    "activity failed"
                );
                return Err(err);
            }
        }
    }
}
