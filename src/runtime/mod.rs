//! The orchestration engine.
//!
//! A [`Runtime`] owns two loops:
//!
//! - the orchestration dispatcher, which receives start/resume/result
//!   messages and advances one instance at a time (a per-instance lock keeps
//!   a single writer per history), and
//! - a pool of activity workers that execute scheduled activities with
//!   bounded retry and report results back as messages.
//!
//! Advancing an instance means: append the new result, re-run the
//! orchestration function over the extended history ([`replay::run_turn`]),
//! commit the decisions it makes, then dispatch them.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::{HistoryStore, InstanceRecord, InstanceUpdate, ParentLink, ProviderError};
use crate::{
    ActivityError, Action, AppErrorKind, ConfigErrorKind, EngineError, ErrorDetails, Event, OrchestrationContext,
    RetryPolicy, WaitError,
};

pub mod registry;
pub mod replay;
mod status;
mod worker;

pub use registry::{ActivityRegistry, OrchestrationRegistry};
pub use status::{InstanceStatus, RuntimeStatus};
pub use worker::ActivityContext;

use replay::TurnOutcome;
use worker::ActivityWorkItem;

const PROVIDER_RETRY_ATTEMPTS: u32 = 3;
const PROVIDER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Orchestration function registered under a workflow name.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;

    /// Required-field validation, run before the instance ever reaches Running.
    fn validate(&self, _input: &str) -> Result<(), String> {
        Ok(())
    }
}

type Validator = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Adapts an `async` closure into an [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    f: F,
    validator: Option<Validator>,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            validator: None,
            _marker: PhantomData,
        }
    }

    pub fn with_validator(mut self, validator: impl Fn(&str) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }
}

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.f)(ctx, input).await
    }

    fn validate(&self, input: &str) -> Result<(), String> {
        match &self.validator {
            Some(v) => v(input),
            None => Ok(()),
        }
    }
}

/// Unit of side-effecting work executed by the worker pool.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError>;

    /// Policy overriding [`RuntimeOptions::activity_retry`] for this activity.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

pub struct FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f, _marker: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        (self.f)(ctx, input).await
    }
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Activity workers running concurrently.
    pub worker_concurrency: usize,
    /// Retry policy for activities without their own override.
    pub activity_retry: RetryPolicy,
    /// Resume non-terminal instances found in the store on start.
    pub resume_on_start: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            activity_retry: RetryPolicy::default(),
            resume_on_start: true,
        }
    }
}

/// Response to a successful start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedInstance {
    pub instance_id: String,
    /// Locator for status queries about this instance.
    pub status_query_url: String,
}

#[derive(Debug, Clone)]
pub(crate) enum OrchestratorMsg {
    Start { instance: String },
    Resume { instance: String },
    Resolve { instance: String, event: Event },
}

impl OrchestratorMsg {
    fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::Start { instance }
            | OrchestratorMsg::Resume { instance }
            | OrchestratorMsg::Resolve { instance, .. } => instance,
        }
    }
}

pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
    orch_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    work_tx: mpsc::UnboundedSender<ActivityWorkItem>,
    instance_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    joins: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub async fn start(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();

        let (orch_tx, orch_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let rt = Arc::new(Self {
            store,
            activities,
            orchestrations,
            options,
            orch_tx,
            work_tx,
            instance_locks: Mutex::new(HashMap::new()),
            joins: tokio::sync::Mutex::new(Vec::new()),
        });

        let mut joins = vec![rt.clone().spawn_orchestration_dispatcher(orch_rx)];
        joins.extend(worker::spawn_workers(rt.clone(), work_rx));
        rt.joins.lock().await.extend(joins);

        debug!(
            orchestrations = ?rt.orchestrations.list_names(),
            activities = ?rt.activities.list_names(),
            workers = rt.options.worker_concurrency,
            "runtime started"
        );

        if rt.options.resume_on_start {
            if let Err(e) = rt.resume_instances().await {
                error!(error = %e, "failed to scan store for instances to resume");
            }
        }
        rt
    }

    /// Abort the dispatcher and every worker. In-flight activity attempts are dropped.
    pub async fn shutdown(&self) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        debug!("runtime stopped");
    }

    /// Start a new instance under a generated id.
    ///
    /// Fails with [`EngineError::UnknownWorkflow`] for unregistered names and
    /// [`EngineError::InvalidInput`] for payloads that are not JSON or that
    /// the orchestration's validation rejects. No instance is created then.
    pub async fn start_orchestration(&self, name: &str, input: impl Into<String>) -> Result<StartedInstance, EngineError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration_with_id(&instance, name, input).await
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        name: &str,
        input: &In,
    ) -> Result<StartedInstance, EngineError> {
        let payload = serde_json::to_string(input).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        self.start_orchestration(name, payload).await
    }

    pub async fn start_orchestration_with_id(
        &self,
        instance: &str,
        name: &str,
        input: impl Into<String>,
    ) -> Result<StartedInstance, EngineError> {
        let input = input.into();
        let handler = self
            .orchestrations
            .get(name)
            .ok_or_else(|| EngineError::UnknownWorkflow(name.to_string()))?;
        serde_json::from_str::<serde_json::Value>(&input)
            .map_err(|e| EngineError::InvalidInput(format!("input is not valid JSON: {e}")))?;
        handler.validate(&input).map_err(EngineError::InvalidInput)?;

        let record = InstanceRecord::new(instance, name, input, None);
        if !self.store.create_instance(record).await? {
            return Err(EngineError::AlreadyExists(instance.to_string()));
        }
        info!(instance_id = %instance, orchestration_name = %name, "instance created");
        self.send(OrchestratorMsg::Start {
            instance: instance.to_string(),
        });
        Ok(StartedInstance {
            instance_id: instance.to_string(),
            status_query_url: format!("/runtime/instances/{instance}"),
        })
    }

    pub async fn get_status(&self, instance: &str) -> Result<InstanceStatus, EngineError> {
        self.store
            .instance(instance)
            .await?
            .map(|r| r.to_status())
            .ok_or_else(|| EngineError::NotFound(instance.to_string()))
    }

    pub async fn get_history(&self, instance: &str) -> Result<Vec<Event>, EngineError> {
        if self.store.instance(instance).await?.is_none() {
            return Err(EngineError::NotFound(instance.to_string()));
        }
        Ok(self.store.read(instance).await?)
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(&self, instance: &str, timeout: Duration) -> Result<InstanceStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Mark a non-terminal instance Terminated.
    ///
    /// No further passes run for it and results of in-flight work are
    /// discarded when they arrive. A terminated child resolves its parent's
    /// call as a failure; children of a terminated instance keep running.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        let lock = self.instance_lock(instance);
        let guard = lock.lock().await;

        let record = self
            .store
            .instance(instance)
            .await?
            .ok_or_else(|| EngineError::NotFound(instance.to_string()))?;
        if record.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                instance: instance.to_string(),
                from: record.status,
                to: RuntimeStatus::Terminated,
            });
        }

        let update = InstanceUpdate::terminated(ErrorDetails::application(AppErrorKind::Terminated, reason.clone()));
        self.store
            .commit(
                instance,
                vec![Event::InstanceTerminated { reason: reason.clone() }],
                Some(update.clone()),
            )
            .await?;
        info!(instance_id = %instance, reason = %reason, "instance terminated");

        let mut done = record;
        done.apply(Some(update));
        drop(guard);
        self.forget_lock(instance);
        self.notify_parent(&done);
        Ok(())
    }

    pub(crate) fn deliver(&self, instance: &str, event: Event) {
        self.send(OrchestratorMsg::Resolve {
            instance: instance.to_string(),
            event,
        });
    }

    pub(crate) async fn is_terminal(&self, instance: &str) -> bool {
        matches!(self.store.instance(instance).await, Ok(Some(r)) if r.status.is_terminal())
    }

    /// Only an operator cancel stops queued work; Completed and Failed
    /// instances still let their scheduled siblings run.
    pub(crate) async fn is_terminated(&self, instance: &str) -> bool {
        matches!(self.store.instance(instance).await, Ok(Some(r)) if r.status == RuntimeStatus::Terminated)
    }

    pub(crate) fn activity_handler(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.activities.get(name)
    }

    pub(crate) fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    fn send(&self, msg: OrchestratorMsg) {
        if let Err(e) = self.orch_tx.send(msg) {
            warn!(instance_id = %e.0.instance(), "orchestration dispatcher is stopped; message dropped");
        }
    }

    fn instance_lock(&self, instance: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.instance_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(instance.to_string()).or_default().clone()
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.instance_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn forget_lock(&self, instance: &str) {
        self.instance_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance);
    }

    fn spawn_orchestration_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<OrchestratorMsg>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let rt = self.clone();
                tokio::spawn(async move { rt.process(msg).await });
            }
        })
    }

    async fn resume_instances(&self) -> Result<(), ProviderError> {
        let mut resumed = 0usize;
        for id in self.store.list_instances().await? {
            let Some(record) = self.store.instance(&id).await? else {
                continue;
            };
            if record.status.is_terminal() {
                continue;
            }
            // Children of live parents are re-attached by the parent's resume.
            if let Some(parent) = &record.parent {
                if !self.is_terminal(&parent.instance).await && self.store.instance(&parent.instance).await?.is_some() {
                    continue;
                }
            }
            self.send(OrchestratorMsg::Resume { instance: id });
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "resuming non-terminal instances");
        }
        Ok(())
    }

    async fn process(self: Arc<Self>, msg: OrchestratorMsg) {
        let instance = msg.instance().to_string();
        let mut attempt = 1;
        loop {
            match self.advance_instance(msg.clone()).await {
                Ok(()) => return,
                Err(EngineError::Provider(e)) if e.is_retryable() && attempt < PROVIDER_RETRY_ATTEMPTS => {
                    warn!(instance_id = %instance, attempt, error = %e, "retrying after store error");
                    tokio::time::sleep(PROVIDER_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(instance_id = %instance, error = %e, "failed to advance instance");
                    return;
                }
            }
        }
    }

    async fn advance_instance(&self, msg: OrchestratorMsg) -> Result<(), EngineError> {
        let instance = msg.instance().to_string();
        let lock = self.instance_lock(&instance);
        let _guard = lock.lock().await;

        let Some(record) = self.store.instance(&instance).await? else {
            warn!(instance_id = %instance, "message for unknown instance dropped");
            self.forget_lock(&instance);
            return Ok(());
        };
        if record.status.is_terminal() {
            debug!(instance_id = %instance, status = %record.status, "instance is terminal; message discarded");
            self.forget_lock(&instance);
            return Ok(());
        }
        let history = self.store.read(&instance).await?;

        let mut pending: Vec<Event> = Vec::new();
        match msg {
            OrchestratorMsg::Start { .. } => {}
            OrchestratorMsg::Resume { .. } => {
                if record.status == RuntimeStatus::Running {
                    self.redispatch_outstanding(&instance, &history).await;
                }
            }
            OrchestratorMsg::Resolve { event, .. } => {
                let Some(call_index) = event.call_index() else {
                    return Ok(());
                };
                if !is_outstanding(&history, call_index) {
                    debug!(instance_id = %instance, call_index, "dropping late or unmatched result");
                    return Ok(());
                }
                if let Event::Failed { details, .. } = &event {
                    warn!(instance_id = %instance, call_index, error = %details, "scheduled call failed");
                }
                pending.push(event);
            }
        }

        let Some(handler) = self.orchestrations.get(&record.name) else {
            let details = ErrorDetails::configuration(ConfigErrorKind::UnregisteredOrchestration, &record.name, None);
            return self.finish(&record, pending, Err(details)).await;
        };

        if record.status == RuntimeStatus::Pending {
            if let Err(message) = handler.validate(&record.input) {
                warn!(instance_id = %instance, error = %message, "input rejected before first pass");
                return self.finish(&record, pending, Err(ErrorDetails::Validation { message })).await;
            }
            self.store.commit(&instance, Vec::new(), Some(InstanceUpdate::running())).await?;
            debug!(instance_id = %instance, orchestration_name = %record.name, "instance running");
        }

        let mut to_dispatch = Vec::new();
        loop {
            let view: Vec<Event> = history.iter().chain(pending.iter()).cloned().collect();
            let turn = replay::run_turn(&instance, &view, handler.clone(), record.input.clone());
            debug!(instance_id = %instance, calls = turn.calls, new_events = turn.new_events.len(), "pass finished");
            pending.extend(turn.new_events);
            match turn.outcome {
                TurnOutcome::Suspended => {
                    let mut resolved_now = false;
                    for action in turn.actions {
                        match self.unregistered_target(&action) {
                            Some(details) => {
                                warn!(instance_id = %instance, call_index = action.call_index(), error = %details, "scheduled call has no handler");
                                pending.push(Event::Failed {
                                    call_index: action.call_index(),
                                    details,
                                });
                                resolved_now = true;
                            }
                            None => to_dispatch.push(action),
                        }
                    }
                    if resolved_now {
                        continue;
                    }
                    self.store.commit(&instance, pending, None).await?;
                    break;
                }
                TurnOutcome::Completed(output) => {
                    self.finish(&record, pending, Ok(output)).await?;
                    break;
                }
                TurnOutcome::Failed(details) => {
                    self.finish(&record, pending, Err(details)).await?;
                    break;
                }
            }
        }

        // Siblings scheduled alongside an inline failure are committed, so they run
        // even when the pass that follows ends the instance.
        for action in to_dispatch {
            if let Err(e) = self.dispatch(&instance, action).await {
                error!(instance_id = %instance, error = %e, "dispatch failed; will be retried on resume");
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        record: &InstanceRecord,
        mut events: Vec<Event>,
        outcome: Result<String, ErrorDetails>,
    ) -> Result<(), EngineError> {
        let update = match outcome {
            Ok(output) => {
                events.push(Event::InstanceCompleted { output: output.clone() });
                InstanceUpdate::completed(output)
            }
            Err(details) => {
                events.push(Event::InstanceFailed {
                    details: details.clone(),
                });
                InstanceUpdate::failed(details)
            }
        };
        self.store
            .commit(&record.instance_id, events, Some(update.clone()))
            .await?;

        match &update.error {
            None => info!(instance_id = %record.instance_id, orchestration_name = %record.name, "instance completed"),
            Some(details) => warn!(
                instance_id = %record.instance_id,
                orchestration_name = %record.name,
                error = %details,
                "instance failed"
            ),
        }

        let mut done = record.clone();
        done.apply(Some(update));
        self.forget_lock(&record.instance_id);
        self.notify_parent(&done);
        Ok(())
    }

    fn notify_parent(&self, child: &InstanceRecord) {
        if let Some((parent, event)) = resolution_for_parent(child) {
            debug!(instance_id = %parent, child_instance = %child.instance_id, "reporting child result to parent");
            self.deliver(&parent, event);
        }
    }

    fn unregistered_target(&self, action: &Action) -> Option<ErrorDetails> {
        match action {
            Action::CallActivity { name, .. } if !self.activities.has(name) => Some(ErrorDetails::configuration(
                ConfigErrorKind::UnregisteredActivity,
                name,
                None,
            )),
            Action::StartSubOrchestration { name, .. } if !self.orchestrations.has(name) => Some(
                ErrorDetails::configuration(ConfigErrorKind::UnregisteredOrchestration, name, None),
            ),
            _ => None,
        }
    }

    async fn redispatch_outstanding(&self, instance: &str, history: &[Event]) {
        for e in history {
            let Some(call_index) = e.call_index() else {
                continue;
            };
            if !matches!(e, Event::Scheduled { .. }) || !is_outstanding(history, call_index) {
                continue;
            }
            if let Some(action) = Action::from_scheduled(instance, e) {
                debug!(instance_id = %instance, call_index, "re-dispatching outstanding call");
                if let Err(err) = self.dispatch(instance, action).await {
                    error!(instance_id = %instance, call_index, error = %err, "re-dispatch failed");
                }
            }
        }
    }

    async fn dispatch(&self, instance: &str, action: Action) -> Result<(), EngineError> {
        match action {
            Action::CallActivity { call_index, name, input } => {
                debug!(instance_id = %instance, call_index, activity_name = %name, "dispatching activity");
                let item = ActivityWorkItem {
                    instance: instance.to_string(),
                    call_index,
                    name,
                    input,
                };
                if self.work_tx.send(item).is_err() {
                    warn!(instance_id = %instance, call_index, "worker pool is stopped; activity dropped");
                }
            }
            Action::StartSubOrchestration {
                call_index,
                name,
                instance: child,
                input,
            } => {
                let record = InstanceRecord::new(
                    &child,
                    &name,
                    input,
                    Some(ParentLink {
                        instance: instance.to_string(),
                        call_index,
                    }),
                );
                if self.store.create_instance(record).await? {
                    debug!(instance_id = %instance, call_index, child_instance = %child, "child instance created");
                    self.send(OrchestratorMsg::Start { instance: child });
                } else {
                    match self.store.instance(&child).await? {
                        Some(existing) if existing.status.is_terminal() => self.notify_parent(&existing),
                        Some(_) => self.send(OrchestratorMsg::Resume { instance: child }),
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }
}

/// Scheduled in history and not yet resolved.
fn is_outstanding(history: &[Event], call_index: u64) -> bool {
    let mut scheduled = false;
    for e in history {
        match e {
            Event::Scheduled { call_index: i, .. } if *i == call_index => scheduled = true,
            Event::Completed { call_index: i, .. } | Event::Failed { call_index: i, .. } if *i == call_index => {
                return false;
            }
            _ => {}
        }
    }
    scheduled
}

/// Event that resolves the parent's call for a terminal child.
fn resolution_for_parent(child: &InstanceRecord) -> Option<(String, Event)> {
    let parent = child.parent.as_ref()?;
    let call_index = parent.call_index;
    let event = match child.status {
        RuntimeStatus::Completed => Event::Completed {
            call_index,
            output: child.output.clone().unwrap_or_default(),
        },
        RuntimeStatus::Failed => {
            let message = child
                .error
                .as_ref()
                .map(|d| d.display_message())
                .unwrap_or_else(|| "sub-orchestration failed".to_string());
            Event::Failed {
                call_index,
                details: ErrorDetails::application(AppErrorKind::SubOrchestrationFailed, message),
            }
        }
        RuntimeStatus::Terminated => {
            let reason = child.error.as_ref().map(|d| d.display_message()).unwrap_or_default();
            Event::Failed {
                call_index,
                details: ErrorDetails::application(
                    AppErrorKind::Terminated,
                    format!("sub-orchestration {} was terminated: {reason}", child.instance_id),
                ),
            }
        }
        RuntimeStatus::Pending | RuntimeStatus::Running => return None,
    };
    Some((parent.instance.clone(), event))
}
