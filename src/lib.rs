//! Replay-driven durable orchestration for multi-stage file pipelines.
//!
//! Orchestrations are plain `async` functions that schedule work through an
//! [`OrchestrationContext`]. Every scheduling call is assigned the next
//! `call_index`; the engine records decisions and results as append-only
//! [`Event`]s and re-runs the function from the top whenever a result arrives.
//! Already-resolved calls fast-forward, the first unresolved one suspends the
//! pass.
//!
//! - Data model: [`Event`], [`Action`], [`TaskKind`]
//! - Context and futures: [`OrchestrationContext`], [`DurableFuture`], [`WaitAllFuture`]
//! - Engine: [`Runtime`] with pluggable [`providers::HistoryStore`]s
//! - Storage collaborator and move protocol: [`storage`]
//! - The file pipeline itself: [`pipeline`]
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use durable_pipeline::providers::in_memory::InMemoryHistoryStore;
//! use durable_pipeline::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
//! use durable_pipeline::{ActivityContext, OrchestrationContext, Runtime};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move { Ok(format!("hello {name}")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloTwice", |ctx: OrchestrationContext, _input: String| async move {
//!         let a = ctx.schedule_activity("Greet", "a");
//!         let b = ctx.schedule_activity("Greet", "b");
//!         let out = ctx.wait_all(vec![a, b]).await?;
//!         Ok(out.join(", "))
//!     })
//!     .build();
//! let rt = Runtime::start(Arc::new(InMemoryHistoryStore::new()), activities, orchestrations).await;
//! let started = rt.start_orchestration("HelloTwice", "{}").await?;
//! let status = rt
//!     .wait_for_orchestration(&started.instance_id, std::time::Duration::from_secs(5))
//!     .await?;
//! println!("{:?}", status.output);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod errors;
pub mod futures;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod storage;

pub use crate::config::PipelineConfig;
pub use crate::errors::{ActivityError, AppErrorKind, ConfigErrorKind, EngineError, ErrorDetails, WaitError};
pub use crate::futures::{DurableFuture, FanInError, WaitAllFuture};
pub use crate::retry::{BackoffStrategy, RetryPolicy};
pub use crate::runtime::{
    ActivityContext, ActivityHandler, InstanceStatus, OrchestrationHandler, Runtime, RuntimeOptions, RuntimeStatus,
    StartedInstance,
};

use crate::_typed_codec::Codec;

// JSON at the typed boundary. Strings travel raw so plain-text payloads stay readable in history.
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(first) => {
                    // Raw strings were encoded without quotes.
                    serde_json::from_value(Value::String(s.to_string())).map_err(|_| first.to_string())
                }
            }
        }
    }
}

/// What a scheduled call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Activity,
    SubOrchestration,
}

/// Append-only history entries. `call_index` pairs a `Scheduled` decision
/// with its single `Completed` or `Failed` resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InstanceStarted {
        name: String,
        input: String,
        parent_instance: Option<String>,
        parent_call_index: Option<u64>,
    },
    Scheduled {
        call_index: u64,
        kind: TaskKind,
        target: String,
        input: String,
    },
    Completed {
        call_index: u64,
        output: String,
    },
    Failed {
        call_index: u64,
        details: ErrorDetails,
    },
    InstanceCompleted {
        output: String,
    },
    InstanceFailed {
        details: ErrorDetails,
    },
    InstanceTerminated {
        reason: String,
    },
}

impl Event {
    pub fn call_index(&self) -> Option<u64> {
        match self {
            Event::Scheduled { call_index, .. } | Event::Completed { call_index, .. } | Event::Failed { call_index, .. } => {
                Some(*call_index)
            }
            _ => None,
        }
    }

    /// `Completed` or `Failed` for a scheduled call.
    pub fn is_resolution(&self) -> bool {
        matches!(self, Event::Completed { .. } | Event::Failed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::InstanceCompleted { .. } | Event::InstanceFailed { .. } | Event::InstanceTerminated { .. }
        )
    }
}

/// Work the engine must dispatch after a pass records new `Scheduled` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        call_index: u64,
        name: String,
        input: String,
    },
    StartSubOrchestration {
        call_index: u64,
        name: String,
        instance: String,
        input: String,
    },
}

impl Action {
    pub fn call_index(&self) -> u64 {
        match self {
            Action::CallActivity { call_index, .. } | Action::StartSubOrchestration { call_index, .. } => *call_index,
        }
    }

    /// Rebuild the dispatch for a `Scheduled` event that never got a result.
    pub fn from_scheduled(instance: &str, event: &Event) -> Option<Action> {
        match event {
            Event::Scheduled {
                call_index,
                kind: TaskKind::Activity,
                target,
                input,
            } => Some(Action::CallActivity {
                call_index: *call_index,
                name: target.clone(),
                input: input.clone(),
            }),
            Event::Scheduled {
                call_index,
                kind: TaskKind::SubOrchestration,
                target,
                input,
            } => Some(Action::StartSubOrchestration {
                call_index: *call_index,
                name: target.clone(),
                instance: sub_orchestration_id(instance, *call_index),
                input: input.clone(),
            }),
            _ => None,
        }
    }
}

/// Child instance id for the sub-orchestration scheduled at `call_index`.
///
/// A pure function of its arguments, so every replay of the parent targets
/// the same child.
pub fn sub_orchestration_id(parent: &str, call_index: u64) -> String {
    format!("{parent}::sub::{call_index}")
}

struct Recorded {
    kind: TaskKind,
    target: String,
    input: String,
}

struct Resolution {
    position: usize,
    result: Result<String, ErrorDetails>,
}

struct CtxInner {
    instance_id: String,
    recorded: HashMap<u64, Recorded>,
    recorded_frontier: u64,
    results: HashMap<u64, Resolution>,
    unobserved: HashSet<u64>,
    next_call_index: u64,
    new_events: Vec<Event>,
    actions: Vec<Action>,
    nondeterminism: Option<String>,
    fan_in_failure: Option<(u64, String)>,
}

/// Decisions collected from one pass over the orchestration function.
pub(crate) struct PassDecisions {
    pub new_events: Vec<Event>,
    pub actions: Vec<Action>,
    pub nondeterminism: Option<String>,
    /// Last failure raised by `wait_all`: failing call index and message.
    pub fan_in_failure: Option<(u64, String)>,
}

/// Replay-aware handle passed to orchestration functions.
///
/// Cheap to clone; all clones share the state of the current pass.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context for one pass over `history`.
    pub fn new(instance_id: impl Into<String>, history: &[Event]) -> Self {
        let mut recorded = HashMap::new();
        let mut recorded_frontier = 0;
        let mut results = HashMap::new();
        for (position, e) in history.iter().enumerate() {
            match e {
                Event::Scheduled {
                    call_index,
                    kind,
                    target,
                    input,
                } => {
                    recorded.insert(
                        *call_index,
                        Recorded {
                            kind: *kind,
                            target: target.clone(),
                            input: input.clone(),
                        },
                    );
                    recorded_frontier = recorded_frontier.max(call_index + 1);
                }
                Event::Completed { call_index, output } => {
                    results.entry(*call_index).or_insert(Resolution {
                        position,
                        result: Ok(output.clone()),
                    });
                }
                Event::Failed { call_index, details } => {
                    results.entry(*call_index).or_insert(Resolution {
                        position,
                        result: Err(details.clone()),
                    });
                }
                _ => {}
            }
        }
        let unobserved = results.keys().copied().collect();
        Self {
            inner: Arc::new(Mutex::new(CtxInner {
                instance_id: instance_id.into(),
                recorded,
                recorded_frontier,
                results,
                unobserved,
                next_call_index: 0,
                new_events: Vec::new(),
                actions: Vec::new(),
                nondeterminism: None,
                fan_in_failure: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // A panicking orchestration poisons the lock; the pass is failed anyway.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    /// True while the pass is re-executing decisions and results already in
    /// history. Use it to keep side-channel output (logs, metrics) from
    /// repeating on every replay.
    pub fn is_replaying(&self) -> bool {
        let g = self.lock();
        g.next_call_index < g.recorded_frontier || !g.unobserved.is_empty()
    }

    /// Schedule an activity. The returned future resolves to its output or
    /// to the error message of its last failed attempt.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule(TaskKind::Activity, name.into(), input.into())
    }

    /// Typed variant of [`schedule_activity`](Self::schedule_activity).
    pub fn schedule_activity_typed<N: Into<String>, In: Serialize, Out: serde::de::DeserializeOwned + Send>(
        &self,
        name: N,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + Send + use<N, In, Out> {
        let scheduled = _typed_codec::Json::encode(input).map(|payload| self.schedule_activity(name, payload));
        async move {
            match scheduled {
                Ok(fut) => fut.into_typed::<Out>().await,
                Err(e) => Err(format!("failed to encode activity input: {e}")),
            }
        }
    }

    /// Start a child instance. Its id is [`sub_orchestration_id`] of this
    /// instance and the assigned call index.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule(TaskKind::SubOrchestration, name.into(), input.into())
    }

    pub fn schedule_sub_orchestration_typed<N: Into<String>, In: Serialize, Out: serde::de::DeserializeOwned + Send>(
        &self,
        name: N,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + Send + use<N, In, Out> {
        let scheduled = _typed_codec::Json::encode(input).map(|payload| self.schedule_sub_orchestration(name, payload));
        async move {
            match scheduled {
                Ok(fut) => fut.into_typed::<Out>().await,
                Err(e) => Err(format!("failed to encode sub-orchestration input: {e}")),
            }
        }
    }

    /// Fan-in over tasks scheduled earlier. Results come back in submission
    /// order; the earliest recorded failure fails the whole group.
    pub fn wait_all(&self, tasks: Vec<DurableFuture>) -> WaitAllFuture {
        WaitAllFuture::new(self.clone(), tasks)
    }

    fn schedule(&self, kind: TaskKind, target: String, input: String) -> DurableFuture {
        let mut g = self.lock();
        let call_index = g.next_call_index;
        g.next_call_index += 1;
        let child = match kind {
            TaskKind::SubOrchestration => Some(sub_orchestration_id(&g.instance_id, call_index)),
            TaskKind::Activity => None,
        };
        let replayed = g.recorded.get(&call_index).map(|rec| {
            if rec.kind == kind && rec.target == target && rec.input == input {
                None
            } else {
                Some(format!(
                    "call index {call_index}: history has {:?} '{}' but this pass scheduled {kind:?} '{target}'",
                    rec.kind, rec.target
                ))
            }
        });
        match replayed {
            Some(Some(mismatch)) => {
                g.nondeterminism.get_or_insert(mismatch);
            }
            Some(None) => {}
            None => {
                g.new_events.push(Event::Scheduled {
                    call_index,
                    kind,
                    target: target.clone(),
                    input: input.clone(),
                });
                let action = match &child {
                    Some(instance) => Action::StartSubOrchestration {
                        call_index,
                        name: target,
                        instance: instance.clone(),
                        input,
                    },
                    None => Action::CallActivity {
                        call_index,
                        name: target,
                        input,
                    },
                };
                g.actions.push(action);
            }
        }
        drop(g);
        DurableFuture::new(self.clone(), call_index, kind, child)
    }

    pub(crate) fn poll_result(&self, call_index: u64) -> Poll<Result<String, String>> {
        let mut g = self.lock();
        if g.nondeterminism.is_some() {
            return Poll::Pending;
        }
        let result = match g.results.get(&call_index) {
            Some(r) => r.result.clone().map_err(|d| d.display_message()),
            None => return Poll::Pending,
        };
        g.unobserved.remove(&call_index);
        Poll::Ready(result)
    }

    pub(crate) fn poll_all(&self, call_indices: &[u64]) -> Poll<Result<Vec<String>, FanInError>> {
        let mut g = self.lock();
        if g.nondeterminism.is_some() {
            return Poll::Pending;
        }
        let mut earliest: Option<(usize, usize, u64, ErrorDetails)> = None;
        let mut all_resolved = true;
        for (position, idx) in call_indices.iter().enumerate() {
            match g.results.get(idx) {
                Some(Resolution {
                    position: at,
                    result: Err(details),
                }) => {
                    if earliest.as_ref().is_none_or(|(best, ..)| at < best) {
                        earliest = Some((*at, position, *idx, details.clone()));
                    }
                }
                Some(_) => {}
                None => all_resolved = false,
            }
        }
        if let Some((_, position, call_index, details)) = earliest {
            g.unobserved.remove(&call_index);
            g.fan_in_failure = Some((call_index, details.display_message()));
            return Poll::Ready(Err(FanInError {
                call_index,
                position,
                details,
            }));
        }
        if !all_resolved {
            return Poll::Pending;
        }
        let mut out = Vec::with_capacity(call_indices.len());
        for idx in call_indices {
            if let Some(Resolution { result: Ok(v), .. }) = g.results.get(idx) {
                out.push(v.clone());
            }
        }
        for idx in call_indices {
            g.unobserved.remove(idx);
        }
        Poll::Ready(Ok(out))
    }

    /// Number of scheduling calls made so far in this pass.
    pub(crate) fn calls_made(&self) -> u64 {
        self.lock().next_call_index
    }

    /// True when every `Scheduled` event in history was claimed by this pass.
    pub(crate) fn claimed_all_recorded(&self) -> bool {
        let g = self.lock();
        g.next_call_index >= g.recorded_frontier
    }

    pub(crate) fn take_decisions(&self) -> PassDecisions {
        let mut g = self.lock();
        PassDecisions {
            new_events: std::mem::take(&mut g.new_events),
            actions: std::mem::take(&mut g.actions),
            nondeterminism: g.nondeterminism.take(),
            fan_in_failure: g.fan_in_failure.take(),
        }
    }
}
