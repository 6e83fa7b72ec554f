//! Futures returned by scheduling calls.
//!
//! Both types resolve purely from the history the pass was built with: they
//! never register wakers, they are either ready during the current poll or
//! the pass stops there.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::{Codec, Json};
use crate::{ErrorDetails, OrchestrationContext, TaskKind};

/// Handle for one scheduled call, correlated by `call_index`.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    call_index: u64,
    kind: TaskKind,
    child: Option<String>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, call_index: u64, kind: TaskKind, child: Option<String>) -> Self {
        Self {
            ctx,
            call_index,
            kind,
            child,
        }
    }

    pub fn call_index(&self) -> u64 {
        self.call_index
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Child instance id for sub-orchestration calls.
    pub fn child_instance(&self) -> Option<&str> {
        self.child.as_deref()
    }

    /// Await the result decoded as JSON.
    pub fn into_typed<Out: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<Out, String>> + Send {
        async move {
            let raw = self.await?;
            Json::decode::<Out>(&raw)
        }
    }
}

impl Future for DurableFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.ctx.poll_result(self.call_index)
    }
}

/// Error raised by [`WaitAllFuture`] for the first failed member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanInError {
    /// Call index of the failed task.
    pub call_index: u64,
    /// Position of the failed task in the submitted batch.
    pub position: usize,
    pub details: ErrorDetails,
}

impl FanInError {
    pub fn message(&self) -> String {
        self.details.display_message()
    }
}

impl std::fmt::Display for FanInError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.details.display_message())
    }
}

impl std::error::Error for FanInError {}

impl From<FanInError> for String {
    fn from(err: FanInError) -> Self {
        err.message()
    }
}

/// Fan-in over a batch of scheduled tasks.
///
/// Resolves once every member has a result, yielding outputs in submission
/// order. Fails fast: as soon as any member has failed, the failure recorded
/// earliest in history is returned and the remaining members are ignored.
pub struct WaitAllFuture {
    ctx: OrchestrationContext,
    call_indices: Vec<u64>,
}

impl WaitAllFuture {
    pub(crate) fn new(ctx: OrchestrationContext, tasks: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            call_indices: tasks.iter().map(|t| t.call_index).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.call_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.call_indices.is_empty()
    }
}

impl Future for WaitAllFuture {
    type Output = Result<Vec<String>, FanInError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.call_indices.is_empty() {
            return Poll::Ready(Ok(Vec::new()));
        }
        self.ctx.poll_all(&self.call_indices)
    }
}
