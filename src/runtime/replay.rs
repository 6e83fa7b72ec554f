//! One deterministic pass of an orchestration function over its history.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use super::OrchestrationHandler;
use crate::{Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, OrchestrationContext};

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Stopped at an unresolved call.
    Suspended,
    Completed(String),
    Failed(ErrorDetails),
}

#[derive(Debug)]
pub struct TurnResult {
    /// `Scheduled` events for call indices not yet in history.
    pub new_events: Vec<Event>,
    /// Dispatches matching `new_events`.
    pub actions: Vec<Action>,
    pub outcome: TurnOutcome,
    /// Scheduling calls made during the pass.
    pub calls: u64,
}

/// Run `handler` once from the top against `history`.
///
/// The function is polled exactly once with a no-op waker: every resolved
/// call completes inline, the first unresolved one leaves the future pending.
/// Divergence from recorded decisions and panics both become a failed
/// outcome, and in the divergence case the pass's new decisions are dropped.
pub fn run_turn(
    instance: &str,
    history: &[Event],
    handler: Arc<dyn OrchestrationHandler>,
    input: String,
) -> TurnResult {
    let ctx = OrchestrationContext::new(instance, history);
    let polled = catch_unwind(AssertUnwindSafe(|| {
        let mut fut = handler.invoke(ctx.clone(), input);
        let mut cx = Context::from_waker(Waker::noop());
        fut.as_mut().poll(&mut cx)
    }));

    let calls = ctx.calls_made();
    let decisions = ctx.take_decisions();
    if let Some(message) = decisions.nondeterminism {
        return nondeterministic(instance, message, calls);
    }

    let outcome = match polled {
        Err(panic) => TurnOutcome::Failed(ErrorDetails::application(
            AppErrorKind::OrchestrationFailed,
            format!("orchestration panicked: {}", panic_message(panic.as_ref())),
        )),
        Ok(Poll::Pending) => TurnOutcome::Suspended,
        Ok(Poll::Ready(Ok(output))) => TurnOutcome::Completed(output),
        Ok(Poll::Ready(Err(message))) => TurnOutcome::Failed(match decisions.fan_in_failure {
            // `?` straight out of `wait_all`.
            Some((call_index, raised)) if raised == message => ErrorDetails::fan_in(call_index, message),
            _ => ErrorDetails::application(AppErrorKind::OrchestrationFailed, message),
        }),
    };

    // A deterministic function reaches every decision it made before.
    if !ctx.claimed_all_recorded() && !matches!(outcome, TurnOutcome::Failed(_)) {
        return nondeterministic(
            instance,
            format!("pass made {calls} scheduling calls but history records more"),
            calls,
        );
    }

    TurnResult {
        new_events: decisions.new_events,
        actions: decisions.actions,
        outcome,
        calls,
    }
}

fn nondeterministic(instance: &str, message: String, calls: u64) -> TurnResult {
    TurnResult {
        new_events: Vec::new(),
        actions: Vec::new(),
        outcome: TurnOutcome::Failed(ErrorDetails::configuration(
            ConfigErrorKind::Nondeterminism,
            instance,
            Some(message),
        )),
        calls,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[path = "replay_tests.rs"]
mod replay_tests;
