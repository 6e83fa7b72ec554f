//! Property-based checks of replay determinism and fan-in ordering.

use std::sync::Arc;

use durable_pipeline::runtime::replay::{TurnOutcome, run_turn};
use durable_pipeline::runtime::{FnOrchestration, OrchestrationHandler};
use durable_pipeline::{AppErrorKind, ErrorDetails, Event, OrchestrationContext, sub_orchestration_id};
use proptest::prelude::*;

fn started() -> Event {
    Event::InstanceStarted {
        name: "FanOut".into(),
        input: "{}".into(),
        parent_instance: None,
        parent_call_index: None,
    }
}

/// Schedules `input` activities and fans in on all of them.
fn fan_out() -> Arc<dyn OrchestrationHandler> {
    Arc::new(FnOrchestration::new(|ctx: OrchestrationContext, input: String| async move {
        let n: usize = input.parse().map_err(|_| "bad count".to_string())?;
        let tasks = (0..n).map(|i| ctx.schedule_activity("Work", i.to_string())).collect();
        let results = ctx.wait_all(tasks).await?;
        Ok(results.join(","))
    }))
}

/// Shuffled `0..n` driven by proptest-generated sort keys.
fn arb_order(max: usize) -> impl Strategy<Value = Vec<usize>> {
    (1..=max).prop_flat_map(|n| {
        prop::collection::vec(any::<u32>(), n).prop_map(|keys| {
            let mut order: Vec<usize> = (0..keys.len()).collect();
            order.sort_by_key(|&i| (keys[i], i));
            order
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Results come back in submission order whatever order they were recorded in.
    #[test]
    fn fan_in_order_is_submission_order(order in arb_order(8)) {
        let n = order.len();
        let first = run_turn("inst", &[started()], fan_out(), n.to_string());
        prop_assert_eq!(first.outcome, TurnOutcome::Suspended);
        prop_assert_eq!(first.new_events.len(), n);

        let mut history = vec![started()];
        history.extend(first.new_events);
        for (step, &idx) in order.iter().enumerate() {
            history.push(Event::Completed { call_index: idx as u64, output: format!("r{idx}") });
            let turn = run_turn("inst", &history, fan_out(), n.to_string());
            prop_assert!(turn.new_events.is_empty());
            if step + 1 < n {
                prop_assert_eq!(turn.outcome, TurnOutcome::Suspended);
            } else {
                let expected: Vec<String> = (0..n).map(|i| format!("r{i}")).collect();
                prop_assert_eq!(turn.outcome, TurnOutcome::Completed(expected.join(",")));
            }
        }
    }

    /// Replaying the same history twice yields identical decisions.
    #[test]
    fn replay_is_deterministic(order in arb_order(6), resolved in 0usize..6) {
        let n = order.len();
        let first = run_turn("inst", &[started()], fan_out(), n.to_string());
        let mut history = vec![started()];
        history.extend(first.new_events);
        for &idx in order.iter().take(resolved.min(n)) {
            history.push(Event::Completed { call_index: idx as u64, output: idx.to_string() });
        }
        let a = run_turn("inst", &history, fan_out(), n.to_string());
        let b = run_turn("inst", &history, fan_out(), n.to_string());
        prop_assert_eq!(&a.new_events, &b.new_events);
        prop_assert_eq!(&a.outcome, &b.outcome);
        prop_assert_eq!(a.calls, b.calls);
        prop_assert_eq!(a.calls, n as u64);
    }

    /// The earliest recorded failure wins, independent of submission position.
    #[test]
    fn earliest_failure_wins(order in arb_order(6)) {
        let n = order.len();
        let first = run_turn("inst", &[started()], fan_out(), n.to_string());
        let mut history = vec![started()];
        history.extend(first.new_events);
        for &idx in &order {
            history.push(Event::Failed {
                call_index: idx as u64,
                details: ErrorDetails::application(AppErrorKind::ActivityFailed, format!("e{idx}")),
            });
        }
        let turn = run_turn("inst", &history, fan_out(), n.to_string());
        match turn.outcome {
            TurnOutcome::Failed(details) => prop_assert_eq!(details.display_message(), format!("e{}", order[0])),
            other => prop_assert!(false, "expected failure, got {:?}", other),
        }
    }

    #[test]
    fn child_ids_depend_only_on_parent_and_index(parent in "[a-z0-9-]{1,12}", idx in 0u64..1000) {
        let id = sub_orchestration_id(&parent, idx);
        prop_assert_eq!(&id, &sub_orchestration_id(&parent, idx));
        prop_assert_eq!(id, format!("{parent}::sub::{idx}"));
    }
}
