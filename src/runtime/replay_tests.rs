#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::runtime::replay::{TurnOutcome, run_turn};
    use crate::runtime::{FnOrchestration, OrchestrationHandler};
    use crate::{Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event, OrchestrationContext, TaskKind};

    fn handler<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        Arc::new(FnOrchestration::new(f))
    }

    fn started() -> Event {
        Event::InstanceStarted {
            name: "Orch".into(),
            input: "{}".into(),
            parent_instance: None,
            parent_call_index: None,
        }
    }

    fn sched(call_index: u64, target: &str, input: &str) -> Event {
        Event::Scheduled {
            call_index,
            kind: TaskKind::Activity,
            target: target.into(),
            input: input.into(),
        }
    }

    fn done(call_index: u64, output: &str) -> Event {
        Event::Completed {
            call_index,
            output: output.into(),
        }
    }

    fn failed(call_index: u64, message: &str) -> Event {
        Event::Failed {
            call_index,
            details: ErrorDetails::application(AppErrorKind::ActivityFailed, message),
        }
    }

    fn fan_out_three() -> Arc<dyn OrchestrationHandler> {
        handler(|ctx, _input| async move {
            let tasks = vec![
                ctx.schedule_activity("Work", "A"),
                ctx.schedule_activity("Work", "B"),
                ctx.schedule_activity("Work", "C"),
            ];
            let results = ctx.wait_all(tasks).await?;
            Ok(results.join(","))
        })
    }

    #[test]
    fn first_pass_schedules_and_suspends() {
        let turn = run_turn("i1", &[started()], fan_out_three(), "{}".into());
        assert_eq!(turn.outcome, TurnOutcome::Suspended);
        assert_eq!(turn.new_events, vec![sched(0, "Work", "A"), sched(1, "Work", "B"), sched(2, "Work", "C")]);
        assert_eq!(turn.actions.len(), 3);
        assert_eq!(turn.actions[2].call_index(), 2);
    }

    #[test]
    fn replay_suppresses_recorded_schedules() {
        let history = vec![started(), sched(0, "Work", "A"), sched(1, "Work", "B"), sched(2, "Work", "C"), done(1, "b")];
        let turn = run_turn("i1", &history, fan_out_three(), "{}".into());
        assert_eq!(turn.outcome, TurnOutcome::Suspended);
        assert!(turn.new_events.is_empty());
        assert!(turn.actions.is_empty());
    }

    #[test]
    fn fan_in_preserves_submission_order() {
        let history = vec![
            started(),
            sched(0, "Work", "A"),
            sched(1, "Work", "B"),
            sched(2, "Work", "C"),
            done(2, "c"),
            done(0, "a"),
            done(1, "b"),
        ];
        let turn = run_turn("i1", &history, fan_out_three(), "{}".into());
        assert_eq!(turn.outcome, TurnOutcome::Completed("a,b,c".into()));
    }

    #[test]
    fn fan_in_fails_fast_on_first_recorded_failure() {
        let history = vec![
            started(),
            sched(0, "Work", "A"),
            sched(1, "Work", "B"),
            sched(2, "Work", "C"),
            done(0, "a"),
            failed(1, "B broke"),
        ];
        let turn = run_turn("i1", &history, fan_out_three(), "{}".into());
        assert_eq!(turn.outcome, TurnOutcome::Failed(ErrorDetails::fan_in(1, "B broke")));
    }

    #[test]
    fn rewrapped_fan_in_error_is_an_orchestration_failure() {
        let history = vec![
            started(),
            sched(0, "Work", "A"),
            sched(1, "Work", "B"),
            failed(0, "A broke"),
        ];
        let h = handler(|ctx, _input| async move {
            let tasks = vec![ctx.schedule_activity("Work", "A"), ctx.schedule_activity("Work", "B")];
            ctx.wait_all(tasks).await.map_err(|e| format!("batch failed: {e}"))?;
            Ok("unreachable".into())
        });
        match run_turn("i1", &history, h, "{}".into()).outcome {
            TurnOutcome::Failed(ErrorDetails::Application {
                kind, message, call_index, ..
            }) => {
                assert_eq!(kind, AppErrorKind::OrchestrationFailed);
                assert_eq!(message, "batch failed: A broke");
                assert_eq!(call_index, None);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn fan_in_picks_earliest_failure_in_history() {
        let history = vec![
            started(),
            sched(0, "Work", "A"),
            sched(1, "Work", "B"),
            sched(2, "Work", "C"),
            failed(2, "C broke"),
            failed(1, "B broke"),
        ];
        let h = handler(|ctx, _input| async move {
            let tasks = vec![
                ctx.schedule_activity("Work", "A"),
                ctx.schedule_activity("Work", "B"),
                ctx.schedule_activity("Work", "C"),
            ];
            match ctx.wait_all(tasks).await {
                Ok(_) => Ok("unexpected".into()),
                Err(e) => Ok(format!("{}@{}", e.message(), e.position)),
            }
        });
        let turn = run_turn("i1", &history, h, "{}".into());
        assert_eq!(turn.outcome, TurnOutcome::Completed("C broke@2".into()));
    }

    #[test]
    fn empty_fan_in_resolves_immediately() {
        let h = handler(|ctx, _input| async move {
            let out = ctx.wait_all(Vec::new()).await?;
            Ok(out.len().to_string())
        });
        let turn = run_turn("i1", &[started()], h, "{}".into());
        assert_eq!(turn.outcome, TurnOutcome::Completed("0".into()));
    }

    #[test]
    fn sub_orchestration_ids_are_stable_across_passes() {
        let h = || {
            handler(|ctx, _input| async move {
                let first = ctx.schedule_activity("Prep", "x");
                first.await?;
                let child = ctx.schedule_sub_orchestration("Child", "payload");
                child.await
            })
        };
        let history = vec![started(), sched(0, "Prep", "x"), done(0, "ok")];
        let a = run_turn("parent", &history, h(), "{}".into());
        let b = run_turn("parent", &history, h(), "{}".into());
        assert_eq!(a.actions, b.actions);
        assert_eq!(
            a.actions,
            vec![Action::StartSubOrchestration {
                call_index: 1,
                name: "Child".into(),
                instance: "parent::sub::1".into(),
                input: "payload".into(),
            }]
        );
    }

    #[test]
    fn divergent_schedule_is_nondeterminism() {
        let history = vec![started(), sched(0, "Other", "A")];
        let turn = run_turn("i1", &history, fan_out_three(), "{}".into());
        assert!(turn.new_events.is_empty());
        assert!(turn.actions.is_empty());
        match turn.outcome {
            TurnOutcome::Failed(ErrorDetails::Configuration { kind, .. }) => {
                assert_eq!(kind, ConfigErrorKind::Nondeterminism)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unclaimed_history_is_nondeterminism() {
        let h = handler(|ctx, _input| async move { ctx.schedule_activity("Work", "A").await });
        let history = vec![started(), sched(0, "Work", "A"), sched(1, "Work", "B")];
        let turn = run_turn("i1", &history, h, "{}".into());
        assert!(matches!(
            turn.outcome,
            TurnOutcome::Failed(ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            })
        ));
    }

    #[test]
    fn panics_fail_the_pass() {
        let h = handler(|_ctx, _input| async move {
            if true {
                panic!("kaboom");
            }
            Ok(String::new())
        });
        let turn = run_turn("i1", &[started()], h, "{}".into());
        match turn.outcome {
            TurnOutcome::Failed(details) => assert!(details.display_message().contains("kaboom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn replaying_flag_clears_at_the_frontier() {
        let fresh = Arc::new(AtomicUsize::new(0));
        let seen = fresh.clone();
        let h = handler(move |ctx, _input| {
            let seen = seen.clone();
            async move {
                let a = ctx.schedule_activity("Work", "A").await?;
                if !ctx.is_replaying() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                let b = ctx.schedule_activity("Work", "B").await?;
                Ok(format!("{a}{b}"))
            }
        });
        let history = vec![started(), sched(0, "Work", "A"), done(0, "a")];
        run_turn("i1", &history, h.clone(), "{}".into());
        assert_eq!(fresh.load(Ordering::SeqCst), 1);
        let mut longer = history.clone();
        longer.extend([sched(1, "Work", "B"), done(1, "b")]);
        let turn = run_turn("i1", &longer, h, "{}".into());
        assert_eq!(turn.outcome, TurnOutcome::Completed("ab".into()));
        assert_eq!(fresh.load(Ordering::SeqCst), 1);
    }
}
