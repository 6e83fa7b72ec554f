use std::sync::Arc;
use std::time::Duration;

use durable_pipeline::providers::HistoryStore;
use durable_pipeline::providers::fs::FsHistoryStore;
use durable_pipeline::runtime::{ActivityRegistry, OrchestrationRegistry};
use durable_pipeline::{Event, OrchestrationContext, RuntimeStatus};

mod common;
use common::*;

fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("TwoSteps", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_activity("Step1", "a").await?;
            let b = ctx.schedule_activity("Step2", "b").await?;
            Ok(format!("{a}|{b}"))
        })
        .register("Parent", |ctx: OrchestrationContext, _input: String| async move {
            let child = ctx.schedule_sub_orchestration("TwoSteps", "{}").await?;
            Ok(format!("parent({child})"))
        })
        .build()
}

fn stuck_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Step1", |_ctx, input: String| async move { Ok(format!("one:{input}")) })
        .register("Step2", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".to_string())
        })
        .build()
}

fn healthy_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Step1", |_ctx, input: String| async move { Ok(format!("one:{input}")) })
        .register("Step2", |_ctx, input: String| async move { Ok(format!("two:{input}")) })
        .build()
}

fn reopen(dir: &std::path::Path) -> Arc<dyn HistoryStore> {
    Arc::new(FsHistoryStore::new(dir, false)) as Arc<dyn HistoryStore>
}

fn step2_scheduled(history: &[Event]) -> bool {
    history
        .iter()
        .any(|e| matches!(e, Event::Scheduled { target, .. } if target == "Step2"))
}

#[tokio::test]
async fn running_instance_resumes_after_restart() {
    let (store, td) = fs_store();
    let rt = start(store.clone(), stuck_activities(), orchestrations()).await;
    rt.start_orchestration_with_id("resume-1", "TwoSteps", "{}").await.unwrap();
    assert!(wait_for_history(&store, "resume-1", step2_scheduled).await);
    rt.shutdown().await;
    assert_eq!(rt.get_status("resume-1").await.unwrap().runtime_status, RuntimeStatus::Running);

    let store = reopen(td.path());
    let rt = start(store.clone(), healthy_activities(), orchestrations()).await;
    let status = rt.wait_for_orchestration("resume-1", WAIT).await.unwrap();
    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("one:a|two:b"));

    // Step1 ran once; replay reused its recorded result.
    let history = store.read("resume-1").await.unwrap();
    let calls = scheduled(&history);
    assert_eq!(calls.len(), 2);
    let step1_results = history
        .iter()
        .filter(|e| matches!(e, Event::Completed { call_index: 0, .. }))
        .count();
    assert_eq!(step1_results, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn parent_resume_reattaches_child() {
    let (store, td) = fs_store();
    let rt = start(store.clone(), stuck_activities(), orchestrations()).await;
    rt.start_orchestration_with_id("p", "Parent", "{}").await.unwrap();
    assert!(wait_for_history(&store, "p::sub::0", step2_scheduled).await);
    rt.shutdown().await;

    let store = reopen(td.path());
    let rt = start(store.clone(), healthy_activities(), orchestrations()).await;
    let parent = rt.wait_for_orchestration("p", WAIT).await.unwrap();
    assert_eq!(parent.output.as_deref(), Some("parent(one:a|two:b)"));
    let child = rt.get_status("p::sub::0").await.unwrap();
    assert_eq!(child.runtime_status, RuntimeStatus::Completed);
    rt.shutdown().await;
}

#[tokio::test]
async fn terminal_instances_stay_put_on_restart() {
    let (store, td) = fs_store();
    let rt = start(store.clone(), healthy_activities(), orchestrations()).await;
    let done = run_to_end(&rt, "TwoSteps", "{}").await;
    rt.shutdown().await;
    let before = store.read(&done.instance_id).await.unwrap();

    let store = reopen(td.path());
    let rt = start(store.clone(), healthy_activities(), orchestrations()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = rt.get_status(&done.instance_id).await.unwrap();
    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(store.read(&done.instance_id).await.unwrap(), before);
    rt.shutdown().await;
}

#[tokio::test]
async fn torn_history_tail_does_not_block_resume() {
    let (store, td) = fs_store();
    let rt = start(store.clone(), stuck_activities(), orchestrations()).await;
    rt.start_orchestration_with_id("torn", "TwoSteps", "{}").await.unwrap();
    assert!(wait_for_history(&store, "torn", step2_scheduled).await);
    rt.shutdown().await;

    // Half-written line from an append cut short by the crash.
    let history = td.path().join("torn").join("history.jsonl");
    let mut data = std::fs::read_to_string(&history).unwrap();
    data.push_str(r#"{"Completed":{"call_index":1,"outp"#);
    std::fs::write(&history, data).unwrap();

    let store = reopen(td.path());
    let rt = start(store.clone(), healthy_activities(), orchestrations()).await;
    let status = rt.wait_for_orchestration("torn", WAIT).await.unwrap();
    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("one:a|two:b"));
    assert!(matches!(
        store.read("torn").await.unwrap().last(),
        Some(Event::InstanceCompleted { .. })
    ));
    rt.shutdown().await;
}
