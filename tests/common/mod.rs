#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use durable_pipeline::providers::HistoryStore;
use durable_pipeline::providers::fs::FsHistoryStore;
use durable_pipeline::providers::in_memory::InMemoryHistoryStore;
use durable_pipeline::runtime::{ActivityRegistry, OrchestrationRegistry};
use durable_pipeline::{BackoffStrategy, Event, InstanceStatus, RetryPolicy, Runtime, RuntimeOptions, TaskKind};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::new()) as Arc<dyn HistoryStore>
}

pub fn fs_store() -> (Arc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn HistoryStore>;
    (store, td)
}

/// Options with millisecond backoff so retry tests stay fast.
pub fn fast_options(max_attempts: u32) -> RuntimeOptions {
    RuntimeOptions {
        activity_retry: RetryPolicy::new(max_attempts).with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(1),
        }),
        ..RuntimeOptions::default()
    }
}

pub async fn start(
    store: Arc<dyn HistoryStore>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
) -> Arc<Runtime> {
    Runtime::start_with_options(store, activities, orchestrations, fast_options(3)).await
}

pub async fn run_to_end(rt: &Runtime, name: &str, input: &str) -> InstanceStatus {
    let started = rt.start_orchestration(name, input).await.unwrap();
    rt.wait_for_orchestration(&started.instance_id, WAIT).await.unwrap()
}

/// CSV text with an `id,name,score` header and `rows` data rows.
pub fn csv(rows: usize) -> String {
    let mut s = String::from("id,name,score\n");
    for i in 0..rows {
        s.push_str(&format!("{i},name{i},{}\n", i * 7 % 100));
    }
    s
}

pub fn scheduled(history: &[Event]) -> Vec<(u64, TaskKind, String)> {
    history
        .iter()
        .filter_map(|e| match e {
            Event::Scheduled {
                call_index,
                kind,
                target,
                ..
            } => Some((*call_index, *kind, target.clone())),
            _ => None,
        })
        .collect()
}

/// Poll the history until `predicate` holds or the wait budget runs out.
pub async fn wait_for_history<F>(store: &Arc<dyn HistoryStore>, instance: &str, predicate: F) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Ok(hist) = store.read(instance).await {
            if predicate(&hist) {
                return true;
            }
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
