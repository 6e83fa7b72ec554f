use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{HistoryStore, InstanceRecord, InstanceUpdate, ProviderError, validate_commit};
use crate::Event;

struct StoredInstance {
    record: InstanceRecord,
    history: Vec<Event>,
}

/// Process-local store. Contents are lost when the store is dropped.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, StoredInstance>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Debug dump of every instance and its events.
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut ids: Vec<&String> = g.keys().collect();
        ids.sort();
        let mut out = String::new();
        for id in ids {
            let stored = &g[id];
            out.push_str(&format!("instance={id} status={}\n", stored.record.status));
            for e in &stored.history {
                out.push_str(&format!("  {e:?}\n"));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(&record.instance_id) {
            return Ok(false);
        }
        let history = vec![record.started_event()];
        g.insert(record.instance_id.clone(), StoredInstance { record, history });
        Ok(true)
    }

    async fn instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.inner.lock().await.get(instance).map(|s| s.record.clone()))
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self
            .inner
            .lock()
            .await
            .get(instance)
            .map(|s| s.history.clone())
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        instance: &str,
        events: Vec<Event>,
        update: Option<InstanceUpdate>,
    ) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let stored = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("commit", format!("instance not found: {instance}")))?;
        let accepted = validate_commit(&stored.record, &stored.history, events, update.as_ref())?;
        stored.history.extend(accepted);
        stored.record.apply(update);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut ids: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeStatus;
    use crate::{ErrorDetails, TaskKind};

    fn scheduled(call_index: u64) -> Event {
        Event::Scheduled {
            call_index,
            kind: TaskKind::Activity,
            target: "A".into(),
            input: "x".into(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_and_writes_started_event() {
        let store = InMemoryHistoryStore::new();
        assert!(store.create_instance(InstanceRecord::new("i1", "Orch", "{}", None)).await.unwrap());
        assert!(!store.create_instance(InstanceRecord::new("i1", "Other", "[]", None)).await.unwrap());
        let rec = store.instance("i1").await.unwrap().unwrap();
        assert_eq!(rec.name, "Orch");
        let hist = store.read("i1").await.unwrap();
        assert!(matches!(hist.as_slice(), [Event::InstanceStarted { .. }]));
    }

    #[tokio::test]
    async fn duplicate_resolution_is_dropped() {
        let store = InMemoryHistoryStore::new();
        store.create_instance(InstanceRecord::new("i1", "Orch", "{}", None)).await.unwrap();
        store
            .commit("i1", vec![scheduled(0)], Some(InstanceUpdate::running()))
            .await
            .unwrap();
        let done = Event::Completed {
            call_index: 0,
            output: "first".into(),
        };
        store.commit("i1", vec![done.clone()], None).await.unwrap();
        store
            .commit(
                "i1",
                vec![Event::Completed {
                    call_index: 0,
                    output: "second".into(),
                }],
                None,
            )
            .await
            .unwrap();
        let hist = store.read("i1").await.unwrap();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[2], done);
    }

    #[tokio::test]
    async fn terminal_instance_rejects_writes() {
        let store = InMemoryHistoryStore::new();
        store.create_instance(InstanceRecord::new("i1", "Orch", "{}", None)).await.unwrap();
        store.commit("i1", vec![], Some(InstanceUpdate::running())).await.unwrap();
        store
            .commit(
                "i1",
                vec![Event::InstanceCompleted { output: "ok".into() }],
                Some(InstanceUpdate::completed("ok".into())),
            )
            .await
            .unwrap();
        let err = store
            .commit(
                "i1",
                vec![],
                Some(InstanceUpdate::failed(ErrorDetails::Validation { message: "x".into() })),
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        let rec = store.instance("i1").await.unwrap().unwrap();
        assert_eq!(rec.status, RuntimeStatus::Completed);
        assert_eq!(rec.output.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn resolution_requires_schedule() {
        let store = InMemoryHistoryStore::new();
        store.create_instance(InstanceRecord::new("i1", "Orch", "{}", None)).await.unwrap();
        let err = store
            .commit(
                "i1",
                vec![Event::Completed {
                    call_index: 4,
                    output: "x".into(),
                }],
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.operation, "commit");
    }

    #[tokio::test]
    async fn pending_cannot_jump_to_completed() {
        let store = InMemoryHistoryStore::new();
        store.create_instance(InstanceRecord::new("i1", "Orch", "{}", None)).await.unwrap();
        let err = store
            .commit(
                "i1",
                vec![Event::InstanceCompleted { output: "x".into() }],
                Some(InstanceUpdate::completed("x".into())),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("cannot move from Pending to Completed"));
    }
}
