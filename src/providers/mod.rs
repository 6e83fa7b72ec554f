//! Instance and history persistence.
//!
//! A store keeps, per instance, an [`InstanceRecord`] (identity, status,
//! terminal output or error) and the append-only [`Event`] history. The
//! engine is the only writer for a given instance; readers see whatever the
//! last successful `commit` left behind.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::{InstanceStatus, RuntimeStatus};
use crate::{ErrorDetails, Event};

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;

/// Correlates a child instance with the parent call that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentLink {
    pub instance: String,
    pub call_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,
    pub name: String,
    pub input: String,
    #[serde(default)]
    pub parent: Option<ParentLink>,
    pub status: RuntimeStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(
        instance_id: impl Into<String>,
        name: impl Into<String>,
        input: impl Into<String>,
        parent: Option<ParentLink>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            name: name.into(),
            input: input.into(),
            parent,
            status: RuntimeStatus::Pending,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// First history event written for the instance.
    pub fn started_event(&self) -> Event {
        Event::InstanceStarted {
            name: self.name.clone(),
            input: self.input.clone(),
            parent_instance: self.parent.as_ref().map(|p| p.instance.clone()),
            parent_call_index: self.parent.as_ref().map(|p| p.call_index),
        }
    }

    pub fn to_status(&self) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.instance_id.clone(),
            name: self.name.clone(),
            runtime_status: self.status,
            output: self.output.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            last_updated_at: self.updated_at,
        }
    }

    pub(crate) fn apply(&mut self, update: Option<InstanceUpdate>) {
        if let Some(update) = update {
            self.status = update.status;
            self.output = update.output;
            self.error = update.error;
        }
        self.updated_at = Utc::now();
    }
}

/// Status change committed together with a batch of history events.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub status: RuntimeStatus,
    pub output: Option<String>,
    pub error: Option<ErrorDetails>,
}

impl InstanceUpdate {
    pub fn running() -> Self {
        Self {
            status: RuntimeStatus::Running,
            output: None,
            error: None,
        }
    }

    pub fn completed(output: String) -> Self {
        Self {
            status: RuntimeStatus::Completed,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(details: ErrorDetails) -> Self {
        Self {
            status: RuntimeStatus::Failed,
            output: None,
            error: Some(details),
        }
    }

    pub fn terminated(details: ErrorDetails) -> Self {
        Self {
            status: RuntimeStatus::Terminated,
            output: None,
            error: Some(details),
        }
    }
}

#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a new instance and its `InstanceStarted` event.
    ///
    /// Returns `false`, leaving the stored instance untouched, when the id is
    /// already taken.
    async fn create_instance(&self, record: InstanceRecord) -> Result<bool, ProviderError>;

    async fn instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Full history in append order. Empty for unknown instances.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Atomically append `events` and apply `update`.
    ///
    /// Duplicate resolutions for an already-resolved call index are dropped.
    /// Writes to terminal instances and illegal status transitions are
    /// rejected with a permanent error.
    async fn commit(
        &self,
        instance: &str,
        events: Vec<Event>,
        update: Option<InstanceUpdate>,
    ) -> Result<(), ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    async fn list_by_status(&self, status: RuntimeStatus) -> Result<Vec<String>, ProviderError> {
        let mut out = Vec::new();
        for id in self.list_instances().await? {
            if let Some(record) = self.instance(&id).await? {
                if record.status == status {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }
}

/// Check a commit against the stored record and history.
///
/// Returns the events that should actually be appended.
pub(crate) fn validate_commit(
    record: &InstanceRecord,
    history: &[Event],
    events: Vec<Event>,
    update: Option<&InstanceUpdate>,
) -> Result<Vec<Event>, ProviderError> {
    const OP: &str = "commit";
    let id = &record.instance_id;
    if record.status.is_terminal() {
        return Err(ProviderError::permanent(
            OP,
            format!("instance {id} is {} and cannot change", record.status),
        ));
    }
    if let Some(u) = update {
        if u.status != record.status && !record.status.can_transition_to(u.status) {
            return Err(ProviderError::permanent(
                OP,
                format!("instance {id} cannot move from {} to {}", record.status, u.status),
            ));
        }
    }

    let mut scheduled: HashMap<u64, Event> = HashMap::new();
    let mut resolved: HashSet<u64> = HashSet::new();
    for e in history {
        match e {
            Event::Scheduled { call_index, .. } => {
                scheduled.insert(*call_index, e.clone());
            }
            Event::Completed { call_index, .. } | Event::Failed { call_index, .. } => {
                resolved.insert(*call_index);
            }
            _ => {}
        }
    }

    let mut accepted = Vec::with_capacity(events.len());
    let mut terminal_seen = false;
    for e in events {
        if terminal_seen {
            return Err(ProviderError::permanent(
                OP,
                format!("instance {id}: event after terminal event: {e:?}"),
            ));
        }
        match &e {
            Event::InstanceStarted { .. } => {
                return Err(ProviderError::permanent(OP, format!("instance {id} already started")));
            }
            Event::Scheduled { call_index, .. } => {
                if let Some(existing) = scheduled.get(call_index) {
                    if existing == &e {
                        continue;
                    }
                    return Err(ProviderError::permanent(
                        OP,
                        format!("instance {id}: conflicting schedule at call index {call_index}"),
                    ));
                }
                scheduled.insert(*call_index, e.clone());
            }
            Event::Completed { call_index, .. } | Event::Failed { call_index, .. } => {
                if !scheduled.contains_key(call_index) {
                    return Err(ProviderError::permanent(
                        OP,
                        format!("instance {id}: resolution for unscheduled call index {call_index}"),
                    ));
                }
                if !resolved.insert(*call_index) {
                    tracing::debug!(instance_id = %id, call_index, "dropping duplicate resolution");
                    continue;
                }
            }
            Event::InstanceCompleted { .. } | Event::InstanceFailed { .. } | Event::InstanceTerminated { .. } => {
                let expected = match &e {
                    Event::InstanceCompleted { .. } => RuntimeStatus::Completed,
                    Event::InstanceFailed { .. } => RuntimeStatus::Failed,
                    _ => RuntimeStatus::Terminated,
                };
                if update.map(|u| u.status) != Some(expected) {
                    return Err(ProviderError::permanent(
                        OP,
                        format!("instance {id}: terminal event without matching {expected} status"),
                    ));
                }
                terminal_seen = true;
            }
        }
        accepted.push(e);
    }
    Ok(accepted)
}
