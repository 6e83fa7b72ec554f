use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ErrorDetails;

/// Lifecycle state of an instance.
///
/// `Completed`, `Failed` and `Terminated` are terminal: once reached, the
/// instance record and its history never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RuntimeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated
        )
    }

    /// Pending may fail validation or be terminated before it ever runs.
    pub fn can_transition_to(self, next: RuntimeStatus) -> bool {
        use RuntimeStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Terminated)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Terminated)
        )
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    pub name: String,
    pub runtime_status: RuntimeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        self.runtime_status.is_terminal()
    }

    /// Decode the output as JSON. `None` until the instance completes.
    pub fn output_typed<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, String>> {
        self.output
            .as_deref()
            .map(|s| serde_json::from_str::<T>(s).map_err(|e| e.to_string()))
    }
}
