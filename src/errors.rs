//! Error taxonomy shared by the engine, providers and activities.
//!
//! Two families live here:
//!
//! - [`ErrorDetails`] is persisted in history (`Failed`, `InstanceFailed`) and
//!   reported through status queries. It is serializable and stable.
//! - [`EngineError`] and [`WaitError`] are call-level errors returned by the
//!   [`Runtime`](crate::Runtime) API. No instance state changes when one of
//!   these is returned.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderError;
use crate::runtime::RuntimeStatus;

/// Failures raised by user code: activities, orchestrations, children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    SubOrchestrationFailed,
    OrchestrationFailed,
    FanInFailed,
    Terminated,
}

/// Failures caused by how the engine was wired up rather than by user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    UnregisteredActivity,
    UnregisteredOrchestration,
    Nondeterminism,
}

/// Persisted failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum ErrorDetails {
    Application {
        kind: AppErrorKind,
        message: String,
        #[serde(default)]
        retryable: bool,
        /// Failing member's call index when a fan-in failure went uncaught.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_index: Option<u64>,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        #[serde(default)]
        message: Option<String>,
    },
    Validation {
        message: String,
    },
    Infrastructure {
        operation: String,
        message: String,
    },
}

impl ErrorDetails {
    pub fn application(kind: AppErrorKind, message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind,
            message: message.into(),
            retryable: false,
            call_index: None,
        }
    }

    /// A `wait_all` failure that propagated out of the orchestration unchanged.
    pub fn fan_in(call_index: u64, message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind: AppErrorKind::FanInFailed,
            message: message.into(),
            retryable: false,
            call_index: Some(call_index),
        }
    }

    pub fn configuration(kind: ConfigErrorKind, resource: impl Into<String>, message: Option<String>) -> Self {
        ErrorDetails::Configuration {
            kind,
            resource: resource.into(),
            message,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Validation { .. } => "validation",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    /// Message handed to orchestration code when an awaited call fails.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } => message.clone(),
            ErrorDetails::Configuration { kind, resource, message } => {
                let base = match kind {
                    ConfigErrorKind::UnregisteredActivity => format!("unregistered activity: {resource}"),
                    ConfigErrorKind::UnregisteredOrchestration => format!("unregistered orchestration: {resource}"),
                    ConfigErrorKind::Nondeterminism => format!("nondeterministic orchestration: {resource}"),
                };
                match message {
                    Some(m) => format!("{base}: {m}"),
                    None => base,
                }
            }
            ErrorDetails::Validation { message } => format!("invalid input: {message}"),
            ErrorDetails::Infrastructure { operation, message } => {
                format!("infrastructure error in {operation}: {message}")
            }
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category(), self.display_message())
    }
}

/// Error returned by an activity handler.
///
/// Retryable errors are retried per the activity's [`RetryPolicy`](crate::RetryPolicy);
/// permanent ones surface to the orchestration on the first attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    pub retryable: bool,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<String> for ActivityError {
    fn from(message: String) -> Self {
        Self::retryable(message)
    }
}

impl From<&str> for ActivityError {
    fn from(message: &str) -> Self {
        Self::retryable(message)
    }
}

/// Call-level errors from the runtime API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error("instance {instance} cannot move from {from} to {to}")]
    InvalidTransition {
        instance: String,
        from: RuntimeStatus,
        to: RuntimeStatus,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for instance {0}")]
    Timeout(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
