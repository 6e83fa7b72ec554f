/// History store error with retry classification.
///
/// **Retryable**: transient I/O failures, contention.
///
/// **Permanent**: corrupt records, writes to terminal instances, illegal
/// status transitions, conflicting duplicate events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Store operation that failed, e.g. `"commit"` or `"create_instance"`.
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub(crate) fn io(operation: &str, err: std::io::Error) -> Self {
        Self::retryable(operation, err.to_string())
    }

    pub(crate) fn corrupt(operation: &str, err: serde_json::Error) -> Self {
        Self::permanent(operation, format!("corrupt record: {err}"))
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.retryable { "retryable" } else { "permanent" };
        write!(f, "{} failed ({kind}): {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for crate::ErrorDetails {
    fn from(err: ProviderError) -> Self {
        crate::ErrorDetails::Infrastructure {
            operation: err.operation,
            message: err.message,
        }
    }
}
