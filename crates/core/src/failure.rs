//! Typed failure raised by the processing operation, and routing reasons.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Namespace/type stamped on failures whose type could not be determined.
pub const UNKNOWN_NAMESPACE: &str = "UNKNOWN";
pub const UNKNOWN_TYPE: &str = "UNKNOWN_ERROR";

/// Failure returned by the business processing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingFailure {
    error_type: String,
    namespace: String,
    description: String,
    #[serde(default)]
    payload: JsonValue,
    #[serde(default = "typed_default")]
    typed: bool,
}

fn typed_default() -> bool {
    true
}

impl ProcessingFailure {
    pub fn new(
        namespace: impl Into<String>,
        error_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            namespace: namespace.into(),
            description: description.into(),
            payload: JsonValue::Null,
            typed: true,
        }
    }

    /// A failure whose type could not be determined. Always classified as unknown.
    pub fn untyped(description: impl Into<String>) -> Self {
        Self {
            error_type: UNKNOWN_TYPE.to_string(),
            namespace: UNKNOWN_NAMESPACE.to_string(),
            description: description.into(),
            payload: JsonValue::Null,
            typed: false,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `namespace:type`.
    pub fn full_error_type(&self) -> String {
        format!("{}:{}", self.namespace, self.error_type)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn is_typed(&self) -> bool {
        self.typed
    }
}

impl core::fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}: {}", self.namespace, self.error_type, self.description)
    }
}

impl std::error::Error for ProcessingFailure {}

/// Why a message left the processing path, written to `X-Failure-Reason`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    RetryableError,
    NonRetryableError,
    MaxRetriesExceeded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetryableError => "RETRYABLE_ERROR",
            FailureReason::NonRetryableError => "NON_RETRYABLE_ERROR",
            FailureReason::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
        }
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
