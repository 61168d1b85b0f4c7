//! Reserved header names and the header map carried on every message.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::HeaderError;

/// Attempts so far; absent on a message that never failed.
pub const RETRY_COUNT: &str = "X-Retry-Count";
/// Failure description plus serialized failure payload, truncated.
pub const ORIGINAL_ERROR: &str = "X-Original-Error";
/// Short failure identifier, e.g. `SERVICE_UNAVAILABLE`.
pub const ERROR_TYPE: &str = "X-Error-Type";
/// Failure category, e.g. `HTTP`.
pub const ERROR_NAMESPACE: &str = "X-Error-Namespace";
/// `namespace:type` composite.
pub const FULL_ERROR_TYPE: &str = "X-Full-Error-Type";
/// Routing outcome, see [`crate::FailureReason`].
pub const FAILURE_REASON: &str = "X-Failure-Reason";
/// When the header set was last written (RFC 3339, UTC).
pub const TIMESTAMP: &str = "X-Timestamp";

/// Header map of a message. Order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parsed `X-Retry-Count`; an absent header counts as zero.
    pub fn retry_count(&self) -> Result<u32, HeaderError> {
        match self.get(RETRY_COUNT) {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| HeaderError::InvalidCount {
                    name: RETRY_COUNT,
                    value: raw.to_string(),
                }),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_retry_count_is_zero() {
        assert_eq!(Headers::new().retry_count(), Ok(0));
    }

    #[test]
    fn retry_count_parses_trimmed_value() {
        let headers = Headers::new().with(RETRY_COUNT, " 2 ");
        assert_eq!(headers.retry_count(), Ok(2));
    }

    #[test]
    fn malformed_retry_count_is_rejected() {
        let headers = Headers::new().with(RETRY_COUNT, "two");
        assert!(matches!(
            headers.retry_count(),
            Err(HeaderError::InvalidCount { value, .. }) if value == "two"
        ));
    }

    #[test]
    fn serializes_as_plain_object() {
        let headers = Headers::new().with(ERROR_TYPE, "VALIDATION");
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"{"X-Error-Type":"VALIDATION"}"#);

        let back: Headers = serde_json::from_str(&json).unwrap();
        assert_eq!(back, headers);
    }
}
