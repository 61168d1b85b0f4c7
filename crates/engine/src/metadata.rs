//! Header stamping for failed messages.

use std::sync::Arc;

use chrono::SecondsFormat;

use requeue_core::headers::{
    ERROR_NAMESPACE, ERROR_TYPE, FULL_ERROR_TYPE, ORIGINAL_ERROR, RETRY_COUNT, TIMESTAMP,
};
use requeue_core::{Clock, Headers, ProcessingFailure};

/// Upper bound, in characters, of `X-Original-Error`.
pub const MAX_ERROR_CHARS: usize = 300;

/// Keep at most `max_chars` characters of `input`, cutting on a char boundary.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &input[..byte_idx],
        None => input,
    }
}

/// `description + "\n" + compact JSON payload`, before truncation.
pub fn describe(failure: &ProcessingFailure) -> String {
    let payload = serde_json::to_string(failure.payload()).unwrap_or_else(|_| "null".to_string());
    format!("{}\n{}", failure.description(), payload)
}

/// Builds the header set of a message leaving the processing path.
///
/// Pure with respect to the broker; the router publishes the result.
#[derive(Debug, Clone)]
pub struct MetadataManager {
    clock: Arc<dyn Clock>,
}

impl MetadataManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Stamp `headers` with `failure`, counting one more attempt than
    /// `previous_retry_count`.
    ///
    /// Unrelated headers are carried over. Error headers, the count and the
    /// timestamp are overwritten. `X-Failure-Reason` is left to the router.
    pub fn stamp(
        &self,
        headers: &Headers,
        failure: &ProcessingFailure,
        previous_retry_count: u32,
    ) -> Headers {
        let retry_count = previous_retry_count.saturating_add(1);
        let description = describe(failure);

        let mut stamped = headers.clone();
        stamped.insert(RETRY_COUNT, retry_count.to_string());
        stamped.insert(ORIGINAL_ERROR, truncate_chars(&description, MAX_ERROR_CHARS));
        stamped.insert(ERROR_TYPE, failure.error_type());
        stamped.insert(ERROR_NAMESPACE, failure.namespace());
        stamped.insert(FULL_ERROR_TYPE, failure.full_error_type());
        stamped.insert(
            TIMESTAMP,
            self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        stamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use requeue_core::ManualClock;
    use requeue_core::headers::FAILURE_REASON;

    fn manager_at(millis: i64) -> MetadataManager {
        MetadataManager::new(Arc::new(ManualClock::at(millis)))
    }

    #[test]
    fn first_failure_counts_one() {
        let failure = ProcessingFailure::new("HTTP", "SERVICE_UNAVAILABLE", "upstream 503");
        let headers = manager_at(0).stamp(&Headers::new(), &failure, 0);

        assert_eq!(headers.retry_count(), Ok(1));
        assert_eq!(headers.get(ERROR_TYPE), Some("SERVICE_UNAVAILABLE"));
        assert_eq!(headers.get(ERROR_NAMESPACE), Some("HTTP"));
        assert_eq!(headers.get(FULL_ERROR_TYPE), Some("HTTP:SERVICE_UNAVAILABLE"));
        assert_eq!(headers.get(ORIGINAL_ERROR), Some("upstream 503\nnull"));
    }

    #[test]
    fn overwrites_previous_error_and_keeps_unrelated_headers() {
        let previous = Headers::new()
            .with(ERROR_TYPE, "TIMEOUT")
            .with(RETRY_COUNT, "1")
            .with(FAILURE_REASON, "RETRYABLE_ERROR")
            .with("traceparent", "00-abc-01");
        let failure = ProcessingFailure::new("HTTP", "SERVICE_UNAVAILABLE", "again");

        let headers = manager_at(0).stamp(&previous, &failure, 1);

        assert_eq!(headers.retry_count(), Ok(2));
        assert_eq!(headers.get(ERROR_TYPE), Some("SERVICE_UNAVAILABLE"));
        assert_eq!(headers.get("traceparent"), Some("00-abc-01"));
        // Router's job; stamping leaves the stale reason for it to overwrite.
        assert_eq!(headers.get(FAILURE_REASON), Some("RETRYABLE_ERROR"));
    }

    #[test]
    fn timestamp_comes_from_clock() {
        let failure = ProcessingFailure::new("HTTP", "X", "d");
        let headers = manager_at(1_700_000_000_123).stamp(&Headers::new(), &failure, 0);
        assert_eq!(headers.get(TIMESTAMP), Some("2023-11-14T22:13:20.123Z"));
    }

    #[test]
    fn description_includes_serialized_payload() {
        let failure = ProcessingFailure::new("HTTP", "VALIDATION", "field missing")
            .with_payload(serde_json::json!({"field": "sku"}));
        assert_eq!(describe(&failure), "field missing\n{\"field\":\"sku\"}");
    }

    #[test]
    fn long_description_is_cut_to_limit() {
        let failure = ProcessingFailure::new("HTTP", "X", "e".repeat(1_000));
        let headers = manager_at(0).stamp(&Headers::new(), &failure, 0);
        let error = headers.get(ORIGINAL_ERROR).unwrap();

        assert_eq!(error.chars().count(), MAX_ERROR_CHARS);
        assert!(error.chars().all(|c| c == 'e'));
    }

    #[test]
    fn truncation_respects_multibyte_chars() {
        let input = "é".repeat(400);
        let out = truncate_chars(&input, MAX_ERROR_CHARS);
        assert_eq!(out.chars().count(), MAX_ERROR_CHARS);
        assert_eq!(out.len(), MAX_ERROR_CHARS * 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: output never exceeds the limit and is a prefix of the input;
        /// short inputs come back unchanged.
        #[test]
        fn truncation_is_bounded_prefix(input in "\\PC{0,600}") {
            let out = truncate_chars(&input, MAX_ERROR_CHARS);
            prop_assert!(out.chars().count() <= MAX_ERROR_CHARS);
            prop_assert!(input.starts_with(out));
            if input.chars().count() <= MAX_ERROR_CHARS {
                prop_assert_eq!(out, input.as_str());
            }
        }

        /// Property: every stamp adds exactly one to the previous count.
        #[test]
        fn stamp_increments_by_one(previous in 0u32..10_000) {
            let failure = ProcessingFailure::new("NS", "T", "d");
            let headers = manager_at(0).stamp(&Headers::new(), &failure, previous);
            prop_assert_eq!(headers.retry_count(), Ok(previous + 1));
        }
    }
}
