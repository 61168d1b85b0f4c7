//! Failure classification.
//!
//! Operators register error names at two granularities: a bare type
//! (`SERVICE_UNAVAILABLE`) or a `namespace:type` composite
//! (`HTTP:SERVICE_UNAVAILABLE`). Both keys of a failure are looked up in both
//! sets. Overlapping entries are settled by the configured [`OverlapPolicy`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use requeue_core::{OverlapPolicy, ProcessingFailure, RequeueConfig};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Retryable,
    NonRetryable,
    /// Matched neither set. Routed like [`Classification::NonRetryable`].
    Unknown,
}

impl Classification {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Classification::Retryable)
    }
}

/// Stateless classifier over the configured error-name sets.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    retryable: HashSet<String>,
    non_retryable: HashSet<String>,
    policy: OverlapPolicy,
}

impl ErrorClassifier {
    pub fn new(
        retryable: HashSet<String>,
        non_retryable: HashSet<String>,
        policy: OverlapPolicy,
    ) -> Self {
        Self {
            retryable,
            non_retryable,
            policy,
        }
    }

    pub fn from_config(config: &RequeueConfig) -> Self {
        Self::new(
            config.retryable_errors.clone(),
            config.non_retryable_errors.clone(),
            config.overlap_policy,
        )
    }

    /// Classify a failure by its bare and composite type.
    ///
    /// `_namespace` is part of the contract but only matters through
    /// `full_error_type`.
    pub fn classify(
        &self,
        error_type: &str,
        _namespace: &str,
        full_error_type: &str,
    ) -> Classification {
        let matches = |set: &HashSet<String>| {
            set.contains(full_error_type) || set.contains(error_type)
        };

        let permanent = matches(&self.non_retryable);
        let transient = matches(&self.retryable);

        match (permanent, transient, self.policy) {
            (true, true, OverlapPolicy::RetryableWins) => Classification::Retryable,
            (true, _, _) => Classification::NonRetryable,
            (false, true, _) => Classification::Retryable,
            (false, false, _) => Classification::Unknown,
        }
    }

    /// Classify a processing failure. Untyped failures are always unknown.
    pub fn classify_failure(&self, failure: &ProcessingFailure) -> Classification {
        if !failure.is_typed() {
            return Classification::Unknown;
        }
        self.classify(
            failure.error_type(),
            failure.namespace(),
            &failure.full_error_type(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classifier(retryable: &[&str], non_retryable: &[&str]) -> ErrorClassifier {
        let config = RequeueConfig::default()
            .with_retryable(retryable.iter().copied())
            .with_non_retryable(non_retryable.iter().copied());
        ErrorClassifier::from_config(&config)
    }

    #[test]
    fn bare_type_matches_any_namespace() {
        let c = classifier(&["SERVICE_UNAVAILABLE"], &[]);
        assert_eq!(
            c.classify("SERVICE_UNAVAILABLE", "HTTP", "HTTP:SERVICE_UNAVAILABLE"),
            Classification::Retryable
        );
        assert_eq!(
            c.classify("SERVICE_UNAVAILABLE", "KAFKA", "KAFKA:SERVICE_UNAVAILABLE"),
            Classification::Retryable
        );
    }

    #[test]
    fn composite_matches_only_its_namespace() {
        let c = classifier(&["HTTP:TIMEOUT"], &[]);
        assert_eq!(
            c.classify("TIMEOUT", "HTTP", "HTTP:TIMEOUT"),
            Classification::Retryable
        );
        assert_eq!(
            c.classify("TIMEOUT", "DB", "DB:TIMEOUT"),
            Classification::Unknown
        );
    }

    #[test]
    fn non_retryable_wins_on_overlap_by_default() {
        let c = classifier(&["HTTP:CONFLICT"], &["CONFLICT"]);
        assert_eq!(
            c.classify("CONFLICT", "HTTP", "HTTP:CONFLICT"),
            Classification::NonRetryable
        );
    }

    #[test]
    fn retryable_wins_when_policy_says_so() {
        let config = RequeueConfig::default()
            .with_retryable(["CONFLICT"])
            .with_non_retryable(["CONFLICT"])
            .with_overlap_policy(OverlapPolicy::RetryableWins);
        let c = ErrorClassifier::from_config(&config);

        assert_eq!(
            c.classify("CONFLICT", "HTTP", "HTTP:CONFLICT"),
            Classification::Retryable
        );
    }

    #[test]
    fn untyped_failure_is_unknown_even_if_configured() {
        let c = classifier(&["UNKNOWN_ERROR"], &[]);
        let failure = ProcessingFailure::untyped("panic in handler");
        assert_eq!(c.classify_failure(&failure), Classification::Unknown);
    }

    #[test]
    fn typed_failure_uses_both_keys() {
        let c = classifier(&[], &["HTTP:VALIDATION"]);
        let failure = ProcessingFailure::new("HTTP", "VALIDATION", "bad payload");
        assert_eq!(c.classify_failure(&failure), Classification::NonRetryable);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a name present in the non-retryable set classifies as
        /// NON_RETRYABLE whatever the retryable set holds.
        #[test]
        fn non_retryable_membership_takes_precedence(
            namespace in "[A-Z]{1,8}",
            error_type in "[A-Z_]{1,16}",
            register_composite in any::<bool>(),
            also_retryable in any::<bool>(),
        ) {
            let full = format!("{namespace}:{error_type}");
            let key = if register_composite { full.clone() } else { error_type.clone() };

            let mut config = RequeueConfig::default().with_non_retryable([key.clone()]);
            if also_retryable {
                config = config.with_retryable([key]);
            }
            let c = ErrorClassifier::from_config(&config);

            prop_assert_eq!(c.classify(&error_type, &namespace, &full), Classification::NonRetryable);
        }

        /// Property: classification is deterministic for the same input.
        #[test]
        fn classification_is_idempotent(error_type in "[A-Z_]{1,12}") {
            let c = classifier(&["A", "B:C"], &["D"]);
            let full = format!("NS:{error_type}");
            prop_assert_eq!(
                c.classify(&error_type, "NS", &full),
                c.classify(&error_type, "NS", &full)
            );
        }
    }
}
