//! Retry-vs-dead-letter routing.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use requeue_broker::Broker;
use requeue_core::headers::FAILURE_REASON;
use requeue_core::{FailureReason, Headers, Message, Record, RequeueConfig, Topics};

use crate::classifier::Classification;
use crate::error::FlowError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    RetryTopic,
    DlqTopic,
}

/// Where a failed message went and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub destination: Destination,
    pub reason: FailureReason,
    pub retry_count: u32,
}

/// Pure routing table, evaluated in order:
///
/// 1. non-retryable or unknown → DLQ, `NON_RETRYABLE_ERROR`
/// 2. retryable below the limit → retry topic, `RETRYABLE_ERROR`
/// 3. retryable at or above the limit → DLQ, `MAX_RETRIES_EXCEEDED`
pub fn decide(
    classification: Classification,
    retry_count: u32,
    max_attempts: u32,
) -> RoutingDecision {
    let (destination, reason) = match classification {
        Classification::NonRetryable | Classification::Unknown => {
            (Destination::DlqTopic, FailureReason::NonRetryableError)
        }
        Classification::Retryable if retry_count < max_attempts => {
            (Destination::RetryTopic, FailureReason::RetryableError)
        }
        Classification::Retryable => (Destination::DlqTopic, FailureReason::MaxRetriesExceeded),
    };

    RoutingDecision {
        destination,
        reason,
        retry_count,
    }
}

/// Publishes failed messages to the retry or dead-letter topic.
///
/// Publish failures are returned as-is; the caller must not commit the
/// source record.
#[derive(Debug, Clone)]
pub struct RetryRouter<B> {
    broker: B,
    topics: Topics,
    max_attempts: u32,
}

impl<B: Broker> RetryRouter<B> {
    pub fn new(broker: B, topics: Topics, max_attempts: u32) -> Self {
        Self {
            broker,
            topics,
            max_attempts,
        }
    }

    pub fn from_config(broker: B, config: &RequeueConfig) -> Self {
        Self::new(broker, config.topics.clone(), config.max_attempts)
    }

    pub fn topic_for(&self, destination: Destination) -> &str {
        match destination {
            Destination::RetryTopic => &self.topics.retry,
            Destination::DlqTopic => &self.topics.dlq,
        }
    }

    /// Route `source` with its freshly stamped `headers`.
    ///
    /// Key and payload are preserved; `X-Failure-Reason` is added.
    pub fn route(
        &self,
        source: &Record,
        mut headers: Headers,
        classification: Classification,
        retry_count: u32,
    ) -> Result<RoutingDecision, FlowError> {
        let decision = decide(classification, retry_count, self.max_attempts);
        let topic = self.topic_for(decision.destination);

        headers.insert(FAILURE_REASON, decision.reason.as_str());
        let message = Message::new(source.key(), source.payload()).with_headers(headers);

        self.broker
            .publish(topic, message)
            .map_err(|e| FlowError::publish(topic, e))?;

        match decision.destination {
            Destination::RetryTopic => info!(
                topic,
                key = source.key(),
                retry_count,
                reason = %decision.reason,
                "message scheduled for retry"
            ),
            Destination::DlqTopic => warn!(
                topic,
                key = source.key(),
                retry_count,
                reason = %decision.reason,
                ?classification,
                "message dead-lettered"
            ),
        }

        Ok(decision)
    }
}
