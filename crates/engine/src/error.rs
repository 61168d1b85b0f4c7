//! Errors surfaced by the consumption paths.
//!
//! Only broker I/O fails a flow. Business failures always end in a routing
//! decision and never show up here.

use requeue_broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("poll from {topic} failed: {source}")]
    Poll { topic: String, source: BrokerError },

    #[error("publish to {topic} failed: {source}")]
    Publish { topic: String, source: BrokerError },

    #[error("commit on {topic} failed: {source}")]
    Commit { topic: String, source: BrokerError },

    #[error("reading broker time for {topic} failed: {source}")]
    Clock { topic: String, source: BrokerError },
}

impl FlowError {
    pub fn poll(topic: impl Into<String>, source: BrokerError) -> Self {
        Self::Poll {
            topic: topic.into(),
            source,
        }
    }

    pub fn publish(topic: impl Into<String>, source: BrokerError) -> Self {
        Self::Publish {
            topic: topic.into(),
            source,
        }
    }

    pub fn commit(topic: impl Into<String>, source: BrokerError) -> Self {
        Self::Commit {
            topic: topic.into(),
            source,
        }
    }

    pub fn clock(topic: impl Into<String>, source: BrokerError) -> Self {
        Self::Clock {
            topic: topic.into(),
            source,
        }
    }
}
