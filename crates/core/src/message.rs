use serde::{Deserialize, Serialize};

use crate::headers::Headers;

/// Outbound unit handed to a broker.
///
/// The key is the partition/ordering key and is preserved across every
/// re-publication of the same logical message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl Message {
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A message as consumed from a topic.
///
/// `creation_timestamp` is assigned by the broker at publish time
/// (milliseconds since the epoch, non-decreasing per topic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    topic: String,
    offset: String,
    creation_timestamp: i64,
    message: Message,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        offset: impl Into<String>,
        creation_timestamp: i64,
        message: Message,
    ) -> Self {
        Self {
            topic: topic.into(),
            offset: offset.into(),
            creation_timestamp,
            message,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Broker position of the record (numeric offset or stream entry id).
    pub fn offset(&self) -> &str {
        &self.offset
    }

    pub fn creation_timestamp(&self) -> i64 {
        self.creation_timestamp
    }

    pub fn key(&self) -> &str {
        &self.message.key
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}
