//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP) to provide:
//! - **Durable topics**: one stream per topic, entries persist until trimmed
//! - **At-least-once**: entries stay pending until XACK'd
//! - **Consumer groups**: all engine instances share one group per topic
//! - **Redelivery**: released entries come back on the next poll; entries
//!   abandoned by a crashed consumer are reclaimed after the pending timeout
//! - **Poison entries**: entries that cannot be decoded are moved to the
//!   dead-letter topic and acknowledged
//!
//! ## Architecture
//!
//! - **Stream Key**: `requeue:<topic>`
//! - **Consumer Group**: `requeue` by default
//! - **Fields**: `key`, `payload` (raw bytes), `headers` (JSON object)
//! - **Creation timestamp**: the millisecond part of the entry id, which
//!   Redis keeps non-decreasing per stream. [`Broker::now_millis`] reads the
//!   same server clock through `TIME`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, error, instrument};

use requeue_broker::{Broker, BrokerError};
use requeue_core::headers::{
    ERROR_NAMESPACE, ERROR_TYPE, FAILURE_REASON, FULL_ERROR_TYPE, ORIGINAL_ERROR, TIMESTAMP,
};
use requeue_core::{FailureReason, Headers, Message, Record, Topics};
use requeue_engine::metadata::{MAX_ERROR_CHARS, truncate_chars};

/// Default stream key prefix
const DEFAULT_KEY_PREFIX: &str = "requeue";

/// Default consumer group
const DEFAULT_GROUP: &str = "requeue";

/// Default pending entry timeout (entries idle longer than this are reclaimed)
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_HEADERS: &str = "headers";

/// Error namespace/type stamped on entries that could not be decoded.
const UNDECODABLE_NAMESPACE: &str = "BROKER";
const UNDECODABLE_TYPE: &str = "UNDECODABLE_ENTRY";

/// Where an undecodable entry came from, and its raw headers field.
pub const SOURCE_TOPIC: &str = "X-Source-Topic";
pub const SOURCE_ENTRY_ID: &str = "X-Source-Entry-Id";
pub const RAW_HEADERS: &str = "X-Raw-Headers";

type ReleasedIds = HashMap<String, VecDeque<String>>;

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    key_prefix: String,
    group: String,
    consumer: String,
    pending_timeout_ms: u64,
    dead_letter_topic: String,
    groups_ready: Arc<Mutex<HashSet<String>>>,
    /// Entries handed back through `release`, per stream key, oldest first.
    released: Arc<Mutex<ReleasedIds>>,
}

impl RedisStreamsBroker {
    /// Create a new Redis Streams broker.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `consumer` - Unique consumer name within the group (e.g., "worker-1");
    ///   a random name is generated when `None`
    pub fn new(redis_url: impl AsRef<str>, consumer: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::now_v7())),
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
            dead_letter_topic: Topics::default().dlq,
            groups_ready: Arc::new(Mutex::new(HashSet::new())),
            released: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// How long an entry must sit unacknowledged before another poll reclaims it.
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Topic receiving entries that cannot be decoded.
    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = topic.into();
        self
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.key_prefix, topic)
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Ensure the consumer group of `stream_key` exists (idempotent).
    fn ensure_group(&self, conn: &mut redis::Connection, stream_key: &str) -> Result<(), BrokerError> {
        if let Ok(ready) = self.groups_ready.lock() {
            if ready.contains(stream_key) {
                return Ok(());
            }
        }

        // MKSTREAM creates the stream if needed; "0" starts the group at the
        // beginning. BUSYGROUP means it already exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);

        if let Err(e) = created {
            if e.code() != Some("BUSYGROUP") {
                return Err(BrokerError::Command(format!("XGROUP CREATE failed: {}", e)));
            }
        }

        if let Ok(mut ready) = self.groups_ready.lock() {
            ready.insert(stream_key.to_string());
        }
        Ok(())
    }

    fn remember_released(&self, stream_key: &str, id: &str) -> Result<(), BrokerError> {
        let mut released = self.released.lock().map_err(|_| BrokerError::Poisoned)?;
        let queue = released.entry(stream_key.to_string()).or_default();
        if !queue.iter().any(|queued| queued == id) {
            queue.push_back(id.to_string());
        }
        Ok(())
    }

    fn take_released(&self, stream_key: &str) -> Result<Option<String>, BrokerError> {
        let mut released = self.released.lock().map_err(|_| BrokerError::Poisoned)?;
        Ok(released.get_mut(stream_key).and_then(VecDeque::pop_front))
    }

    /// Take back the oldest entry this consumer released, whatever its idle time.
    fn claim_released(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
    ) -> Result<Option<StreamId>, BrokerError> {
        while let Some(id) = self.take_released(stream_key)? {
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(0)
                .arg(&id)
                .query(conn)
                .map_err(|e| BrokerError::Command(format!("XCLAIM failed: {}", e)))?;

            match claimed.ids.into_iter().next() {
                Some(entry) => return Ok(Some(entry)),
                // Acknowledged or deleted since it was released.
                None => debug!(stream = stream_key, id = %id, "released entry no longer pending"),
            }
        }
        Ok(None)
    }

    /// Reclaim one entry left pending longer than the pending timeout.
    fn claim_stale(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
    ) -> Result<Option<StreamId>, BrokerError> {
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.pending_timeout_ms.to_string())
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XPENDING failed: {}", e)))?;

        let Some(stale) = pending.ids.first() else {
            return Ok(None);
        };

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.pending_timeout_ms.to_string())
            .arg(&stale.id)
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XCLAIM failed: {}", e)))?;

        let entry = claimed.ids.into_iter().next();
        if let Some(entry) = &entry {
            debug!(
                stream = stream_key,
                id = %entry.id,
                deliveries = stale.times_delivered,
                "reclaimed stale pending entry"
            );
        }
        // None: claimed by another consumer in the meantime.
        Ok(entry)
    }

    /// Read the next new entry for this consumer (blocking).
    fn read_new(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        timeout: Duration,
    ) -> Result<Option<StreamId>, BrokerError> {
        // BLOCK 0 would wait forever.
        let block_ms = timeout.as_millis().max(1) as u64;

        let reply: StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms.to_string())
            .arg("STREAMS")
            .arg(stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {}", e)))?;

        Ok(reply.keys.into_iter().flat_map(|k| k.ids).next())
    }

    /// Released entries first, then stale pending entries, then new entries.
    fn next_entry(
        &self,
        conn: &mut redis::Connection,
        stream_key: &str,
        timeout: Duration,
    ) -> Result<Option<StreamId>, BrokerError> {
        if let Some(entry) = self.claim_released(conn, stream_key)? {
            return Ok(Some(entry));
        }
        if let Some(entry) = self.claim_stale(conn, stream_key)? {
            return Ok(Some(entry));
        }
        self.read_new(conn, stream_key, timeout)
    }

    /// Move an undecodable entry to the dead-letter topic and acknowledge it.
    fn quarantine(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        stream_key: &str,
        entry: &StreamId,
        cause: &BrokerError,
    ) -> Result<(), BrokerError> {
        let message = undecodable_message(topic, entry, &cause.to_string(), Utc::now());
        xadd(conn, &self.stream_key(&self.dead_letter_topic), &message)?;
        xack(conn, stream_key, &self.group, &entry.id)?;

        error!(
            topic,
            id = %entry.id,
            dead_letter_topic = %self.dead_letter_topic,
            error = %cause,
            "undecodable entry moved to dead-letter topic"
        );
        Ok(())
    }
}

fn xadd(conn: &mut redis::Connection, stream_key: &str, message: &Message) -> Result<String, BrokerError> {
    let headers = serde_json::to_string(&message.headers)
        .map_err(|e| BrokerError::Serialization(e.to_string()))?;

    redis::cmd("XADD")
        .arg(stream_key)
        .arg("*")
        .arg(FIELD_KEY)
        .arg(&message.key)
        .arg(FIELD_PAYLOAD)
        .arg(&message.payload[..])
        .arg(FIELD_HEADERS)
        .arg(&headers)
        .query(conn)
        .map_err(|e| BrokerError::Command(format!("XADD failed: {}", e)))
}

fn xack(conn: &mut redis::Connection, stream_key: &str, group: &str, id: &str) -> Result<u64, BrokerError> {
    redis::cmd("XACK")
        .arg(stream_key)
        .arg(group)
        .arg(id)
        .query(conn)
        .map_err(|e| BrokerError::Command(format!("XACK failed: {}", e)))
}

/// Parse a stream entry into a [`Record`].
fn parse_entry(topic: &str, entry: &StreamId) -> Result<Record, BrokerError> {
    let creation_timestamp = entry
        .id
        .split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .ok_or_else(|| BrokerError::Deserialization(format!("invalid entry id {}", entry.id)))?;

    let key: String = entry
        .get(FIELD_KEY)
        .ok_or_else(|| BrokerError::Deserialization("missing key field".to_string()))?;

    let payload: Vec<u8> = entry
        .get(FIELD_PAYLOAD)
        .ok_or_else(|| BrokerError::Deserialization("missing payload field".to_string()))?;

    let headers = match entry.get::<String>(FIELD_HEADERS) {
        Some(raw) => serde_json::from_str::<Headers>(&raw).map_err(|e| {
            BrokerError::Deserialization(format!("invalid headers on {}: {}", entry.id, e))
        })?,
        None => Headers::new(),
    };

    let message = Message::new(key, payload).with_headers(headers);
    Ok(Record::new(topic, entry.id.clone(), creation_timestamp, message))
}

/// Dead-letter message carrying whatever could be salvaged from a bad entry.
fn undecodable_message(topic: &str, entry: &StreamId, reason: &str, now: DateTime<Utc>) -> Message {
    let key: String = entry.get(FIELD_KEY).unwrap_or_default();
    let payload: Vec<u8> = entry.get(FIELD_PAYLOAD).unwrap_or_default();
    let raw_headers: Option<String> = entry.get(FIELD_HEADERS);

    let mut headers = raw_headers
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Headers>(raw).ok())
        .unwrap_or_default();
    if let Some(raw) = raw_headers.filter(|_| headers.is_empty()) {
        headers.insert(RAW_HEADERS, raw);
    }

    headers.insert(ORIGINAL_ERROR, truncate_chars(reason, MAX_ERROR_CHARS));
    headers.insert(ERROR_TYPE, UNDECODABLE_TYPE);
    headers.insert(ERROR_NAMESPACE, UNDECODABLE_NAMESPACE);
    headers.insert(FULL_ERROR_TYPE, format!("{UNDECODABLE_NAMESPACE}:{UNDECODABLE_TYPE}"));
    headers.insert(FAILURE_REASON, FailureReason::NonRetryableError.as_str());
    headers.insert(TIMESTAMP, now.to_rfc3339_opts(SecondsFormat::Millis, true));
    headers.insert(SOURCE_TOPIC, topic);
    headers.insert(SOURCE_ENTRY_ID, entry.id.as_str());

    Message::new(key, payload).with_headers(headers)
}

impl Broker for RedisStreamsBroker {
    /// XADD with an auto-generated id; returns once Redis confirms the write.
    #[instrument(skip(self, message), fields(key = %message.key), err)]
    fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        xadd(&mut conn, &self.stream_key(topic), &message)?;
        Ok(())
    }

    /// Undecodable entries are quarantined on the way and never returned.
    #[instrument(skip(self), err)]
    fn poll(&self, topic: &str, timeout: Duration) -> Result<Option<Record>, BrokerError> {
        let stream_key = self.stream_key(topic);
        let mut conn = self.connection()?;
        self.ensure_group(&mut conn, &stream_key)?;

        while let Some(entry) = self.next_entry(&mut conn, &stream_key, timeout)? {
            match parse_entry(topic, &entry) {
                Ok(record) => return Ok(Some(record)),
                Err(cause) => self.quarantine(&mut conn, topic, &stream_key, &entry, &cause)?,
            }
        }
        Ok(None)
    }

    #[instrument(skip(self, record), fields(topic = record.topic(), id = record.offset()), err)]
    fn commit(&self, record: &Record) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let acked = xack(&mut conn, &self.stream_key(record.topic()), &self.group, record.offset())?;

        if acked == 0 {
            return Err(BrokerError::NotInFlight {
                topic: record.topic().to_string(),
                offset: record.offset().to_string(),
            });
        }
        Ok(())
    }

    /// The entry stays pending under this consumer; the next poll of its
    /// topic claims it back before reading anything else.
    fn release(&self, record: &Record) -> Result<(), BrokerError> {
        self.remember_released(&self.stream_key(record.topic()), record.offset())?;
        debug!(topic = record.topic(), id = record.offset(), "entry released for redelivery");
        Ok(())
    }

    /// Redis server time, the clock behind entry ids.
    fn now_millis(&self) -> Result<Option<i64>, BrokerError> {
        let mut conn = self.connection()?;
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("TIME failed: {}", e)))?;
        Ok(Some(secs * 1_000 + micros / 1_000))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use requeue_core::headers::RETRY_COUNT;

    fn entry(id: &str, fields: &[(&str, &[u8])]) -> StreamId {
        let map: HashMap<String, redis::Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), redis::Value::Data(v.to_vec())))
            .collect();
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    fn broker() -> RedisStreamsBroker {
        RedisStreamsBroker::new("redis://127.0.0.1:6379", Some("w1".into())).unwrap()
    }

    fn record(topic: &str, id: &str) -> Record {
        Record::new(topic, id, 1, Message::new("k", "v"))
    }

    #[test]
    fn parses_entry_fields_and_timestamp() {
        let record = parse_entry(
            "orders.retry",
            &entry(
                "1700000000123-4",
                &[
                    (FIELD_KEY, b"order-1"),
                    (FIELD_PAYLOAD, b"\x00\x01binary"),
                    (FIELD_HEADERS, br#"{"X-Retry-Count":"2"}"#),
                ],
            ),
        )
        .unwrap();

        assert_eq!(record.topic(), "orders.retry");
        assert_eq!(record.offset(), "1700000000123-4");
        assert_eq!(record.creation_timestamp(), 1_700_000_000_123);
        assert_eq!(record.key(), "order-1");
        assert_eq!(record.payload(), b"\x00\x01binary");
        assert_eq!(record.headers().get(RETRY_COUNT), Some("2"));
    }

    #[test]
    fn missing_headers_field_means_no_headers() {
        let record = parse_entry(
            "t",
            &entry("1-0", &[(FIELD_KEY, b"k"), (FIELD_PAYLOAD, b"v")]),
        )
        .unwrap();
        assert!(record.headers().is_empty());
    }

    #[test]
    fn missing_key_is_rejected() {
        let err = parse_entry("t", &entry("1-0", &[(FIELD_PAYLOAD, b"v")])).unwrap_err();
        assert!(matches!(err, BrokerError::Deserialization(_)));
    }

    #[test]
    fn malformed_id_is_rejected() {
        let err = parse_entry(
            "t",
            &entry("not-an-id", &[(FIELD_KEY, b"k"), (FIELD_PAYLOAD, b"v")]),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerError::Deserialization(_)));
    }

    #[test]
    fn undecodable_entry_becomes_a_dead_letter() {
        let bad = entry(
            "1700000000123-0",
            &[(FIELD_PAYLOAD, b"{\"order\":1}"), (FIELD_HEADERS, b"not json")],
        );
        let cause = parse_entry("orders.retry", &bad).unwrap_err();
        let now = DateTime::from_timestamp_millis(1_700_000_000_500).unwrap();

        let message = undecodable_message("orders.retry", &bad, &cause.to_string(), now);

        // Salvaged message decodes cleanly.
        let stored_headers = serde_json::to_string(&message.headers).unwrap();
        let stored = entry(
            "1700000000600-0",
            &[
                (FIELD_KEY, message.key.as_bytes()),
                (FIELD_PAYLOAD, message.payload.as_slice()),
                (FIELD_HEADERS, stored_headers.as_bytes()),
            ],
        );
        assert!(parse_entry("orders.dlq", &stored).is_ok());

        assert_eq!(message.key, "");
        assert_eq!(message.payload, b"{\"order\":1}");
        let headers = &message.headers;
        assert_eq!(headers.get(FULL_ERROR_TYPE), Some("BROKER:UNDECODABLE_ENTRY"));
        assert_eq!(headers.get(FAILURE_REASON), Some("NON_RETRYABLE_ERROR"));
        assert!(headers.get(ORIGINAL_ERROR).unwrap().contains("missing key field"));
        assert_eq!(headers.get(RAW_HEADERS), Some("not json"));
        assert_eq!(headers.get(SOURCE_TOPIC), Some("orders.retry"));
        assert_eq!(headers.get(SOURCE_ENTRY_ID), Some("1700000000123-0"));
        assert_eq!(headers.get(TIMESTAMP), Some("2023-11-14T22:13:20.500Z"));
    }

    #[test]
    fn undecodable_entry_keeps_readable_headers() {
        let bad = entry("bad-id", &[(FIELD_KEY, b"k"), (FIELD_HEADERS, br#"{"X-Retry-Count":"1"}"#)]);
        let message = undecodable_message("t", &bad, "invalid entry id bad-id", Utc::now());

        assert_eq!(message.headers.get(RETRY_COUNT), Some("1"));
        assert!(!message.headers.contains(RAW_HEADERS));
    }

    #[test]
    fn released_entries_are_taken_back_oldest_first_per_stream() {
        let broker = broker();
        broker.release(&record("orders.retry", "5-0")).unwrap();
        broker.release(&record("orders.retry", "3-0")).unwrap();
        broker.release(&record("orders.retry", "5-0")).unwrap();
        broker.release(&record("other", "9-0")).unwrap();

        let retry = broker.stream_key("orders.retry");
        assert_eq!(broker.take_released(&retry).unwrap().as_deref(), Some("5-0"));
        assert_eq!(broker.take_released(&retry).unwrap().as_deref(), Some("3-0"));
        assert_eq!(broker.take_released(&retry).unwrap(), None);

        let other = broker.stream_key("other");
        assert_eq!(broker.take_released(&other).unwrap().as_deref(), Some("9-0"));
    }

    #[test]
    fn stream_keys_are_prefixed() {
        let broker = broker().with_key_prefix("app");
        assert_eq!(broker.stream_key("orders.dlq"), "app:orders.dlq");
    }
}
