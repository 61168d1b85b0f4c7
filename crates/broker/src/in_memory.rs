//! In-memory broker for tests/dev.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use requeue_core::{Clock, Message, Record, SystemClock};

use crate::broker::Broker;
use crate::error::BrokerError;

/// One topic: records waiting for delivery plus records handed out but not
/// yet committed, both keyed by offset.
#[derive(Debug, Default)]
struct TopicLog {
    next_offset: u64,
    last_timestamp: i64,
    ready: VecDeque<(u64, Record)>,
    in_flight: BTreeMap<u64, Record>,
}

impl TopicLog {
    /// Put a record back at its offset position so delivery order is kept.
    fn requeue(&mut self, offset: u64, record: Record) {
        let pos = self
            .ready
            .iter()
            .position(|(o, _)| *o > offset)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, (offset, record));
    }
}

/// In-memory broker.
///
/// - No IO / no async
/// - Blocking poll bounded by the caller's timeout
/// - Creation timestamps come from the injected [`Clock`] and never go backwards
/// - At-least-once: uncommitted records can be released for redelivery
#[derive(Debug)]
pub struct InMemoryBroker<C = SystemClock> {
    topics: Mutex<HashMap<String, TopicLog>>,
    available: Condvar,
    clock: C,
}

impl InMemoryBroker<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryBroker<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryBroker<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            available: Condvar::new(),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, TopicLog>>, BrokerError> {
        self.topics.lock().map_err(|_| BrokerError::Poisoned)
    }

    /// Snapshot of every uncommitted record of `topic` (waiting or in flight), in offset order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let Ok(topics) = self.lock() else {
            return Vec::new();
        };
        let Some(log) = topics.get(topic) else {
            return Vec::new();
        };

        let mut all: BTreeMap<u64, Record> = log.in_flight.clone();
        all.extend(log.ready.iter().cloned());
        all.into_values().collect()
    }

    /// Number of uncommitted records of `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|t| t.get(topic).map(|l| l.ready.len() + l.in_flight.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }
}

fn parse_offset(record: &Record) -> Result<u64, BrokerError> {
    record
        .offset()
        .parse::<u64>()
        .map_err(|_| BrokerError::NotInFlight {
            topic: record.topic().to_string(),
            offset: record.offset().to_string(),
        })
}

impl<C: Clock> Broker for InMemoryBroker<C> {
    fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        let mut topics = self.lock()?;
        let log = topics.entry(topic.to_string()).or_default();

        let offset = log.next_offset;
        log.next_offset += 1;
        log.last_timestamp = log.last_timestamp.max(self.clock.now_millis());

        let record = Record::new(topic, offset.to_string(), log.last_timestamp, message);
        trace!(topic, offset, creation_timestamp = log.last_timestamp, "record appended");
        log.ready.push_back((offset, record));

        self.available.notify_all();
        Ok(())
    }

    fn poll(&self, topic: &str, timeout: Duration) -> Result<Option<Record>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut topics = self.lock()?;

        loop {
            if let Some(log) = topics.get_mut(topic) {
                if let Some((offset, record)) = log.ready.pop_front() {
                    log.in_flight.insert(offset, record.clone());
                    return Ok(Some(record));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (guard, _) = self
                .available
                .wait_timeout(topics, deadline - now)
                .map_err(|_| BrokerError::Poisoned)?;
            topics = guard;
        }
    }

    fn commit(&self, record: &Record) -> Result<(), BrokerError> {
        let offset = parse_offset(record)?;
        let mut topics = self.lock()?;

        topics
            .get_mut(record.topic())
            .and_then(|log| log.in_flight.remove(&offset))
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotInFlight {
                topic: record.topic().to_string(),
                offset: record.offset().to_string(),
            })
    }

    fn release(&self, record: &Record) -> Result<(), BrokerError> {
        let offset = parse_offset(record)?;
        let mut topics = self.lock()?;

        let log = topics
            .get_mut(record.topic())
            .ok_or_else(|| BrokerError::NotInFlight {
                topic: record.topic().to_string(),
                offset: record.offset().to_string(),
            })?;
        let original = log
            .in_flight
            .remove(&offset)
            .ok_or_else(|| BrokerError::NotInFlight {
                topic: record.topic().to_string(),
                offset: record.offset().to_string(),
            })?;
        log.requeue(offset, original);

        self.available.notify_all();
        Ok(())
    }

    fn now_millis(&self) -> Result<Option<i64>, BrokerError> {
        Ok(Some(self.clock.now_millis()))
    }
}
