//! Topic publish/consume abstraction (mechanics only).
//!
//! The engine only needs four operations from a broker: append a message to a
//! topic, take the next record of a topic, and acknowledge or give back a
//! record it has taken.
//!
//! ## Delivery Guarantees
//!
//! Brokers provide **at-least-once delivery**:
//!
//! - A record returned by [`Broker::poll`] stays *in flight* until it is
//!   committed or released
//! - A released (or never committed) record is delivered again later
//! - Consumers must be idempotent; the engine achieves this by recomputing
//!   retry counts from the record's headers every time
//!
//! ## Creation Timestamps
//!
//! Every record carries a broker-assigned creation timestamp. Within a topic,
//! timestamps are **non-decreasing in publish order**. The reprocessor's loop
//! prevention depends on this.

use std::sync::Arc;
use std::time::Duration;

use requeue_core::{Message, Record};

use crate::error::BrokerError;

/// Domain-agnostic broker client.
///
/// ## Error Handling
///
/// Every operation can fail (connection lost, command rejected). Failures are
/// surfaced to the caller and never retried here; broker-level retry and
/// backoff belong to the underlying client.
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`: the main consumption flow and the
/// scheduled reprocessor share one broker from different threads.
pub trait Broker: Send + Sync {
    /// Append `message` to `topic`. Returns once the broker has accepted it.
    fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError>;

    /// Take the next record of `topic`, waiting up to `timeout`.
    ///
    /// `Ok(None)` means nothing arrived within the timeout.
    fn poll(&self, topic: &str, timeout: Duration) -> Result<Option<Record>, BrokerError>;

    /// Acknowledge a polled record. It will not be delivered again.
    fn commit(&self, record: &Record) -> Result<(), BrokerError>;

    /// Give a polled record back without acknowledging it, so it is delivered again.
    fn release(&self, record: &Record) -> Result<(), BrokerError>;

    /// Current time, in epoch milliseconds, on the clock that stamps creation
    /// timestamps.
    ///
    /// Comparisons against [`Record::creation_timestamp`] must use this value.
    /// `Ok(None)` means the broker has no clock of its own and the caller's
    /// clock is authoritative.
    fn now_millis(&self) -> Result<Option<i64>, BrokerError> {
        Ok(None)
    }
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        (**self).publish(topic, message)
    }

    fn poll(&self, topic: &str, timeout: Duration) -> Result<Option<Record>, BrokerError> {
        (**self).poll(topic, timeout)
    }

    fn commit(&self, record: &Record) -> Result<(), BrokerError> {
        (**self).commit(record)
    }

    fn release(&self, record: &Record) -> Result<(), BrokerError> {
        (**self).release(record)
    }

    fn now_millis(&self) -> Result<Option<i64>, BrokerError> {
        (**self).now_millis()
    }
}
