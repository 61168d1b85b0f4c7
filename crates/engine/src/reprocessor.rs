//! Scheduled batch reprocessing of the retry topic.
//!
//! One tick:
//!
//! 1. Record the execution timestamp before touching the broker.
//! 2. Poll the retry topic up to `batch_size` times, one record per poll.
//!    - nothing within `poll_timeout`: the topic is drained, stop early
//!    - created at or after the execution timestamp: the record was routed
//!      during this tick (by this tick or by the main flow); skip it
//!    - otherwise hand it to the main flow's processing step
//! 3. Give skipped records back to the broker so a later tick sees them.
//!
//! Ticks never overlap: a tick requested while another is running returns
//! [`TickOutcome::Overlapped`] immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use requeue_broker::Broker;
use requeue_core::{Clock, Record, RequeueConfig};

use crate::error::FlowError;
use crate::flow::{FlowOutcome, MainFlow};
use crate::processor::Processor;
use crate::router::Destination;

/// Counters of a finished tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub execution_timestamp: i64,
    /// Poll attempts, including the one that found the topic empty.
    pub polls: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub topic_empty: bool,
    pub elapsed: Duration,
}

impl TickReport {
    fn new(execution_timestamp: i64) -> Self {
        Self {
            execution_timestamp,
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: &FlowOutcome) {
        match outcome {
            FlowOutcome::Succeeded => self.succeeded += 1,
            FlowOutcome::Routed(d) => match d.destination {
                Destination::RetryTopic => self.retried += 1,
                Destination::DlqTopic => self.dead_lettered += 1,
            },
        }
    }

    /// Records that went through processing (skips excluded).
    pub fn reprocessed(&self) -> usize {
        self.succeeded + self.retried + self.dead_lettered
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still running; this one did nothing.
    Overlapped,
}

/// Clears the running flag when the tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reprocessor<B, P> {
    flow: Arc<MainFlow<B, P>>,
    clock: Arc<dyn Clock>,
    topic: String,
    batch_size: usize,
    poll_timeout: Duration,
    running: AtomicBool,
}

impl<B, P> core::fmt::Debug for Reprocessor<B, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reprocessor")
            .field("topic", &self.topic)
            .field("batch_size", &self.batch_size)
            .field("poll_timeout", &self.poll_timeout)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B, P> Reprocessor<B, P>
where
    B: Broker,
    P: Processor,
{
    pub fn new(flow: Arc<MainFlow<B, P>>, config: &RequeueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            flow,
            clock,
            topic: config.topics.retry.clone(),
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout,
            running: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one tick. The scheduler's single entry point.
    pub fn run_tick(&self) -> Result<TickOutcome, FlowError> {
        let Some(_guard) = TickGuard::acquire(&self.running) else {
            debug!(topic = %self.topic, "previous tick still running; skipping");
            return Ok(TickOutcome::Overlapped);
        };

        let started = Instant::now();
        let execution_timestamp = self.execution_timestamp()?;
        let mut report = TickReport::new(execution_timestamp);
        let mut deferred = Vec::new();

        let drained = self.drain(execution_timestamp, &mut report, &mut deferred);

        for record in &deferred {
            if let Err(e) = self.flow.broker().release(record) {
                warn!(
                    topic = %self.topic,
                    offset = record.offset(),
                    error = %e,
                    "failed to release skipped record"
                );
            }
        }
        report.elapsed = started.elapsed();

        if let Err(e) = drained {
            error!(topic = %self.topic, error = %e, ?report, "reprocessing tick aborted");
            return Err(e);
        }

        info!(
            topic = %self.topic,
            execution_timestamp,
            polls = report.polls,
            skipped = report.skipped,
            succeeded = report.succeeded,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            topic_empty = report.topic_empty,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "reprocessing tick finished"
        );
        Ok(TickOutcome::Completed(report))
    }

    /// Tick start on the clock that stamped the records being compared.
    fn execution_timestamp(&self) -> Result<i64, FlowError> {
        match self.flow.broker().now_millis() {
            Ok(Some(now)) => Ok(now),
            Ok(None) => Ok(self.clock.now_millis()),
            Err(e) => Err(FlowError::clock(&self.topic, e)),
        }
    }

    fn drain(
        &self,
        execution_timestamp: i64,
        report: &mut TickReport,
        deferred: &mut Vec<Record>,
    ) -> Result<(), FlowError> {
        for _ in 0..self.batch_size {
            report.polls += 1;
            let polled = self
                .flow
                .broker()
                .poll(&self.topic, self.poll_timeout)
                .map_err(|e| FlowError::poll(&self.topic, e))?;

            let Some(record) = polled else {
                report.topic_empty = true;
                break;
            };

            if record.creation_timestamp() >= execution_timestamp {
                debug!(
                    topic = %self.topic,
                    offset = record.offset(),
                    creation_timestamp = record.creation_timestamp(),
                    execution_timestamp,
                    "record produced during this tick; leaving it for the next one"
                );
                report.skipped += 1;
                deferred.push(record);
                continue;
            }

            let outcome = self.flow.handle_record(&record)?;
            report.record(&outcome);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use requeue_broker::InMemoryBroker;
    use requeue_core::{ManualClock, Message, ProcessingFailure};

    type TestBroker = Arc<InMemoryBroker<ManualClock>>;

    fn setup<P: Processor>(
        clock: &ManualClock,
        processor: P,
        batch_size: usize,
    ) -> (TestBroker, Reprocessor<TestBroker, P>) {
        let config = RequeueConfig::default()
            .with_retryable(["SERVICE_UNAVAILABLE"])
            .with_batch_size(batch_size)
            .with_poll_timeout(Duration::from_millis(10));
        let broker: TestBroker = Arc::new(InMemoryBroker::with_clock(clock.clone()));
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let flow = Arc::new(MainFlow::new(
            broker.clone(),
            Arc::new(processor),
            &config,
            clock.clone(),
        ));
        (broker, Reprocessor::new(flow, &config, clock))
    }

    fn ok(_: &[u8]) -> Result<(), ProcessingFailure> {
        Ok(())
    }

    fn completed(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Completed(report) => report,
            TickOutcome::Overlapped => panic!("tick unexpectedly overlapped"),
        }
    }

    #[test]
    fn empty_topic_stops_after_one_poll() {
        let clock = ManualClock::at(1_000);
        let (_, reprocessor) = setup(&clock, ok, 50);

        let report = completed(reprocessor.run_tick().unwrap());
        assert_eq!(report.polls, 1);
        assert!(report.topic_empty);
        assert_eq!(report.reprocessed(), 0);
    }

    #[test]
    fn batch_size_bounds_a_tick() {
        let clock = ManualClock::at(1_000);
        let (broker, reprocessor) = setup(&clock, ok, 2);
        for i in 0..5 {
            broker
                .publish("requeue.retry", Message::new(format!("k{i}"), "v"))
                .unwrap();
        }
        clock.set(2_000);

        let report = completed(reprocessor.run_tick().unwrap());
        assert_eq!(report.polls, 2);
        assert_eq!(report.succeeded, 2);
        assert!(!report.topic_empty);
        assert_eq!(broker.len("requeue.retry"), 3);
    }

    #[test]
    fn records_created_at_tick_start_are_skipped_and_released() {
        let clock = ManualClock::at(1_000);
        let (broker, reprocessor) = setup(&clock, ok, 10);
        broker
            .publish("requeue.retry", Message::new("same-ms", "v"))
            .unwrap();

        let report = completed(reprocessor.run_tick().unwrap());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.reprocessed(), 0);
        assert_eq!(broker.len("requeue.retry"), 1);

        clock.advance(1);
        let report = completed(reprocessor.run_tick().unwrap());
        assert_eq!(report.succeeded, 1);
        assert!(broker.is_empty("requeue.retry"));
    }

    #[test]
    fn tick_start_comes_from_the_broker_clock() {
        let broker_clock = ManualClock::at(5_000);
        let worker_clock = ManualClock::at(5_000);
        let config = RequeueConfig::default()
            .with_retryable(["SERVICE_UNAVAILABLE"])
            .with_max_attempts(10)
            .with_batch_size(10)
            .with_poll_timeout(Duration::from_millis(10));
        let broker: TestBroker = Arc::new(InMemoryBroker::with_clock(broker_clock.clone()));
        let clock: Arc<dyn Clock> = Arc::new(worker_clock.clone());
        let flow = Arc::new(MainFlow::new(
            broker.clone(),
            Arc::new(|_: &[u8]| -> Result<(), ProcessingFailure> {
                Err(ProcessingFailure::new("HTTP", "SERVICE_UNAVAILABLE", "503"))
            }),
            &config,
            clock.clone(),
        ));
        let reprocessor = Reprocessor::new(flow, &config, clock);
        broker.publish("requeue.retry", Message::new("k", "v")).unwrap();

        // Broker clock runs 50 ms behind the worker's.
        broker_clock.set(9_950);
        worker_clock.set(10_000);

        let report = completed(reprocessor.run_tick().unwrap());
        assert_eq!(report.execution_timestamp, 9_950);
        assert_eq!(report.retried, 1);
        assert_eq!(report.skipped, 1);

        let pending = broker.records("requeue.retry");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].headers().get("X-Retry-Count"), Some("1"));
    }

    #[test]
    fn overlapping_tick_is_skipped_not_queued() {
        let clock = ManualClock::at(1_000);
        let barrier = Arc::new(Barrier::new(2));
        let inside = barrier.clone();
        let (broker, reprocessor) = setup(
            &clock,
            move |_: &[u8]| -> Result<(), ProcessingFailure> {
                inside.wait();
                inside.wait();
                Ok(())
            },
            1,
        );
        broker.publish("requeue.retry", Message::new("k", "v")).unwrap();
        clock.set(2_000);

        let reprocessor = Arc::new(reprocessor);
        let background = reprocessor.clone();
        let handle = thread::spawn(move || background.run_tick());

        // First wait: the background tick is inside processing.
        barrier.wait();
        assert!(reprocessor.is_running());
        assert_eq!(reprocessor.run_tick().unwrap(), TickOutcome::Overlapped);
        barrier.wait();

        let report = completed(handle.join().unwrap().unwrap());
        assert_eq!(report.succeeded, 1);
        assert!(!reprocessor.is_running());
    }
}
