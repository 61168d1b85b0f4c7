//! Main consumption flow.
//!
//! Each consumed record walks an explicit state machine:
//!
//! ```text
//! RECEIVED → PROCESSING → SUCCEEDED                               (commit)
//!                       → FAILED → classify → stamp → route → ROUTED (commit)
//! ```
//!
//! The source record is committed only once it reached a terminal state. Any
//! broker error on the way releases it for redelivery instead; because the
//! prior retry count is always read back from the record's headers, handling
//! the redelivered copy produces the same routing.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use requeue_broker::Broker;
use requeue_core::{Clock, ProcessingFailure, Record, RequeueConfig};

use crate::classifier::ErrorClassifier;
use crate::error::FlowError;
use crate::metadata::MetadataManager;
use crate::processor::Processor;
use crate::router::{RetryRouter, RoutingDecision};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowState {
    Received,
    Processing,
    Succeeded,
    Failed,
    Routed,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Succeeded | FlowState::Routed)
    }
}

/// Terminal result of handling one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutcome {
    Succeeded,
    Routed(RoutingDecision),
}

/// Classify → stamp → route for a single failure.
///
/// Stateless; shared by the main flow and the reprocessor.
#[derive(Debug, Clone)]
pub struct FailureHandler<B> {
    classifier: ErrorClassifier,
    metadata: MetadataManager,
    router: RetryRouter<B>,
}

impl<B: Broker> FailureHandler<B> {
    pub fn new(classifier: ErrorClassifier, metadata: MetadataManager, router: RetryRouter<B>) -> Self {
        Self {
            classifier,
            metadata,
            router,
        }
    }

    pub fn from_config(broker: B, config: &RequeueConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            ErrorClassifier::from_config(config),
            MetadataManager::new(clock),
            RetryRouter::from_config(broker, config),
        )
    }

    pub fn handle(
        &self,
        record: &Record,
        failure: &ProcessingFailure,
        previous_retry_count: u32,
    ) -> Result<RoutingDecision, FlowError> {
        let classification = self.classifier.classify_failure(failure);
        let headers = self
            .metadata
            .stamp(record.headers(), failure, previous_retry_count);
        let retry_count = previous_retry_count.saturating_add(1);

        debug!(
            key = record.key(),
            error = %failure,
            ?classification,
            retry_count,
            "failure classified"
        );

        self.router
            .route(record, headers, classification, retry_count)
    }
}

/// Consumes the primary topic and drives failures through [`FailureHandler`].
#[derive(Debug)]
pub struct MainFlow<B, P> {
    broker: B,
    processor: Arc<P>,
    failures: FailureHandler<B>,
    topic: String,
    poll_timeout: Duration,
}

impl<B, P> MainFlow<B, P>
where
    B: Broker + Clone,
    P: Processor,
{
    pub fn new(
        broker: B,
        processor: Arc<P>,
        config: &RequeueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            failures: FailureHandler::from_config(broker.clone(), config, clock),
            broker,
            processor,
            topic: config.topics.primary.clone(),
            poll_timeout: config.poll_timeout,
        }
    }
}

impl<B, P> MainFlow<B, P>
where
    B: Broker,
    P: Processor,
{
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Poll the primary topic once and handle what arrives.
    ///
    /// `Ok(None)` when nothing arrived within the poll timeout.
    pub fn consume_next(&self) -> Result<Option<FlowOutcome>, FlowError> {
        let record = self
            .broker
            .poll(&self.topic, self.poll_timeout)
            .map_err(|e| FlowError::poll(&self.topic, e))?;

        match record {
            Some(record) => self.handle_record(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Process one record to a terminal state, then commit it.
    ///
    /// On a broker error the record is released (not committed) and the
    /// error returned.
    pub fn handle_record(&self, record: &Record) -> Result<FlowOutcome, FlowError> {
        let outcome = match self.process(record) {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(release_err) = self.broker.release(record) {
                    error!(
                        topic = record.topic(),
                        offset = record.offset(),
                        error = %release_err,
                        "failed to release record after flow error"
                    );
                }
                return Err(err);
            }
        };

        self.broker
            .commit(record)
            .map_err(|e| FlowError::commit(record.topic(), e))?;

        Ok(outcome)
    }

    /// Run the processing step without committing.
    pub fn process(&self, record: &Record) -> Result<FlowOutcome, FlowError> {
        let mut state = FlowState::Received;
        self.transition(record, &mut state, FlowState::Processing);

        let failure = match run_processor(&*self.processor, record) {
            Ok(()) => {
                self.transition(record, &mut state, FlowState::Succeeded);
                return Ok(FlowOutcome::Succeeded);
            }
            Err(failure) => failure,
        };
        self.transition(record, &mut state, FlowState::Failed);

        let previous = previous_retry_count(record);
        let decision = self.failures.handle(record, &failure, previous)?;
        self.transition(record, &mut state, FlowState::Routed);

        debug_assert!(state.is_terminal());
        Ok(FlowOutcome::Routed(decision))
    }

    fn transition(&self, record: &Record, state: &mut FlowState, next: FlowState) {
        trace!(
            topic = record.topic(),
            offset = record.offset(),
            from = ?*state,
            to = ?next,
            "flow transition"
        );
        *state = next;
    }
}

/// Invoke the processor, turning a panic into an untyped failure.
fn run_processor<P: Processor + ?Sized>(
    processor: &P,
    record: &Record,
) -> Result<(), ProcessingFailure> {
    panic::catch_unwind(AssertUnwindSafe(|| processor.process(record.payload())))
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(
                topic = record.topic(),
                offset = record.offset(),
                panic = %message,
                "processor panicked"
            );
            Err(ProcessingFailure::untyped(format!("processor panicked: {message}")))
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Retry count the record carried when it was consumed.
///
/// A malformed header is treated as absent.
pub fn previous_retry_count(record: &Record) -> u32 {
    record.headers().retry_count().unwrap_or_else(|err| {
        warn!(
            topic = record.topic(),
            offset = record.offset(),
            error = %err,
            "ignoring malformed retry count"
        );
        0
    })
}
