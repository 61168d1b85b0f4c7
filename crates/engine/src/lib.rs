//! `requeue-engine`: retry/dead-letter orchestration.
//!
//! ```text
//! primary ─► MainFlow ─► ok: commit
//!               │ failure
//!               ▼
//!     classify ─► stamp ─► route ─► retry topic ─► Reprocessor (per tick) ─► MainFlow step
//!                            └────► dlq topic (terminal)
//! ```
//!
//! Classifier, metadata manager and router are stateless and shared by both
//! consumption paths without locking. The retry topic is the only point of
//! coordination between them.

pub mod classifier;
pub mod error;
pub mod flow;
pub mod metadata;
pub mod processor;
pub mod reprocessor;
pub mod router;


use std::sync::Arc;

use requeue_broker::Broker;
use requeue_core::{Clock, RequeueConfig};

pub use classifier::{Classification, ErrorClassifier};
pub use error::FlowError;
pub use flow::{FailureHandler, FlowOutcome, FlowState, MainFlow};
pub use metadata::{MAX_ERROR_CHARS, MetadataManager};
pub use processor::Processor;
pub use reprocessor::{Reprocessor, TickOutcome, TickReport};
pub use router::{Destination, RetryRouter, RoutingDecision};

/// Both consumption paths wired over one broker, processor and clock.
#[derive(Debug)]
pub struct Engine<B, P> {
    main_flow: Arc<MainFlow<B, P>>,
    reprocessor: Arc<Reprocessor<B, P>>,
}

impl<B, P> Engine<B, P>
where
    B: Broker + Clone,
    P: Processor,
{
    pub fn new(config: &RequeueConfig, broker: B, processor: P, clock: Arc<dyn Clock>) -> Self {
        let main_flow = Arc::new(MainFlow::new(
            broker,
            Arc::new(processor),
            config,
            clock.clone(),
        ));
        let reprocessor = Arc::new(Reprocessor::new(main_flow.clone(), config, clock));

        Self {
            main_flow,
            reprocessor,
        }
    }

    pub fn main_flow(&self) -> Arc<MainFlow<B, P>> {
        self.main_flow.clone()
    }

    pub fn reprocessor(&self) -> Arc<Reprocessor<B, P>> {
        self.reprocessor.clone()
    }
}
