use requeue_core::ProcessingFailure;

/// The business operation whose failures the engine manages.
///
/// Implementations must be safe to call from the main flow and the
/// reprocessor at the same time.
pub trait Processor: Send + Sync {
    fn process(&self, payload: &[u8]) -> Result<(), ProcessingFailure>;
}

impl<F> Processor for F
where
    F: Fn(&[u8]) -> Result<(), ProcessingFailure> + Send + Sync,
{
    fn process(&self, payload: &[u8]) -> Result<(), ProcessingFailure> {
        self(payload)
    }
}
