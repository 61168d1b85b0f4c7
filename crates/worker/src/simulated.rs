//! Payload-directed stand-in for the business operation.
//!
//! Payloads must be JSON. A `simulate_error` object makes processing fail with
//! that typed failure:
//!
//! ```json
//! {"order": 42, "simulate_error": {"namespace": "payments", "type": "SERVICE_UNAVAILABLE", "description": "gateway down"}}
//! ```

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use requeue_core::ProcessingFailure;
use requeue_engine::Processor;

#[derive(Debug, Deserialize)]
struct SimulatedError {
    namespace: String,
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    details: JsonValue,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedProcessor;

impl Processor for SimulatedProcessor {
    fn process(&self, payload: &[u8]) -> Result<(), ProcessingFailure> {
        let mut body: JsonValue = serde_json::from_slice(payload)
            .map_err(|e| ProcessingFailure::untyped(format!("payload is not JSON: {e}")))?;

        let Some(spec) = body.as_object_mut().and_then(|o| o.remove("simulate_error")) else {
            debug!(bytes = payload.len(), "payload processed");
            return Ok(());
        };

        let simulated: SimulatedError = serde_json::from_value(spec).map_err(|e| {
            ProcessingFailure::untyped(format!("malformed simulate_error: {e}"))
        })?;

        Err(
            ProcessingFailure::new(simulated.namespace, simulated.error_type, simulated.description)
                .with_payload(simulated.details),
        )
    }
}
