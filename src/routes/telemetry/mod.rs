pub mod routes;

use serde::Serialize;

use crate::telemetry::TelemetryEvent;

/// SSE event name for one evaluation on the live feed.
pub const EVALUATION_EVENT: &str = "evaluation";

/// Largest batch accepted from a single SDK post.
pub const MAX_INGEST_BATCH: usize = 1000;

// MODELS

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

// HELPER FUNCTIONS

pub fn validate_batch(events: &[TelemetryEvent]) -> Result<(), String> {
    if events.len() > MAX_INGEST_BATCH {
        return Err(format!(
            "Telemetry batch too large ({} events, max {})",
            events.len(),
            MAX_INGEST_BATCH
        ));
    }

    if let Some(event) = events.iter().find(|e| e.flag_key.is_empty()) {
        return Err(format!(
            "Telemetry event for environment {} has an empty flag key",
            event.environment_id
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{EvaluationContext, EvaluationResult};
    use crate::telemetry::Origin;
    use serde_json::Value;
    use uuid::Uuid;

    fn event(flag_key: &str) -> TelemetryEvent {
        TelemetryEvent::new(
            Uuid::new_v4(),
            EvaluationResult::fallback(flag_key, &Value::Bool(false)),
            &EvaluationContext::new(),
            3,
            Origin::Sdk,
        )
    }

    #[test]
    fn test_validate_batch() {
        assert!(validate_batch(&[]).is_ok());
        assert!(validate_batch(&[event("new-ui"), event("dark-mode")]).is_ok());
        assert!(validate_batch(&[event("new-ui"), event("")]).is_err());

        let oversized: Vec<_> = (0..=MAX_INGEST_BATCH).map(|_| event("new-ui")).collect();
        let err = validate_batch(&oversized).unwrap_err();
        assert!(err.contains("too large"));
    }
}
