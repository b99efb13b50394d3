pub mod routes;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::evaluation::{EvaluationContext, EvaluationResult};

// MODELS

#[derive(Debug, Default, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default)]
    pub context: EvaluationContext,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub environment_key: String,
    pub version: u64,
    pub flags: BTreeMap<String, EvaluationResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_without_context() {
        let request: EvaluateRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.context.bucketing_key.is_none());
        assert!(request.context.attributes.is_empty());
    }
}
