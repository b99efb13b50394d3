pub mod routes;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluation::{EvaluationContext, EvaluationResult};

/// Bucketing key used when a preview request brings no context.
pub const PREVIEW_BUCKETING_KEY: &str = "preview";

// MODELS

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub environment_ids: Vec<Uuid>,
    #[serde(default)]
    pub context: Option<EvaluationContext>,
}

#[derive(Debug, Serialize)]
pub struct PreviewEntry {
    pub environment_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EvaluationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreviewEntry {
    pub fn failed(environment_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            environment_id,
            version: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub flag_id: Uuid,
    pub context: EvaluationContext,
    pub environments: Vec<PreviewEntry>,
}

// HELPER FUNCTIONS

/// The caller's context, or a synthetic one keyed `preview`.
pub fn preview_context(context: Option<EvaluationContext>) -> EvaluationContext {
    let mut context = context.unwrap_or_default();
    if context.bucketing_key.is_none() {
        context.bucketing_key = Some(PREVIEW_BUCKETING_KEY.to_string());
    }
    context
}
