pub mod routes;

use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use tracing::error;

use crate::state::AppState;
use crate::store::EnvironmentRecord;

// MODELS

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    /// Version the caller already holds; same effect as `If-None-Match`.
    pub version: Option<u64>,
}

// HELPER FUNCTIONS

/// Validating the environment key
pub fn validate_environment_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Environment key cannot be empty".to_string());
    }

    if key.len() > 32 {
        return Err("Environment key is too long (Max: 32 characters)".to_string());
    }

    if !key.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err("Environment key must start with a lowercase letter".to_string());
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(
            "Environment key can only contain lowercase letters, numbers, underscores, and hyphens"
                .to_string(),
        );
    }

    Ok(())
}

/// Resolve an environment by its globally unique key.
pub async fn find_environment(
    state: &AppState,
    environment_key: &str,
) -> Result<EnvironmentRecord, (StatusCode, String)> {
    validate_environment_key(environment_key).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    state
        .sources
        .environment_by_key(environment_key)
        .await
        .map_err(|e| {
            error!(environment_key, error = %e, "Failed to fetch environment");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch environment".to_string(),
            )
        })?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Environment '{}' not found", environment_key),
            )
        })
}

/// Highest version named in an `If-None-Match` header (`"7"`, `W/"7"`, lists).
pub fn if_none_match_version(headers: &HeaderMap) -> Option<u64> {
    headers
        .get_all(axum::http::header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|tag| {
            let tag = tag.trim();
            let tag = tag.strip_prefix("W/").unwrap_or(tag);
            tag.trim_matches('"').parse::<u64>().ok()
        })
        .max()
}
