use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

/// Failure modes below the evaluation boundary.
///
/// None of these reach an evaluating caller as an error: they become a
/// fallback value plus a `reason`/`error_detail`, or (for transport) show up
/// only as staleness.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("unknown flag")]
    ConfigNotFound,

    #[error("no snapshot available yet")]
    StaleOrUnreachable,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("malformed condition: {0}")]
    MalformedCondition(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} missing, it is required")]
    Missing(&'static str),

    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Published snapshots are immutable; a second save of a version loses.
    #[error("snapshot version {version} already exists for environment {environment_id}")]
    VersionConflict { environment_id: Uuid, version: u64 },
}

/// Publish-time validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("flag '{flag_key}' is invalid: {reason}")]
    InvalidFlag { flag_key: String, reason: String },

    #[error("flag key '{flag_key}' appears more than once")]
    DuplicateFlag { flag_key: String },

    #[error("flag '{flag_key}' has {count} default variations")]
    MultipleDefaults { flag_key: String, count: usize },

    #[error("flag '{flag_key}' has no default variation and no default rollout")]
    MissingDefault { flag_key: String },

    #[error("flag '{flag_key}' references unknown variation '{variation_id}'")]
    UnknownVariation {
        flag_key: String,
        variation_id: String,
    },

    #[error("flag '{flag_key}' has a rollout totalling {total}, expected 100000")]
    InvalidRollout { flag_key: String, total: u64 },

    #[error("flag '{flag_key}' references unknown segment '{segment_id}'")]
    UnknownSegment {
        flag_key: String,
        segment_id: String,
    },

    #[error("segment '{segment_id}' references segment '{referenced}'; segments cannot nest")]
    NestedSegment {
        segment_id: String,
        referenced: String,
    },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("environment {0} not found")]
    EnvironmentNotFound(Uuid),

    #[error("project {0} not found")]
    ProjectNotFound(Uuid),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The room actor for an environment stopped before it could answer.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("distribution room for environment {0} is unavailable")]
pub struct RoomUnavailable(pub Uuid);

impl PublishError {
    pub fn status(&self) -> StatusCode {
        match self {
            PublishError::EnvironmentNotFound(_) | PublishError::ProjectNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PublishError::Build(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PublishError::Store(StoreError::VersionConflict { .. }) => StatusCode::CONFLICT,
            PublishError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors surfaced by the client sync SDK.
///
/// Evaluation never returns these; they come from `ready()`, `refresh()` and
/// the transport.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("failed to parse snapshot: {0}")]
    Parse(String),

    #[error("request timed out")]
    Timeout,

    #[error("client has been closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Flag(FlagError::TransportFailure(message.into()))
    }

    /// Whether the background loops should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Closed | SyncError::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_strings() {
        assert_eq!(FlagError::ConfigNotFound.to_string(), "unknown flag");
        assert_eq!(
            FlagError::TransportFailure("connection reset".to_string()).to_string(),
            "transport failure: connection reset"
        );
    }

    #[test]
    fn test_publish_error_status() {
        assert_eq!(
            PublishError::EnvironmentNotFound(Uuid::nil()).status(),
            StatusCode::NOT_FOUND
        );
        let build = PublishError::from(BuildError::MissingDefault {
            flag_key: "new-ui".to_string(),
        });
        assert_eq!(build.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let conflict = PublishError::from(StoreError::VersionConflict {
            environment_id: Uuid::nil(),
            version: 4,
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_retryable() {
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::transport("reset").is_retryable());
        assert!(!SyncError::Closed.is_retryable());
    }
}
