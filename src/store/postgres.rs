use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::{EnvironmentRecord, Result, SnapshotStore, SourceStore};
use crate::error::StoreError;
use crate::snapshot::{
    FlagDefinition, FlagKind, Segment, Snapshot, SourceRecords, TargetRule, TargetingRecord,
    Variation, WeightedVariation,
};

// Database row types

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    id: Uuid,
    key: String,
    kind: String,
    variations: Json<Vec<Variation>>,
}

#[derive(Debug, sqlx::FromRow)]
struct TargetingRow {
    flag_id: Uuid,
    enabled: bool,
    targets: Json<Vec<TargetRule>>,
    default_variation_id: Option<String>,
    default_rollout: Option<Json<Vec<WeightedVariation>>>,
    off_variation_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SegmentRow {
    id: String,
    key: String,
    conditions: Json<Vec<crate::snapshot::Condition>>,
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    document: Json<Snapshot>,
}

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_kind(raw: &str) -> Result<FlagKind> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(StoreError::Serialization)
}

#[async_trait]
impl SourceStore for PgStore {
    async fn environment(&self, id: Uuid) -> Result<Option<EnvironmentRecord>> {
        let environment = sqlx::query_as::<_, EnvironmentRecord>(
            "SELECT id, project_id, key FROM environments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(environment)
    }

    async fn environment_by_key(&self, key: &str) -> Result<Option<EnvironmentRecord>> {
        let environment = sqlx::query_as::<_, EnvironmentRecord>(
            "SELECT id, project_id, key FROM environments WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(environment)
    }

    async fn project_environments(&self, project_id: Uuid) -> Result<Vec<EnvironmentRecord>> {
        let environments = sqlx::query_as::<_, EnvironmentRecord>(
            r#"
            SELECT id, project_id, key
            FROM environments
            WHERE project_id = $1
            ORDER BY key ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(environments)
    }

    async fn load_records(&self, environment: &EnvironmentRecord) -> Result<SourceRecords> {
        let flags: Vec<FlagRow> = sqlx::query_as(
            r#"
            SELECT id, key, kind, variations
            FROM flags
            WHERE project_id = $1 AND archived = FALSE
            ORDER BY key ASC
            "#,
        )
        .bind(environment.project_id)
        .fetch_all(&self.pool)
        .await?;

        let targeting: Vec<TargetingRow> = sqlx::query_as(
            r#"
            SELECT flag_id, enabled, targets, default_variation_id, default_rollout, off_variation_id
            FROM targeting_rules
            WHERE environment_id = $1
            "#,
        )
        .bind(environment.id)
        .fetch_all(&self.pool)
        .await?;

        let segments: Vec<SegmentRow> = sqlx::query_as(
            "SELECT id, key, conditions FROM segments WHERE project_id = $1",
        )
        .bind(environment.project_id)
        .fetch_all(&self.pool)
        .await?;

        debug!(
            environment_id = %environment.id,
            flags = flags.len(),
            targeting = targeting.len(),
            segments = segments.len(),
            "Loaded source records"
        );

        let flags = flags
            .into_iter()
            .map(|row| {
                Ok(FlagDefinition {
                    id: row.id,
                    kind: parse_kind(&row.kind)?,
                    key: row.key,
                    variations: row.variations.0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let targeting = targeting
            .into_iter()
            .map(|row| TargetingRecord {
                flag_id: row.flag_id,
                enabled: row.enabled,
                targets: row.targets.0,
                default_variation_id: row.default_variation_id,
                default_rollout: row.default_rollout.map(|r| r.0),
                off_variation_id: row.off_variation_id,
            })
            .collect();

        let segments = segments
            .into_iter()
            .map(|row| Segment {
                id: row.id,
                key: row.key,
                conditions: row.conditions.0,
            })
            .collect();

        Ok(SourceRecords {
            flags,
            targeting,
            segments,
        })
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn latest(&self, environment_id: Uuid) -> Result<Option<Snapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT document
            FROM snapshots
            WHERE environment_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.document.0))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let created_at: DateTime<Utc> = snapshot.created_at;
        let result = sqlx::query(
            r#"
            INSERT INTO snapshots (environment_id, version, document, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (environment_id, version) DO NOTHING
            "#,
        )
        .bind(snapshot.environment_id)
        .bind(snapshot.version as i64)
        .bind(Json(snapshot))
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                environment_id: snapshot.environment_id,
                version: snapshot.version,
            });
        }
        Ok(())
    }

    async fn prune(&self, environment_id: Uuid, retain: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM snapshots
            WHERE environment_id = $1
              AND version NOT IN (
                SELECT version FROM snapshots
                WHERE environment_id = $1
                ORDER BY version DESC
                LIMIT $2
              )
            "#,
        )
        .bind(environment_id)
        .bind(retain.max(1) as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("boolean").unwrap(), FlagKind::Boolean);
        assert_eq!(parse_kind("json").unwrap(), FlagKind::Json);
        assert!(parse_kind("Boolean").is_err());
    }
}
