use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    Condition, FlagDefinition, RuleOutcome, Segment, Snapshot, TargetRule, TargetingRules,
    WeightedVariation,
};
use crate::error::BuildError;
use crate::evaluation::bucketing::BUCKET_SPACE;

// MODELS

/// Per (flag, environment) ruleset as the CRUD side stores it.
///
/// Defaults are optional here; the builder fills them from the flag's
/// default variation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetingRecord {
    pub flag_id: Uuid,
    pub enabled: bool,
    #[serde(default)]
    pub targets: Vec<TargetRule>,
    #[serde(default)]
    pub default_variation_id: Option<String>,
    #[serde(default)]
    pub default_rollout: Option<Vec<WeightedVariation>>,
    #[serde(default)]
    pub off_variation_id: Option<String>,
}

/// Everything the CRUD collaborator owns for one environment, read at publish time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRecords {
    pub flags: Vec<FlagDefinition>,
    pub targeting: Vec<TargetingRecord>,
    pub segments: Vec<Segment>,
}

// BUILD

/// Assemble the next snapshot for an environment.
///
/// The version is `previous.version + 1`, or 1 for the first publish. Callers
/// serialize builds per environment; builds for different environments are
/// independent.
pub fn build(
    environment_id: Uuid,
    records: SourceRecords,
    previous: Option<&Snapshot>,
) -> Result<Snapshot, BuildError> {
    let SourceRecords {
        flags,
        targeting,
        segments,
    } = records;

    let mut segments_by_id: HashMap<String, Segment> = HashMap::new();
    for segment in segments {
        if let Some(nested) = segment.conditions.iter().find_map(Condition::segment_id) {
            return Err(BuildError::NestedSegment {
                segment_id: segment.id.clone(),
                referenced: nested.to_string(),
            });
        }
        segments_by_id.insert(segment.id.clone(), segment);
    }

    let mut targeting_by_flag: HashMap<Uuid, TargetingRecord> = targeting
        .into_iter()
        .map(|record| (record.flag_id, record))
        .collect();

    let mut flag_map = BTreeMap::new();
    let mut rules_map = BTreeMap::new();
    let mut referenced_segments = BTreeSet::new();

    for flag in flags {
        validate_flag_key(&flag.key).map_err(|reason| BuildError::InvalidFlag {
            flag_key: flag.key.clone(),
            reason,
        })?;

        if flag_map.contains_key(&flag.key) {
            return Err(BuildError::DuplicateFlag {
                flag_key: flag.key.clone(),
            });
        }

        validate_variations(&flag)?;

        let record = targeting_by_flag.remove(&flag.id);
        let rules = resolve_rules(&flag, record)?;

        for target in &rules.targets {
            for condition in &target.conditions {
                if let Some(segment_id) = condition.segment_id() {
                    if !segments_by_id.contains_key(segment_id) {
                        return Err(BuildError::UnknownSegment {
                            flag_key: flag.key.clone(),
                            segment_id: segment_id.to_string(),
                        });
                    }
                    referenced_segments.insert(segment_id.to_string());
                }
            }
        }

        rules_map.insert(flag.key.clone(), rules);
        flag_map.insert(flag.key.clone(), flag);
    }

    if !targeting_by_flag.is_empty() {
        debug!(
            environment_id = %environment_id,
            orphaned = targeting_by_flag.len(),
            "Skipping targeting records for flags outside the environment"
        );
    }

    let segments = referenced_segments
        .into_iter()
        .filter_map(|id| segments_by_id.remove(&id).map(|segment| (id, segment)))
        .collect();

    Ok(Snapshot {
        environment_id,
        version: previous.map_or(1, |p| p.version + 1),
        flags: flag_map,
        rules: rules_map,
        segments,
        created_at: Utc::now(),
    })
}

fn validate_variations(flag: &FlagDefinition) -> Result<(), BuildError> {
    if flag.variations.is_empty() {
        return Err(BuildError::InvalidFlag {
            flag_key: flag.key.clone(),
            reason: "Flag must have at least one variation".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for variation in &flag.variations {
        if !seen.insert(variation.id.as_str()) {
            return Err(BuildError::InvalidFlag {
                flag_key: flag.key.clone(),
                reason: format!("Duplicate variation id '{}'", variation.id),
            });
        }
    }

    let defaults = flag.variations.iter().filter(|v| v.is_default).count();
    if defaults > 1 {
        return Err(BuildError::MultipleDefaults {
            flag_key: flag.key.clone(),
            count: defaults,
        });
    }

    Ok(())
}

fn resolve_rules(
    flag: &FlagDefinition,
    record: Option<TargetingRecord>,
) -> Result<TargetingRules, BuildError> {
    let flag_default = flag.default_variation().map(|v| v.id.clone());

    let record = record.unwrap_or(TargetingRecord {
        flag_id: flag.id,
        enabled: true,
        targets: Vec::new(),
        default_variation_id: None,
        default_rollout: None,
        off_variation_id: None,
    });

    let default_variation_id = match record.default_variation_id.or_else(|| flag_default.clone()) {
        Some(id) => id,
        // A default rollout always applies, so the default variation is never served
        None if record.default_rollout.is_some() => flag.variations[0].id.clone(),
        None => {
            return Err(BuildError::MissingDefault {
                flag_key: flag.key.clone(),
            })
        }
    };
    let off_variation_id = record
        .off_variation_id
        .or(flag_default)
        .unwrap_or_else(|| default_variation_id.clone());

    let mut targets = record.targets;
    targets.sort_by_key(|t| t.priority);

    let check_variation = |variation_id: &str| -> Result<(), BuildError> {
        match flag.variation(variation_id) {
            Some(_) => Ok(()),
            None => Err(BuildError::UnknownVariation {
                flag_key: flag.key.clone(),
                variation_id: variation_id.to_string(),
            }),
        }
    };

    check_variation(&default_variation_id)?;
    check_variation(&off_variation_id)?;

    if let Some(rollout) = &record.default_rollout {
        validate_rollout(&flag.key, rollout)?;
        rollout
            .iter()
            .try_for_each(|w| check_variation(&w.variation_id))?;
    }

    for target in &targets {
        match &target.outcome {
            RuleOutcome::Variation { variation_id } => check_variation(variation_id)?,
            RuleOutcome::Rollout { rollout } => {
                validate_rollout(&flag.key, rollout)?;
                rollout
                    .iter()
                    .try_for_each(|w| check_variation(&w.variation_id))?;
            }
        }
    }

    Ok(TargetingRules {
        targets,
        enabled: record.enabled,
        default_variation_id,
        default_rollout: record.default_rollout,
        off_variation_id,
    })
}

// HELPER FUNCTIONS

/// Validating the flag key
pub fn validate_flag_key(key: &str) -> Result<(), String> {
    let first = match key.chars().next() {
        Some(c) => c,
        None => return Err("Flag key cannot be empty".to_string()),
    };

    if key.len() > 64 {
        return Err("Flag key is too long (Max: 64 characters)".to_string());
    }

    if !first.is_ascii_alphabetic() {
        return Err("Flag key must start with a letter".to_string());
    }

    if !key.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == '.'
    }) {
        return Err(
            "Flag key can only contain lowercase letters, numbers, underscores, hyphens and dots"
                .to_string(),
        );
    }

    Ok(())
}

/// Rollout weights must cover the whole bucket space exactly.
pub fn validate_rollout(flag_key: &str, rollout: &[WeightedVariation]) -> Result<(), BuildError> {
    let total: u64 = rollout.iter().map(|w| u64::from(w.weight)).sum();
    if rollout.is_empty() || total != u64::from(BUCKET_SPACE) {
        return Err(BuildError::InvalidRollout {
            flag_key: flag_key.to_string(),
            total,
        });
    }
    Ok(())
}
