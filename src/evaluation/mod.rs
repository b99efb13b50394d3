pub mod bucketing;
pub mod operators;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FlagError;
use crate::snapshot::{FlagDefinition, RuleOutcome, Snapshot, WeightedVariation};

// Caller-supplied attributes for one evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// Stable key for bucketing (usually a user id). Absent means anonymous:
    /// every evaluation draws a fresh random key.
    #[serde(default)]
    pub bucketing_key: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.bucketing_key = Some(key.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    RuleMatch,
    Default,
    Off,
    Fallback,
    Error,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::RuleMatch => "RULE_MATCH",
            Reason::Default => "DEFAULT",
            Reason::Off => "OFF",
            Reason::Fallback => "FALLBACK",
            Reason::Error => "ERROR",
        }
    }
}

// Flag evaluation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub flag_key: String,
    pub value: Value,
    #[serde(default)]
    pub variation_id: Option<String>,
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl EvaluationResult {
    /// The caller's fallback, used before the first successful sync.
    pub fn fallback(flag_key: &str, fallback: &Value) -> Self {
        Self {
            flag_key: flag_key.to_string(),
            value: fallback.clone(),
            variation_id: None,
            reason: Reason::Fallback,
            matched_rule_id: None,
            error_detail: Some(FlagError::StaleOrUnreachable.to_string()),
        }
    }

    pub fn error(flag_key: &str, fallback: &Value, detail: impl Into<String>) -> Self {
        Self {
            flag_key: flag_key.to_string(),
            value: fallback.clone(),
            variation_id: None,
            reason: Reason::Error,
            matched_rule_id: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// Evaluate one flag against a snapshot.
///
/// Never fails: an unknown flag, a dangling variation reference or a rollout
/// that misses the bucket all come back as `Reason::Error` carrying
/// `fallback`. The order is:
/// 1. Unknown flag -> ERROR
/// 2. Ruleset disabled -> off variation, OFF
/// 3. First target whose conditions all hold -> its variation or rollout, RULE_MATCH
/// 4. Default rollout, if any -> DEFAULT
/// 5. Default variation -> DEFAULT
pub fn evaluate(
    snapshot: &Snapshot,
    flag_key: &str,
    context: &EvaluationContext,
    fallback: &Value,
) -> EvaluationResult {
    let (flag, rules) = match (snapshot.flags.get(flag_key), snapshot.rules.get(flag_key)) {
        (Some(flag), Some(rules)) => (flag, rules),
        _ => return EvaluationResult::error(flag_key, fallback, FlagError::ConfigNotFound.to_string()),
    };

    // Step 1: A disabled ruleset ignores targets and defaults entirely
    if !rules.enabled {
        return serve(flag, &rules.off_variation_id, Reason::Off, None, fallback);
    }

    // Step 2: Targets in stored order, first full match wins
    for target in &rules.targets {
        let matched = target
            .conditions
            .iter()
            .all(|c| operators::matches(c, context, &snapshot.segments, 0));
        if !matched {
            continue;
        }

        return match &target.outcome {
            RuleOutcome::Variation { variation_id } => {
                serve(flag, variation_id, Reason::RuleMatch, Some(&target.id), fallback)
            }
            RuleOutcome::Rollout { rollout } => roll_out(
                flag,
                rollout,
                context,
                Reason::RuleMatch,
                Some(&target.id),
                fallback,
            ),
        };
    }

    // Step 3: Nothing matched
    match &rules.default_rollout {
        Some(rollout) => roll_out(flag, rollout, context, Reason::Default, None, fallback),
        None => serve(flag, &rules.default_variation_id, Reason::Default, None, fallback),
    }
}

/// Evaluate every flag in the snapshot with a `null` fallback.
///
/// An anonymous context gets one random key for the whole batch, so a
/// single request sees a consistent assignment across flags.
pub fn evaluate_all(snapshot: &Snapshot, context: &EvaluationContext) -> Vec<EvaluationResult> {
    let context = if context.bucketing_key.is_some() {
        context.clone()
    } else {
        context.clone().with_key(Uuid::new_v4().to_string())
    };

    snapshot
        .flags
        .keys()
        .map(|key| evaluate(snapshot, key, &context, &Value::Null))
        .collect()
}

fn serve(
    flag: &FlagDefinition,
    variation_id: &str,
    reason: Reason,
    matched_rule_id: Option<&str>,
    fallback: &Value,
) -> EvaluationResult {
    match flag.variation(variation_id) {
        Some(variation) => EvaluationResult {
            flag_key: flag.key.clone(),
            value: variation.value.clone(),
            variation_id: Some(variation.id.clone()),
            reason,
            matched_rule_id: matched_rule_id.map(str::to_string),
            error_detail: None,
        },
        None => EvaluationResult::error(
            &flag.key,
            fallback,
            format!("unknown variation '{}'", variation_id),
        ),
    }
}

fn roll_out(
    flag: &FlagDefinition,
    rollout: &[WeightedVariation],
    context: &EvaluationContext,
    reason: Reason,
    matched_rule_id: Option<&str>,
    fallback: &Value,
) -> EvaluationResult {
    let bucket = match context.bucketing_key.as_deref() {
        Some(key) => bucketing::bucket(&flag.key, key),
        None => bucketing::bucket(&flag.key, &Uuid::new_v4().to_string()),
    };

    match bucketing::select(rollout, bucket) {
        Some(entry) => serve(flag, &entry.variation_id, reason, matched_rule_id, fallback),
        None => EvaluationResult::error(
            &flag.key,
            fallback,
            format!("rollout does not cover bucket {}", bucket),
        ),
    }
}
