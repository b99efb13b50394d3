use std::collections::BTreeMap;

use semver::Version;
use serde_json::Value;
use tracing::trace;

use super::EvaluationContext;
use crate::error::FlagError;
use crate::snapshot::{Condition, Segment};

/// How many `segment_ref` hops evaluation follows. Rules may reference a
/// segment; a segment may not reference another.
pub const SEGMENT_DEPTH_LIMIT: usize = 1;

/// Evaluate one condition. Type mismatches and missing attributes are
/// non-matching, never errors.
pub fn matches(
    condition: &Condition,
    context: &EvaluationContext,
    segments: &BTreeMap<String, Segment>,
    depth: usize,
) -> bool {
    match condition {
        Condition::Equals { attribute, value } => context
            .attribute(attribute)
            .is_some_and(|actual| values_equal(actual, value)),

        Condition::In { attribute, values } => context
            .attribute(attribute)
            .is_some_and(|actual| values.iter().any(|v| values_equal(actual, v))),

        Condition::Contains { attribute, value } => match (context.attribute(attribute), value) {
            (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Some(Value::Array(items)), needle) => items.iter().any(|item| values_equal(item, needle)),
            _ => false,
        },

        Condition::Regex { attribute, pattern } => {
            let actual = context.attribute(attribute).and_then(Value::as_str);
            match (actual, pattern.regex()) {
                (Some(text), Some(regex)) => regex.is_match(text),
                (Some(_), None) => {
                    if let Some(detail) = malformed_operand(condition) {
                        trace!(detail = %detail, "Condition never matches");
                    }
                    false
                }
                _ => false,
            }
        }

        Condition::NumericCompare {
            attribute,
            comparison,
            value,
        } => {
            let actual = context.attribute(attribute).and_then(Value::as_f64);
            match (actual, value.as_f64()) {
                (Some(actual), Some(expected)) => actual
                    .partial_cmp(&expected)
                    .is_some_and(|ordering| comparison.holds(ordering)),
                _ => false,
            }
        }

        Condition::SemverCompare {
            attribute,
            comparison,
            value,
        } => {
            let actual = context.attribute(attribute).and_then(parse_semver);
            match (actual, parse_semver(value)) {
                (Some(actual), Some(expected)) => comparison.holds(actual.cmp(&expected)),
                (_, None) => {
                    if let Some(detail) = malformed_operand(condition) {
                        trace!(detail = %detail, "Condition never matches");
                    }
                    false
                }
                _ => false,
            }
        }

        Condition::SegmentRef { segment_id } => {
            if depth >= SEGMENT_DEPTH_LIMIT {
                trace!(segment_id = %segment_id, "Nested segment reference never matches");
                return false;
            }
            segments.get(segment_id).is_some_and(|segment| {
                segment
                    .conditions
                    .iter()
                    .all(|c| matches(c, context, segments, depth + 1))
            })
        }
    }
}

/// Operands that can never match whatever the context holds: a regex that
/// failed to compile, or a semver operand that does not parse.
pub fn malformed_operand(condition: &Condition) -> Option<FlagError> {
    match condition {
        Condition::Regex { pattern, .. } if pattern.regex().is_none() => Some(
            FlagError::MalformedCondition(format!("invalid regex {:?}", pattern.as_str())),
        ),
        Condition::SemverCompare { value, .. } if parse_semver(value).is_none() => Some(
            FlagError::MalformedCondition(format!("invalid semver operand {}", value)),
        ),
        _ => None,
    }
}

/// JSON equality, except numbers compare by value (`1 == 1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn parse_semver(value: &Value) -> Option<Version> {
    let raw = value.as_str()?;
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    Version::parse(raw).ok()
}
