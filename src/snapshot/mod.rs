pub mod builder;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub use builder::{build, SourceRecords, TargetingRecord};

// MODELS

/// Immutable, versioned configuration for one environment.
///
/// A snapshot is never mutated after the builder hands it out; a newer
/// publish supersedes it. Everything that shares one travels as
/// `Arc<Snapshot>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub environment_id: Uuid,
    pub version: u64,
    /// Flags by key.
    pub flags: BTreeMap<String, FlagDefinition>,
    /// Targeting rules by flag key.
    pub rules: BTreeMap<String, TargetingRules>,
    /// Segments by id, only those referenced by `rules`.
    pub segments: BTreeMap<String, Segment>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// An empty snapshot at version 0, the state before any publish.
    pub fn empty(environment_id: Uuid) -> Self {
        Self {
            environment_id,
            version: 0,
            flags: BTreeMap::new(),
            rules: BTreeMap::new(),
            segments: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn flag_by_id(&self, flag_id: Uuid) -> Option<&FlagDefinition> {
        self.flags.values().find(|f| f.id == flag_id)
    }

    /// Entity tag used for conditional fetches.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    Boolean,
    String,
    Number,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinition {
    pub id: Uuid,
    pub key: String,
    pub kind: FlagKind,
    pub variations: Vec<Variation>,
}

impl FlagDefinition {
    pub fn variation(&self, variation_id: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == variation_id)
    }

    pub fn default_variation(&self) -> Option<&Variation> {
        self.variations.iter().find(|v| v.is_default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub id: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub key: String,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl Comparison {
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparison::Lt => ordering == Less,
            Comparison::Lte => ordering != Greater,
            Comparison::Gt => ordering == Greater,
            Comparison::Gte => ordering != Less,
            Comparison::Eq => ordering == Equal,
        }
    }
}

/// A single predicate on a context attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum Condition {
    Equals {
        attribute: String,
        value: serde_json::Value,
    },
    In {
        attribute: String,
        values: Vec<serde_json::Value>,
    },
    Contains {
        attribute: String,
        value: serde_json::Value,
    },
    Regex {
        attribute: String,
        pattern: Pattern,
    },
    NumericCompare {
        attribute: String,
        comparison: Comparison,
        value: serde_json::Value,
    },
    SemverCompare {
        attribute: String,
        comparison: Comparison,
        value: serde_json::Value,
    },
    SegmentRef {
        segment_id: String,
    },
}

impl Condition {
    pub fn segment_id(&self) -> Option<&str> {
        match self {
            Condition::SegmentRef { segment_id } => Some(segment_id),
            _ => None,
        }
    }
}

/// A regex operand, compiled once when the document is decoded.
///
/// An invalid pattern is kept (so it round-trips) but never matches.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    compiled: Option<Regex>,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let compiled = Regex::new(&source).ok();
        Self { source, compiled }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn regex(&self) -> Option<&Regex> {
        self.compiled.as_ref()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Ok(Pattern::new(source))
    }
}

/// A (variation, weight) pair; weights are basis points out of 100000.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedVariation {
    pub variation_id: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleOutcome {
    Variation { variation_id: String },
    Rollout { rollout: Vec<WeightedVariation> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRule {
    pub id: String,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    pub outcome: RuleOutcome,
}

/// Ruleset for one (flag, environment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetingRules {
    /// Stored in evaluation order.
    pub targets: Vec<TargetRule>,
    pub enabled: bool,
    pub default_variation_id: String,
    #[serde(default)]
    pub default_rollout: Option<Vec<WeightedVariation>>,
    pub off_variation_id: String,
}
