//! Core record types flowing through the tiers
//!
//! - `ReadingSubmission` - raw payload as delivered by the message bus
//! - `Reading` - validated, sanitized submission
//! - `StackSample` - one sub-entity of a reading; the stored raw record
//! - `IntervalBucket` - per-bucket parameter statistics
//! - `DeltaRecord` - per-bucket first/last/difference of counters

use super::interval::IntervalType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Round to two decimals (the precision reported for means and deltas)
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parameter value as reported by a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view; numeric strings count, non-finite values do not
    pub fn as_number(&self) -> Option<f64> {
        let value = match self {
            ParamValue::Number(n) => *n,
            ParamValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }

    /// Convert a JSON payload value; structured values and nulls are dropped
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(ParamValue::Number),
            serde_json::Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) => Some(ParamValue::Number(n)),
                Err(_) => Some(ParamValue::Text(s.clone())),
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub mobile_number: Option<String>,
}

impl Contact {
    pub fn has_channel(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        present(&self.email) || present(&self.mobile_number)
    }
}

/// Sub-entity entry of an incoming payload; parameters are inline fields
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubEntitySubmission {
    #[serde(default, alias = "stackName")]
    pub name: Option<String>,
    #[serde(default, alias = "stationType")]
    pub station_class: Option<String>,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Incoming payload; every field is optional so validation can report
/// exactly which one is missing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSubmission {
    #[serde(default, alias = "userName")]
    pub entity_id: Option<String>,
    #[serde(default, alias = "product_id")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default, alias = "industryType")]
    pub category: Option<String>,
    #[serde(default)]
    pub contact: Option<Contact>,
    #[serde(default, alias = "stacks", alias = "stackData")]
    pub sub_entities: Vec<SubEntitySubmission>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubEntityReading {
    pub name: String,
    pub station_class: String,
    pub parameters: BTreeMap<String, ParamValue>,
}

/// Validated reading accepted by the ingestion gate
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub entity_id: String,
    pub product_id: String,
    pub company_name: String,
    pub category: Option<String>,
    pub contact: Contact,
    pub sub_entities: Vec<SubEntityReading>,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Split into one stored sample per sub-entity
    pub fn into_samples(self, received_at: DateTime<Utc>, tags: &ClassificationTags) -> Vec<StackSample> {
        let Reading {
            entity_id,
            product_id,
            company_name,
            category,
            sub_entities,
            timestamp,
            ..
        } = self;

        sub_entities
            .into_iter()
            .map(|sub| StackSample {
                entity_id: entity_id.clone(),
                product_id: product_id.clone(),
                company_name: Some(company_name.clone()),
                category: category.clone(),
                sub_entity: sub.name,
                station_class: sub.station_class,
                parameters: sub.parameters,
                timestamp,
                received_at,
                tags: tags.clone(),
            })
            .collect()
    }
}

pub const EXCEEDED_LABEL: &str = "Parameter exceedance detected";
pub const WITHIN_LIMITS_LABEL: &str = "Within limits";
pub const STALE_LABEL: &str = "Time interval exceeded";
pub const ON_TIME_LABEL: &str = "Within allowed time interval";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceedanceTag {
    pub exceeded: bool,
    /// `sub_entity.parameter` names that crossed their limit
    pub parameters: Vec<String>,
    pub label: String,
    pub color: String,
}

impl ExceedanceTag {
    pub fn from_exceeded(parameters: Vec<String>) -> Self {
        let exceeded = !parameters.is_empty();
        Self {
            exceeded,
            parameters,
            label: if exceeded { EXCEEDED_LABEL } else { WITHIN_LIMITS_LABEL }.to_string(),
            color: if exceeded { "red" } else { "green" }.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StalenessTag {
    pub stale: bool,
    /// Seconds since the entity's previous reading, if there was one
    pub gap_secs: Option<i64>,
    pub label: String,
    pub color: String,
}

impl StalenessTag {
    pub fn classify(gap: Option<Duration>, limit: Duration) -> Self {
        let stale = gap.map_or(false, |g| g > limit);
        Self {
            stale,
            gap_secs: gap.map(|g| g.num_seconds()),
            label: if stale { STALE_LABEL } else { ON_TIME_LABEL }.to_string(),
            color: if stale { "purple" } else { "green" }.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTags {
    pub exceedance: ExceedanceTag,
    pub staleness: StalenessTag,
}

/// Stored raw record: one sub-entity of one reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSample {
    pub entity_id: String,
    pub product_id: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub sub_entity: String,
    pub station_class: String,
    pub parameters: BTreeMap<String, ParamValue>,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub tags: ClassificationTags,
}

/// Statistics of one parameter over a bucket
///
/// `sum` and `count` are kept so coarser buckets can roll up exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStats {
    pub mean: f64,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl ParameterStats {
    pub fn single(value: f64) -> Self {
        Self {
            mean: round2(value),
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn absorb(&mut self, value: f64) {
        self.merge(&ParameterStats::single(value));
    }

    pub fn merge(&mut self, other: &ParameterStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.mean = if self.count > 0 {
            round2(self.sum / self.count as f64)
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalBucket {
    pub entity_id: String,
    pub sub_entity: String,
    #[serde(default)]
    pub station_class: Option<String>,
    pub interval: IntervalType,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
    #[serde(default)]
    pub company_name: Option<String>,
    /// Raw readings represented by this bucket
    pub readings: u64,
    pub parameters: BTreeMap<String, ParameterStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterKind {
    /// Cumulative meter (energy, flow): delta is `last - first`, floored at zero
    Monotonic,
    /// Depleting level (fuel): small decreases are consumption, large ones are resets
    Depleting { reset_ceiling: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub kind: CounterKind,
    pub first: f64,
    pub last: f64,
    pub difference: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRecord {
    pub entity_id: String,
    pub sub_entity: String,
    #[serde(default)]
    pub station_class: Option<String>,
    pub interval: IntervalType,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
    #[serde(default)]
    pub company_name: Option<String>,
    pub counters: BTreeMap<String, CounterDelta>,
}
