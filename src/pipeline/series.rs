//! Generic tiered series: one configuration value per data class
//!
//! A `TieredSeries<R>` ties a record type to its data class name (hot-store
//! partition and cold-store prefix), its archive partitioning, its retention
//! window and its cold-read policy. Readings, interval buckets and delta
//! records of every interval type all flow through the same code paths.

use super::interval::IntervalType;
use super::types::{DeltaRecord, IntervalBucket, StackSample};
use crate::store::{CompositeKey, HotDocument, StoreError, RAW_INTERVAL};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;

/// Record stored in both tiers
pub trait TierRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn composite_key(&self) -> CompositeKey;

    /// Version instant in ms; the later version wins on key collision
    fn version_ms(&self) -> i64;

    /// Instant used for ordering and date-range predicates
    fn timestamp(&self) -> DateTime<Utc>;
}

impl TierRecord for StackSample {
    fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(
            self.entity_id.as_str(),
            self.sub_entity.as_str(),
            RAW_INTERVAL,
            self.timestamp.timestamp_millis(),
        )
    }

    fn version_ms(&self) -> i64 {
        self.received_at.timestamp_millis()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl TierRecord for IntervalBucket {
    fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(
            self.entity_id.as_str(),
            self.sub_entity.as_str(),
            self.interval.as_str(),
            self.bucket_start.timestamp_millis(),
        )
    }

    fn version_ms(&self) -> i64 {
        self.computed_at.timestamp_millis()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.bucket_start
    }
}

impl TierRecord for DeltaRecord {
    fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(
            self.entity_id.as_str(),
            self.sub_entity.as_str(),
            self.interval.as_str(),
            self.bucket_start.timestamp_millis(),
        )
    }

    fn version_ms(&self) -> i64 {
        self.computed_at.timestamp_millis()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.bucket_start
    }
}

/// How a data class is split into archive objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioning {
    /// `<class>/YYYY.json`
    Year,
    /// `<class>/YYYY-MM.json`
    Month,
    /// `<class>/YYYY-MM-DD.json`
    Day,
    /// `<class>/YYYY-MM-DD/HH.json`
    Hour,
}

impl Partitioning {
    fn step(&self) -> Option<Duration> {
        match self {
            Partitioning::Hour => Some(Duration::hours(1)),
            Partitioning::Day => Some(Duration::days(1)),
            Partitioning::Month | Partitioning::Year => None,
        }
    }

    /// Calendar interval whose buckets line up with one partition
    fn calendar(&self) -> IntervalType {
        match self {
            Partitioning::Year => IntervalType::Yearly,
            Partitioning::Month => IntervalType::Monthly,
            Partitioning::Day => IntervalType::Daily,
            Partitioning::Hour => IntervalType::Hourly,
        }
    }
}

/// When the reader consults the cold tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdFallback {
    /// Always merge cold results in
    Always,
    /// Only when the hot tier returned nothing
    WhenHotEmpty,
}

#[derive(Debug, Clone)]
pub struct SeriesSpec {
    pub data_class: String,
    pub partitioning: Partitioning,
    /// Age after which hot records move to the cold tier
    pub retention: Duration,
    pub cold_fallback: ColdFallback,
}

/// Upper bound on partitions enumerated for one range query; wider ranges list the prefix
const MAX_ENUMERATED_PARTITIONS: usize = 24 * 62;

pub struct TieredSeries<R> {
    spec: SeriesSpec,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for TieredSeries<R> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> fmt::Debug for TieredSeries<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredSeries").field("spec", &self.spec).finish()
    }
}

impl<R: TierRecord> TieredSeries<R> {
    pub fn new(spec: SeriesSpec) -> Self {
        Self {
            spec,
            _record: PhantomData,
        }
    }

    pub fn spec(&self) -> &SeriesSpec {
        &self.spec
    }

    pub fn data_class(&self) -> &str {
        &self.spec.data_class
    }

    pub fn encode(&self, record: &R) -> Result<HotDocument, StoreError> {
        Ok(HotDocument {
            key: record.composite_key(),
            record_ms: record.version_ms(),
            body: serde_json::to_string(record)?,
        })
    }

    pub fn decode(&self, doc: &HotDocument) -> Result<R, StoreError> {
        Ok(serde_json::from_str(&doc.body)?)
    }

    /// Archive objects are JSON arrays of records
    pub fn decode_object(&self, body: &[u8]) -> Result<Vec<R>, StoreError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn encode_object(&self, records: &[R]) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(records)?)
    }

    /// Object path holding the record whose bucket instant is `bucket_ms`
    pub fn archive_path(&self, bucket_ms: i64) -> String {
        let class = &self.spec.data_class;
        let at = Utc
            .timestamp_millis_opt(bucket_ms)
            .single()
            .unwrap_or_default();
        match self.spec.partitioning {
            Partitioning::Year => format!("{}/{}.json", class, at.format("%Y")),
            Partitioning::Month => format!("{}/{}.json", class, at.format("%Y-%m")),
            Partitioning::Day => format!("{}/{}.json", class, at.format("%Y-%m-%d")),
            Partitioning::Hour => format!("{}/{}.json", class, at.format("%Y-%m-%d/%H")),
        }
    }

    /// Prefix under which every object of this class lives
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.spec.data_class)
    }

    /// Object paths covering `[from, to)`
    ///
    /// Returns `None` when the range is open or too wide to enumerate; the
    /// caller then lists the whole prefix instead.
    pub fn archive_paths_between(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Option<Vec<String>> {
        let (from, to) = (from?, to?);
        if to <= from {
            return Some(Vec::new());
        }

        let mut paths: Vec<String> = Vec::new();
        match self.spec.partitioning.step() {
            Some(step) => {
                let mut cursor = from;
                while cursor < to {
                    if paths.len() >= MAX_ENUMERATED_PARTITIONS {
                        return None;
                    }
                    paths.push(self.archive_path(cursor.timestamp_millis()));
                    cursor = cursor + step;
                }
                // The last partial step may start a partition the loop skipped
                paths.push(self.archive_path((to - Duration::milliseconds(1)).timestamp_millis()));
            }
            None => {
                let calendar = self.spec.partitioning.calendar();
                let mut cursor = calendar.bucket_start(from);
                while cursor < to {
                    if paths.len() >= MAX_ENUMERATED_PARTITIONS {
                        return None;
                    }
                    paths.push(self.archive_path(cursor.timestamp_millis()));
                    cursor = calendar.bucket_end(cursor);
                }
            }
        }
        paths.dedup();
        Some(paths)
    }
}

impl TieredSeries<StackSample> {
    pub fn readings(retention: Duration) -> Self {
        Self::new(SeriesSpec {
            data_class: "readings".to_string(),
            partitioning: Partitioning::Hour,
            retention,
            cold_fallback: ColdFallback::Always,
        })
    }
}

fn partitioning_for(interval: IntervalType) -> Partitioning {
    match interval {
        IntervalType::Min15 | IntervalType::Min30 | IntervalType::Hourly => Partitioning::Day,
        IntervalType::Daily | IntervalType::Weekly => Partitioning::Month,
        IntervalType::Monthly | IntervalType::Semiannual | IntervalType::Yearly => Partitioning::Year,
    }
}

impl TieredSeries<IntervalBucket> {
    pub fn averages(interval: IntervalType, retention: Duration) -> Self {
        Self::new(SeriesSpec {
            data_class: format!("averages/{}", interval.as_str()),
            partitioning: partitioning_for(interval),
            retention,
            cold_fallback: ColdFallback::Always,
        })
    }
}

impl TieredSeries<DeltaRecord> {
    pub fn deltas(interval: IntervalType, retention: Duration) -> Self {
        Self::new(SeriesSpec {
            data_class: format!("deltas/{}", interval.as_str()),
            partitioning: partitioning_for(interval),
            retention,
            cold_fallback: ColdFallback::Always,
        })
    }
}

/// Composite-key collision resolved by keep-latest
#[derive(Debug, Clone, PartialEq)]
pub struct DataIntegrityWarning {
    pub data_class: String,
    pub key: CompositeKey,
    pub kept_version_ms: i64,
    pub discarded_version_ms: i64,
}

impl fmt::Display for DataIntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} key collision on {}: kept version {}, discarded version {}",
            self.data_class, self.key, self.kept_version_ms, self.discarded_version_ms
        )
    }
}

#[derive(Debug)]
pub struct MergeOutcome<R> {
    /// Deduplicated records ordered by composite key
    pub records: Vec<R>,
    pub warnings: Vec<DataIntegrityWarning>,
    /// Identical copies (same key, same version) folded together
    pub duplicates: usize,
}

/// Merge two record sets, keeping the latest version per composite key
///
/// On equal versions the incoming record wins. Copies with identical key and
/// version are the same record seen in both tiers and are folded silently;
/// genuinely different versions are logged as data-integrity warnings.
pub fn merge_keep_latest<R: TierRecord>(
    data_class: &str,
    existing: Vec<R>,
    incoming: Vec<R>,
) -> MergeOutcome<R> {
    let mut by_key: HashMap<CompositeKey, R> = HashMap::with_capacity(existing.len() + incoming.len());
    let mut warnings = Vec::new();
    let mut duplicates = 0;

    for record in existing.into_iter().chain(incoming) {
        let key = record.composite_key();
        match by_key.get(&key).map(|current| current.version_ms()) {
            None => {
                by_key.insert(key, record);
            }
            Some(current_v) => {
                let new_v = record.version_ms();
                if current_v == new_v {
                    duplicates += 1;
                    by_key.insert(key, record);
                    continue;
                }
                let (kept, discarded) = if new_v > current_v {
                    (new_v, current_v)
                } else {
                    (current_v, new_v)
                };
                let warning = DataIntegrityWarning {
                    data_class: data_class.to_string(),
                    key: key.clone(),
                    kept_version_ms: kept,
                    discarded_version_ms: discarded,
                };
                log::warn!("⚠️  {}", warning);
                warnings.push(warning);
                if new_v > current_v {
                    by_key.insert(key, record);
                }
            }
        }
    }

    let ordered: BTreeMap<CompositeKey, R> = by_key.into_iter().collect();
    MergeOutcome {
        records: ordered.into_values().collect(),
        warnings,
        duplicates,
    }
}

/// Every series the engine manages, one per data class
#[derive(Debug, Clone)]
pub struct SeriesCatalog {
    pub readings: TieredSeries<StackSample>,
    averages: BTreeMap<IntervalType, TieredSeries<IntervalBucket>>,
    deltas: BTreeMap<IntervalType, TieredSeries<DeltaRecord>>,
}

impl SeriesCatalog {
    /// Build the catalog with per-granularity retention windows
    ///
    /// - raw readings: `reading_retention`
    /// - 15m/30m/hourly records: `bucket_retention`
    /// - daily and coarser records: `summary_retention`
    pub fn new(reading_retention: Duration, bucket_retention: Duration, summary_retention: Duration) -> Self {
        let retention_for = |interval: IntervalType| match interval {
            IntervalType::Min15 | IntervalType::Min30 | IntervalType::Hourly => bucket_retention,
            _ => summary_retention,
        };

        Self {
            readings: TieredSeries::readings(reading_retention),
            averages: IntervalType::all()
                .into_iter()
                .map(|i| (i, TieredSeries::averages(i, retention_for(i))))
                .collect(),
            deltas: IntervalType::all()
                .into_iter()
                .map(|i| (i, TieredSeries::deltas(i, retention_for(i))))
                .collect(),
        }
    }

    pub fn averages(&self, interval: IntervalType) -> &TieredSeries<IntervalBucket> {
        // Catalog is built over IntervalType::all(), so every interval is present
        &self.averages[&interval]
    }

    pub fn deltas(&self, interval: IntervalType) -> &TieredSeries<DeltaRecord> {
        &self.deltas[&interval]
    }

    pub fn all_averages(&self) -> impl Iterator<Item = &TieredSeries<IntervalBucket>> {
        self.averages.values()
    }

    pub fn all_deltas(&self) -> impl Iterator<Item = &TieredSeries<DeltaRecord>> {
        self.deltas.values()
    }
}

impl Default for SeriesCatalog {
    fn default() -> Self {
        Self::new(Duration::hours(1), Duration::minutes(75), Duration::days(2))
    }
}
