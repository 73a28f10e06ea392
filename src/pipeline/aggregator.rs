//! Interval Aggregator: per-bucket parameter statistics
//!
//! For one closed bucket of one interval type:
//! 1. Collect the source records through the tiered reader (raw readings for
//!    15m/30m/hourly, the next-finer stored buckets for coarser intervals)
//! 2. Group by (entity, sub-entity) and fold every numeric measurement into
//!    count/sum/min/max statistics
//! 3. Skip keys that already exist in either tier, write the rest with an
//!    insert-if-absent so overlapping runs converge on one record per key
//!
//! A pair with no numeric data in the window produces no record.

use super::directory::DirectoryProvider;
use super::interval::IntervalType;
use super::reader::{TieredQuery, TieredReader};
use super::series::{SeriesCatalog, TierRecord, TieredSeries};
use super::types::{IntervalBucket, ParamValue, ParameterStats};
use crate::store::{CompositeKey, HotStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Identity and bookkeeping fields that are never averaged
const IDENTITY_FIELDS: &[&str] = &[
    "_id",
    "id",
    "userName",
    "entityId",
    "productId",
    "product_id",
    "companyName",
    "stackName",
    "stationType",
    "stationClass",
    "timestamp",
    "date",
    "time",
];

/// Picks the parameters that are numeric measurements
#[derive(Debug, Clone)]
pub struct FieldSelector {
    excluded: HashSet<String>,
}

impl FieldSelector {
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            excluded: excluded
                .into_iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_measurement(&self, name: &str) -> bool {
        !self.excluded.contains(&name.to_ascii_lowercase())
    }

    /// Numeric measurements of a parameter map
    pub fn measurements<'a>(
        &'a self,
        parameters: &'a BTreeMap<String, ParamValue>,
    ) -> impl Iterator<Item = (&'a str, f64)> + 'a {
        parameters
            .iter()
            .filter(|(name, _)| self.is_measurement(name))
            .filter_map(|(name, value)| value.as_number().map(|v| (name.as_str(), v)))
    }
}

impl Default for FieldSelector {
    fn default() -> Self {
        Self::new(IDENTITY_FIELDS)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorConfig {
    pub fields: FieldSelector,
    /// Station classes left out of averaging (cumulative meters, for example)
    pub excluded_station_classes: Vec<String>,
}

impl AggregatorConfig {
    fn includes_station_class(&self, station_class: &str) -> bool {
        !self
            .excluded_station_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(station_class))
    }
}

/// Result of one bucket run of the aggregator or the delta calculator
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRunSummary {
    pub interval: IntervalType,
    pub bucket_start: DateTime<Utc>,
    /// (entity, sub-entity) pairs with source data in the window
    pub pairs: usize,
    pub written: usize,
    /// Pairs whose key was already present in either tier
    pub existing: usize,
    /// Pairs with source records but nothing to compute
    pub empty: usize,
    pub failed: usize,
}

impl BucketRunSummary {
    pub(crate) fn new(interval: IntervalType, bucket_start: DateTime<Utc>) -> Self {
        Self {
            interval,
            bucket_start,
            pairs: 0,
            written: 0,
            existing: 0,
            empty: 0,
            failed: 0,
        }
    }

    pub(crate) fn log(&self, job: &str) {
        if self.failed > 0 {
            log::warn!(
                "⚠️  {} {} @ {}: {} written, {} existing, {} empty, {} failed",
                job,
                self.interval,
                self.bucket_start.to_rfc3339(),
                self.written,
                self.existing,
                self.empty,
                self.failed
            );
        } else {
            log::info!(
                "✅ {} {} @ {}: {} written, {} existing, {} empty",
                job,
                self.interval,
                self.bucket_start.to_rfc3339(),
                self.written,
                self.existing,
                self.empty
            );
        }
    }
}

/// Per-run cache of company names from the directory
pub(crate) struct CompanyNames<'a> {
    directory: &'a dyn DirectoryProvider,
    cache: HashMap<String, Option<String>>,
}

impl<'a> CompanyNames<'a> {
    pub(crate) fn new(directory: &'a dyn DirectoryProvider) -> Self {
        Self {
            directory,
            cache: HashMap::new(),
        }
    }

    pub(crate) async fn get(&mut self, entity_id: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(entity_id) {
            return cached.clone();
        }
        let name = self.directory.lookup(entity_id).await.map(|e| e.company_name);
        self.cache.insert(entity_id.to_string(), name.clone());
        name
    }
}

/// Write a record unless its key already exists in the hot tier
pub(crate) async fn insert_new<R: TierRecord>(
    hot: &dyn HotStore,
    series: &TieredSeries<R>,
    record: &R,
) -> Result<bool, StoreError> {
    let doc = series.encode(record)?;
    hot.insert_if_absent(series.data_class(), &doc).await
}

#[derive(Default)]
struct PairStats {
    station_class: Option<String>,
    company_name: Option<String>,
    readings: u64,
    parameters: BTreeMap<String, ParameterStats>,
}

impl PairStats {
    fn absorb(&mut self, name: &str, stats: &ParameterStats) {
        match self.parameters.get_mut(name) {
            Some(existing) => existing.merge(stats),
            None => {
                self.parameters.insert(name.to_string(), stats.clone());
            }
        }
    }
}

pub struct IntervalAggregator {
    hot: Arc<dyn HotStore>,
    reader: TieredReader,
    catalog: Arc<SeriesCatalog>,
    directory: Arc<dyn DirectoryProvider>,
    config: AggregatorConfig,
}

impl IntervalAggregator {
    pub fn new(
        hot: Arc<dyn HotStore>,
        reader: TieredReader,
        catalog: Arc<SeriesCatalog>,
        directory: Arc<dyn DirectoryProvider>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            hot,
            reader,
            catalog,
            directory,
            config,
        }
    }

    /// Aggregate the most recently closed bucket of `interval`
    pub async fn run_once(
        &self,
        interval: IntervalType,
        now: DateTime<Utc>,
    ) -> Result<BucketRunSummary, StoreError> {
        self.run_for_bucket(interval, interval.last_closed_bucket(now), now)
            .await
    }

    /// Aggregate the bucket containing `bucket_start` (backfill entry point)
    ///
    /// Fails only when the source or existence reads fail; per-pair failures
    /// are counted in the summary. Either way the scheduled job keeps the
    /// bucket owed and runs it again on its next tick.
    pub async fn run_for_bucket(
        &self,
        interval: IntervalType,
        bucket_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BucketRunSummary, StoreError> {
        let start = interval.bucket_start(bucket_start);
        let end = interval.bucket_end(start);
        let target = self.catalog.averages(interval);
        let mut summary = BucketRunSummary::new(interval, start);

        let groups = match interval.rollup_source() {
            None => self.group_readings(start, end).await?,
            Some(source) => self.group_buckets(source, start, end).await?,
        };
        if groups.is_empty() {
            log::debug!("📊 No source data for {} @ {}", interval, start.to_rfc3339());
            return Ok(summary);
        }

        let existing = self.reader.existing_keys(target, start, end).await?;
        let mut names = CompanyNames::new(self.directory.as_ref());

        for ((entity_id, sub_entity), stats) in groups {
            summary.pairs += 1;
            let key = CompositeKey::new(
                entity_id.as_str(),
                sub_entity.as_str(),
                interval.as_str(),
                start.timestamp_millis(),
            );
            if existing.contains(&key) {
                summary.existing += 1;
                continue;
            }
            if stats.parameters.is_empty() {
                summary.empty += 1;
                continue;
            }

            let company_name = names.get(&entity_id).await.or(stats.company_name);
            let bucket = IntervalBucket {
                entity_id,
                sub_entity,
                station_class: stats.station_class,
                interval,
                bucket_start: start,
                bucket_end: end,
                computed_at: now,
                company_name,
                readings: stats.readings,
                parameters: stats.parameters,
            };

            match insert_new(self.hot.as_ref(), target, &bucket).await {
                Ok(true) => summary.written += 1,
                Ok(false) => summary.existing += 1,
                Err(e) => {
                    summary.failed += 1;
                    log::error!("❌ Failed to write {} average for {}: {}", interval, key, e);
                }
            }
        }

        summary.log("Aggregated");
        Ok(summary)
    }

    async fn group_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<(String, String), PairStats>, StoreError> {
        let samples = self
            .reader
            .export(&self.catalog.readings, &TieredQuery::all().between(start, end))
            .await?;

        let mut groups: BTreeMap<(String, String), PairStats> = BTreeMap::new();
        for sample in samples {
            if !self.config.includes_station_class(&sample.station_class) {
                continue;
            }
            let pair = groups
                .entry((sample.entity_id.clone(), sample.sub_entity.clone()))
                .or_default();
            pair.readings += 1;
            if pair.station_class.is_none() {
                pair.station_class = Some(sample.station_class.clone());
            }
            if pair.company_name.is_none() {
                pair.company_name = sample.company_name.clone();
            }
            for (name, value) in self.config.fields.measurements(&sample.parameters) {
                pair.absorb(name, &ParameterStats::single(value));
            }
        }
        Ok(groups)
    }

    async fn group_buckets(
        &self,
        source: IntervalType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<(String, String), PairStats>, StoreError> {
        let buckets = self
            .reader
            .export(self.catalog.averages(source), &TieredQuery::all().between(start, end))
            .await?;

        let mut groups: BTreeMap<(String, String), PairStats> = BTreeMap::new();
        for bucket in buckets {
            let pair = groups
                .entry((bucket.entity_id.clone(), bucket.sub_entity.clone()))
                .or_default();
            pair.readings += bucket.readings;
            if pair.station_class.is_none() {
                pair.station_class = bucket.station_class.clone();
            }
            if pair.company_name.is_none() {
                pair.company_name = bucket.company_name.clone();
            }
            for (name, stats) in &bucket.parameters {
                pair.absorb(name, stats);
            }
        }
        Ok(groups)
    }
}
