//! Delta Calculator: first/last/difference of counter parameters per bucket
//!
//! Two counter classes:
//! - Monotonic (cumulative energy, cumulative flow): `last - first`, floored
//!   at zero when the meter appears to have reset
//! - Depleting (fuel level): the sum of decreases between consecutive
//!   readings that are smaller than the reset ceiling; larger decreases are
//!   tank/sensor resets and increases are refills, neither counts
//!
//! Fine intervals read raw readings; coarse intervals roll up the stored
//! delta records of the next-finer interval, in the same cascade as the
//! interval aggregator.

use super::aggregator::{insert_new, BucketRunSummary, CompanyNames};
use super::directory::DirectoryProvider;
use super::interval::IntervalType;
use super::reader::{TieredQuery, TieredReader};
use super::series::SeriesCatalog;
use super::types::{round2, CounterDelta, CounterKind, DeltaRecord};
use crate::store::{CompositeKey, HotStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_RESET_CEILING: f64 = 100.0;

/// A parameter tracked as a counter
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSpec {
    pub name: String,
    pub kind: CounterKind,
}

impl CounterSpec {
    pub fn monotonic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CounterKind::Monotonic,
        }
    }

    pub fn depleting(name: impl Into<String>, reset_ceiling: f64) -> Self {
        Self {
            name: name.into(),
            kind: CounterKind::Depleting { reset_ceiling },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeltaConfig {
    pub counters: Vec<CounterSpec>,
    /// Use the first/last non-zero reading as monotonic endpoints
    pub skip_zero_endpoints: bool,
}

impl DeltaConfig {
    /// Default counter catalogue with the given fuel reset ceiling
    pub fn with_reset_ceiling(reset_ceiling: f64) -> Self {
        Self {
            counters: vec![
                CounterSpec::monotonic("energy"),
                CounterSpec::monotonic("energyReading"),
                CounterSpec::monotonic("cumulatingFlow"),
                CounterSpec::monotonic("Totalizer_Flow"),
                CounterSpec::depleting("fuel_volume_liters", reset_ceiling),
                CounterSpec::depleting("fuelVolume", reset_ceiling),
            ],
            skip_zero_endpoints: true,
        }
    }
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self::with_reset_ceiling(DEFAULT_RESET_CEILING)
    }
}

/// Delta of a cumulative counter over time-ordered values
///
/// Returns `None` for an empty series.
pub fn monotonic_delta(values: &[f64], skip_zero_endpoints: bool) -> Option<CounterDelta> {
    let (&head, &tail) = (values.first()?, values.last()?);
    let (first, last) = if skip_zero_endpoints {
        (
            values.iter().copied().find(|v| *v != 0.0).unwrap_or(head),
            values.iter().rev().copied().find(|v| *v != 0.0).unwrap_or(tail),
        )
    } else {
        (head, tail)
    };

    Some(CounterDelta {
        kind: CounterKind::Monotonic,
        first,
        last,
        difference: round2((last - first).max(0.0)),
        samples: values.len() as u64,
    })
}

/// Consumed quantity of a depleting level over time-ordered values
pub fn depleting_consumption(values: &[f64], reset_ceiling: f64) -> f64 {
    values
        .windows(2)
        .map(|pair| pair[0] - pair[1])
        .filter(|drop| *drop > 0.0 && *drop < reset_ceiling)
        .sum()
}

fn depleting_delta(values: &[f64], reset_ceiling: f64) -> Option<CounterDelta> {
    Some(CounterDelta {
        kind: CounterKind::Depleting { reset_ceiling },
        first: *values.first()?,
        last: *values.last()?,
        difference: round2(depleting_consumption(values, reset_ceiling)),
        samples: values.len() as u64,
    })
}

/// Combine time-ordered child deltas of one counter into one coarser delta
pub fn rollup_deltas(children: &[CounterDelta]) -> Option<CounterDelta> {
    let (head, tail) = (children.first()?, children.last()?);
    let samples = children.iter().map(|c| c.samples).sum();

    let difference = match head.kind {
        CounterKind::Monotonic => (tail.last - head.first).max(0.0),
        CounterKind::Depleting { reset_ceiling } => {
            let inside: f64 = children.iter().map(|c| c.difference).sum();
            let across: f64 = children
                .windows(2)
                .map(|pair| pair[0].last - pair[1].first)
                .filter(|drop| *drop > 0.0 && *drop < reset_ceiling)
                .sum();
            inside + across
        }
    };

    Some(CounterDelta {
        kind: head.kind,
        first: head.first,
        last: tail.last,
        difference: round2(difference),
        samples,
    })
}

#[derive(Default)]
struct PairSeries {
    station_class: Option<String>,
    company_name: Option<String>,
    /// Counter name -> time-ordered values
    values: BTreeMap<String, Vec<f64>>,
    /// Counter name -> time-ordered child deltas (rollups)
    children: BTreeMap<String, Vec<CounterDelta>>,
}

pub struct DeltaCalculator {
    hot: Arc<dyn HotStore>,
    reader: TieredReader,
    catalog: Arc<SeriesCatalog>,
    directory: Arc<dyn DirectoryProvider>,
    config: DeltaConfig,
}

impl DeltaCalculator {
    pub fn new(
        hot: Arc<dyn HotStore>,
        reader: TieredReader,
        catalog: Arc<SeriesCatalog>,
        directory: Arc<dyn DirectoryProvider>,
        config: DeltaConfig,
    ) -> Self {
        Self {
            hot,
            reader,
            catalog,
            directory,
            config,
        }
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    /// Compute deltas for the most recently closed bucket of `interval`
    pub async fn run_once(
        &self,
        interval: IntervalType,
        now: DateTime<Utc>,
    ) -> Result<BucketRunSummary, StoreError> {
        self.run_for_bucket(interval, interval.last_closed_bucket(now), now)
            .await
    }

    pub async fn run_for_bucket(
        &self,
        interval: IntervalType,
        bucket_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BucketRunSummary, StoreError> {
        let start = interval.bucket_start(bucket_start);
        let end = interval.bucket_end(start);
        let target = self.catalog.deltas(interval);
        let mut summary = BucketRunSummary::new(interval, start);

        let groups = match interval.rollup_source() {
            None => self.group_readings(start, end).await?,
            Some(source) => self.group_deltas(source, start, end).await?,
        };
        if groups.is_empty() {
            log::debug!("📊 No counter data for {} @ {}", interval, start.to_rfc3339());
            return Ok(summary);
        }

        let existing = self.reader.existing_keys(target, start, end).await?;
        let mut names = CompanyNames::new(self.directory.as_ref());

        for ((entity_id, sub_entity), series) in groups {
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

            let counters = self.compute(&series);
            if counters.is_empty() {
                summary.empty += 1;
                continue;
            }

            let company_name = names.get(&entity_id).await.or(series.company_name);
            let record = DeltaRecord {
                entity_id,
                sub_entity,
                station_class: series.station_class,
                interval,
                bucket_start: start,
                bucket_end: end,
                computed_at: now,
                company_name,
                counters,
            };

            match insert_new(self.hot.as_ref(), target, &record).await {
                Ok(true) => summary.written += 1,
                Ok(false) => summary.existing += 1,
                Err(e) => {
                    summary.failed += 1;
                    log::error!("❌ Failed to write {} delta for {}: {}", interval, key, e);
                }
            }
        }

        summary.log("Deltas");
        Ok(summary)
    }

    fn compute(&self, series: &PairSeries) -> BTreeMap<String, CounterDelta> {
        let mut counters = BTreeMap::new();
        for spec in &self.config.counters {
            let delta = if let Some(values) = series.values.get(&spec.name) {
                match spec.kind {
                    CounterKind::Monotonic => monotonic_delta(values, self.config.skip_zero_endpoints),
                    CounterKind::Depleting { reset_ceiling } => depleting_delta(values, reset_ceiling),
                }
            } else if let Some(children) = series.children.get(&spec.name) {
                rollup_deltas(children)
            } else {
                None
            };

            if let Some(delta) = delta {
                counters.insert(spec.name.clone(), delta);
            }
        }
        counters
    }

    async fn group_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<(String, String), PairSeries>, StoreError> {
        // Export is sorted ascending by timestamp
        let samples = self
            .reader
            .export(&self.catalog.readings, &TieredQuery::all().between(start, end))
            .await?;

        let mut groups: BTreeMap<(String, String), PairSeries> = BTreeMap::new();
        for sample in samples {
            let counters: Vec<(&str, f64)> = self
                .config
                .counters
                .iter()
                .filter_map(|spec| {
                    let value = sample.parameters.get(&spec.name)?.as_number()?;
                    Some((spec.name.as_str(), value))
                })
                .collect();
            if counters.is_empty() {
                continue;
            }

            let pair = groups
                .entry((sample.entity_id.clone(), sample.sub_entity.clone()))
                .or_default();
            if pair.station_class.is_none() {
                pair.station_class = Some(sample.station_class.clone());
            }
            if pair.company_name.is_none() {
                pair.company_name = sample.company_name.clone();
            }
            for (name, value) in counters {
                pair.values.entry(name.to_string()).or_default().push(value);
            }
        }
        Ok(groups)
    }

    async fn group_deltas(
        &self,
        source: IntervalType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<(String, String), PairSeries>, StoreError> {
        let records = self
            .reader
            .export(self.catalog.deltas(source), &TieredQuery::all().between(start, end))
            .await?;

        let mut groups: BTreeMap<(String, String), PairSeries> = BTreeMap::new();
        for record in records {
            let pair = groups
                .entry((record.entity_id.clone(), record.sub_entity.clone()))
                .or_default();
            if pair.station_class.is_none() {
                pair.station_class = record.station_class.clone();
            }
            if pair.company_name.is_none() {
                pair.company_name = record.company_name.clone();
            }
            for (name, delta) in record.counters {
                pair.children.entry(name).or_default().push(delta);
            }
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::directory::MemoryDirectory;
    use crate::pipeline::types::{
        ClassificationTags, ExceedanceTag, ParamValue, StackSample, StalenessTag,
    };
    use crate::store::{HotFilter, MemoryColdStore, MemoryHotStore};
    use chrono::Duration;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn make_sample(sub: &str, ts: DateTime<Utc>, params: &[(&str, f64)]) -> StackSample {
        StackSample {
            entity_id: "U1".to_string(),
            product_id: "P1".to_string(),
            company_name: None,
            category: None,
            sub_entity: sub.to_string(),
            station_class: "energy".to_string(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), ParamValue::Number(*v)))
                .collect(),
            timestamp: ts,
            received_at: ts,
            tags: ClassificationTags {
                exceedance: ExceedanceTag::from_exceeded(vec![]),
                staleness: StalenessTag::classify(None, Duration::minutes(15)),
            },
        }
    }

    fn make_calculator() -> (DeltaCalculator, Arc<MemoryHotStore>, Arc<SeriesCatalog>) {
        let hot = Arc::new(MemoryHotStore::new());
        let cold = Arc::new(MemoryColdStore::new());
        let catalog = Arc::new(SeriesCatalog::default());
        let calculator = DeltaCalculator::new(
            hot.clone(),
            TieredReader::new(hot.clone(), cold),
            catalog.clone(),
            Arc::new(MemoryDirectory::new()),
            DeltaConfig::default(),
        );
        (calculator, hot, catalog)
    }

    async fn seed(hot: &MemoryHotStore, catalog: &SeriesCatalog, samples: &[StackSample]) {
        let docs: Vec<_> = samples.iter().map(|s| catalog.readings.encode(s).unwrap()).collect();
        hot.upsert("readings", &docs).await.unwrap();
    }

    async fn stored(hot: &MemoryHotStore, catalog: &SeriesCatalog, interval: IntervalType) -> Vec<DeltaRecord> {
        let series = catalog.deltas(interval);
        hot.query(series.data_class(), &HotFilter::default())
            .await
            .unwrap()
            .iter()
            .map(|d| series.decode(d).unwrap())
            .collect()
    }

    #[test]
    fn test_depleting_tolerance() {
        assert_eq!(depleting_consumption(&[50.0, 48.0, 130.0, 125.0], 100.0), 7.0);
        // 300 -> 150 is a reset, not consumption
        assert_eq!(depleting_consumption(&[300.0, 150.0, 140.0], 100.0), 10.0);
        assert_eq!(depleting_consumption(&[42.0], 100.0), 0.0);
    }

    #[test]
    fn test_monotonic_floor_and_zero_endpoints() {
        let reset = monotonic_delta(&[500.0, 20.0], true).unwrap();
        assert_eq!(reset.difference, 0.0);

        let glitch = monotonic_delta(&[0.0, 100.0, 104.5, 0.0], true).unwrap();
        assert_eq!(glitch.first, 100.0);
        assert_eq!(glitch.last, 104.5);
        assert_eq!(glitch.difference, 4.5);

        let raw = monotonic_delta(&[0.0, 100.0], false).unwrap();
        assert_eq!(raw.difference, 100.0);

        assert!(monotonic_delta(&[], true).is_none());
    }

    #[test]
    fn test_rollup_of_depleting_children_counts_boundaries() {
        let kind = CounterKind::Depleting { reset_ceiling: 100.0 };
        let children = vec![
            CounterDelta { kind, first: 50.0, last: 48.0, difference: 2.0, samples: 2 },
            CounterDelta { kind, first: 45.0, last: 40.0, difference: 5.0, samples: 2 },
            CounterDelta { kind, first: 190.0, last: 185.0, difference: 5.0, samples: 2 },
        ];

        let rolled = rollup_deltas(&children).unwrap();
        // 2 + 5 + 5 inside, 48 -> 45 across, 40 -> 190 is a refill
        assert_eq!(rolled.difference, 15.0);
        assert_eq!(rolled.first, 50.0);
        assert_eq!(rolled.last, 185.0);
        assert_eq!(rolled.samples, 6);
    }

    #[tokio::test]
    async fn test_hourly_energy_delta() {
        let (calculator, hot, catalog) = make_calculator();
        seed(
            &hot,
            &catalog,
            &[
                make_sample("A", utc("2024-03-14T10:45:00Z"), &[("energyReading", 110.5)]),
                make_sample("A", utc("2024-03-14T10:05:00Z"), &[("energyReading", 100.0)]),
                make_sample("A", utc("2024-03-14T10:25:00Z"), &[("energyReading", 105.0)]),
            ],
        )
        .await;

        let summary = calculator
            .run_once(IntervalType::Hourly, utc("2024-03-14T11:01:00Z"))
            .await
            .unwrap();
        assert_eq!(summary.written, 1);

        let records = stored(&hot, &catalog, IntervalType::Hourly).await;
        let delta = &records[0].counters["energyReading"];
        assert_eq!(delta.first, 100.0);
        assert_eq!(delta.last, 110.5);
        assert_eq!(delta.difference, 10.5);
        assert_eq!(delta.samples, 3);
    }

    #[tokio::test]
    async fn test_fuel_delta_and_idempotence() {
        let (calculator, hot, catalog) = make_calculator();
        let base = utc("2024-03-14T10:00:00Z");
        let levels = [50.0, 48.0, 130.0, 125.0];
        let samples: Vec<_> = levels
            .iter()
            .enumerate()
            .map(|(i, v)| make_sample("Tank", base + Duration::minutes(i as i64 * 10), &[("fuelVolume", *v)]))
            .collect();
        seed(&hot, &catalog, &samples).await;

        let now = utc("2024-03-14T11:01:00Z");
        calculator.run_once(IntervalType::Hourly, now).await.unwrap();
        let again = calculator.run_once(IntervalType::Hourly, now).await.unwrap();
        assert_eq!(again.written, 0);

        let records = stored(&hot, &catalog, IntervalType::Hourly).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].counters["fuelVolume"].difference, 7.0);
    }

    #[tokio::test]
    async fn test_no_counters_no_record() {
        let (calculator, hot, catalog) = make_calculator();
        seed(&hot, &catalog, &[make_sample("A", utc("2024-03-14T10:05:00Z"), &[("pH", 7.1)])]).await;

        let summary = calculator
            .run_once(IntervalType::Hourly, utc("2024-03-14T11:01:00Z"))
            .await
            .unwrap();

        assert_eq!(summary.written, 0);
        assert!(stored(&hot, &catalog, IntervalType::Hourly).await.is_empty());
    }

    #[tokio::test]
    async fn test_daily_rolls_up_hourly_records() {
        let (calculator, hot, catalog) = make_calculator();
        seed(
            &hot,
            &catalog,
            &[
                make_sample("A", utc("2024-03-14T10:05:00Z"), &[("energy", 1000.0)]),
                make_sample("A", utc("2024-03-14T10:55:00Z"), &[("energy", 1010.0)]),
                make_sample("A", utc("2024-03-14T14:05:00Z"), &[("energy", 1030.0)]),
                make_sample("A", utc("2024-03-14T14:50:00Z"), &[("energy", 1042.25)]),
            ],
        )
        .await;

        for hour in [10, 14] {
            let start = utc("2024-03-14T00:00:00Z") + Duration::hours(hour);
            calculator
                .run_for_bucket(IntervalType::Hourly, start, start + Duration::hours(1))
                .await
                .unwrap();
        }
        calculator
            .run_once(IntervalType::Daily, utc("2024-03-15T00:05:00Z"))
            .await
            .unwrap();

        let daily = stored(&hot, &catalog, IntervalType::Daily).await;
        assert_eq!(daily.len(), 1);
        let energy = &daily[0].counters["energy"];
        assert_eq!(energy.first, 1000.0);
        assert_eq!(energy.last, 1042.25);
        assert_eq!(energy.difference, 42.25);
        assert_eq!(energy.samples, 4);
    }
}
