//! Ingestion Gate: validate, classify and persist incoming readings
//!
//! Per submission:
//! 1. Validate required fields (entity, product, company, contact, sub-entities)
//! 2. Strip negative/invalid parameter values; drop emptied sub-entities
//! 3. Suppress duplicates of the same (entity, product) inside the dedup window
//! 4. Tag exceedance against calibrated thresholds and staleness against the
//!    entity's previous reading
//! 5. Upsert one hot record per sub-entity
//! 6. Spawn the exceedance notification (never awaited by ingestion)

use super::calibration::{CalibrationProvider, ExceededParameter};
use super::clock::Clock;
use super::directory::{DirectoryEntry, DirectoryProvider};
use super::notify::{ExceedanceEvent, NotificationDispatcher};
use super::series::TieredSeries;
use super::types::{
    ClassificationTags, ExceedanceTag, ParamValue, Reading, ReadingSubmission, StackSample,
    StalenessTag, SubEntityReading,
};
use crate::store::{HotStore, StoreError};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Gap after which a reading is tagged stale
    pub staleness_limit: Duration,
    /// Window in which a repeat submission of the same (entity, product) is dropped
    pub duplicate_window: Duration,
    /// Parameter names never stored
    pub discarded_parameters: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            staleness_limit: Duration::minutes(15),
            duplicate_window: Duration::seconds(1),
            discarded_parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Malformed(String),
    MissingField(&'static str),
    NoSubEntities,
    MissingSubEntityField { index: usize, field: &'static str },
    /// Every sub-entity lost all its values to sanitization
    EmptyAfterSanitize,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Malformed(e) => write!(f, "Malformed payload: {}", e),
            ValidationError::MissingField(field) => write!(f, "Missing required field: {}", field),
            ValidationError::NoSubEntities => write!(f, "Submission has no sub-entities"),
            ValidationError::MissingSubEntityField { index, field } => {
                write!(f, "Sub-entity #{} is missing required field: {}", index, field)
            }
            ValidationError::EmptyAfterSanitize => {
                write!(f, "No valid sub-entity data left after sanitization")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum IngestError {
    Validation(ValidationError),
    Store(StoreError),
}

impl From<ValidationError> for IngestError {
    fn from(err: ValidationError) -> Self {
        IngestError::Validation(err)
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::Store(err)
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Validation(e) => write!(f, "Validation error: {}", e),
            IngestError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    pub entity_id: String,
    pub samples: usize,
    pub tags: ClassificationTags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored(IngestReceipt),
    Duplicate,
}

/// Keep a parameter value only if it is a usable measurement or label
fn sanitize_value(value: ParamValue) -> Option<ParamValue> {
    match value {
        ParamValue::Number(n) if n.is_finite() && n >= 0.0 => Some(ParamValue::Number(n)),
        ParamValue::Number(_) => None,
        ParamValue::Text(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
                None
            } else {
                Some(ParamValue::Text(s))
            }
        }
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ValidationError::MissingField(field)),
    }
}

pub struct IngestionGate {
    hot: Arc<dyn HotStore>,
    series: TieredSeries<StackSample>,
    calibration: Arc<dyn CalibrationProvider>,
    directory: Arc<dyn DirectoryProvider>,
    notifier: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    config: GateConfig,
    /// Receipt time of the last accepted submission per (entity, product)
    recent: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    /// Latest reading timestamp per entity
    last_seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl IngestionGate {
    pub fn new(
        hot: Arc<dyn HotStore>,
        series: TieredSeries<StackSample>,
        calibration: Arc<dyn CalibrationProvider>,
        directory: Arc<dyn DirectoryProvider>,
        notifier: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        config: GateConfig,
    ) -> Self {
        Self {
            hot,
            series,
            calibration,
            directory,
            notifier,
            clock,
            config,
            recent: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a raw bus payload and ingest it
    pub async fn ingest_json(&self, payload: &str) -> Result<IngestOutcome, IngestError> {
        let submission: ReadingSubmission = serde_json::from_str(payload)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        self.ingest(submission).await
    }

    pub async fn ingest(&self, submission: ReadingSubmission) -> Result<IngestOutcome, IngestError> {
        let now = self.clock.now();
        let reading = self.validate(submission, now)?;

        let dedup_key = (reading.entity_id.clone(), reading.product_id.clone());
        if !self.claim_slot(&dedup_key, now) {
            log::debug!(
                "🔁 Duplicate submission for {}/{} ignored",
                reading.entity_id,
                reading.product_id
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let exceeded = self.classify_exceedance(&reading).await;
        let staleness = self.classify_staleness(&reading).await;
        let tags = ClassificationTags {
            exceedance: ExceedanceTag::from_exceeded(
                exceeded
                    .iter()
                    .map(|p| format!("{}.{}", p.sub_entity, p.parameter))
                    .collect(),
            ),
            staleness,
        };

        let entry = DirectoryEntry {
            entity_id: reading.entity_id.clone(),
            company_name: reading.company_name.clone(),
            category: reading.category.clone(),
            contact: reading.contact.clone(),
        };
        let event = (!exceeded.is_empty()).then(|| ExceedanceEvent {
            entity_id: reading.entity_id.clone(),
            product_id: reading.product_id.clone(),
            company_name: reading.company_name.clone(),
            category: reading.category.clone(),
            contact: reading.contact.clone(),
            exceeded,
            timestamp: reading.timestamp,
        });

        let entity_id = reading.entity_id.clone();
        let timestamp = reading.timestamp;
        let samples = reading.into_samples(now, &tags);

        if let Err(e) = self.persist(&samples).await {
            self.release_slot(&dedup_key, now);
            return Err(e.into());
        }

        self.record_seen(&entity_id, timestamp);
        self.directory.observe(entry);

        if let Some(event) = event {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.dispatch(&event).await {
                    log::warn!("⚠️  Exceedance notification failed for {}: {}", event.entity_id, e);
                }
            });
        }

        log::debug!(
            "✅ Stored {} sub-entities for {} (exceeded={}, stale={})",
            samples.len(),
            entity_id,
            tags.exceedance.exceeded,
            tags.staleness.stale
        );

        Ok(IngestOutcome::Stored(IngestReceipt {
            entity_id,
            samples: samples.len(),
            tags,
        }))
    }

    fn validate(&self, submission: ReadingSubmission, now: DateTime<Utc>) -> Result<Reading, ValidationError> {
        let entity_id = required(&submission.entity_id, "entityId")?;
        let product_id = required(&submission.product_id, "productId")?;
        let company_name = required(&submission.company_name, "companyName")?;
        let contact = match submission.contact {
            Some(contact) if contact.has_channel() => contact,
            _ => return Err(ValidationError::MissingField("contact")),
        };

        if submission.sub_entities.is_empty() {
            return Err(ValidationError::NoSubEntities);
        }

        let mut sub_entities = Vec::with_capacity(submission.sub_entities.len());
        for (index, sub) in submission.sub_entities.into_iter().enumerate() {
            let name = required(&sub.name, "name")
                .map_err(|_| ValidationError::MissingSubEntityField { index, field: "name" })?;
            let station_class = required(&sub.station_class, "stationClass").map_err(|_| {
                ValidationError::MissingSubEntityField {
                    index,
                    field: "stationClass",
                }
            })?;

            let parameters: BTreeMap<String, ParamValue> = sub
                .parameters
                .iter()
                .filter(|(key, _)| !self.config.discarded_parameters.contains(key))
                .filter_map(|(key, raw)| {
                    let value = ParamValue::from_json(raw).and_then(sanitize_value)?;
                    Some((key.clone(), value))
                })
                .collect();

            if parameters.is_empty() {
                log::debug!("⚠️  Sub-entity {} of {} has no valid values, dropped", name, entity_id);
                continue;
            }

            sub_entities.push(SubEntityReading {
                name,
                station_class,
                parameters,
            });
        }

        if sub_entities.is_empty() {
            return Err(ValidationError::EmptyAfterSanitize);
        }

        Ok(Reading {
            entity_id,
            product_id,
            company_name,
            category: submission.category.filter(|c| !c.trim().is_empty()),
            contact,
            sub_entities,
            timestamp: submission.timestamp.unwrap_or(now),
        })
    }

    /// Reserve the dedup slot; false if a submission was accepted inside the window
    fn claim_slot(&self, key: &(String, String), now: DateTime<Utc>) -> bool {
        let Ok(mut recent) = self.recent.lock() else {
            return true;
        };
        if let Some(previous) = recent.get(key) {
            if now - *previous < self.config.duplicate_window {
                return false;
            }
        }
        recent.insert(key.clone(), now);
        true
    }

    fn release_slot(&self, key: &(String, String), claimed_at: DateTime<Utc>) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.get(key) == Some(&claimed_at) {
                recent.remove(key);
            }
        }
    }

    /// An unavailable calibration profile classifies as within limits; the
    /// reading is still stored and no notification goes out.
    async fn classify_exceedance(&self, reading: &Reading) -> Vec<ExceededParameter> {
        let Some(category) = reading.category.as_deref() else {
            return Vec::new();
        };

        match self.calibration.profile(category).await {
            Ok(Some(profile)) => reading
                .sub_entities
                .iter()
                .flat_map(|sub| profile.exceeded(sub))
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("⚠️  Calibration lookup failed for {}: {}", category, e);
                Vec::new()
            }
        }
    }

    async fn classify_staleness(&self, reading: &Reading) -> StalenessTag {
        let cached = self
            .last_seen
            .lock()
            .ok()
            .and_then(|seen| seen.get(&reading.entity_id).copied());

        let previous = match cached {
            Some(ts) => Some(ts),
            None => match self
                .hot
                .latest_bucket_ms(self.series.data_class(), &reading.entity_id)
                .await
            {
                Ok(ms) => ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                Err(e) => {
                    log::warn!("⚠️  Previous reading lookup failed for {}: {}", reading.entity_id, e);
                    None
                }
            },
        };

        let gap = previous
            .map(|prev| reading.timestamp - prev)
            .filter(|gap| *gap >= Duration::zero());
        StalenessTag::classify(gap, self.config.staleness_limit)
    }

    fn record_seen(&self, entity_id: &str, timestamp: DateTime<Utc>) {
        if let Ok(mut seen) = self.last_seen.lock() {
            let latest = seen.entry(entity_id.to_string()).or_insert(timestamp);
            if timestamp > *latest {
                *latest = timestamp;
            }
        }
    }

    async fn persist(&self, samples: &[StackSample]) -> Result<usize, StoreError> {
        let docs = samples
            .iter()
            .map(|s| self.series.encode(s))
            .collect::<Result<Vec<_>, _>>()?;
        self.hot.upsert(self.series.data_class(), &docs).await
    }
}

/// Consume raw payloads from the message-bus adapter until the channel closes
pub async fn start_ingestion(mut rx: mpsc::Receiver<String>, gate: Arc<IngestionGate>) {
    log::info!("🚀 Starting ingestion gate");
    log::info!("   └─ Waiting for readings...");

    let mut accepted = 0u64;
    let mut duplicates = 0u64;
    let mut rejected = 0u64;
    let mut last_log_time = std::time::Instant::now();

    while let Some(payload) = rx.recv().await {
        match gate.ingest_json(&payload).await {
            Ok(IngestOutcome::Stored(_)) => accepted += 1,
            Ok(IngestOutcome::Duplicate) => duplicates += 1,
            Err(IngestError::Validation(e)) => {
                rejected += 1;
                log::warn!("⚠️  Rejected reading: {}", e);
            }
            Err(IngestError::Store(e)) => {
                rejected += 1;
                log::error!("❌ Failed to persist reading: {}", e);
            }
        }

        if last_log_time.elapsed().as_secs() >= 10 {
            let per_sec = accepted as f64 / last_log_time.elapsed().as_secs_f64();
            log::info!(
                "📊 Ingestion rate: {:.1} readings/sec (accepted: {}, duplicates: {}, rejected: {})",
                per_sec,
                accepted,
                duplicates,
                rejected
            );
            last_log_time = std::time::Instant::now();
            accepted = 0;
            duplicates = 0;
            rejected = 0;
        }
    }

    log::info!("🛑 Ingestion channel closed, gate stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::calibration::{CalibrationProfile, StaticCalibration, ThresholdRule};
    use crate::pipeline::clock::ManualClock;
    use crate::pipeline::directory::MemoryDirectory;
    use crate::pipeline::notify::NotifyError;
    use crate::store::{HotFilter, MemoryHotStore};
    use async_trait::async_trait;
    use serde_json::json;

    struct ChannelDispatcher {
        tx: mpsc::UnboundedSender<ExceedanceEvent>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationDispatcher for ChannelDispatcher {
        async fn dispatch(&self, event: &ExceedanceEvent) -> Result<(), NotifyError> {
            let _ = self.tx.send(event.clone());
            if self.fail {
                return Err(NotifyError::Rejected(500));
            }
            Ok(())
        }
    }

    struct Harness {
        gate: IngestionGate,
        hot: Arc<MemoryHotStore>,
        clock: Arc<ManualClock>,
        directory: Arc<MemoryDirectory>,
        events: mpsc::UnboundedReceiver<ExceedanceEvent>,
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-14T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct UnavailableCalibration;

    #[async_trait]
    impl CalibrationProvider for UnavailableCalibration {
        async fn profile(&self, _category: &str) -> Result<Option<CalibrationProfile>, StoreError> {
            Err(StoreError::Transient("calibration table locked".to_string()))
        }
    }

    fn make_harness(fail_notifications: bool) -> Harness {
        let calibration = StaticCalibration::new().with_profile(
            CalibrationProfile::new("Sugar")
                .with_rule("BOD", ThresholdRule::Ceiling { limit: 30.0 })
                .with_rule("pH", ThresholdRule::TwoSided { above: 8.5, below: 6.5 }),
        );
        make_harness_with(Arc::new(calibration), fail_notifications)
    }

    fn make_harness_with(calibration: Arc<dyn CalibrationProvider>, fail_notifications: bool) -> Harness {
        let hot = Arc::new(MemoryHotStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let directory = Arc::new(MemoryDirectory::new());
        let (tx, events) = mpsc::unbounded_channel();

        let gate = IngestionGate::new(
            hot.clone(),
            TieredSeries::readings(Duration::hours(1)),
            calibration,
            directory.clone(),
            Arc::new(ChannelDispatcher {
                tx,
                fail: fail_notifications,
            }),
            clock.clone(),
            GateConfig::default(),
        );

        Harness {
            gate,
            hot,
            clock,
            directory,
            events,
        }
    }

    fn make_payload(timestamp: DateTime<Utc>, sub_entities: serde_json::Value) -> String {
        json!({
            "entityId": "U1",
            "productId": "P1",
            "companyName": "Acme Sugar",
            "category": "Sugar",
            "contact": {"email": "ops@acme.test", "mobileNumber": "5550100"},
            "subEntities": sub_entities,
            "timestamp": timestamp.to_rfc3339(),
        })
        .to_string()
    }

    async fn stored_samples(hot: &MemoryHotStore) -> Vec<StackSample> {
        let series = TieredSeries::<StackSample>::readings(Duration::hours(1));
        hot.query("readings", &HotFilter::default())
            .await
            .unwrap()
            .iter()
            .map(|d| series.decode(d).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_missing_required_fields_are_rejected() {
        let h = make_harness(false);

        let cases = [
            (json!({"productId": "P1", "companyName": "A", "contact": {"email": "a@b"}, "subEntities": [{"name": "S", "stationClass": "q", "BOD": 1}]}), ValidationError::MissingField("entityId")),
            (json!({"entityId": "U1", "companyName": "A", "contact": {"email": "a@b"}, "subEntities": [{"name": "S", "stationClass": "q", "BOD": 1}]}), ValidationError::MissingField("productId")),
            (json!({"entityId": "U1", "productId": "P1", "contact": {"email": "a@b"}, "subEntities": [{"name": "S", "stationClass": "q", "BOD": 1}]}), ValidationError::MissingField("companyName")),
            (json!({"entityId": "U1", "productId": "P1", "companyName": "A", "subEntities": [{"name": "S", "stationClass": "q", "BOD": 1}]}), ValidationError::MissingField("contact")),
            (json!({"entityId": "U1", "productId": "P1", "companyName": "A", "contact": {"email": "a@b"}, "subEntities": []}), ValidationError::NoSubEntities),
            (json!({"entityId": "U1", "productId": "P1", "companyName": "A", "contact": {"email": "a@b"}, "subEntities": [{"name": "S", "BOD": 1}]}), ValidationError::MissingSubEntityField { index: 0, field: "stationClass" }),
        ];

        for (payload, expected) in cases {
            match h.gate.ingest_json(&payload.to_string()).await {
                Err(IngestError::Validation(e)) => assert_eq!(e, expected),
                other => panic!("expected {:?}, got {:?}", expected, other),
            }
        }

        assert!(matches!(
            h.gate.ingest_json("{not json").await,
            Err(IngestError::Validation(ValidationError::Malformed(_)))
        ));
        assert_eq!(h.hot.len("readings"), 0);
    }

    #[tokio::test]
    async fn test_negative_and_invalid_values_are_stripped() {
        let h = make_harness(false);

        let payload = make_payload(
            t0(),
            json!([
                {"name": "S1", "stationClass": "quality", "BOD": 12.5, "COD": -3.0, "TSS": "N/A", "flow": "4.5"},
                {"name": "S2", "stationClass": "quality", "BOD": -1.0, "COD": "N/A"}
            ]),
        );

        let outcome = h.gate.ingest_json(&payload).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored(ref r) if r.samples == 1));

        let samples = stored_samples(&h.hot).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].sub_entity, "S1");
        assert_eq!(samples[0].parameters.len(), 2);
        assert_eq!(samples[0].parameters["flow"], ParamValue::Number(4.5));
    }

    #[tokio::test]
    async fn test_all_values_stripped_is_validation_error() {
        let h = make_harness(false);
        let payload = make_payload(
            t0(),
            json!([{"name": "S1", "stationClass": "quality", "BOD": -5.0, "COD": "N/A"}]),
        );

        assert!(matches!(
            h.gate.ingest_json(&payload).await,
            Err(IngestError::Validation(ValidationError::EmptyAfterSanitize))
        ));
        assert_eq!(h.hot.len("readings"), 0);
    }

    #[tokio::test]
    async fn test_duplicates_inside_window_are_ignored() {
        let h = make_harness(false);
        let subs = json!([{"name": "S1", "stationClass": "quality", "BOD": 10.0}]);

        let first = h.gate.ingest_json(&make_payload(t0(), subs.clone())).await.unwrap();
        assert!(matches!(first, IngestOutcome::Stored(_)));

        h.clock.advance(Duration::milliseconds(400));
        let second = h
            .gate
            .ingest_json(&make_payload(t0() + Duration::seconds(1), subs.clone()))
            .await
            .unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);

        h.clock.advance(Duration::milliseconds(700));
        let third = h
            .gate
            .ingest_json(&make_payload(t0() + Duration::seconds(2), subs))
            .await
            .unwrap();
        assert!(matches!(third, IngestOutcome::Stored(_)));
        assert_eq!(h.hot.len("readings"), 2);
    }

    #[tokio::test]
    async fn test_resubmitted_sub_entity_updates_in_place() {
        let h = make_harness(false);

        h.gate
            .ingest_json(&make_payload(t0(), json!([{"name": "S1", "stationClass": "quality", "BOD": 10.0}])))
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(5));
        h.gate
            .ingest_json(&make_payload(t0(), json!([{"name": "S1", "stationClass": "quality", "BOD": 11.0}])))
            .await
            .unwrap();

        let samples = stored_samples(&h.hot).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].parameters["BOD"], ParamValue::Number(11.0));
    }

    #[tokio::test]
    async fn test_staleness_against_previous_reading() {
        let h = make_harness(false);
        let subs = json!([{"name": "S1", "stationClass": "quality", "BOD": 10.0}]);

        let first = h.gate.ingest_json(&make_payload(t0(), subs.clone())).await.unwrap();
        let IngestOutcome::Stored(first) = first else { panic!("first reading not stored") };
        assert!(!first.tags.staleness.stale);

        h.clock.advance(Duration::minutes(10));
        let on_time = h
            .gate
            .ingest_json(&make_payload(t0() + Duration::minutes(10), subs.clone()))
            .await
            .unwrap();
        let IngestOutcome::Stored(on_time) = on_time else { panic!("reading not stored") };
        assert!(!on_time.tags.staleness.stale);

        h.clock.advance(Duration::minutes(16));
        let late = h
            .gate
            .ingest_json(&make_payload(t0() + Duration::minutes(26), subs))
            .await
            .unwrap();
        let IngestOutcome::Stored(late) = late else { panic!("reading not stored") };
        assert!(late.tags.staleness.stale);
        assert_eq!(late.tags.staleness.gap_secs, Some(16 * 60));
        assert_eq!(late.tags.staleness.color, "purple");
    }

    #[tokio::test]
    async fn test_exceedance_is_tagged_and_notified() {
        let mut h = make_harness(false);

        let outcome = h
            .gate
            .ingest_json(&make_payload(
                t0(),
                json!([{"name": "S1", "stationClass": "quality", "BOD": 31.0, "pH": 9.1}]),
            ))
            .await
            .unwrap();

        let IngestOutcome::Stored(receipt) = outcome else { panic!("reading not stored") };
        assert!(receipt.tags.exceedance.exceeded);
        assert_eq!(receipt.tags.exceedance.parameters, vec!["S1.BOD".to_string(), "S1.pH".to_string()]);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.entity_id, "U1");
        assert_eq!(event.exceeded.len(), 2);

        assert_eq!(h.directory.lookup("U1").await.unwrap().company_name, "Acme Sugar");
    }

    #[tokio::test]
    async fn test_calibration_outage_stores_reading_within_limits() {
        let mut h = make_harness_with(Arc::new(UnavailableCalibration), false);

        let outcome = h
            .gate
            .ingest_json(&make_payload(
                t0(),
                json!([{"name": "S1", "stationClass": "quality", "BOD": 99.0}]),
            ))
            .await
            .unwrap();

        let IngestOutcome::Stored(receipt) = outcome else { panic!("reading not stored") };
        assert_eq!(receipt.tags.exceedance, ExceedanceTag::from_exceeded(vec![]));
        assert_eq!(receipt.tags.exceedance.color, "green");

        let samples = stored_samples(&h.hot).await;
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].tags.exceedance.exceeded);

        let next = tokio::time::timeout(std::time::Duration::from_millis(100), h.events.recv()).await;
        assert!(next.is_err(), "no notification without a calibration profile");
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block_persistence() {
        let mut h = make_harness(true);

        let outcome = h
            .gate
            .ingest_json(&make_payload(
                t0(),
                json!([{"name": "S1", "stationClass": "quality", "BOD": 99.0}]),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, IngestOutcome::Stored(_)));
        assert_eq!(h.hot.len("readings"), 1);
        assert!(tokio::time::timeout(std::time::Duration::from_secs(1), h.events.recv())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_within_limits_sends_nothing() {
        let mut h = make_harness(false);

        h.gate
            .ingest_json(&make_payload(
                t0(),
                json!([{"name": "S1", "stationClass": "quality", "BOD": 5.0, "pH": 7.0}]),
            ))
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_ingestion_drains_channel() {
        let h = make_harness(false);
        let gate = Arc::new(h.gate);
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(start_ingestion(rx, Arc::clone(&gate)));
        tx.send(make_payload(t0(), json!([{"name": "S1", "stationClass": "quality", "BOD": 1.0}])))
            .await
            .unwrap();
        tx.send("garbage".to_string()).await.unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(h.hot.len("readings"), 1);
    }
}
