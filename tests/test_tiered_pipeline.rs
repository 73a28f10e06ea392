//! End-to-end tests over the SQLite hot store and the filesystem cold store
//!
//! Time is driven by a `ManualClock`; jobs fire through the scheduler exactly
//! as in the runtime binary.

#[cfg(test)]
mod tiered_pipeline_tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tierflow::pipeline::notify::LogDispatcher;
    use tierflow::pipeline::types::{ClassificationTags, ExceedanceTag, ParamValue, StalenessTag};
    use tierflow::pipeline::{
        register_standard_jobs, AggregatorConfig, ArchivalMover, DeltaCalculator, DeltaConfig,
        GateConfig, IngestOutcome, IngestionGate, IntervalAggregator, IntervalType, ManualClock,
        MemoryDirectory, Scheduler, SeriesCatalog, StackSample, StaticCalibration, TieredQuery,
        TieredReader,
    };
    use tierflow::store::{
        ColdStore, FsColdStore, HotStore, SqliteHotStore, StoreError, StoredObject, WriteCondition,
    };

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// Filesystem cold store that can be taken offline
    struct SwitchableColdStore {
        inner: FsColdStore,
        offline: AtomicBool,
    }

    impl SwitchableColdStore {
        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::Transient("cold store unreachable".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ColdStore for SwitchableColdStore {
        async fn get_object(&self, path: &str) -> Result<Option<StoredObject>, StoreError> {
            self.check()?;
            self.inner.get_object(path).await
        }

        async fn put_object(
            &self,
            path: &str,
            body: Vec<u8>,
            condition: WriteCondition,
        ) -> Result<String, StoreError> {
            self.check()?;
            self.inner.put_object(path, body, condition).await
        }

        async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.check()?;
            self.inner.list_objects(prefix).await
        }

        fn backend_type(&self) -> &'static str {
            "switchable-fs"
        }
    }

    struct Engine {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        hot: Arc<SqliteHotStore>,
        cold: Arc<SwitchableColdStore>,
        catalog: Arc<SeriesCatalog>,
        reader: TieredReader,
        gate: IngestionGate,
        aggregator: Arc<IntervalAggregator>,
        scheduler: Scheduler,
    }

    fn make_engine(start: DateTime<Utc>) -> Engine {
        let dir = tempdir().unwrap();
        let schema_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");
        let hot = Arc::new(SqliteHotStore::open(dir.path().join("hot.db"), schema_dir).unwrap());
        let cold = Arc::new(SwitchableColdStore {
            inner: FsColdStore::new(dir.path().join("archive")).unwrap(),
            offline: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::new(start));
        let catalog = Arc::new(SeriesCatalog::default());
        let directory = Arc::new(MemoryDirectory::new());
        let reader = TieredReader::new(hot.clone(), cold.clone());

        let gate = IngestionGate::new(
            hot.clone(),
            catalog.readings.clone(),
            Arc::new(StaticCalibration::new()),
            directory.clone(),
            Arc::new(LogDispatcher),
            clock.clone(),
            GateConfig::default(),
        );
        let aggregator = Arc::new(IntervalAggregator::new(
            hot.clone(),
            reader.clone(),
            catalog.clone(),
            directory.clone(),
            AggregatorConfig::default(),
        ));
        let calculator = Arc::new(DeltaCalculator::new(
            hot.clone(),
            reader.clone(),
            catalog.clone(),
            directory,
            DeltaConfig::default(),
        ));
        let mover = Arc::new(ArchivalMover::new(hot.clone(), cold.clone()));

        let mut scheduler = Scheduler::new(clock.clone());
        register_standard_jobs(
            &mut scheduler,
            aggregator.clone(),
            calculator,
            mover,
            catalog.clone(),
            Duration::minutes(5),
        );

        Engine {
            _dir: dir,
            clock,
            hot,
            cold,
            catalog,
            reader,
            gate,
            aggregator,
            scheduler,
        }
    }

    fn make_payload(timestamp: DateTime<Utc>, energy: f64) -> String {
        json!({
            "entityId": "U1",
            "productId": "P1",
            "companyName": "Acme Energy",
            "contact": {"email": "ops@acme.test"},
            "subEntities": [{"name": "A", "stationClass": "energy", "energyReading": energy}],
            "timestamp": timestamp.to_rfc3339(),
        })
        .to_string()
    }

    async fn ingest_scenario(engine: &Engine) {
        for (ts, energy) in [
            ("2024-03-14T10:05:00Z", 100.0),
            ("2024-03-14T10:25:00Z", 105.0),
            ("2024-03-14T10:45:00Z", 110.5),
        ] {
            engine.clock.set(utc(ts));
            let outcome = engine.gate.ingest_json(&make_payload(utc(ts), energy)).await.unwrap();
            assert!(matches!(outcome, IngestOutcome::Stored(_)));
        }
    }

    #[tokio::test]
    async fn test_end_to_end_hourly_average_and_delta() {
        let mut engine = make_engine(utc("2024-03-14T10:00:00Z"));
        ingest_scenario(&engine).await;

        engine.clock.set(utc("2024-03-14T11:00:30Z"));
        assert!(engine.scheduler.run_due_and_wait().await > 0);

        let averages = engine
            .reader
            .query(engine.catalog.averages(IntervalType::Hourly), &TieredQuery::for_entity("U1"))
            .await
            .unwrap();
        assert_eq!(averages.total, 1);
        let bucket = &averages.items[0];
        assert_eq!(bucket.sub_entity, "A");
        assert_eq!(bucket.parameters["energyReading"].mean, 105.17);
        assert_eq!(bucket.company_name.as_deref(), Some("Acme Energy"));

        let deltas = engine
            .reader
            .export(engine.catalog.deltas(IntervalType::Hourly), &TieredQuery::for_entity("U1"))
            .await
            .unwrap();
        assert_eq!(deltas.len(), 1);
        let energy = &deltas[0].counters["energyReading"];
        assert_eq!(energy.first, 100.0);
        assert_eq!(energy.last, 110.5);
        assert_eq!(energy.difference, 10.5);

        // Idempotence: a repeated run for the same bucket writes nothing
        let rerun = engine
            .aggregator
            .run_once(IntervalType::Hourly, utc("2024-03-14T11:00:30Z"))
            .await
            .unwrap();
        assert_eq!(rerun.written, 0);
        assert_eq!(rerun.existing, 1);
    }

    #[tokio::test]
    async fn test_archival_is_lossless_and_rollups_read_cold() {
        let mut engine = make_engine(utc("2024-03-14T10:00:00Z"));
        ingest_scenario(&engine).await;

        engine.clock.set(utc("2024-03-14T11:00:30Z"));
        engine.scheduler.run_due_and_wait().await;

        let readings_before = engine
            .reader
            .export(&engine.catalog.readings, &TieredQuery::all())
            .await
            .unwrap();
        assert_eq!(readings_before.len(), 3);

        // Past every fine-grained retention window
        engine.clock.set(utc("2024-03-14T12:30:00Z"));
        engine.scheduler.run_due_and_wait().await;

        let hot_readings = engine
            .hot
            .query("readings", &Default::default())
            .await
            .unwrap();
        assert!(hot_readings.is_empty());
        assert!(!engine.cold.list_objects("readings/").await.unwrap().is_empty());

        let readings_after = engine
            .reader
            .export(&engine.catalog.readings, &TieredQuery::all())
            .await
            .unwrap();
        assert_eq!(readings_before, readings_after);

        // Daily rollup after midnight reads the archived hourly records
        engine.clock.set(utc("2024-03-15T00:06:00Z"));
        engine.scheduler.run_due_and_wait().await;

        let daily = engine
            .reader
            .export(engine.catalog.averages(IntervalType::Daily), &TieredQuery::for_entity("U1"))
            .await
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].parameters["energyReading"].mean, 105.17);
        assert_eq!(daily[0].readings, 3);

        let daily_delta = engine
            .reader
            .export(engine.catalog.deltas(IntervalType::Daily), &TieredQuery::for_entity("U1"))
            .await
            .unwrap();
        assert_eq!(daily_delta.len(), 1);
        assert_eq!(daily_delta[0].counters["energyReading"].difference, 10.5);
    }

    #[tokio::test]
    async fn test_bucket_missed_during_cold_outage_is_retried() {
        let mut engine = make_engine(utc("2024-03-14T10:00:00Z"));
        ingest_scenario(&engine).await;

        engine.cold.set_offline(true);
        engine.clock.set(utc("2024-03-14T11:00:30Z"));
        engine.scheduler.run_due_and_wait().await;
        engine.cold.set_offline(false);

        let hourly = engine.catalog.averages(IntervalType::Hourly);
        assert!(engine.reader.export(hourly, &TieredQuery::all()).await.unwrap().is_empty());

        for tick in [
            "2024-03-14T11:05:30Z",
            "2024-03-14T11:30:30Z",
            "2024-03-14T12:00:30Z",
            "2024-03-14T13:00:30Z",
        ] {
            engine.clock.set(utc(tick));
            engine.scheduler.run_due_and_wait().await;
        }

        let averages = engine
            .reader
            .export(hourly, &TieredQuery::for_entity("U1"))
            .await
            .unwrap();
        assert_eq!(averages.len(), 1);
        assert_eq!(averages[0].bucket_start, utc("2024-03-14T10:00:00Z"));
        assert_eq!(averages[0].parameters["energyReading"].mean, 105.17);
        assert_eq!(averages[0].readings, 3);

        let deltas = engine
            .reader
            .export(engine.catalog.deltas(IntervalType::Hourly), &TieredQuery::for_entity("U1"))
            .await
            .unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].counters["energyReading"].difference, 10.5);
    }

    #[tokio::test]
    async fn test_empty_window_produces_no_records() {
        let mut engine = make_engine(utc("2024-03-14T10:00:00Z"));

        engine.clock.set(utc("2024-03-14T11:00:30Z"));
        engine.scheduler.run_due_and_wait().await;

        for interval in [IntervalType::Min15, IntervalType::Min30, IntervalType::Hourly] {
            let page = engine
                .reader
                .query(engine.catalog.averages(interval), &TieredQuery::all())
                .await
                .unwrap();
            assert_eq!(page.total, 0, "{} average written for an empty window", interval);

            let deltas = engine
                .reader
                .export(engine.catalog.deltas(interval), &TieredQuery::all())
                .await
                .unwrap();
            assert!(deltas.is_empty());
        }
    }

    fn make_sample(minute: i64) -> StackSample {
        let ts = utc("2024-03-14T08:00:00Z") + Duration::minutes(minute);
        StackSample {
            entity_id: "U1".to_string(),
            product_id: "P1".to_string(),
            company_name: None,
            category: None,
            sub_entity: "A".to_string(),
            station_class: "quality".to_string(),
            parameters: [("BOD".to_string(), ParamValue::Number(minute as f64))]
                .into_iter()
                .collect(),
            timestamp: ts,
            received_at: ts,
            tags: ClassificationTags {
                exceedance: ExceedanceTag::from_exceeded(vec![]),
                staleness: StalenessTag::classify(None, Duration::minutes(15)),
            },
        }
    }

    #[tokio::test]
    async fn test_pagination_after_merge_across_backends() {
        let engine = make_engine(utc("2024-03-14T12:00:00Z"));
        let series = &engine.catalog.readings;

        let hot_docs: Vec<_> = (6..12).map(|m| series.encode(&make_sample(m)).unwrap()).collect();
        engine.hot.upsert("readings", &hot_docs).await.unwrap();

        let cold_records: Vec<_> = (0..8).map(make_sample).collect();
        engine
            .cold
            .put_object(
                &series.archive_path(make_sample(0).timestamp.timestamp_millis()),
                series.encode_object(&cold_records).unwrap(),
                WriteCondition::IfAbsent,
            )
            .await
            .unwrap();

        let page = engine
            .reader
            .query(series, &TieredQuery::for_entity("U1").page(1, 10))
            .await
            .unwrap();
        assert_eq!(page.total, 12);
        assert_eq!(page.items.len(), 10);
        assert!(page.has_next());

        let minutes: Vec<f64> = page
            .items
            .iter()
            .map(|s| s.parameters["BOD"].as_number().unwrap())
            .collect();
        assert_eq!(minutes, (0..10).map(|m| m as f64).collect::<Vec<_>>());

        let last = engine
            .reader
            .query(series, &TieredQuery::for_entity("U1").page(2, 10))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 2);
        assert!(!last.has_next());
    }

    #[tokio::test]
    async fn test_staleness_uses_stored_history_after_restart() {
        let engine = make_engine(utc("2024-03-14T10:00:00Z"));
        engine.clock.set(utc("2024-03-14T10:05:00Z"));
        engine
            .gate
            .ingest_json(&make_payload(utc("2024-03-14T10:05:00Z"), 100.0))
            .await
            .unwrap();

        // A fresh gate has no in-memory history and falls back to the hot store
        let restarted = IngestionGate::new(
            engine.hot.clone(),
            engine.catalog.readings.clone(),
            Arc::new(StaticCalibration::new()),
            Arc::new(MemoryDirectory::new()),
            Arc::new(LogDispatcher),
            engine.clock.clone(),
            GateConfig::default(),
        );
        engine.clock.set(utc("2024-03-14T10:40:00Z"));
        let outcome = restarted
            .ingest_json(&make_payload(utc("2024-03-14T10:40:00Z"), 104.0))
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Stored(receipt) => {
                assert!(receipt.tags.staleness.stale);
                assert_eq!(receipt.tags.staleness.gap_secs, Some(35 * 60));
            }
            IngestOutcome::Duplicate => panic!("reading treated as duplicate"),
        }
    }
}
