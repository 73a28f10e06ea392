//! # Tiered telemetry pipeline
//!
//! ```text
//! message bus ─▶ IngestionGate ─▶ hot store ◀─┬─ IntervalAggregator
//!                                              ├─ DeltaCalculator
//!                                              └─ ArchivalMover ─▶ cold store
//!                          TieredReader ◀── hot store + cold store
//! ```
//!
//! Every stored record type (raw readings, interval buckets, delta records)
//! is described by a [`TieredSeries`] value: data class, archive
//! partitioning, retention and cold-read policy. Aggregation, archival and
//! reads are written once against that abstraction.
//!
//! ## Module Organization
//!
//! - `types` - Record types (readings, buckets, deltas, classification tags)
//! - `interval` - Interval types and UTC bucket arithmetic
//! - `series` - `TieredSeries<R>`, composite keys, keep-latest merge
//! - `calibration` - Threshold profiles and providers
//! - `directory` - Display metadata provider
//! - `notify` - Exceedance notification dispatchers
//! - `ingestion` - Ingestion gate and bus consumer loop
//! - `aggregator` - Interval aggregator
//! - `delta` - Counter delta calculator
//! - `archival` - Hot-to-cold archival mover
//! - `reader` - Tiered reader
//! - `clock` - Injectable clock
//! - `scheduler` - Job scheduler and standard jobs

pub mod aggregator;
pub mod archival;
pub mod calibration;
pub mod clock;
pub mod delta;
pub mod directory;
pub mod ingestion;
pub mod interval;
pub mod notify;
pub mod reader;
pub mod scheduler;
pub mod series;
pub mod types;

// Re-export commonly used types
pub use aggregator::{AggregatorConfig, BucketRunSummary, FieldSelector, IntervalAggregator};
pub use archival::{ArchivalMover, ArchiveRunSummary};
pub use calibration::{CalibrationProfile, CalibrationProvider, SqliteCalibration, StaticCalibration, ThresholdRule};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delta::{CounterSpec, DeltaCalculator, DeltaConfig};
pub use directory::{DirectoryEntry, DirectoryProvider, MemoryDirectory};
pub use ingestion::{start_ingestion, GateConfig, IngestError, IngestOutcome, IngestionGate, ValidationError};
pub use interval::IntervalType;
pub use notify::{ExceedanceEvent, NotificationDispatcher};
pub use reader::{Page, SortOrder, TieredQuery, TieredReader};
pub use scheduler::{register_standard_jobs, Cadence, Job, Scheduler};
pub use series::{DataIntegrityWarning, SeriesCatalog, TierRecord, TieredSeries};
pub use types::{DeltaRecord, IntervalBucket, ReadingSubmission, StackSample};
