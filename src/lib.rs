//! Tiered telemetry engine: ingestion, interval aggregation, counter deltas,
//! hot-to-cold archival and merged reads over both tiers.

pub mod config;
pub mod pipeline;
pub mod sqlite_pragma;
pub mod store;
