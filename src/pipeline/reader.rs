//! Tiered Reader: transparent merge of hot and cold results
//!
//! Query flow:
//! 1. Query the hot store with the pushed-down filter
//! 2. Fetch the covering archive objects when the data class asks for it
//!    (or the hot tier came back empty) and filter them client-side
//! 3. Merge both sets by composite key, keep-latest
//! 4. Sort, then paginate the merged set
//!
//! Pagination is never applied to a single tier. A tier that fails is logged
//! and skipped; only when both fail does the caller see an error.

use super::series::{merge_keep_latest, ColdFallback, TierRecord, TieredSeries};
use crate::store::{ColdStore, CompositeKey, HotFilter, HotStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Read query; the date range is `[from, to)` over record timestamps
#[derive(Debug, Clone)]
pub struct TieredQuery {
    pub entity_id: Option<String>,
    pub sub_entity: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub order: SortOrder,
    /// 1-based page number
    pub page: usize,
    /// Page size; 0 returns everything
    pub page_size: usize,
}

impl Default for TieredQuery {
    fn default() -> Self {
        Self {
            entity_id: None,
            sub_entity: None,
            from: None,
            to: None,
            order: SortOrder::Ascending,
            page: 1,
            page_size: 50,
        }
    }
}

impl TieredQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn sub_entity(mut self, sub_entity: impl Into<String>) -> Self {
        self.sub_entity = Some(sub_entity.into());
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page.max(1);
        self.page_size = page_size;
        self
    }

    fn hot_filter(&self) -> HotFilter {
        HotFilter {
            entity_id: self.entity_id.clone(),
            sub_entity: self.sub_entity.clone(),
            from_ms: self.from.map(|t| t.timestamp_millis()),
            to_ms: self.to.map(|t| t.timestamp_millis()),
        }
    }

    pub fn matches<R: TierRecord>(&self, record: &R) -> bool {
        let key = record.composite_key();
        let ts = record.timestamp();
        self.entity_id.as_ref().map_or(true, |e| &key.entity_id == e)
            && self.sub_entity.as_ref().map_or(true, |s| &key.sub_entity == s)
            && self.from.map_or(true, |from| ts >= from)
            && self.to.map_or(true, |to| ts < to)
    }
}

#[derive(Debug, Clone)]
pub struct Page<R> {
    pub items: Vec<R>,
    /// Size of the merged, deduplicated result before pagination
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub hot_count: usize,
    pub cold_count: usize,
}

impl<R> Page<R> {
    pub fn has_next(&self) -> bool {
        self.page_size > 0 && self.page * self.page_size < self.total
    }
}

struct Merged<R> {
    records: Vec<R>,
    hot_count: usize,
    cold_count: usize,
}

#[derive(Clone)]
pub struct TieredReader {
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdStore>,
}

impl TieredReader {
    pub fn new(hot: Arc<dyn HotStore>, cold: Arc<dyn ColdStore>) -> Self {
        Self { hot, cold }
    }

    /// Paginated query over both tiers
    pub async fn query<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        query: &TieredQuery,
    ) -> Result<Page<R>, StoreError> {
        let merged = self.merged(series, query).await?;
        let total = merged.records.len();
        let page = query.page.max(1);

        let items = if query.page_size == 0 {
            merged.records
        } else {
            merged
                .records
                .into_iter()
                .skip((page - 1) * query.page_size)
                .take(query.page_size)
                .collect()
        };

        Ok(Page {
            items,
            total,
            page,
            page_size: query.page_size,
            hot_count: merged.hot_count,
            cold_count: merged.cold_count,
        })
    }

    /// Full merged result, sorted, without pagination (bulk export)
    pub async fn export<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        query: &TieredQuery,
    ) -> Result<Vec<R>, StoreError> {
        Ok(self.merged(series, query).await?.records)
    }

    /// Keys already present in either tier for `[from, to)`
    ///
    /// Unlike reads, this is strict: any tier failure is returned, because a
    /// wrong "absent" answer would let a job write a second record for a key.
    pub async fn existing_keys<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashSet<CompositeKey>, StoreError> {
        let query = TieredQuery::all().between(from, to);
        let mut keys: HashSet<CompositeKey> = self
            .hot
            .query(series.data_class(), &query.hot_filter())
            .await?
            .into_iter()
            .map(|doc| doc.key)
            .collect();

        for record in self.read_cold(series, &query, true).await? {
            keys.insert(record.composite_key());
        }
        Ok(keys)
    }

    async fn merged<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        query: &TieredQuery,
    ) -> Result<Merged<R>, StoreError> {
        let class = series.data_class();

        let hot = match self.read_hot(series, query).await {
            Ok(records) => Some(records),
            Err(e) => {
                log::warn!("⚠️  Hot tier unavailable for {}: {}", class, e);
                None
            }
        };

        let needs_cold = match series.spec().cold_fallback {
            ColdFallback::Always => true,
            ColdFallback::WhenHotEmpty => hot.as_ref().map_or(true, |h| h.is_empty()),
        };

        let cold = if needs_cold {
            match self.read_cold(series, query, false).await {
                Ok(records) => Some(records),
                Err(e) => {
                    log::warn!("⚠️  Cold tier unavailable for {}: {}", class, e);
                    None
                }
            }
        } else {
            Some(Vec::new())
        };

        let (hot, cold) = match (hot, cold) {
            (None, None) => {
                return Err(StoreError::Transient(format!(
                    "both tiers unavailable for {}",
                    class
                )))
            }
            (hot, cold) => (hot.unwrap_or_default(), cold.unwrap_or_default()),
        };

        let (hot_count, cold_count) = (hot.len(), cold.len());

        // Hot is passed as incoming so it wins on equal versions
        let mut records = merge_keep_latest(class, cold, hot).records;
        records.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.composite_key().cmp(&b.composite_key()))
        });
        if query.order == SortOrder::Descending {
            records.reverse();
        }

        log::debug!(
            "📖 {} read: hot={} cold={} merged={}",
            class,
            hot_count,
            cold_count,
            records.len()
        );

        Ok(Merged {
            records,
            hot_count,
            cold_count,
        })
    }

    async fn read_hot<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        query: &TieredQuery,
    ) -> Result<Vec<R>, StoreError> {
        let docs = self.hot.query(series.data_class(), &query.hot_filter()).await?;
        let mut records = Vec::with_capacity(docs.len());
        for doc in &docs {
            match series.decode(doc) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("⚠️  Skipping undecodable hot record {}: {}", doc.key, e),
            }
        }
        Ok(records)
    }

    async fn read_cold<R: TierRecord>(
        &self,
        series: &TieredSeries<R>,
        query: &TieredQuery,
        strict: bool,
    ) -> Result<Vec<R>, StoreError> {
        // Widen the partition range by one step so records whose bucket instant
        // and timestamp differ still land in the scanned partitions
        let paths = match series.archive_paths_between(
            query.from,
            query.to.map(|to| to + Duration::milliseconds(1)),
        ) {
            Some(paths) => paths,
            None => self.cold.list_objects(&series.list_prefix()).await?,
        };

        let mut records = Vec::new();
        let mut failures = 0;
        let mut last_error = None;

        for path in &paths {
            let fetched = match self.cold.get_object(path).await {
                Ok(None) => continue,
                Ok(Some(object)) => series.decode_object(&object.body),
                Err(e) => Err(e),
            };

            match fetched {
                Ok(batch) => records.extend(batch.into_iter().filter(|r| query.matches(r))),
                Err(e) if strict => return Err(e),
                Err(e) => {
                    log::warn!("⚠️  Cold object {} unreadable: {}", path, e);
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        if failures > 0 && failures == paths.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(records)
    }
}
