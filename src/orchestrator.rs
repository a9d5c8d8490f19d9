//! Request orchestration: the cold/hot/warm cache state machine.
//!
//! For each submitted metric query the orchestrator classifies cache state
//! once and drives the matching fetch/merge strategy:
//!
//! - **COLD**: no descriptor cached. Full-range upstream fetch, new series
//!   records created, everything persisted.
//! - **HOT**: descriptor cached and fresh. Served straight from the store,
//!   zero upstream calls.
//! - **WARM**: descriptor cached but stale. Only the delta range since the
//!   last refresh is fetched and merged into the cached series.
//!
//! Store writes are best-effort: pipelined write successes are counted and
//! logged, never retried, and never fail a response built from data already
//! in hand.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::kquery::{KQuery, KQueryRecord};
use crate::mts::{Mts, QueryFragment};
use crate::store::{StoreClient, StoreWrite};
use crate::time_range::TimeRange;
use crate::upstream::UpstreamClient;

/// One fragment of the outbound response, in the submitted metric's position.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponseFragment {
    Results(QueryFragment),
    /// A metric whose refresh failed degrades to an in-position error entry
    /// instead of aborting its siblings.
    Failed {
        error: String,
        status_code: u16,
        sample_size: usize,
    },
}

/// The full outbound response: one fragment per submitted metric, in
/// submission order.
#[derive(Debug, Serialize)]
pub struct CacheResponse {
    pub queries: Vec<ResponseFragment>,
}

/// Drives the cache state machine. Holds injected store and upstream handles;
/// never constructs clients itself.
pub struct Orchestrator {
    store: Arc<dyn StoreClient>,
    upstream: Arc<dyn UpstreamClient>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StoreClient>,
        upstream: Arc<dyn UpstreamClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            upstream,
            config,
        }
    }

    /// Evaluate a multi-metric request body into a response.
    ///
    /// Queries within the request are independent and evaluated concurrently;
    /// a failure on one yields an error fragment in its position without
    /// disturbing the others. A malformed request fails as a whole.
    pub async fn handle_request(&self, body: &Value) -> Result<CacheResponse> {
        let kqueries: Vec<KQuery> = KQuery::from_request(body, Utc::now())?.collect();

        let fragments = join_all(kqueries.into_iter().map(|kq| self.evaluate(kq))).await;

        let queries = fragments
            .into_iter()
            .map(|outcome| match outcome {
                Ok(fragment) => ResponseFragment::Results(fragment),
                Err(CacheError::BackendQueryFailure {
                    message,
                    status_code,
                }) => {
                    warn!(status_code, "Metric query failed against the backend");
                    ResponseFragment::Failed {
                        error: message,
                        status_code,
                        sample_size: 0,
                    }
                }
                Err(error) => {
                    warn!(%error, "Metric query failed");
                    ResponseFragment::Failed {
                        error: error.to_string(),
                        status_code: 500,
                        sample_size: 0,
                    }
                }
            })
            .collect();

        Ok(CacheResponse { queries })
    }

    /// Classify one query's cache state and run the matching strategy.
    async fn evaluate(&self, mut kquery: KQuery) -> Result<QueryFragment> {
        let threshold = self.config.cache.staleness_threshold_secs;
        match kquery.load(self.store.as_ref()).await? {
            None => {
                debug!(key = %kquery.cache_key(), "KQuery is COLD");
                self.fetch_cold(kquery).await
            }
            Some(record) if !kquery.is_stale(record.last_add_data, threshold) => {
                debug!(key = %kquery.cache_key(), "KQuery is HOT");
                self.read_hot(&kquery, &record).await
            }
            Some(record) => {
                debug!(key = %kquery.cache_key(), "KQuery is WARM");
                self.refresh_warm(kquery, record).await
            }
        }
    }

    /// COLD: full-range fetch; the only path that creates brand-new series
    /// records.
    async fn fetch_cold(&self, mut kquery: KQuery) -> Result<QueryFragment> {
        let range = *kquery.time_range();
        let result = kquery
            .proxy_to_backend(self.upstream.as_ref(), &range, true)
            .await?;

        let mut fragment = QueryFragment::default();
        let mut writes = Vec::new();
        let entries: Vec<Mts> =
            Mts::from_result(first_query(&result), self.config.cache.expiry_secs).collect();

        for mts in &entries {
            kquery.add_mts(mts);
            writes.push(mts.to_store_write()?);
            mts.build_response(&kquery, &mut fragment, false);
        }

        // earliest_data records the oldest datapoint actually cached; only an
        // empty fetch falls back to the requested range start.
        let earliest_ms = entries
            .iter()
            .filter_map(|mts| mts.result().values.iter().map(|point| point.0).min())
            .min()
            .unwrap_or(range.start_ms);

        self.flush_writes(&writes).await;
        self.upsert_descriptor(&mut kquery, DateTime::from_timestamp_millis(earliest_ms))
            .await;
        Ok(fragment)
    }

    /// HOT: serve straight from the store; no upstream call, no writes.
    async fn read_hot(&self, kquery: &KQuery, record: &KQueryRecord) -> Result<QueryFragment> {
        let entries = Mts::from_cache(
            &record.mts_keys,
            self.store.as_ref(),
            self.config.cache.expiry_secs,
        )
        .await?;

        let mut fragment = QueryFragment::default();
        for mts in &entries {
            // The cached span may be wider than the requested window.
            mts.build_response(kquery, &mut fragment, true);
        }
        Ok(fragment)
    }

    /// WARM: fetch only the delta range since the last refresh and merge it
    /// into the cached series.
    async fn refresh_warm(
        &self,
        mut kquery: KQuery,
        record: KQueryRecord,
    ) -> Result<QueryFragment> {
        let expiry = self.config.cache.expiry_secs;
        // last_add_data comes out of the store, so it gets the same overflow
        // guard as wire values.
        let delta_start = record.last_add_data.checked_mul(1000).ok_or_else(|| {
            CacheError::BadRequest(format!(
                "descriptor last_add_data out of range: {}",
                record.last_add_data
            ))
        })?;
        let delta = TimeRange::new(delta_start, None);
        let result = kquery
            .proxy_to_backend(self.upstream.as_ref(), &delta, true)
            .await?;

        // Re-register every previously cached series so entries absent from
        // the delta are not dropped from future hot/warm reads.
        let mut cached_by_key: HashMap<String, Mts> = HashMap::new();
        for mts in Mts::from_cache(&record.mts_keys, self.store.as_ref(), expiry).await? {
            kquery.add_mts(mts.key().to_string());
            cached_by_key.insert(mts.key().to_string(), mts);
        }

        let mut fragment = QueryFragment::default();
        let mut writes = Vec::new();

        for new in Mts::from_result(first_query(&result), expiry) {
            match cached_by_key.remove(new.key()) {
                Some(mut cached) => {
                    // Freshly fetched data supersedes the cached overlap; the
                    // merged span may be wider than the delta, so trim.
                    cached.merge_from(new, true);
                    writes.push(cached.to_store_write()?);
                    cached.build_response(&kquery, &mut fragment, true);
                }
                None => {
                    // A series the delta introduced: same path as COLD.
                    kquery.add_mts(&new);
                    writes.push(new.to_store_write()?);
                    new.build_response(&kquery, &mut fragment, false);
                }
            }
        }

        self.flush_writes(&writes).await;
        // earliest_data is already set on the loaded record and stays put.
        self.upsert_descriptor(&mut kquery, None).await;
        Ok(fragment)
    }

    /// Pipelined multi-key write of series records. Successes are counted,
    /// partial failure is logged and tolerated, nothing is retried.
    async fn flush_writes(&self, writes: &[StoreWrite]) {
        if writes.is_empty() {
            return;
        }
        match self.store.set_many(writes).await {
            Ok(results) => {
                let successes = results.iter().filter(|ok| **ok).count();
                debug!(
                    successes,
                    total = results.len(),
                    "Series write pipeline complete"
                );
                if successes < results.len() {
                    warn!(
                        failed = results.len() - successes,
                        "Partial failure in series write pipeline"
                    );
                }
            }
            Err(error) => warn!(%error, "Series write pipeline failed"),
        }
    }

    /// Persist the descriptor; failures are reported, never fatal, since the
    /// response was built from data already fetched.
    async fn upsert_descriptor(&self, kquery: &mut KQuery, earliest: Option<DateTime<Utc>>) {
        match kquery.upsert(self.store.as_ref(), earliest, None).await {
            Ok(true) => {}
            Ok(false) => warn!(key = %kquery.cache_key(), "Descriptor write refused by store"),
            Err(error) => warn!(key = %kquery.cache_key(), %error, "Descriptor write failed"),
        }
    }
}

/// The first per-query result object of an upstream payload.
fn first_query(result: &Value) -> &Value {
    result
        .get("queries")
        .and_then(|queries| queries.get(0))
        .unwrap_or(&Value::Null)
}
