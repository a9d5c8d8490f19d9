//! Query descriptors (KQuery).
//!
//! One descriptor per submitted metric query. A descriptor derives its
//! canonical cache key from the query body alone, tracks the set of series
//! it owns, persists and loads its own store record, and drives upstream
//! proxy calls for its query.
//!
//! The digest basis is immutable from the moment the descriptor is created:
//! accumulated metadata (series keys, refresh timestamps) lives in a separate
//! record so repeated persists of the same logical query always resolve to
//! the same store entry.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::keys::{create_key, KQUERY_NAMESPACE};
use crate::mts::Mts;
use crate::store::{StoreClient, StoreWrite};
use crate::time_range::TimeRange;
use crate::upstream::{is_error_payload, UpstreamClient};

/// Request fields describing the shared time window. They are copied into
/// each metric's spec and stripped again when building the upstream body,
/// which carries the resolved absolute window instead.
const TIME_FIELDS: [&str; 4] = [
    "start_absolute",
    "start_relative",
    "end_absolute",
    "end_relative",
];

/// The descriptor record as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KQueryRecord {
    /// The immutable query spec this record was fingerprinted from.
    pub query: Value,

    /// Store keys of the series belonging to this query.
    pub mts_keys: Vec<String>,

    /// Epoch seconds of the most recent datapoint ingestion.
    pub last_add_data: i64,

    /// Epoch seconds of the first datapoint ever cached; write-once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_data: Option<i64>,
}

/// A series identity handed to [`KQuery::add_mts`]: either the entry itself
/// or a raw store key.
pub enum MtsRef<'a> {
    Entry(&'a Mts),
    Key(String),
}

impl<'a> From<&'a Mts> for MtsRef<'a> {
    fn from(mts: &'a Mts) -> Self {
        MtsRef::Entry(mts)
    }
}

impl<'a> From<&'a str> for MtsRef<'a> {
    fn from(key: &'a str) -> Self {
        MtsRef::Key(key.to_string())
    }
}

impl<'a> From<String> for MtsRef<'a> {
    fn from(key: String) -> Self {
        MtsRef::Key(key)
    }
}

/// One submitted metric query and its accumulated cache metadata.
#[derive(Debug, Clone)]
pub struct KQuery {
    /// The opaque query body; the fingerprint basis. Never mutated.
    query: Value,

    /// Namespaced digest of `query`, computed at construction.
    cache_key: String,

    /// The request window, resolved once at evaluation time.
    range: TimeRange,

    /// Deduplicated store keys of owned series.
    related_mts: BTreeSet<String>,

    /// The previously stored record, once loaded or written.
    record: Option<KQueryRecord>,
}

impl KQuery {
    pub fn new(query: Value, range: TimeRange) -> Self {
        let cache_key = create_key(&query, KQUERY_NAMESPACE);
        Self {
            query,
            cache_key,
            range,
            related_mts: BTreeSet::new(),
            record: None,
        }
    }

    /// Split a multi-metric request into one descriptor per metric.
    ///
    /// Each descriptor's spec is the metric's own object plus the request's
    /// shared time-range fields. The shared window resolves against `now`
    /// exactly once, so every descriptor sees the same absolute instants.
    /// Lazily produced; performs no store I/O.
    pub fn from_request(
        body: &Value,
        now: DateTime<Utc>,
    ) -> Result<impl Iterator<Item = KQuery> + '_> {
        let range = TimeRange::resolve(body, now)?;
        let metrics = body
            .get("metrics")
            .and_then(Value::as_array)
            .ok_or_else(|| CacheError::BadRequest("request has no metrics array".into()))?;

        let shared: Vec<(String, Value)> = TIME_FIELDS
            .iter()
            .filter_map(|field| body.get(*field).map(|v| (field.to_string(), v.clone())))
            .collect();

        Ok(metrics.iter().map(move |metric| {
            let mut spec = metric.clone();
            normalize_aggregators(&mut spec);
            if let Some(obj) = spec.as_object_mut() {
                for (field, value) in &shared {
                    obj.insert(field.clone(), value.clone());
                }
            }
            KQuery::new(spec, range)
        }))
    }

    /// The fields the fingerprint is computed over: the original query body
    /// only, never accumulated metadata.
    pub fn key_basis(&self) -> &Value {
        &self.query
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// The resolved request window.
    pub fn time_range(&self) -> &TimeRange {
        &self.range
    }

    pub fn related_mts(&self) -> &BTreeSet<String> {
        &self.related_mts
    }

    /// The stored descriptor record, if one has been loaded or written.
    pub fn record(&self) -> Option<&KQueryRecord> {
        self.record.as_ref()
    }

    /// Register a series as belonging to this query. Idempotent.
    pub fn add_mts<'a>(&mut self, mts: impl Into<MtsRef<'a>>) {
        let key = match mts.into() {
            MtsRef::Entry(entry) => entry.key().to_string(),
            MtsRef::Key(key) => key,
        };
        self.related_mts.insert(key);
    }

    /// Load this query's descriptor record from the store, if present.
    pub async fn load(&mut self, store: &dyn StoreClient) -> Result<Option<KQueryRecord>> {
        let Some(raw) = store.get(&self.cache_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<KQueryRecord>(&raw) {
            Ok(record) => {
                self.record = Some(record.clone());
                Ok(Some(record))
            }
            Err(error) => {
                // An unparseable record is treated as a miss; the cold path
                // will overwrite it.
                warn!(key = %self.cache_key, %error, "Discarding unparseable descriptor record");
                Ok(None)
            }
        }
    }

    /// Whether a record last refreshed at `last_modified` (epoch seconds) is
    /// too old to serve directly. This is the sole test driving the
    /// cold/hot/warm decision.
    pub fn is_stale(&self, last_modified: i64, threshold_secs: u64) -> bool {
        Utc::now().timestamp().saturating_sub(last_modified) > threshold_secs as i64
    }

    /// Persist the descriptor record under its cache key.
    ///
    /// `earliest_data_time` seeds `earliest_data` only when not already set;
    /// once set it is never overwritten. `last_data_time` sets
    /// `last_add_data`, defaulting to the current wall clock. Write failure
    /// is reported, not fatal: the response was built from data already in
    /// hand.
    pub async fn upsert(
        &mut self,
        store: &dyn StoreClient,
        earliest_data_time: Option<DateTime<Utc>>,
        last_data_time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let last_add_data = last_data_time
            .map(|t| t.timestamp())
            .unwrap_or_else(|| Utc::now().timestamp());

        let earliest_data = self
            .record
            .as_ref()
            .and_then(|r| r.earliest_data)
            .or_else(|| earliest_data_time.map(|t| t.timestamp()));

        let record = KQueryRecord {
            query: self.query.clone(),
            mts_keys: self.related_mts.iter().cloned().collect(),
            last_add_data,
            earliest_data,
        };

        let value = serde_json::to_string(&record)?;
        // Descriptor records carry no TTL of their own; they age out of
        // relevance with the series records they reference.
        let ok = store
            .set(&StoreWrite::new(self.cache_key.clone(), value, None))
            .await?;
        self.record = Some(record);
        Ok(ok)
    }

    /// Issue one upstream query for this descriptor over `range`.
    ///
    /// With `propagate`, an upstream error payload becomes a
    /// [`CacheError::BackendQueryFailure`]; without it the payload is
    /// returned as-is for the caller to inspect.
    pub async fn proxy_to_backend(
        &self,
        upstream: &dyn UpstreamClient,
        range: &TimeRange,
        propagate: bool,
    ) -> Result<Value> {
        let mut body = json!({
            "metrics": [self.backend_metric()],
            "cache_time": 0,
            "start_absolute": range.start_ms,
        });
        if let Some(end_ms) = range.end_ms {
            body["end_absolute"] = end_ms.into();
        }

        debug!(key = %self.cache_key, start_ms = range.start_ms, "Querying upstream");
        let result = upstream.query(&body).await?;

        if propagate && is_error_payload(&result) {
            return Err(CacheError::backend_failure(&result));
        }
        Ok(result)
    }

    /// Issue one upstream query per time chunk, in order.
    ///
    /// Each chunk call returns its payload rather than raising; after all
    /// chunks complete, any error payload fails the whole call with no
    /// partial result. Chunked fetches are all-or-nothing.
    pub async fn proxy_to_backend_chunked(
        &self,
        upstream: &dyn UpstreamClient,
        ranges: &[TimeRange],
    ) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(ranges.len());
        for range in ranges {
            results.push(self.proxy_to_backend(upstream, range, false).await?);
        }

        if let Some(failed) = results.iter().find(|r| is_error_payload(r)) {
            return Err(CacheError::backend_failure(failed));
        }
        Ok(results)
    }

    /// The metric object sent upstream: the spec minus the shared time-range
    /// fields, which travel as resolved absolute bounds at the top level.
    fn backend_metric(&self) -> Value {
        let mut metric = self.query.clone();
        if let Some(obj) = metric.as_object_mut() {
            for field in TIME_FIELDS {
                obj.remove(field);
            }
        }
        metric
    }
}

/// Rewrite every aggregator carrying `align_sampling: true` to
/// `align_start_time: true` with the same sampling payload. Compatibility
/// shim for an older query dialect; applied metric-by-metric,
/// aggregator-by-aggregator.
fn normalize_aggregators(spec: &mut Value) {
    let Some(aggregators) = spec.get_mut("aggregators").and_then(Value::as_array_mut) else {
        return;
    };
    for aggregator in aggregators {
        let Some(obj) = aggregator.as_object_mut() else {
            continue;
        };
        if obj.get("align_sampling").and_then(Value::as_bool) == Some(true) {
            obj.remove("align_sampling");
            obj.insert("align_start_time".to_string(), Value::Bool(true));
        }
    }
}
