//! Series cache entries (MTS, short for metric time series).
//!
//! One entry per concrete time series returned by the upstream service. An
//! entry knows its own store key and TTL, merges newly fetched datapoints
//! into previously cached ones, and renders itself into the client-facing
//! response fragment for its owning query.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::Result;
use crate::keys::{create_key, MTS_NAMESPACE};
use crate::kquery::KQuery;
use crate::store::{StoreClient, StoreWrite};

/// A single datapoint, serialized as `[timestamp_ms, value]`.
///
/// Values stay opaque JSON: the upstream dialect allows numbers, strings and
/// histograms alike, and the cache never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint(pub i64, pub Value);

/// One series' payload as the upstream service reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesResult {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub values: Vec<DataPoint>,
}

/// The per-query response fragment being accumulated.
#[derive(Debug, Default, Serialize)]
pub struct QueryFragment {
    pub results: Vec<SeriesResult>,
    pub sample_size: usize,
}

/// A cached series entry.
///
/// Datapoints stay sorted by timestamp with no duplicates; [`Mts::merge_from`]
/// preserves that invariant.
#[derive(Debug, Clone)]
pub struct Mts {
    result: SeriesResult,
    key: String,
    /// TTL in seconds applied on persist.
    expiry: u64,
}

impl Mts {
    pub fn new(result: SeriesResult, expiry: u64) -> Self {
        let identity = json!({"name": result.name, "tags": result.tags});
        let key = create_key(&identity, MTS_NAMESPACE);
        Self {
            result,
            key,
            expiry,
        }
    }

    /// One entry per series in a single upstream query's result payload.
    /// Performs no store I/O; malformed series are skipped with a warning.
    pub fn from_result(query_result: &Value, expiry: u64) -> impl Iterator<Item = Mts> + '_ {
        query_result
            .get("results")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(move |raw| match serde_json::from_value::<SeriesResult>(raw.clone()) {
                Ok(result) => Some(Mts::new(result, expiry)),
                Err(error) => {
                    warn!(%error, "Skipping unparseable series in upstream result");
                    None
                }
            })
    }

    /// Load entries for a set of keys in one pipelined round trip.
    ///
    /// Keys absent from the store are simply missing from the output, and
    /// unparseable records are dropped the same way; a cache read never
    /// fails a request over a single bad entry.
    pub async fn from_cache(
        keys: &[String],
        store: &dyn StoreClient,
        expiry: u64,
    ) -> Result<Vec<Mts>> {
        let values = store.get_many(keys).await?;
        let mut entries = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(raw) = value else { continue };
            match serde_json::from_str::<SeriesResult>(&raw) {
                Ok(result) => entries.push(Mts {
                    result,
                    key: key.clone(),
                    expiry,
                }),
                Err(error) => warn!(key, %error, "Skipping unparseable cached series"),
            }
        }
        Ok(entries)
    }

    /// The entry's store key, derived from series identity (name + tag set).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn result(&self) -> &SeriesResult {
        &self.result
    }

    /// Merge `other`'s datapoints into this entry.
    ///
    /// The result is the union of timestamps, sorted ascending. On a
    /// timestamp present in both, `other` wins iff `is_newer`: a refresh
    /// overwrites stale overlap, but an older fetch never clobbers newer
    /// data.
    pub fn merge_from(&mut self, other: Mts, is_newer: bool) {
        let mut merged: BTreeMap<i64, Value> = self
            .result
            .values
            .drain(..)
            .map(|DataPoint(ts, value)| (ts, value))
            .collect();

        for DataPoint(ts, value) in other.result.values {
            match merged.entry(ts) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => {
                    if is_newer {
                        slot.insert(value);
                    }
                }
            }
        }

        self.result.values = merged
            .into_iter()
            .map(|(ts, value)| DataPoint(ts, value))
            .collect();
    }

    /// Append this entry into the response fragment being built for its
    /// owning query.
    ///
    /// With `trim`, emitted datapoints are restricted to the query's
    /// requested window, since the cached span may be wider than what was
    /// asked for. Without it the entry is emitted as fetched, which already matches
    /// the needed range right after a fresh or delta fetch.
    pub fn build_response(&self, kquery: &KQuery, response: &mut QueryFragment, trim: bool) {
        let mut result = self.result.clone();
        if trim {
            let range = kquery.time_range();
            result.values.retain(|DataPoint(ts, _)| range.contains(*ts));
        }
        response.sample_size += result.values.len();
        response.results.push(result);
    }

    /// Render this entry as one pipelined-write element, TTL applied.
    pub fn to_store_write(&self) -> Result<StoreWrite> {
        let value = serde_json::to_string(&self.result)?;
        Ok(StoreWrite::new(self.key.clone(), value, Some(self.expiry)))
    }
}
