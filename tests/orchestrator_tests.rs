//! End-to-end scenarios for the cold/hot/warm cache state machine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use tscached::config::Config;
use tscached::error::Result;
use tscached::kquery::{KQuery, KQueryRecord};
use tscached::mts::SeriesResult;
use tscached::orchestrator::Orchestrator;
use tscached::store::MemoryStore;
use tscached::time_range::TimeRange;
use tscached::upstream::UpstreamClient;

/// Upstream stub that records call bodies and replays scripted payloads.
struct ScriptedUpstream {
    payloads: Mutex<Vec<Value>>,
    calls: Mutex<Vec<Value>>,
}

impl ScriptedUpstream {
    fn new(payloads: Vec<Value>) -> Self {
        Self {
            payloads: Mutex::new(payloads),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn query(&self, body: &Value) -> Result<Value> {
        self.calls.lock().unwrap().push(body.clone());
        let mut payloads = self.payloads.lock().unwrap();
        assert!(!payloads.is_empty(), "unexpected upstream call: {body}");
        Ok(payloads.remove(0))
    }
}

fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.cache.expiry_secs = 600;
    config.cache.staleness_threshold_secs = 300;
    Arc::new(config)
}

fn orchestrator(
    store: Arc<MemoryStore>,
    payloads: Vec<Value>,
) -> (Orchestrator, Arc<ScriptedUpstream>) {
    let upstream = Arc::new(ScriptedUpstream::new(payloads));
    (
        Orchestrator::new(store, upstream.clone(), test_config()),
        upstream,
    )
}

fn request_body() -> Value {
    json!({
        "metrics": [{"name": "cpu.load", "tags": {"host": ["web01"]}}],
        "start_relative": {"value": "1", "unit": "hours"},
    })
}

/// The descriptor and series keys the request body above resolves to.
fn derived_keys(body: &Value) -> (String, String) {
    let kquery: KQuery = KQuery::from_request(body, Utc::now())
        .unwrap()
        .next()
        .unwrap();
    let series = SeriesResult {
        name: "cpu.load".to_string(),
        tags: [("host".to_string(), vec!["web01".to_string()])]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    let mts = tscached::mts::Mts::new(series, 600);
    (kquery.cache_key().to_string(), mts.key().to_string())
}

fn upstream_payload(values: Vec<(i64, f64)>) -> Value {
    let values: Vec<Value> = values.into_iter().map(|(t, v)| json!([t, v])).collect();
    json!({
        "queries": [{
            "results": [{
                "name": "cpu.load",
                "tags": {"host": ["web01"]},
                "values": values,
            }]
        }]
    })
}

#[tokio::test]
async fn test_cold_path_fetches_full_range_and_persists() {
    let store = Arc::new(MemoryStore::new());
    let now_ms = Utc::now().timestamp_millis();
    let (orchestrator, upstream) = orchestrator(
        store.clone(),
        vec![upstream_payload(vec![
            (now_ms - 120_000, 1.0),
            (now_ms - 60_000, 2.0),
        ])],
    );

    let body = request_body();
    let response = orchestrator.handle_request(&body).await.unwrap();
    let response = serde_json::to_value(&response).unwrap();

    // One upstream call over the full requested range.
    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    let start = calls[0]["start_absolute"].as_i64().unwrap();
    assert!((start - (now_ms - 3_600_000)).abs() < 5_000);
    assert!(calls[0].get("end_absolute").is_none());

    // Response carries the raw fetched datapoints untrimmed.
    let fragment = &response["queries"][0];
    assert_eq!(fragment["sample_size"], 2);
    assert_eq!(
        fragment["results"][0]["values"],
        json!([[now_ms - 120_000, 1.0], [now_ms - 60_000, 2.0]])
    );

    // One new series record and one descriptor referencing it.
    let (kquery_key, mts_key) = derived_keys(&body);
    assert!(store.peek(&mts_key).is_some());
    let record: KQueryRecord =
        serde_json::from_str(&store.peek(&kquery_key).unwrap()).unwrap();
    assert_eq!(record.mts_keys, vec![mts_key]);
    // earliest_data is the oldest datapoint actually fetched, in epoch
    // seconds, not the requested range start.
    assert_eq!(
        record.earliest_data,
        Some((now_ms - 120_000).div_euclid(1000))
    );
}

#[tokio::test]
async fn test_cold_path_empty_fetch_seeds_earliest_from_range_start() {
    let store = Arc::new(MemoryStore::new());
    let now_ms = Utc::now().timestamp_millis();
    let (orchestrator, _) = orchestrator(
        store.clone(),
        vec![json!({"queries": [{"results": []}]})],
    );

    let body = request_body();
    orchestrator.handle_request(&body).await.unwrap();

    let (kquery_key, _) = derived_keys(&body);
    let record: KQueryRecord =
        serde_json::from_str(&store.peek(&kquery_key).unwrap()).unwrap();
    let earliest = record.earliest_data.unwrap();
    assert!((earliest - (now_ms - 3_600_000) / 1000).abs() < 5);
}

#[tokio::test]
async fn test_hot_path_serves_from_cache_without_upstream() {
    let store = Arc::new(MemoryStore::new());
    let body = request_body();
    let (kquery_key, mts_key) = derived_keys(&body);
    let now = Utc::now();
    let now_ms = now.timestamp_millis();

    // Cached span wider than the requested hour; the hot path must trim.
    let cached = json!({
        "name": "cpu.load",
        "tags": {"host": ["web01"]},
        "values": [[now_ms - 7_200_000, 0.5], [now_ms - 60_000, 2.0]],
    });
    store.seed(&mts_key, cached.to_string());

    let record = KQueryRecord {
        query: json!({"name": "cpu.load"}),
        mts_keys: vec![mts_key.clone()],
        last_add_data: now.timestamp() - 10, // fresh
        earliest_data: Some(now.timestamp() - 7_200),
    };
    store.seed(&kquery_key, serde_json::to_string(&record).unwrap());

    let (orchestrator, upstream) = orchestrator(store.clone(), vec![]);
    let response = orchestrator.handle_request(&body).await.unwrap();
    let response = serde_json::to_value(&response).unwrap();

    // Zero upstream calls; only the in-window datapoint survives trimming.
    assert!(upstream.calls().is_empty());
    let fragment = &response["queries"][0];
    assert_eq!(fragment["sample_size"], 1);
    assert_eq!(
        fragment["results"][0]["values"],
        json!([[now_ms - 60_000, 2.0]])
    );
}

#[tokio::test]
async fn test_warm_path_fetches_delta_and_merges() {
    let store = Arc::new(MemoryStore::new());
    let body = request_body();
    let (kquery_key, mts_key) = derived_keys(&body);
    let now = Utc::now();
    let now_ms = now.timestamp_millis();
    let last_add = now.timestamp() - 600; // past the 300s threshold

    let overlap_ts = (last_add + 30) * 1000;
    let cached = json!({
        "name": "cpu.load",
        "tags": {"host": ["web01"]},
        "values": [[now_ms - 1_800_000, 1.0], [overlap_ts, 2.0]],
    });
    store.seed(&mts_key, cached.to_string());

    let record = KQueryRecord {
        query: json!({"name": "cpu.load"}),
        mts_keys: vec![mts_key.clone()],
        last_add_data: last_add,
        earliest_data: Some(123_456),
    };
    store.seed(&kquery_key, serde_json::to_string(&record).unwrap());

    // The delta fetch returns an overlapping point with a new value plus a
    // genuinely new one.
    let (orchestrator, upstream) = orchestrator(
        store.clone(),
        vec![upstream_payload(vec![
            (overlap_ts, 20.0),
            (now_ms - 60_000, 3.0),
        ])],
    );

    let response = orchestrator.handle_request(&body).await.unwrap();
    let response = serde_json::to_value(&response).unwrap();

    // Exactly one upstream call scoped to [last_add_data, now).
    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["start_absolute"], last_add * 1000);
    assert!(calls[0].get("end_absolute").is_none());

    // Merged series: union of old and new, new value winning on overlap.
    let fragment = &response["queries"][0];
    assert_eq!(
        fragment["results"][0]["values"],
        json!([
            [now_ms - 1_800_000, 1.0],
            [overlap_ts, 20.0],
            [now_ms - 60_000, 3.0],
        ])
    );

    // The merged entry was re-persisted with the new value.
    let stored: Value = serde_json::from_str(&store.peek(&mts_key).unwrap()).unwrap();
    assert_eq!(stored["values"][1], json!([overlap_ts, 20.0]));

    // Descriptor refreshed, earliest_data unchanged from its prior value.
    let record: KQueryRecord =
        serde_json::from_str(&store.peek(&kquery_key).unwrap()).unwrap();
    assert_eq!(record.earliest_data, Some(123_456));
    assert!(record.last_add_data > last_add);
    assert_eq!(record.mts_keys, vec![mts_key]);
}

#[tokio::test]
async fn test_warm_path_keeps_series_absent_from_delta_registered() {
    let store = Arc::new(MemoryStore::new());
    let body = request_body();
    let (kquery_key, _) = derived_keys(&body);
    let now = Utc::now();

    // A second cached series the delta fetch will not return.
    let quiet = SeriesResult {
        name: "cpu.load".to_string(),
        tags: [("host".to_string(), vec!["web02".to_string()])]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    let quiet_key = tscached::mts::Mts::new(quiet.clone(), 600).key().to_string();
    store.seed(&quiet_key, serde_json::to_string(&quiet).unwrap());

    let record = KQueryRecord {
        query: json!({"name": "cpu.load"}),
        mts_keys: vec![quiet_key.clone()],
        last_add_data: now.timestamp() - 600,
        earliest_data: Some(1),
    };
    store.seed(&kquery_key, serde_json::to_string(&record).unwrap());

    let (orchestrator, _) = orchestrator(
        store.clone(),
        vec![upstream_payload(vec![(now.timestamp_millis() - 1_000, 9.0)])],
    );
    orchestrator.handle_request(&body).await.unwrap();

    let record: KQueryRecord =
        serde_json::from_str(&store.peek(&kquery_key).unwrap()).unwrap();
    assert!(
        record.mts_keys.contains(&quiet_key),
        "series absent from the delta must stay registered"
    );
    assert_eq!(record.mts_keys.len(), 2);
}

#[tokio::test]
async fn test_failed_metric_degrades_without_aborting_siblings() {
    let store = Arc::new(MemoryStore::new());
    let now_ms = Utc::now().timestamp_millis();
    let body = json!({
        "metrics": [
            {"name": "bad.metric"},
            {"name": "cpu.load", "tags": {"host": ["web01"]}},
        ],
        "start_relative": {"value": "1", "unit": "hours"},
    });

    // First metric's fetch errors, second succeeds. Queries are evaluated in
    // submission order against the scripted payload list.
    let (orchestrator, _) = orchestrator(
        store.clone(),
        vec![
            json!({"error": "metric not found", "status_code": 400}),
            upstream_payload(vec![(now_ms - 60_000, 2.0)]),
        ],
    );

    let response = orchestrator.handle_request(&body).await.unwrap();
    let response = serde_json::to_value(&response).unwrap();

    let queries = response["queries"].as_array().unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0]["error"], "metric not found");
    assert_eq!(queries[0]["status_code"], 400);
    assert_eq!(queries[0]["sample_size"], 0);
    assert_eq!(queries[1]["sample_size"], 1);
}

#[tokio::test]
async fn test_partial_series_write_failure_is_tolerated() {
    let store = Arc::new(MemoryStore::new());
    let body = request_body();
    let (kquery_key, mts_key) = derived_keys(&body);
    store.fail_writes_to(mts_key.clone());

    let now_ms = Utc::now().timestamp_millis();
    let (orchestrator, _) = orchestrator(
        store.clone(),
        vec![upstream_payload(vec![(now_ms - 60_000, 2.0)])],
    );

    // The refused series write must not dent the response, which is built
    // from data already in hand.
    let response = orchestrator.handle_request(&body).await.unwrap();
    let response = serde_json::to_value(&response).unwrap();
    assert_eq!(response["queries"][0]["sample_size"], 1);

    // The series never landed, but the descriptor still registers it for the
    // next refresh to repopulate.
    assert!(store.peek(&mts_key).is_none());
    let record: KQueryRecord =
        serde_json::from_str(&store.peek(&kquery_key).unwrap()).unwrap();
    assert_eq!(record.mts_keys, vec![mts_key]);
}

#[tokio::test]
async fn test_corrupt_descriptor_timestamp_degrades_to_error_fragment() {
    let store = Arc::new(MemoryStore::new());
    let body = request_body();
    let (kquery_key, _) = derived_keys(&body);

    // A stale descriptor whose last_add_data cannot be scaled to millis
    // without overflow must yield an error fragment, not a panic.
    let record = KQueryRecord {
        query: json!({"name": "cpu.load"}),
        mts_keys: Vec::new(),
        last_add_data: i64::MIN / 2,
        earliest_data: None,
    };
    store.seed(&kquery_key, serde_json::to_string(&record).unwrap());

    let (orchestrator, upstream) = orchestrator(store.clone(), vec![]);
    let response = orchestrator.handle_request(&body).await.unwrap();
    let response = serde_json::to_value(&response).unwrap();

    assert!(upstream.calls().is_empty());
    assert_eq!(response["queries"][0]["status_code"], 500);
    assert_eq!(response["queries"][0]["sample_size"], 0);
}

#[tokio::test]
async fn test_hot_path_reads_are_pipelined() {
    let store = Arc::new(MemoryStore::new());
    let body = request_body();
    let (kquery_key, mts_key) = derived_keys(&body);
    let now = Utc::now();

    store.seed(
        &mts_key,
        json!({"name": "cpu.load", "tags": {"host": ["web01"]}, "values": []}).to_string(),
    );
    // Register extra keys so the multi-key read has several to fetch.
    let record = KQueryRecord {
        query: json!({"name": "cpu.load"}),
        mts_keys: vec![
            mts_key,
            "tscached:mts:gone-1".to_string(),
            "tscached:mts:gone-2".to_string(),
        ],
        last_add_data: now.timestamp(),
        earliest_data: None,
    };
    store.seed(&kquery_key, serde_json::to_string(&record).unwrap());

    let (orchestrator, _) = orchestrator(store.clone(), vec![]);
    orchestrator.handle_request(&body).await.unwrap();

    // One descriptor get plus one pipelined series read, not one per key.
    assert_eq!(store.get_round_trips(), 2);
}

#[tokio::test]
async fn test_malformed_request_fails_whole() {
    let store = Arc::new(MemoryStore::new());
    let (orchestrator, _) = orchestrator(store, vec![]);

    let err = orchestrator
        .handle_request(&json!({"metrics": [{"name": "m"}]}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("start"));
}

#[test]
fn test_time_range_shared_across_descriptors() {
    let body = json!({
        "metrics": [{"name": "a"}, {"name": "b"}],
        "start_relative": {"value": "1", "unit": "hours"},
    });
    let kqueries: Vec<KQuery> = KQuery::from_request(&body, Utc::now()).unwrap().collect();
    let ranges: Vec<&TimeRange> = kqueries.iter().map(KQuery::time_range).collect();
    assert_eq!(ranges[0], ranges[1]);
}
