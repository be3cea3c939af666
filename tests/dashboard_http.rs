use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use station_demand::{
    build_snapshot, dashboard_router, DashboardSnapshot, DashboardSnapshotSource, DemandStore,
    InMemorySnapshotSource, Prediction, StoreSnapshotSource,
};
use tempfile::tempdir;
use tower::util::ServiceExt;

const T0: i64 = 1_404_172_800_000;
const HOUR_MS: i64 = 3_600_000;

fn prediction(station: &str, ts: i64, demand: u64) -> Prediction {
    Prediction {
        entity_id: station.to_string(),
        target_ts_ms_utc: ts,
        predicted_demand: demand,
    }
}

fn sample_predictions() -> Vec<Prediction> {
    vec![
        prediction("Pershing Square North", T0 + HOUR_MS, 31),
        prediction("E 17 St & Broadway", T0 + HOUR_MS, 22),
        prediction("W 21 St & 6 Ave", T0 + HOUR_MS, 9),
        prediction("Pershing Square North", T0, 40),
    ]
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn dashboard_page_renders_table_and_summary() {
    let source = Arc::new(InMemorySnapshotSource::new(build_snapshot(
        &sample_predictions(),
        2,
    )));

    let (status, body) = get(dashboard_router(source), "/dashboard").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();

    assert!(text.contains("<table id=\"dashboard-table\""));
    assert!(text.contains("Pershing Square North"));
    assert!(text.contains("E 17 St &amp; Broadway"));
    assert!(!text.contains("W 21 St &amp; 6 Ave"));
    assert!(text.contains("Average<b>20.67</b>"));
    assert!(text.contains("Max<b>31</b>"));
    assert!(text.contains("Min<b>9</b>"));
}

#[tokio::test]
async fn snapshot_endpoint_returns_ranked_rows() {
    let source = Arc::new(InMemorySnapshotSource::new(build_snapshot(
        &sample_predictions(),
        10,
    )));

    let (status, body) = get(dashboard_router(source), "/dashboard/snapshot").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rows = json["rows"].as_array().unwrap();

    assert_eq!(json["target_ts_ms_utc"], T0 + HOUR_MS);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["rank"], 1);
    assert_eq!(rows[0]["station"], "Pershing Square North");
    assert_eq!(rows[0]["predicted_demand"], 31);
    assert_eq!(json["summary"]["station_count"], 3);
}

#[tokio::test]
async fn snapshot_endpoint_applies_station_and_top_query() {
    let source = Arc::new(InMemorySnapshotSource::new(build_snapshot(
        &sample_predictions(),
        10,
    )));

    let (status, body) = get(
        dashboard_router(source),
        "/dashboard/snapshot?station=st&top=1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rows = json["rows"].as_array().unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["station"], "E 17 St & Broadway");
    assert_eq!(rows[0]["rank"], 2);
}

#[tokio::test]
async fn replaced_snapshot_is_served() {
    let source = Arc::new(InMemorySnapshotSource::new(DashboardSnapshot::default()));
    let app = dashboard_router(source.clone());

    let (_, body) = get(app.clone(), "/dashboard").await;
    assert!(String::from_utf8(body).unwrap().contains("No predictions yet."));

    source.replace_snapshot(build_snapshot(&sample_predictions(), 1));
    let (_, body) = get(app, "/dashboard/snapshot").await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["rows"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn store_backed_source_reads_predictions() {
    let mut store = DemandStore::open_in_memory().unwrap();
    store
        .upsert_predictions(&sample_predictions(), "fingerprint")
        .unwrap();
    let source = Arc::new(StoreSnapshotSource::new(store, 2, i64::MAX));
    source.refresh().unwrap();

    let (status, body) = get(dashboard_router(source), "/dashboard/snapshot").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let rows = json["rows"].as_array().unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["station"], "E 17 St & Broadway");
    assert_eq!(json["summary"]["max"], 31);
}

#[tokio::test]
async fn store_backed_source_serves_cached_snapshot_until_refresh() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("demand.sqlite");
    let mut writer = DemandStore::open(&path).unwrap();
    writer
        .upsert_predictions(&sample_predictions(), "fingerprint")
        .unwrap();

    let source = Arc::new(StoreSnapshotSource::open(&path, 10, i64::MAX).unwrap());
    let app = dashboard_router(source.clone());

    let (_, body) = get(app.clone(), "/dashboard").await;
    assert!(String::from_utf8(body).unwrap().contains("No predictions yet."));

    source.refresh().unwrap();
    writer
        .upsert_predictions(
            &[prediction("Grand Army Plaza", T0 + 2 * HOUR_MS, 50)],
            "fingerprint",
        )
        .unwrap();
    let (_, body) = get(app.clone(), "/dashboard/snapshot").await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["target_ts_ms_utc"], T0 + HOUR_MS);

    source.refresh().unwrap();
    let (_, body) = get(app, "/dashboard/snapshot").await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["target_ts_ms_utc"], T0 + 2 * HOUR_MS);
    assert_eq!(json["rows"][0]["station"], "Grand Army Plaza");
}

#[tokio::test]
async fn refresh_task_fills_the_snapshot() {
    let mut store = DemandStore::open_in_memory().unwrap();
    store
        .upsert_predictions(&sample_predictions(), "fingerprint")
        .unwrap();
    let source = Arc::new(StoreSnapshotSource::new(store, 10, i64::MAX));
    let task = source.clone().spawn_refresh(Duration::from_millis(20));

    let mut rows = 0;
    for _ in 0..100 {
        rows = source.snapshot().rows.len();
        if rows > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    task.abort();
    assert_eq!(rows, 3);
}
