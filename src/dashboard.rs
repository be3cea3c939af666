//! Station demand dashboard: top-N table, summary stats and HTTP routes.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::inference::{top_stations, Prediction};
use crate::store::{DemandStore, StoreError};

pub const DASHBOARD_HEADERS: [&str; 4] = ["Rank", "Station", "Predicted rides", "Target hour (UTC)"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardRow {
    pub rank: usize,
    pub station: String,
    pub predicted_demand: u64,
    pub target_ts_ms_utc: i64,
}

impl DashboardRow {
    pub fn to_cell_text_values(&self) -> Vec<String> {
        vec![
            self.rank.to_string(),
            self.station.clone(),
            self.predicted_demand.to_string(),
            format_ts(self.target_ts_ms_utc),
        ]
    }
}

/// Aggregates over every station predicted for the target bucket, not just the top N.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandSummary {
    pub station_count: usize,
    pub average: f64,
    pub max: u64,
    pub min: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DashboardSnapshot {
    pub target_ts_ms_utc: Option<i64>,
    pub summary: Option<DemandSummary>,
    pub rows: Vec<DashboardRow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DashboardQuery {
    pub top: Option<usize>,
    pub station: Option<String>,
}

pub trait DashboardSnapshotSource: Send + Sync + 'static {
    fn snapshot(&self) -> DashboardSnapshot;
}

#[derive(Clone)]
pub struct InMemorySnapshotSource {
    inner: Arc<RwLock<DashboardSnapshot>>,
}

impl InMemorySnapshotSource {
    pub fn new(snapshot: DashboardSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn replace_snapshot(&self, snapshot: DashboardSnapshot) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = snapshot;
    }
}

impl DashboardSnapshotSource for InMemorySnapshotSource {
    fn snapshot(&self) -> DashboardSnapshot {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Serves the last snapshot read from the demand store. Requests never touch
/// SQLite; `refresh` does, and `spawn_refresh` runs it on the blocking pool.
pub struct StoreSnapshotSource {
    store: Mutex<DemandStore>,
    top_n: usize,
    lookback_ms: i64,
    cached: InMemorySnapshotSource,
}

impl StoreSnapshotSource {
    pub fn open(path: &Path, top_n: usize, lookback_ms: i64) -> Result<Self, StoreError> {
        Ok(Self::new(DemandStore::open(path)?, top_n, lookback_ms))
    }

    pub fn new(store: DemandStore, top_n: usize, lookback_ms: i64) -> Self {
        Self {
            store: Mutex::new(store),
            top_n,
            lookback_ms,
            cached: InMemorySnapshotSource::new(DashboardSnapshot::default()),
        }
    }

    /// Re-reads recent predictions and swaps in a new snapshot.
    pub fn refresh(&self) -> Result<(), StoreError> {
        let from_ts = Utc::now().timestamp_millis().saturating_sub(self.lookback_ms);
        let predictions = {
            let store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            store.read_predictions(from_ts)?
        };
        let snapshot = build_snapshot(&predictions, self.top_n);
        info!(
            component = "dashboard",
            event = "dashboard.source.refreshed",
            predictions = predictions.len(),
            rows = snapshot.rows.len()
        );
        self.cached.replace_snapshot(snapshot);
        Ok(())
    }

    /// Refreshes right away, then once per `every`. A failed read keeps the
    /// previous snapshot.
    pub fn spawn_refresh(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let source = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || source.refresh()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(
                        component = "dashboard",
                        event = "dashboard.source.read_failed",
                        error = %err
                    ),
                    Err(err) => warn!(
                        component = "dashboard",
                        event = "dashboard.source.refresh_aborted",
                        error = %err
                    ),
                }
            }
        })
    }
}

impl DashboardSnapshotSource for StoreSnapshotSource {
    fn snapshot(&self) -> DashboardSnapshot {
        self.cached.snapshot()
    }
}

/// Snapshot of the most recent target bucket present in `predictions`.
pub fn build_snapshot(predictions: &[Prediction], top_n: usize) -> DashboardSnapshot {
    let Some(target_ts_ms_utc) = predictions.iter().map(|p| p.target_ts_ms_utc).max() else {
        return DashboardSnapshot::default();
    };
    let latest: Vec<Prediction> = predictions
        .iter()
        .filter(|p| p.target_ts_ms_utc == target_ts_ms_utc)
        .cloned()
        .collect();

    let rows = top_stations(&latest, top_n)
        .into_iter()
        .enumerate()
        .map(|(idx, p)| DashboardRow {
            rank: idx + 1,
            station: p.entity_id,
            predicted_demand: p.predicted_demand,
            target_ts_ms_utc: p.target_ts_ms_utc,
        })
        .collect();

    DashboardSnapshot {
        target_ts_ms_utc: Some(target_ts_ms_utc),
        summary: summarize(&latest),
        rows,
    }
}

pub fn summarize(predictions: &[Prediction]) -> Option<DemandSummary> {
    let max = predictions.iter().map(|p| p.predicted_demand).max()?;
    let min = predictions.iter().map(|p| p.predicted_demand).min()?;
    let total: u64 = predictions.iter().map(|p| p.predicted_demand).sum();
    Some(DemandSummary {
        station_count: predictions.len(),
        average: total as f64 / predictions.len() as f64,
        max,
        min,
    })
}

/// Case-insensitive station substring filter, then an optional row limit.
/// Ranks are kept from the unfiltered table.
pub fn apply_query(snapshot: &DashboardSnapshot, query: &DashboardQuery) -> DashboardSnapshot {
    let needle = query
        .station
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);

    let mut rows: Vec<DashboardRow> = snapshot
        .rows
        .iter()
        .filter(|row| match &needle {
            Some(needle) => row.station.to_lowercase().contains(needle),
            None => true,
        })
        .cloned()
        .collect();
    if let Some(top) = query.top {
        rows.truncate(top);
    }

    DashboardSnapshot {
        target_ts_ms_utc: snapshot.target_ts_ms_utc,
        summary: snapshot.summary.clone(),
        rows,
    }
}

pub fn dashboard_router(source: Arc<dyn DashboardSnapshotSource>) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/snapshot", get(get_dashboard_snapshot))
        .with_state(DashboardAppState { source })
}

pub fn render_dashboard_html(snapshot: &DashboardSnapshot) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Station Demand</title>\n");
    out.push_str("<style>body{margin:0;font-family:\"Avenir Next\",\"Segoe UI\",sans-serif;background:#f3f5f6;color:#182026}.shell{max-width:960px;margin:0 auto;padding:24px 18px}.hero{background:#14343f;color:#f7fbfc;border-radius:14px;padding:16px 20px}.hero h1{margin:0 0 8px;font-size:1.5rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.9rem;color:#dcebf0}.stats{display:flex;gap:12px;margin-top:16px}.stat{flex:1;background:#fff;border:1px solid #d7dce1;border-radius:12px;padding:12px}.stat b{display:block;font-size:1.3rem}.card{margin-top:16px;background:#fff;border:1px solid #d7dce1;border-radius:14px;overflow:hidden}table{width:100%;border-collapse:collapse}thead th{background:#14343f;color:#f2f7f9;font-size:.8rem;text-transform:uppercase;padding:10px;text-align:left}tbody td{font-size:.9rem;padding:9px 10px;border-bottom:1px solid #e3e7ea}tbody tr:nth-child(even){background:#fafcfd}.empty{padding:16px;color:#5f6a73}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<section class=\"hero\"><h1>Station Demand Forecast</h1>");
    out.push_str("<div class=\"hero-meta\">\n");
    out.push_str(&format!(
        "<span>Target: {}</span>",
        escape_html(
            &snapshot
                .target_ts_ms_utc
                .map(format_ts)
                .unwrap_or_else(|| "-".to_string())
        )
    ));
    out.push_str(&format!("<span>Rows: {}</span>", snapshot.rows.len()));
    out.push_str(&format!("<span>Generated: {}</span>", escape_html(&now_utc)));
    out.push_str("</div></section>\n");

    if let Some(summary) = &snapshot.summary {
        out.push_str("<section class=\"stats\" id=\"demand-summary\">");
        out.push_str(&format!(
            "<div class=\"stat\">Stations<b>{}</b></div>",
            summary.station_count
        ));
        out.push_str(&format!(
            "<div class=\"stat\">Average<b>{:.2}</b></div>",
            summary.average
        ));
        out.push_str(&format!("<div class=\"stat\">Max<b>{}</b></div>", summary.max));
        out.push_str(&format!("<div class=\"stat\">Min<b>{}</b></div>", summary.min));
        out.push_str("</section>\n");
    }

    out.push_str("<section class=\"card\">");
    if snapshot.rows.is_empty() {
        out.push_str("<div class=\"empty\">No predictions yet.</div>");
    } else {
        out.push_str("<table id=\"dashboard-table\">\n<thead><tr>");
        for header in DASHBOARD_HEADERS {
            out.push_str("<th>");
            out.push_str(&escape_html(header));
            out.push_str("</th>");
        }
        out.push_str("</tr></thead><tbody>\n");

        for row in &snapshot.rows {
            out.push_str(&format!("<tr data-rank=\"{}\">", row.rank));
            for value in row.to_cell_text_values() {
                out.push_str("<td>");
                out.push_str(&escape_html(&value));
                out.push_str("</td>");
            }
            out.push_str("</tr>\n");
        }
        out.push_str("</tbody></table>");
    }
    out.push_str("</section></main></body></html>\n");
    out
}

fn format_ts(ts_ms_utc: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts_ms_utc.to_string())
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn DashboardSnapshotSource>,
}

async fn get_dashboard_html(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> impl IntoResponse {
    let snapshot = apply_query(&state.source.snapshot(), &query);
    Html(render_dashboard_html(&snapshot))
}

async fn get_dashboard_snapshot(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> impl IntoResponse {
    let snapshot = apply_query(&state.source.snapshot(), &query);
    info!(
        component = "dashboard",
        event = "http.snapshot.request",
        rows = snapshot.rows.len(),
        target_ts_ms_utc = snapshot.target_ts_ms_utc
    );
    Json(snapshot)
}
