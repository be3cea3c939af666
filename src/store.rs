//! SQLite-backed store for bucket counts, lag windows and predictions.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::inference::Prediction;
use crate::series::{fill_missing_buckets, DenseSeries, Granularity, Observation, SeriesError};
use crate::windows::{lag_column_names, LagTable, LagTableRow, WindowError, WindowRow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("stored windows in range mix window sizes {first} and {second}")]
    MixedWindowSizes { first: usize, second: usize },
    #[error("negative count {count} stored for {entity_id} at {bucket_ts_ms_utc}")]
    NegativeCount {
        entity_id: String,
        bucket_ts_ms_utc: i64,
        count: i64,
    },
}

pub struct DemandStore {
    conn: Connection,
}

impl DemandStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;

        info!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn upsert_series(&mut self, series: &DenseSeries) -> Result<usize, StoreError> {
        let granularity = series.granularity().as_str();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO demand_series (granularity, bucket_ts_ms, entity_id, count)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(granularity, bucket_ts_ms, entity_id) DO UPDATE SET
                    count = excluded.count
                ",
            )?;
            for obs in series.observations() {
                stmt.execute(params![
                    granularity,
                    obs.bucket_ts_ms_utc,
                    obs.entity_id,
                    obs.count as i64
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.series.upserted",
            granularity,
            rows = series.len()
        );
        Ok(series.len())
    }

    /// Reads stored counts in `[start, end)` and re-densifies them, so the
    /// result is gap-free and deterministically ordered regardless of row order.
    pub fn read_series(
        &self,
        granularity: Granularity,
        start_ts_ms_utc: i64,
        end_ts_ms_utc_exclusive: i64,
    ) -> Result<DenseSeries, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT bucket_ts_ms, entity_id, count
            FROM demand_series
            WHERE granularity = ?1
              AND bucket_ts_ms >= ?2
              AND bucket_ts_ms < ?3
            ",
        )?;
        let mut rows = stmt.query(params![
            granularity.as_str(),
            start_ts_ms_utc,
            end_ts_ms_utc_exclusive
        ])?;

        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            let bucket_ts_ms_utc: i64 = row.get(0)?;
            let entity_id: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            if count < 0 {
                return Err(StoreError::NegativeCount {
                    entity_id,
                    bucket_ts_ms_utc,
                    count,
                });
            }
            observations.push(Observation::new(bucket_ts_ms_utc, entity_id, count as u64));
        }

        debug!(
            component = "store",
            event = "store.series.read",
            granularity = granularity.as_str(),
            start_ts_ms_utc,
            end_ts_ms_utc_exclusive,
            rows = observations.len()
        );

        Ok(fill_missing_buckets(granularity, &observations)?)
    }

    pub fn latest_bucket_ts(&self, granularity: Granularity) -> Result<Option<i64>, StoreError> {
        let latest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(bucket_ts_ms) FROM demand_series WHERE granularity = ?1",
                params![granularity.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(latest)
    }

    pub fn upsert_windows(&mut self, windows: &[WindowRow]) -> Result<usize, StoreError> {
        if windows.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO lag_windows (anchor_ts_ms, entity_id, window_size, lag_values_json, target)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(anchor_ts_ms, entity_id) DO UPDATE SET
                    window_size = excluded.window_size,
                    lag_values_json = excluded.lag_values_json,
                    target = excluded.target
                ",
            )?;
            for window in windows {
                stmt.execute(params![
                    window.anchor_ts_ms_utc,
                    window.entity_id,
                    window.lag_values.len() as i64,
                    serde_json::to_string(&window.lag_values)?,
                    window.target as i64
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.windows.upserted",
            rows = windows.len()
        );
        Ok(windows.len())
    }

    /// Reads stored windows with anchors in `[start, end)` as a lag table whose
    /// column names are derived from the stored window size.
    pub fn read_lag_table(
        &self,
        prefix: &str,
        start_ts_ms_utc: i64,
        end_ts_ms_utc_exclusive: i64,
    ) -> Result<LagTable, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT anchor_ts_ms, entity_id, window_size, lag_values_json, target
            FROM lag_windows
            WHERE anchor_ts_ms >= ?1
              AND anchor_ts_ms < ?2
            ORDER BY anchor_ts_ms ASC, entity_id ASC
            ",
        )?;
        let mut rows = stmt.query(params![start_ts_ms_utc, end_ts_ms_utc_exclusive])?;

        let mut window_size: Option<usize> = None;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let stored_size = row.get::<_, i64>(2)? as usize;
            match window_size {
                Some(first) if first != stored_size => {
                    return Err(StoreError::MixedWindowSizes {
                        first,
                        second: stored_size,
                    });
                }
                _ => window_size = Some(stored_size),
            }

            let lag_json: String = row.get(3)?;
            let lag_values: Vec<u64> = serde_json::from_str(&lag_json)?;
            let target: i64 = row.get(4)?;
            out.push(LagTableRow {
                anchor_ts_ms_utc: row.get(0)?,
                entity_id: row.get(1)?,
                values: lag_values.into_iter().map(|v| v as f64).collect(),
                target: Some(target as f64),
            });
        }

        let columns = lag_column_names(prefix, window_size.unwrap_or(0));
        Ok(LagTable::new(columns, out)?)
    }

    pub fn upsert_predictions(
        &mut self,
        predictions: &[Prediction],
        model_fingerprint: &str,
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO predictions (target_ts_ms, entity_id, predicted_demand, model_fingerprint)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(target_ts_ms, entity_id) DO UPDATE SET
                    predicted_demand = excluded.predicted_demand,
                    model_fingerprint = excluded.model_fingerprint
                ",
            )?;
            for prediction in predictions {
                stmt.execute(params![
                    prediction.target_ts_ms_utc,
                    prediction.entity_id,
                    prediction.predicted_demand as i64,
                    model_fingerprint
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.predictions.upserted",
            rows = predictions.len()
        );
        Ok(predictions.len())
    }

    pub fn read_predictions(&self, from_ts_ms_utc: i64) -> Result<Vec<Prediction>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT target_ts_ms, entity_id, predicted_demand
            FROM predictions
            WHERE target_ts_ms >= ?1
            ORDER BY target_ts_ms ASC, entity_id ASC
            ",
        )?;
        let rows = stmt.query_map(params![from_ts_ms_utc], |row| {
            Ok(Prediction {
                target_ts_ms_utc: row.get(0)?,
                entity_id: row.get(1)?,
                predicted_demand: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS demand_series (
            granularity TEXT NOT NULL,
            bucket_ts_ms INTEGER NOT NULL,
            entity_id TEXT NOT NULL,
            count INTEGER NOT NULL,
            PRIMARY KEY(granularity, bucket_ts_ms, entity_id)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS lag_windows (
            anchor_ts_ms INTEGER NOT NULL,
            entity_id TEXT NOT NULL,
            window_size INTEGER NOT NULL,
            lag_values_json TEXT NOT NULL,
            target INTEGER NOT NULL,
            PRIMARY KEY(anchor_ts_ms, entity_id)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS predictions (
            target_ts_ms INTEGER NOT NULL,
            entity_id TEXT NOT NULL,
            predicted_demand INTEGER NOT NULL,
            model_fingerprint TEXT NOT NULL,
            PRIMARY KEY(target_ts_ms, entity_id)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}
