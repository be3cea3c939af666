//! Time-ordered train/test partitioning by anchor timestamp.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::windows::{LagTable, LagTableRow, WindowError, WindowRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cutoff {
    At(i64),
    /// `max(anchor) - offset_ms` over the rows being split.
    OffsetFromMax { offset_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split<T> {
    pub cutoff_ts_ms_utc: i64,
    pub train: Vec<T>,
    pub test: Vec<T>,
}

/// A [`LagTable`] cut in two at the resolved cutoff; both sides keep its columns.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSplit {
    pub cutoff_ts_ms_utc: i64,
    pub train: LagTable,
    pub test: LagTable,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("no rows to split")]
    EmptyInput,
    #[error(
        "{partition:?} partition is empty at cutoff {cutoff_ts_ms_utc} (train_rows={train_rows}, test_rows={test_rows})"
    )]
    EmptySplit {
        partition: Partition,
        cutoff_ts_ms_utc: i64,
        train_rows: usize,
        test_rows: usize,
    },
    #[error(transparent)]
    Table(#[from] WindowError),
}

pub trait Anchored {
    fn anchor_ts_ms_utc(&self) -> i64;
}

impl Anchored for WindowRow {
    fn anchor_ts_ms_utc(&self) -> i64 {
        self.anchor_ts_ms_utc
    }
}

impl Anchored for LagTableRow {
    fn anchor_ts_ms_utc(&self) -> i64 {
        self.anchor_ts_ms_utc
    }
}

pub fn resolve_cutoff<T: Anchored>(rows: &[T], cutoff: Cutoff) -> Result<i64, SplitError> {
    match cutoff {
        Cutoff::At(ts) => Ok(ts),
        Cutoff::OffsetFromMax { offset_ms } => rows
            .iter()
            .map(Anchored::anchor_ts_ms_utc)
            .max()
            .map(|max_ts| max_ts.saturating_sub(offset_ms))
            .ok_or(SplitError::EmptyInput),
    }
}

/// Train gets `anchor < cutoff`, test gets `anchor >= cutoff`. Relative input
/// order is kept inside each side.
pub fn split_by_cutoff<T: Anchored>(rows: Vec<T>, cutoff: Cutoff) -> Result<Split<T>, SplitError> {
    if rows.is_empty() {
        return Err(SplitError::EmptyInput);
    }
    let cutoff_ts_ms_utc = resolve_cutoff(&rows, cutoff)?;

    let (train, test): (Vec<T>, Vec<T>) = rows
        .into_iter()
        .partition(|row| row.anchor_ts_ms_utc() < cutoff_ts_ms_utc);

    let empty = if train.is_empty() {
        Some(Partition::Train)
    } else if test.is_empty() {
        Some(Partition::Test)
    } else {
        None
    };

    if let Some(partition) = empty {
        warn!(
            component = "split",
            event = "split.empty_partition",
            partition = ?partition,
            cutoff_ts_ms_utc,
            train_rows = train.len(),
            test_rows = test.len()
        );
        return Err(SplitError::EmptySplit {
            partition,
            cutoff_ts_ms_utc,
            train_rows: train.len(),
            test_rows: test.len(),
        });
    }

    info!(
        component = "split",
        event = "split.finish",
        cutoff_ts_ms_utc,
        train_rows = train.len(),
        test_rows = test.len()
    );

    Ok(Split {
        cutoff_ts_ms_utc,
        train,
        test,
    })
}

pub fn split_lag_table(table: &LagTable, cutoff: Cutoff) -> Result<TableSplit, SplitError> {
    let split = split_by_cutoff(table.rows().to_vec(), cutoff)?;
    Ok(TableSplit {
        cutoff_ts_ms_utc: split.cutoff_ts_ms_utc,
        train: table.with_rows(split.train)?,
        test: table.with_rows(split.test)?,
    })
}
