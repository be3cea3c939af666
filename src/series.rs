//! Sparse per-station bucket counts to a dense, zero-filled grid.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    pub fn step_ms(self) -> i64 {
        match self {
            Self::Hour => HOUR_MS,
            Self::Day => DAY_MS,
        }
    }

    /// Number of buckets spanning exactly one week.
    pub fn buckets_per_week(self) -> usize {
        match self {
            Self::Hour => 7 * 24,
            Self::Day => 7,
        }
    }

    /// Floors a UTC millisecond timestamp to the start of its bucket.
    pub fn floor_ts_ms(self, ts_ms_utc: i64) -> i64 {
        ts_ms_utc - ts_ms_utc.rem_euclid(self.step_ms())
    }

    /// Bucket holding the instant `ts_ms_utc` as seen from `tz`.
    ///
    /// Hour buckets are plain UTC hours. Day buckets are labelled by the local
    /// calendar date in `tz`, stored as that date's UTC midnight, so they stay
    /// aligned while a day still means midnight-to-midnight local time.
    pub fn bucket_start(self, ts_ms_utc: i64, tz: Tz) -> i64 {
        match self {
            Self::Hour => self.floor_ts_ms(ts_ms_utc),
            Self::Day => Utc
                .timestamp_millis_opt(ts_ms_utc)
                .single()
                .and_then(|dt| dt.with_timezone(&tz).date_naive().and_hms_opt(0, 0, 0))
                .map(|midnight| Utc.from_utc_datetime(&midnight).timestamp_millis())
                .unwrap_or_else(|| self.floor_ts_ms(ts_ms_utc)),
        }
    }

    pub fn is_aligned(self, ts_ms_utc: i64) -> bool {
        ts_ms_utc.rem_euclid(self.step_ms()) == 0
    }
}

pub fn parse_granularity(raw: &str) -> Option<Granularity> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "hour" | "hourly" | "h" => Some(Granularity::Hour),
        "day" | "daily" | "d" => Some(Granularity::Day),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub bucket_ts_ms_utc: i64,
    pub entity_id: String,
    pub count: u64,
}

impl Observation {
    pub fn new(bucket_ts_ms_utc: i64, entity_id: impl Into<String>, count: u64) -> Self {
        Self {
            bucket_ts_ms_utc,
            entity_id: entity_id.into(),
            count,
        }
    }
}

/// Every (bucket, entity) pair of the covered range, exactly once, bucket-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseSeries {
    granularity: Granularity,
    first_bucket_ts_ms_utc: i64,
    bucket_count: usize,
    entities: Vec<String>,
    observations: Vec<Observation>,
}

impl DenseSeries {
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn into_observations(self) -> Vec<Observation> {
        self.observations
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn first_bucket_ts_ms_utc(&self) -> i64 {
        self.first_bucket_ts_ms_utc
    }

    pub fn last_bucket_ts_ms_utc(&self) -> i64 {
        self.first_bucket_ts_ms_utc
            + (self.bucket_count as i64 - 1) * self.granularity.step_ms()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Splits the grid into one owned, chronologically ordered sequence per entity.
    pub fn partition_by_entity(&self) -> BTreeMap<String, Vec<(i64, u64)>> {
        let mut out: BTreeMap<String, Vec<(i64, u64)>> = self
            .entities
            .iter()
            .map(|entity| (entity.clone(), Vec::with_capacity(self.bucket_count)))
            .collect();

        for obs in &self.observations {
            if let Some(seq) = out.get_mut(&obs.entity_id) {
                seq.push((obs.bucket_ts_ms_utc, obs.count));
            }
        }

        out
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeriesError {
    #[error("no observations supplied; cannot establish a bucket range")]
    EmptyInput,
    #[error("bucket timestamp {bucket_ts_ms_utc} for entity {entity_id} is not aligned to {granularity:?}")]
    MisalignedBucket {
        bucket_ts_ms_utc: i64,
        entity_id: String,
        granularity: Granularity,
    },
}

/// Builds the dense grid covering every bucket between the earliest and latest
/// observed bucket (inclusive) for every entity seen anywhere in the input.
///
/// Duplicate (bucket, entity) inputs are summed. Missing pairs become zero.
pub fn fill_missing_buckets(
    granularity: Granularity,
    observations: &[Observation],
) -> Result<DenseSeries, SeriesError> {
    if observations.is_empty() {
        return Err(SeriesError::EmptyInput);
    }

    let mut counts: BTreeMap<(i64, &str), u64> = BTreeMap::new();
    let mut entities: BTreeSet<&str> = BTreeSet::new();
    let mut min_ts = i64::MAX;
    let mut max_ts = i64::MIN;

    for obs in observations {
        if !granularity.is_aligned(obs.bucket_ts_ms_utc) {
            return Err(SeriesError::MisalignedBucket {
                bucket_ts_ms_utc: obs.bucket_ts_ms_utc,
                entity_id: obs.entity_id.clone(),
                granularity,
            });
        }
        min_ts = min_ts.min(obs.bucket_ts_ms_utc);
        max_ts = max_ts.max(obs.bucket_ts_ms_utc);
        entities.insert(obs.entity_id.as_str());
        let slot = counts
            .entry((obs.bucket_ts_ms_utc, obs.entity_id.as_str()))
            .or_insert(0);
        *slot = slot.saturating_add(obs.count);
    }

    let step = granularity.step_ms();
    let bucket_count = ((max_ts - min_ts) / step) as usize + 1;
    let mut dense = Vec::with_capacity(bucket_count * entities.len());
    let mut filled_points = 0u64;

    for bucket_idx in 0..bucket_count {
        let bucket_ts = min_ts + bucket_idx as i64 * step;
        for entity in &entities {
            let count = match counts.get(&(bucket_ts, *entity)) {
                Some(count) => *count,
                None => {
                    filled_points += 1;
                    0
                }
            };
            dense.push(Observation::new(bucket_ts, *entity, count));
        }
    }

    debug!(
        component = "series",
        event = "series.fill.zero_filled",
        filled_points
    );
    info!(
        component = "series",
        event = "series.fill.finish",
        granularity = granularity.as_str(),
        input_points = observations.len(),
        bucket_count,
        entity_count = entities.len(),
        output_points = dense.len(),
        filled_points
    );

    Ok(DenseSeries {
        granularity,
        first_bucket_ts_ms_utc: min_ts,
        bucket_count,
        entities: entities.into_iter().map(str::to_string).collect(),
        observations: dense,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_404_172_800_000; // 2014-07-01T00:00:00Z

    fn hour(h: i64) -> i64 {
        T0 + h * HOUR_MS
    }

    #[test]
    fn fills_gaps_for_sparse_entity() {
        let mut input: Vec<Observation> = (0..6)
            .map(|h| Observation::new(hour(h), "A", h as u64 + 1))
            .collect();
        input.push(Observation::new(hour(0), "B", 7));
        input.push(Observation::new(hour(5), "B", 9));

        let series = fill_missing_buckets(Granularity::Hour, &input).expect("fill succeeds");
        assert_eq!(series.len(), 12);
        assert_eq!(series.bucket_count(), 6);

        let parts = series.partition_by_entity();
        let a: Vec<u64> = parts["A"].iter().map(|(_, c)| *c).collect();
        let b: Vec<u64> = parts["B"].iter().map(|(_, c)| *c).collect();
        assert_eq!(a, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(b, vec![7, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn order_is_bucket_major_entity_minor() {
        let input = vec![
            Observation::new(hour(1), "Z", 1),
            Observation::new(hour(0), "A", 1),
        ];
        let series = fill_missing_buckets(Granularity::Hour, &input).expect("fill succeeds");
        let keys: Vec<(i64, &str)> = series
            .observations()
            .iter()
            .map(|obs| (obs.bucket_ts_ms_utc, obs.entity_id.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![(hour(0), "A"), (hour(0), "Z"), (hour(1), "A"), (hour(1), "Z")]
        );
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(
            fill_missing_buckets(Granularity::Day, &[]),
            Err(SeriesError::EmptyInput)
        );
    }

    #[test]
    fn misaligned_bucket_is_rejected() {
        let input = vec![Observation::new(hour(0) + 1, "A", 1)];
        let err = fill_missing_buckets(Granularity::Hour, &input).expect_err("must fail");
        assert!(matches!(err, SeriesError::MisalignedBucket { .. }));
    }

    #[test]
    fn duplicate_pairs_are_summed() {
        let input = vec![
            Observation::new(hour(0), "A", 2),
            Observation::new(hour(0), "A", 3),
        ];
        let series = fill_missing_buckets(Granularity::Hour, &input).expect("fill succeeds");
        assert_eq!(series.observations(), &[Observation::new(hour(0), "A", 5)]);
    }

    #[test]
    fn floor_handles_pre_epoch_timestamps() {
        assert_eq!(Granularity::Hour.floor_ts_ms(-1), -HOUR_MS);
        assert_eq!(Granularity::Day.floor_ts_ms(T0 + 5), T0);
    }

    #[test]
    fn day_bucket_follows_local_calendar_date() {
        let ny = chrono_tz::America::New_York;
        // 2014-07-01 22:30 EDT is already 2014-07-02 in UTC
        let late_evening = T0 + 26 * HOUR_MS + 30 * 60_000;
        assert_eq!(Granularity::Day.bucket_start(late_evening, ny), T0);
        assert_eq!(Granularity::Day.bucket_start(late_evening, chrono_tz::UTC), T0 + DAY_MS);
        assert_eq!(
            Granularity::Hour.bucket_start(late_evening, ny),
            T0 + 26 * HOUR_MS
        );
    }
}
