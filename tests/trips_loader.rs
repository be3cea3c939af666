use std::fs;
use std::io::Write;
use std::path::Path;

use station_demand::{
    aggregate_trips, load_trip_files, Granularity, Observation, TripLoadConfig, TripLoadError,
};
use tempfile::tempdir;
use zip::write::SimpleFileOptions;

const T0: i64 = 1_404_172_800_000; // 2014-07-01T00:00:00Z
const HOUR_MS: i64 = 3_600_000;

const JULY_CSV: &str = "\"tripduration\",\"starttime\",\"stoptime\",\"start station id\",\"start station name\"\n\
\"634\",\"2014-07-01 00:00:04\",\"2014-07-01 00:10:38\",\"2002\",\"Wythe Ave & Metropolitan Ave\"\n\
\"1547\",\"2014-07-01 00:00:06\",\"2014-07-01 00:25:53\",\"327\",\"Vesey Pl & River Terrace\"\n\
\"178\",\"2014-07-01 00:30:11\",\"2014-07-01 00:33:09\",\"2002\",\"Wythe Ave & Metropolitan Ave\"\n\
\"250\",\"not-a-time\",\"2014-07-01 00:33:09\",\"2002\",\"Wythe Ave & Metropolitan Ave\"\n";

const AUGUST_CSV: &str = "tripduration,starttime,stoptime,start station id,start station name\n\
900,8/1/2014 02:15:00,8/1/2014 02:30:00,327,Vesey Pl & River Terrace\n";

fn write_zip(path: &Path, entry_name: &str, body: &str) {
    let file = fs::File::create(path).expect("create zip");
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file(
        entry_name,
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored),
    )
    .expect("start entry");
    zip.write_all(body.as_bytes()).expect("write entry");
    zip.finish().expect("finish zip");
}

fn utc_cfg() -> TripLoadConfig {
    TripLoadConfig {
        source_timezone: chrono_tz::UTC,
        ..TripLoadConfig::default()
    }
}

#[test]
fn loads_csv_and_zip_files_for_the_year_in_name_order() {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("2014-07.csv"), JULY_CSV).expect("write csv");
    write_zip(&dir.path().join("2014-08.zip"), "2014-08 - Citi Bike trip data.csv", AUGUST_CSV);
    fs::write(dir.path().join("2013-12.csv"), JULY_CSV).expect("write other year");
    fs::write(dir.path().join("2014-notes.txt"), "ignore me").expect("write txt");

    let (trips, report) = load_trip_files(dir.path(), 2014, &utc_cfg()).expect("load");

    let names: Vec<String> = report
        .files
        .iter()
        .map(|p| p.file_name().expect("name").to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["2014-07.csv", "2014-08.zip"]);
    assert_eq!(report.rows_read, 5);
    assert_eq!(report.rows_kept, 4);
    assert_eq!(report.rows_dropped, 1);
    assert_eq!(trips.len(), 4);

    let observations = aggregate_trips(&trips, Granularity::Hour, chrono_tz::UTC);
    let aug_first = T0 + 31 * 24 * HOUR_MS + 2 * HOUR_MS;
    assert_eq!(
        observations,
        vec![
            Observation::new(T0, "Vesey Pl & River Terrace", 1),
            Observation::new(T0, "Wythe Ave & Metropolitan Ave", 2),
            Observation::new(aug_first, "Vesey Pl & River Terrace", 1),
        ]
    );
}

#[test]
fn naive_times_default_to_new_york() {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("2014-07.csv"), JULY_CSV).expect("write csv");

    let (trips, _) = load_trip_files(dir.path(), 2014, &TripLoadConfig::default()).expect("load");
    let observations = aggregate_trips(&trips, Granularity::Hour, chrono_tz::America::New_York);
    // EDT is UTC-4
    assert!(observations
        .iter()
        .all(|o| o.bucket_ts_ms_utc == T0 + 4 * HOUR_MS));
}

#[test]
fn daily_counts_follow_new_york_dates() {
    let dir = tempdir().expect("temp dir");
    let body = "tripduration,starttime,stoptime,start station name\n\
                600,2014-07-01 08:00:00,2014-07-01 08:10:00,A\n\
                600,2014-07-01 21:30:00,2014-07-01 21:40:00,A\n\
                600,2014-07-02 00:15:00,2014-07-02 00:25:00,A\n";
    fs::write(dir.path().join("2014-07.csv"), body).expect("write csv");

    let (trips, _) = load_trip_files(dir.path(), 2014, &TripLoadConfig::default()).expect("load");
    let observations = aggregate_trips(&trips, Granularity::Day, chrono_tz::America::New_York);
    // 21:30 EDT falls on the next UTC day but stays on July 1st
    assert_eq!(
        observations,
        vec![
            Observation::new(T0, "A", 2),
            Observation::new(T0 + 24 * HOUR_MS, "A", 1),
        ]
    );
}

#[test]
fn missing_year_is_an_error() {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("2014-07.csv"), JULY_CSV).expect("write csv");

    let err = load_trip_files(dir.path(), 2015, &utc_cfg()).expect_err("must fail");
    assert!(matches!(err, TripLoadError::NoFiles { year: 2015, .. }));
}

#[test]
fn zip_without_csv_entry_is_an_error() {
    let dir = tempdir().expect("temp dir");
    write_zip(&dir.path().join("2014-09.zip"), "README.txt", "nothing here");

    let err = load_trip_files(dir.path(), 2014, &utc_cfg()).expect_err("must fail");
    assert!(matches!(err, TripLoadError::MissingCsvEntry { .. }));
}
