use std::error::Error;

use station_demand::{
    init_logging, run_feature_pipeline, AppKind, DemandStore, LoggingConfig, PipelineConfig,
    RunLog, RunOutcome,
};

fn main() -> Result<(), Box<dyn Error>> {
    let logging_cfg = LoggingConfig::from_env(AppKind::FeaturePipeline);
    init_logging(&logging_cfg)?;
    let run = RunLog::start(&logging_cfg);

    match load_into_store() {
        Ok(()) => {
            run.finish(RunOutcome::Completed);
            Ok(())
        }
        Err(err) => {
            run.finish(RunOutcome::Failed);
            Err(err)
        }
    }
}

fn load_into_store() -> Result<(), Box<dyn Error>> {
    let cfg = PipelineConfig::from_env();
    let mut store = DemandStore::open(&cfg.store_path)?;
    let report = run_feature_pipeline(&cfg, &mut store)?;

    println!(
        "Feature pipeline done | files={} trips_kept={} trips_dropped={} stations={} dense_rows={} store={}",
        report.trips.files.len(),
        report.trips.rows_kept,
        report.trips.rows_dropped,
        report.entities,
        report.dense_rows,
        cfg.store_path.display()
    );
    Ok(())
}
