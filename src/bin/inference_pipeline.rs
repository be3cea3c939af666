use std::error::Error;

use chrono::Utc;
use station_demand::{
    init_logging, run_backfill_pipeline, run_inference_pipeline, top_stations, AppKind,
    DemandStore, LoggingConfig, PipelineConfig, RunLog, RunOutcome,
};

fn main() -> Result<(), Box<dyn Error>> {
    let logging_cfg = LoggingConfig::from_env(AppKind::InferencePipeline);
    init_logging(&logging_cfg)?;
    let run = RunLog::start(&logging_cfg);

    let backfill = std::env::args().skip(1).any(|arg| arg == "--backfill");
    match score(backfill) {
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

fn score(backfill: bool) -> Result<(), Box<dyn Error>> {
    let cfg = PipelineConfig::from_env();
    let mut store = DemandStore::open(&cfg.store_path)?;

    if backfill {
        let predictions = run_backfill_pipeline(&cfg, &mut store)?;
        println!(
            "Backfill done | predictions={} step_size={}",
            predictions.len(),
            cfg.inference_step_size
        );
        return Ok(());
    }

    let predictions = run_inference_pipeline(&cfg, &mut store, Utc::now().timestamp_millis())?;
    println!("Inference done | predictions={}", predictions.len());
    for (rank, prediction) in top_stations(&predictions, cfg.dashboard_top_n)
        .iter()
        .enumerate()
    {
        println!(
            "{:>3}. {:<40} {:>5}",
            rank + 1,
            prediction.entity_id,
            prediction.predicted_demand
        );
    }
    Ok(())
}
