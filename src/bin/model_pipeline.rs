use std::error::Error;
use std::process::ExitCode;

use chrono::Utc;
use station_demand::{
    init_logging, run_model_pipeline, AppKind, DemandStore, LoggingConfig, PipelineConfig,
    RunLog, RunOutcome, MAE_METRIC,
};
use tracing::warn;

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let logging_cfg = LoggingConfig::from_env(AppKind::ModelPipeline);
    init_logging(&logging_cfg)?;
    let run = RunLog::start(&logging_cfg);

    let cfg = PipelineConfig::from_env();
    let mut store = match DemandStore::open(&cfg.store_path) {
        Ok(store) => store,
        Err(err) => {
            run.finish(RunOutcome::Failed);
            return Err(err.into());
        }
    };

    let card = match run_model_pipeline(&cfg, &mut store, Utc::now().timestamp_millis()) {
        Ok(card) => card,
        Err(err) if err.is_recoverable() => {
            warn!(
                component = "model_pipeline",
                event = "model_pipeline.skipped",
                error = %err
            );
            run.finish(RunOutcome::Skipped);
            return Ok(ExitCode::from(2));
        }
        Err(err) => {
            run.finish(RunOutcome::Failed);
            return Err(err.into());
        }
    };

    println!(
        "Model pipeline done | model={} {}={:.4} columns={} fingerprint={} card={}",
        card.model_name,
        MAE_METRIC,
        card.metrics.get(MAE_METRIC).copied().unwrap_or(f64::NAN),
        card.schema.columns.len(),
        card.schema.fingerprint,
        cfg.model_card_path.display()
    );

    run.finish(RunOutcome::Completed);
    Ok(ExitCode::SUCCESS)
}
