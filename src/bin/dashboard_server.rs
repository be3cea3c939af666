use std::{net::SocketAddr, sync::Arc, time::Duration};

use station_demand::{
    dashboard_router, init_logging, log_dashboard_bind, log_snapshot_source, AppKind,
    DashboardSnapshot, DashboardSnapshotSource, InMemorySnapshotSource, LoggingConfig,
    PipelineConfig, RunLog, RunOutcome, StoreSnapshotSource,
};
use tracing::warn;

const PREDICTION_LOOKBACK_MS: i64 = 7 * 86_400_000;
const SNAPSHOT_REFRESH: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = LoggingConfig::from_env(AppKind::DashboardServer);
    init_logging(&logging_cfg)?;
    let run = RunLog::start(&logging_cfg);

    let addr: SocketAddr = std::env::var("DEMAND_DASHBOARD_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let source = source_from_env(&PipelineConfig::from_env());
    let app = dashboard_router(source);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_dashboard_bind(bound_addr);
    let served = axum::serve(listener, app).await;
    run.finish(if served.is_ok() {
        RunOutcome::Completed
    } else {
        RunOutcome::Failed
    });
    served?;

    Ok(())
}

fn source_from_env(cfg: &PipelineConfig) -> Arc<dyn DashboardSnapshotSource> {
    let force_empty = std::env::var("DEMAND_DASHBOARD_USE_EMPTY")
        .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if force_empty {
        log_snapshot_source("in_memory", Some("DEMAND_DASHBOARD_USE_EMPTY"));
        return Arc::new(InMemorySnapshotSource::new(DashboardSnapshot::default()));
    }

    match StoreSnapshotSource::open(&cfg.store_path, cfg.dashboard_top_n, PREDICTION_LOOKBACK_MS) {
        Ok(source) => {
            log_snapshot_source("store", None);
            let source = Arc::new(source);
            Arc::clone(&source).spawn_refresh(SNAPSHOT_REFRESH);
            source
        }
        Err(err) => {
            warn!(
                component = "dashboard_server",
                event = "source.store_unavailable",
                path = %cfg.store_path.display(),
                error = %err
            );
            log_snapshot_source("in_memory", Some("store_unavailable"));
            Arc::new(InMemorySnapshotSource::new(DashboardSnapshot::default()))
        }
    }
}
