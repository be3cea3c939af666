//! Tracing setup and run lifecycle events for the pipeline stages and the
//! dashboard server.
//!
//! Every process logs `app.start` when it comes up and `app.finish` with an
//! outcome and wall time when it is done. The batch stages default to compact
//! one-line output for cron logs; the dashboard defaults to pretty output.

use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{env_parsed, env_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    FeaturePipeline,
    ModelPipeline,
    InferencePipeline,
    DashboardServer,
}

impl AppKind {
    pub fn component(self) -> &'static str {
        match self {
            Self::FeaturePipeline => "feature_pipeline",
            Self::ModelPipeline => "model_pipeline",
            Self::InferencePipeline => "inference_pipeline",
            Self::DashboardServer => "dashboard_server",
        }
    }

    fn default_format(self) -> LogFormat {
        match self {
            Self::DashboardServer => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub app: AppKind,
    /// `EnvFilter` directives, e.g. `info` or `station_demand=debug,warn`.
    pub filter: String,
    pub format: LogFormat,
    pub include_target: bool,
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl LoggingConfig {
    pub fn for_app(app: AppKind) -> Self {
        Self {
            app,
            filter: "info".to_string(),
            format: app.default_format(),
            include_target: true,
        }
    }

    /// `DEMAND_LOG_LEVEL`, `DEMAND_LOG_FORMAT` and `DEMAND_LOG_TARGET` override
    /// the app defaults; unparsable values are ignored.
    pub fn from_env(app: AppKind) -> Self {
        let mut cfg = Self::for_app(app);
        if let Some(filter) = env_string("DEMAND_LOG_LEVEL") {
            cfg.filter = filter;
        }
        if let Some(format) = env_parsed("DEMAND_LOG_FORMAT", parse_log_format) {
            cfg.format = format;
        }
        if let Some(include_target) = env_parsed("DEMAND_LOG_TARGET", parse_bool) {
            cfg.include_target = include_target;
        }
        cfg
    }
}

pub fn init_logging(cfg: &LoggingConfig) -> Result<(), LoggingInitError> {
    let filter = EnvFilter::try_new(&cfg.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cfg.include_target)
        .with_ansi(cfg.format == LogFormat::Pretty);

    match cfg.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish())?,
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Nothing to do yet, e.g. too little history to split.
    Skipped,
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Brackets one process run between `app.start` and `app.finish`.
#[derive(Debug)]
pub struct RunLog {
    app: AppKind,
    started: Instant,
}

impl RunLog {
    pub fn start(cfg: &LoggingConfig) -> Self {
        info!(
            component = cfg.app.component(),
            event = "app.start",
            log_filter = %cfg.filter,
            log_format = ?cfg.format,
            pid = std::process::id()
        );
        Self {
            app: cfg.app,
            started: Instant::now(),
        }
    }

    pub fn finish(self, outcome: RunOutcome) {
        info!(
            component = self.app.component(),
            event = "app.finish",
            outcome = outcome.as_str(),
            elapsed_ms = self.started.elapsed().as_millis() as u64
        );
    }
}

pub fn log_dashboard_bind(bound_addr: SocketAddr) {
    info!(
        component = "dashboard_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        routes = "/dashboard,/dashboard/snapshot"
    );
}

/// `reason` says why a fallback source was picked; `None` means the store.
pub fn log_snapshot_source(source: &str, reason: Option<&str>) {
    info!(
        component = "dashboard_server",
        event = "source.selected",
        source,
        reason = reason.unwrap_or("configured")
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        "compact" => Some(LogFormat::Compact),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
