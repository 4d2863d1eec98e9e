pub mod conversation;
pub mod db;
pub mod errors;
pub mod executor;
pub mod lifecycle;
pub mod models;
pub mod publication;
pub mod queue;
pub mod schedule;
pub mod secrets;

pub use conversation::{Assistant, AssistantReply, ConverseFuture, SessionManager, SessionUpdate};
pub use db::Database;
pub use errors::{CoreError, CoreResult};
pub use executor::{ExecuteFuture, RunExecutor, RunOutcome};
pub use lifecycle::ReportEngine;
pub use models::{
    ConversationSession, ConversationTurn, DayOfWeek, EngineSettings, ListReportsFilters,
    PublishedReport, PublishedReportLink, QueryExecution, Report, ReportDefinition, ReportRun,
    ReportStatus, RunStatus, ScheduleConfigPayload, ScheduleSpec, ScheduleType, SessionState,
    SqlQuery, TriggerType, TurnRole, UpdateSchedulePayload,
};
pub use publication::PublicationRegistry;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Initializes daily-rolling JSON file logging under `data_dir/logs`.
/// Safe to call once per process; the writer guard lives for its lifetime.
pub fn init_tracing(data_dir: &Path) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
