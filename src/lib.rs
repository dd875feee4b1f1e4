pub mod catalog;
pub mod chart;
pub mod db;
pub mod errors;
pub mod fallback;
pub mod interpreter;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod plan;
pub mod query;
pub mod settings;
pub mod store;
pub mod tools;

pub use crate::db::Database;
pub use crate::errors::{AppError, AppResult, ErrorCategory, ToolError, ToolResult};
pub use crate::interpreter::{ExecutionContext, PlanInterpreter, StepOutcome};
pub use crate::plan::Plan;
pub use crate::settings::EngineSettings;

use crate::query::QueryBuilder;
use crate::store::{SiteDirectory, TimeseriesStore};
use crate::tools::ToolExecutor;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Wires store handles into an interpreter configured from `settings`.
pub fn build_interpreter(
    directory: Arc<dyn SiteDirectory>,
    store: Arc<dyn TimeseriesStore>,
    settings: &EngineSettings,
) -> PlanInterpreter {
    let executor = ToolExecutor::new(directory, store, QueryBuilder::new(settings.preview_limit));
    PlanInterpreter::new(Arc::new(executor), settings.step_timeout())
}

pub fn open_database(settings: &EngineSettings) -> AppResult<Arc<Database>> {
    let db = Database::new(&settings.database_path)?;
    tracing::info!(path = %db.path().display(), "database opened");
    Ok(Arc::new(db))
}

pub fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
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
