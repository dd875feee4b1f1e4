use crate::errors::{AppError, AppResult};
use crate::query::DEFAULT_PREVIEW_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_PATH_ENV: &str = "SITE_INSIGHTS_DB";
pub const STEP_TIMEOUT_ENV: &str = "SITE_INSIGHTS_STEP_TIMEOUT_MS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub preview_limit: u32,
    pub step_timeout_ms: u64,
    pub planner_timeout_ms: u64,
    pub synthesis_timeout_ms: u64,
    pub history_max_turns: usize,
    pub chart_keywords: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("site-insights.db"),
            log_dir: PathBuf::from("logs"),
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            step_timeout_ms: 30_000,
            planner_timeout_ms: 60_000,
            synthesis_timeout_ms: 60_000,
            history_max_turns: 6,
            chart_keywords: [
                "grafico",
                "gráfico",
                "graficar",
                "dibuja",
                "muestra un",
                "visualiza un",
                "chart",
                "plot",
                "graph",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

impl EngineSettings {
    /// Deep-merges a JSON settings file over the defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("{}: {error}", path.display())))?;
        let update: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|error| AppError::Config(format!("{}: {error}", path.display())))?;
        Self::default().merged(update)
    }

    pub fn merged(&self, update: serde_json::Value) -> AppResult<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, update);
        let settings: Self = serde_json::from_value(merged).map_err(|error| AppError::Config(error.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> AppResult<()> {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.trim().is_empty() {
                self.database_path = PathBuf::from(path.trim());
            }
        }
        if let Ok(raw) = std::env::var(STEP_TIMEOUT_ENV) {
            self.step_timeout_ms = raw
                .trim()
                .parse()
                .map_err(|_| AppError::Config(format!("{STEP_TIMEOUT_ENV} must be milliseconds, got '{raw}'")))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.preview_limit == 0 {
            return Err(AppError::Config("previewLimit must be at least 1".to_string()));
        }
        if self.step_timeout_ms == 0 || self.planner_timeout_ms == 0 || self.synthesis_timeout_ms == 0 {
            return Err(AppError::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_millis(self.planner_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
