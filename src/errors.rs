use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("PLAN_INVALID: {0}")]
    Plan(String),
    #[error("PLANNER_FAILED: {0}")]
    Planner(String),
    #[error("SYNTHESIS_FAILED: {0}")]
    Synthesis(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Broad class of a step failure, used by the synthesis stage to pick wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Resolution,
    Validation,
    Data,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("no site with id {0}")]
    SiteNotFound(i64),
    #[error("no site matches the name '{0}'")]
    SiteNameNotFound(String),
    #[error("site {site_id} has no alias for source '{source_name}'")]
    MissingAlias { site_id: i64, source_name: String },
    #[error("none of the requested sites has an alias for source '{0}'")]
    NoResolvableSite(String),
    #[error("unknown source '{0}'")]
    UnknownSource(String),
    #[error("none of the metrics {0:?} is valid for this source")]
    NoValidMetric(Vec<String>),
    #[error("invalid aggregation '{0}', expected 'sum' or 'avg'")]
    InvalidAggregation(String),
    #[error("invalid mode '{0}', expected 'max' or 'min'")]
    InvalidMode(String),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("both sources have data but their periods do not overlap")]
    NoOverlappingPeriod,
    #[error("not enough data in one or both sources: {0}")]
    InsufficientData(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("could not resolve placeholder '{0}'")]
    UnresolvedReference(String),
    #[error("placeholder '{0}' references a step that has not run yet")]
    ForwardReference(String),
    #[error("store query failed: {0}")]
    Store(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SiteNotFound(_) | Self::SiteNameNotFound(_) => "site_not_found",
            Self::MissingAlias { .. } | Self::NoResolvableSite(_) => "missing_alias",
            Self::UnknownSource(_) => "unknown_source",
            Self::NoValidMetric(_) => "no_valid_metric",
            Self::InvalidAggregation(_) => "invalid_aggregation",
            Self::InvalidMode(_) => "invalid_mode",
            Self::InvalidDate(_) => "invalid_date",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::NoOverlappingPeriod => "no_overlapping_period",
            Self::InsufficientData(_) => "insufficient_data",
            Self::UnknownTool(_) => "unknown_tool",
            Self::UnresolvedReference(_) => "unresolved_reference",
            Self::ForwardReference(_) => "forward_reference",
            Self::Store(_) => "store_failure",
            Self::Timeout(_) => "timeout",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SiteNotFound(_)
            | Self::SiteNameNotFound(_)
            | Self::MissingAlias { .. }
            | Self::NoResolvableSite(_)
            | Self::UnresolvedReference(_)
            | Self::ForwardReference(_) => ErrorCategory::Resolution,
            Self::UnknownSource(_)
            | Self::NoValidMetric(_)
            | Self::InvalidAggregation(_)
            | Self::InvalidMode(_)
            | Self::InvalidDate(_)
            | Self::InvalidParameters(_)
            | Self::UnknownTool(_) => ErrorCategory::Validation,
            Self::NoOverlappingPeriod | Self::InsufficientData(_) => ErrorCategory::Data,
            Self::Store(_) | Self::Timeout(_) => ErrorCategory::Transport,
        }
    }
}

impl From<AppError> for ToolError {
    fn from(value: AppError) -> Self {
        Self::Store(value.to_string())
    }
}

impl From<rusqlite::Error> for ToolError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(value.to_string())
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::{ErrorCategory, ToolError};

    #[test]
    fn codes_and_categories_follow_the_taxonomy() {
        let missing = ToolError::MissingAlias {
            site_id: 3,
            source_name: "weather".to_string(),
        };
        assert_eq!(missing.code(), "missing_alias");
        assert_eq!(missing.category(), ErrorCategory::Resolution);
        assert_eq!(ToolError::NoValidMetric(vec![]).category(), ErrorCategory::Validation);
        assert_eq!(ToolError::NoOverlappingPeriod.category(), ErrorCategory::Data);
        assert_eq!(ToolError::Timeout(10).category(), ErrorCategory::Transport);
    }
}
