//! Typed parameter shapes for each tool.
//!
//! Planners are loose about scalar types, so ids and limits are accepted as
//! numbers or numeric strings, and a single metric may stand in for a list.

use super::ToolParams;
use crate::errors::{ToolError, ToolResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

pub fn parse<T: DeserializeOwned>(params: &ToolParams) -> ToolResult<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|error| ToolError::InvalidParameters(error.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Flexible {
    Number(i64),
    Float(f64),
    Text(String),
}

impl Flexible {
    pub fn as_i64(&self) -> ToolResult<i64> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Float(value) if value.fract() == 0.0 => Ok(*value as i64),
            Self::Float(value) => Err(ToolError::InvalidParameters(format!("expected an integer, got {value}"))),
            Self::Text(value) => value
                .trim()
                .parse::<i64>()
                .map_err(|_| ToolError::InvalidParameters(format!("expected an integer, got '{value}'"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

pub fn site_ids(raw: Option<OneOrMany<Flexible>>) -> ToolResult<Vec<i64>> {
    let mut ids = Vec::new();
    for value in raw.map(OneOrMany::into_vec).unwrap_or_default() {
        let id = value.as_i64()?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

pub fn required_site_ids(raw: Option<OneOrMany<Flexible>>) -> ToolResult<Vec<i64>> {
    let ids = site_ids(raw)?;
    if ids.is_empty() {
        return Err(ToolError::InvalidParameters("center_id is required".to_string()));
    }
    Ok(ids)
}

pub fn limit(raw: Option<Flexible>) -> ToolResult<Option<u32>> {
    raw.map(|value| {
        let limit = value.as_i64()?;
        u32::try_from(limit)
            .ok()
            .filter(|limit| *limit > 0)
            .ok_or_else(|| ToolError::InvalidParameters(format!("limit must be a positive integer, got {limit}")))
    })
    .transpose()
}

fn metrics_list(raw: OneOrMany<String>) -> Vec<String> {
    raw.into_vec()
}

#[derive(Debug, Deserialize)]
pub struct NameArgs {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SourceArgs {
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct SiteSourceArgs {
    pub center_id: Flexible,
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct TimeseriesArgs {
    #[serde(default, alias = "center_ids")]
    pub center_id: Option<OneOrMany<Flexible>>,
    pub source: String,
    pub metrics: OneOrMany<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub limit: Option<Flexible>,
}

impl TimeseriesArgs {
    pub fn metric_names(&self) -> Vec<String> {
        metrics_list(self.metrics.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct CorrelationArgs {
    pub center_id: Flexible,
    pub primary_source: String,
    pub primary_metrics: OneOrMany<String>,
    pub secondary_source: String,
    pub secondary_metrics: OneOrMany<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub limit: Option<Flexible>,
}

#[derive(Debug, Deserialize)]
pub struct AggregationArgs {
    pub source: String,
    pub metrics: OneOrMany<String>,
    pub aggregation: String,
    #[serde(default, alias = "center_id")]
    pub center_ids: Option<OneOrMany<Flexible>>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub limit: Option<Flexible>,
    #[serde(default)]
    pub year: Option<Flexible>,
}

impl AggregationArgs {
    pub fn metric_names(&self) -> Vec<String> {
        metrics_list(self.metrics.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct MetricLookupArgs {
    pub center_id: Flexible,
    pub source: String,
    pub metric: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MortalityArgs {
    #[serde(default, alias = "center_id")]
    pub center_ids: Option<OneOrMany<Flexible>>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DirectAnswerArgs {
    #[serde(alias = "answer")]
    pub response: String,
}
