//! Named operations a plan step can invoke.
//!
//! Every tool has the same shape, `(executor, parameters) -> ToolResult<ToolOutput>`,
//! and is reachable only through [`ToolRegistry`], which maps a [`ToolId`] to its
//! handler.

pub mod aggregate;
pub mod args;
pub mod mortality;
pub mod series;
pub mod sites;

use crate::errors::{ToolError, ToolResult};
use crate::models::{DataRange, SiteRef};
use crate::query::{QueryBuilder, TIMESTAMP_FORMAT};
use crate::store::{SiteDirectory, TimeseriesStore};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub type ToolParams = Map<String, Value>;
pub type ToolHandler = fn(&ToolExecutor, &ToolParams) -> ToolResult<ToolOutput>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolId {
    GetCenterIdByName,
    GetAllCenters,
    FindCentersWithData,
    GetDataRangeForSource,
    GetTimeseriesData,
    CorrelateTimeseriesData,
    GetMonthlyAggregation,
    GetAnnualAggregation,
    GetExtremaForMetric,
    GetLastReadingForMetric,
    GetMortalityRate,
    DirectAnswer,
}

impl ToolId {
    pub const ALL: [ToolId; 12] = [
        ToolId::GetCenterIdByName,
        ToolId::GetAllCenters,
        ToolId::FindCentersWithData,
        ToolId::GetDataRangeForSource,
        ToolId::GetTimeseriesData,
        ToolId::CorrelateTimeseriesData,
        ToolId::GetMonthlyAggregation,
        ToolId::GetAnnualAggregation,
        ToolId::GetExtremaForMetric,
        ToolId::GetLastReadingForMetric,
        ToolId::GetMortalityRate,
        ToolId::DirectAnswer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetCenterIdByName => "get_center_id_by_name",
            Self::GetAllCenters => "get_all_centers",
            Self::FindCentersWithData => "find_centers_with_data",
            Self::GetDataRangeForSource => "get_data_range_for_source",
            Self::GetTimeseriesData => "get_timeseries_data",
            Self::CorrelateTimeseriesData => "correlate_timeseries_data",
            Self::GetMonthlyAggregation => "get_monthly_aggregation",
            Self::GetAnnualAggregation => "get_annual_aggregation",
            Self::GetExtremaForMetric => "get_extrema_for_metric",
            Self::GetLastReadingForMetric => "get_last_reading_for_metric",
            Self::GetMortalityRate => "get_mortality_rate",
            Self::DirectAnswer => "direct_answer",
        }
    }

    /// Tools whose empty result warrants an available-range lookup.
    pub fn is_timeseries_shaped(self) -> bool {
        matches!(
            self,
            Self::GetTimeseriesData | Self::CorrelateTimeseriesData | Self::GetMonthlyAggregation
        )
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = ToolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == value)
            .ok_or_else(|| ToolError::UnknownTool(value.to_string()))
    }
}

fn handler_for(id: ToolId) -> ToolHandler {
    match id {
        ToolId::GetCenterIdByName => sites::get_center_id_by_name,
        ToolId::GetAllCenters => sites::get_all_centers,
        ToolId::FindCentersWithData => sites::find_centers_with_data,
        ToolId::GetDataRangeForSource => sites::get_data_range_for_source,
        ToolId::GetTimeseriesData => series::get_timeseries_data,
        ToolId::CorrelateTimeseriesData => series::correlate_timeseries_data,
        ToolId::GetMonthlyAggregation => aggregate::get_monthly_aggregation,
        ToolId::GetAnnualAggregation => aggregate::get_annual_aggregation,
        ToolId::GetExtremaForMetric => series::get_extrema_for_metric,
        ToolId::GetLastReadingForMetric => series::get_last_reading_for_metric,
        ToolId::GetMortalityRate => mortality::get_mortality_rate,
        ToolId::DirectAnswer => sites::direct_answer,
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    handlers: BTreeMap<ToolId, ToolHandler>,
}

impl ToolRegistry {
    pub fn standard() -> Self {
        Self {
            handlers: ToolId::ALL.iter().map(|id| (*id, handler_for(*id))).collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> ToolResult<(ToolId, ToolHandler)> {
        let id = ToolId::from_str(name.trim())?;
        self.handlers
            .get(&id)
            .map(|handler| (id, *handler))
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().map(|id| id.as_str())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Injected handles every tool works against.
pub struct ToolExecutor {
    pub directory: Arc<dyn SiteDirectory>,
    pub store: Arc<dyn TimeseriesStore>,
    pub builder: QueryBuilder,
    registry: ToolRegistry,
}

impl ToolExecutor {
    pub fn new(directory: Arc<dyn SiteDirectory>, store: Arc<dyn TimeseriesStore>, builder: QueryBuilder) -> Self {
        Self {
            directory,
            store,
            builder,
            registry: ToolRegistry::standard(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn execute(&self, tool: &str, params: &ToolParams) -> ToolResult<ToolOutput> {
        let (id, handler) = self.registry.resolve(tool)?;
        tracing::debug!(tool = id.as_str(), "dispatching tool");
        handler(self, params)
    }
}

// ─── Outputs ────────────────────────────────────────────────────────────────

/// One timestamped row, values in the result's metric order.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub fecha: NaiveDateTime,
    pub site: SiteRef,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesResult {
    /// Sites this result was fetched for, carried explicitly for the merger.
    pub sites: Vec<SiteRef>,
    pub metrics: Vec<String>,
    pub points: Vec<SeriesPoint>,
    pub default_limit_used: bool,
}

impl TimeseriesResult {
    pub fn count(&self) -> usize {
        self.points.len()
    }

    fn rows_json(&self) -> Vec<Value> {
        self.points
            .iter()
            .map(|point| {
                let mut row = Map::new();
                row.insert("fecha".to_string(), Value::String(point.fecha.format(TIMESTAMP_FORMAT).to_string()));
                row.insert("centro".to_string(), Value::String(point.site.name.clone()));
                for (metric, value) in self.metrics.iter().zip(&point.values) {
                    row.insert(metric.clone(), number_or_null(*value));
                }
                Value::Object(row)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    pub series: TimeseriesResult,
    pub date_range_used: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub centro: String,
    pub year: i32,
    pub month: Option<u32>,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    /// Output column names, `<metric>_<op>`.
    pub columns: Vec<String>,
    pub rows: Vec<AggregateRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MortalityRow {
    pub centro: String,
    pub total_peces_ingresados: f64,
    pub total_peces_muertos: f64,
    pub porcentaje_mortalidad_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MortalityResult {
    pub count: usize,
    pub data: Vec<MortalityRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall: Option<MortalityRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    SiteMatch(SiteRef),
    SiteList(Vec<SiteRef>),
    CentersWithData { source: String, sites: Vec<SiteRef> },
    DataRange(DataRange),
    DataRanges(Vec<DataRange>),
    Series(TimeseriesResult),
    Correlation(CorrelationResult),
    Aggregation(AggregationResult),
    Records(TimeseriesResult),
    Mortality(MortalityResult),
    DirectAnswer(String),
}

impl ToolOutput {
    /// Row count for outputs that carry one.
    pub fn record_count(&self) -> Option<usize> {
        match self {
            Self::Series(result) | Self::Records(result) => Some(result.count()),
            Self::Correlation(result) => Some(result.series.count()),
            Self::Aggregation(result) => Some(result.rows.len()),
            Self::Mortality(result) => Some(result.count),
            _ => None,
        }
    }

    pub fn timeseries(&self) -> Option<&TimeseriesResult> {
        match self {
            Self::Series(result) => Some(result),
            Self::Correlation(result) => Some(&result.series),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::SiteMatch(site) => json!({ "center_id": site.id, "center_name": site.name }),
            Self::SiteList(sites) => json!({
                "count": sites.len(),
                "centers": sites_json(sites),
                "center_ids": sites.iter().map(|site| site.id).collect::<Vec<_>>(),
            }),
            Self::CentersWithData { source, sites } => json!({
                "count": sites.len(),
                "source_checked": source,
                "centers_with_data": sites_json(sites),
            }),
            Self::DataRange(range) => serde_json::to_value(range).unwrap_or(Value::Null),
            Self::DataRanges(ranges) => json!({
                "count": ranges.len(),
                "ranges": serde_json::to_value(ranges).unwrap_or(Value::Null),
            }),
            Self::Series(result) => json!({
                "count": result.count(),
                "data": result.rows_json(),
                "default_limit_used": result.default_limit_used,
            }),
            Self::Correlation(result) => json!({
                "count": result.series.count(),
                "data": result.series.rows_json(),
                "default_limit_used": result.series.default_limit_used,
                "date_range_used": result.date_range_used,
            }),
            Self::Aggregation(result) => {
                let data: Vec<Value> = result
                    .rows
                    .iter()
                    .map(|record| {
                        let mut row = Map::new();
                        row.insert("centro".to_string(), Value::String(record.centro.clone()));
                        row.insert("year".to_string(), json!(record.year));
                        if let Some(month) = record.month {
                            row.insert("month".to_string(), json!(month));
                            row.insert(
                                "period".to_string(),
                                Value::String(format!("{:04}-{:02}", record.year, month)),
                            );
                        }
                        for (column, value) in result.columns.iter().zip(&record.values) {
                            row.insert(column.clone(), number_or_null(*value));
                        }
                        Value::Object(row)
                    })
                    .collect();
                json!({ "count": data.len(), "data": data })
            }
            Self::Records(result) => json!({ "count": result.count(), "data": result.rows_json() }),
            Self::Mortality(result) => serde_json::to_value(result).unwrap_or(Value::Null),
            Self::DirectAnswer(answer) => json!({ "answer": answer }),
        }
    }
}

fn sites_json(sites: &[SiteRef]) -> Vec<Value> {
    sites
        .iter()
        .map(|site| json!({ "id": site.id, "name": site.name }))
        .collect()
}

fn number_or_null(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn every_tool_id_round_trips_through_its_name() {
        let registry = ToolRegistry::standard();
        for id in ToolId::ALL {
            let (resolved, _) = registry.resolve(id.as_str()).expect("registered");
            assert_eq!(resolved, id);
        }
        assert_eq!(registry.names().count(), ToolId::ALL.len());
        assert!(matches!(registry.resolve("drop_tables"), Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn series_json_carries_site_and_metrics() {
        let site = SiteRef {
            id: 4,
            name: "Northsite".to_string(),
        };
        let output = ToolOutput::Series(TimeseriesResult {
            sites: vec![site.clone()],
            metrics: vec!["temperature".to_string()],
            points: vec![SeriesPoint {
                fecha: NaiveDate::from_ymd_opt(2024, 1, 1)
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .expect("timestamp"),
                site,
                values: vec![Some(10.5)],
            }],
            default_limit_used: true,
        });
        let value = output.to_json();
        assert_eq!(value["count"], 1);
        assert_eq!(value["default_limit_used"], true);
        assert_eq!(value["data"][0]["fecha"], "2024-01-01 00:00:00");
        assert_eq!(value["data"][0]["centro"], "Northsite");
        assert_eq!(value["data"][0]["temperature"], 10.5);
    }
}
