//! Available-range lookups for time series steps that came back empty.

use crate::catalog::{self, SourceSpec};
use crate::errors::{ToolError, ToolResult};
use crate::tools::args::{self, Flexible, OneOrMany};
use crate::tools::{sites, ToolExecutor, ToolId, ToolOutput, ToolParams};
use serde_json::Value;

pub const RANGE_INFO_SUFFIX: &str = "_range_info";

#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub key: String,
    pub source: &'static SourceSpec,
    pub site_ids: Vec<i64>,
}

/// A lookup is due when a time series shaped tool returned no rows and its
/// parameters name both a site and a known source.
pub fn trigger(tool: ToolId, result_key: &str, params: &ToolParams, output: &ToolOutput) -> Option<FallbackRequest> {
    if !tool.is_timeseries_shaped() || output.record_count() != Some(0) {
        return None;
    }
    let source = ["source", "primary_source"]
        .iter()
        .find_map(|name| params.get(*name).and_then(Value::as_str))
        .and_then(catalog::source)?;
    let raw_ids = ["center_id", "center_ids"]
        .iter()
        .find_map(|name| params.get(*name))
        .cloned()?;
    let ids = serde_json::from_value::<OneOrMany<Flexible>>(raw_ids).ok();
    let site_ids = args::site_ids(ids).ok().filter(|ids| !ids.is_empty())?;
    Some(FallbackRequest {
        key: format!("{result_key}{RANGE_INFO_SUFFIX}"),
        source,
        site_ids,
    })
}

pub fn lookup(executor: &ToolExecutor, request: &FallbackRequest) -> ToolResult<ToolOutput> {
    let mut ranges = Vec::with_capacity(request.site_ids.len());
    for site_id in &request.site_ids {
        match sites::available_range(executor, *site_id, request.source) {
            Ok(range) => ranges.push(range),
            Err(ToolError::Store(message)) => return Err(ToolError::Store(message)),
            Err(error) => tracing::debug!(site_id, error = %error, "no range for site"),
        }
    }
    match ranges.len() {
        0 => Err(ToolError::NoResolvableSite(request.source.name.to_string())),
        1 => Ok(ToolOutput::DataRange(ranges.remove(0))),
        _ => Ok(ToolOutput::DataRanges(ranges)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::TimeseriesResult;
    use serde_json::json;

    fn empty_series() -> ToolOutput {
        ToolOutput::Series(TimeseriesResult {
            sites: Vec::new(),
            metrics: vec!["temperature".to_string()],
            points: Vec::new(),
            default_limit_used: false,
        })
    }

    fn params(value: Value) -> ToolParams {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn triggers_only_for_empty_timeseries_with_site_and_source() {
        let request = trigger(
            ToolId::GetTimeseriesData,
            "t",
            &params(json!({ "center_id": "4", "source": "clima" })),
            &empty_series(),
        )
        .expect("fallback");
        assert_eq!(request.key, "t_range_info");
        assert_eq!(request.site_ids, vec![4]);
        assert_eq!(request.source.name, "weather");

        assert!(trigger(
            ToolId::GetMonthlyAggregation,
            "m",
            &params(json!({ "source": "weather" })),
            &empty_series(),
        )
        .is_none());
        assert!(trigger(
            ToolId::GetExtremaForMetric,
            "e",
            &params(json!({ "center_id": 4, "source": "weather" })),
            &empty_series(),
        )
        .is_none());
    }
}
