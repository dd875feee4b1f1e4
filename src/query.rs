//! Builds typed store queries from tool parameters.
//!
//! A query here is the whole retrieval pipeline: which records match, how they
//! are ordered while limiting, which metrics are projected and how many rows
//! survive. Stores compile it to their own dialect.

use crate::catalog::{MetricColumn, SourceSpec};
use crate::errors::{ToolError, ToolResult};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

pub const DEFAULT_PREVIEW_LIMIT: u32 = 20;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

impl DateWindow {
    pub fn parse(start: Option<&str>, end: Option<&str>) -> ToolResult<Self> {
        Ok(Self {
            from: start.map(parse_start).transpose()?,
            to: end.map(parse_end).transpose()?,
        })
    }

    /// Whole days, first instant of `first` through the last second of `last`.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Self {
        Self {
            from: Some(first.and_time(NaiveTime::MIN)),
            to: Some(end_of_day(last)),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn describe(&self) -> Option<String> {
        match (self.from, self.to) {
            (None, None) => None,
            (from, to) => Some(format!(
                "{} to {}",
                from.map(|at| at.format(DATE_FORMAT).to_string())
                    .unwrap_or_else(|| "start".to_string()),
                to.map(|at| at.format(DATE_FORMAT).to_string())
                    .unwrap_or_else(|| "latest".to_string()),
            )),
        }
    }
}

fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).unwrap_or_else(|| date.and_time(NaiveTime::MIN))
}

/// Parses the timestamp formats found in plans and store documents.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.naive_utc());
    }
    NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN))
}

pub fn parse_start(raw: &str) -> ToolResult<NaiveDateTime> {
    parse_timestamp(raw).ok_or_else(|| ToolError::InvalidDate(raw.to_string()))
}

/// A bare date as an end bound covers the whole day.
pub fn parse_end(raw: &str) -> ToolResult<NaiveDateTime> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
        return Ok(end_of_day(date));
    }
    parse_timestamp(trimmed).ok_or_else(|| ToolError::InvalidDate(raw.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub limit: Option<u32>,
    pub default_limit_used: bool,
}

/// Explicit limit wins; a date bound disables the implicit preview; with
/// neither, the preview limit applies and is flagged.
pub fn decide_limit(window: &DateWindow, explicit: Option<u32>, preview_limit: u32) -> LimitDecision {
    match explicit {
        Some(limit) => LimitDecision {
            limit: Some(limit),
            default_limit_used: false,
        },
        None if window.is_unbounded() => LimitDecision {
            limit: Some(preview_limit),
            default_limit_used: true,
        },
        None => LimitDecision {
            limit: None,
            default_limit_used: false,
        },
    }
}

/// Order applied before limiting. Results always come back by ascending date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrder {
    NewestFirst,
    MetricDescending(&'static str),
    MetricAscending(&'static str),
}

#[derive(Debug, Clone)]
pub struct TimeseriesQuery {
    pub source: &'static SourceSpec,
    pub site_keys: Vec<String>,
    pub window: DateWindow,
    pub columns: Vec<MetricColumn>,
    pub order: RecordOrder,
    pub limit: Option<u32>,
    pub default_limit_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
}

impl AggregateOp {
    pub fn parse(raw: &str) -> ToolResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            _ => Err(ToolError::InvalidAggregation(raw.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Month,
    Year,
}

#[derive(Debug, Clone)]
pub struct AggregationQuery {
    pub source: &'static SourceSpec,
    /// Empty means every site in the source.
    pub site_keys: Vec<String>,
    pub window: DateWindow,
    pub columns: Vec<MetricColumn>,
    pub op: AggregateOp,
    pub granularity: Granularity,
    /// Keeps only the N most recent periods.
    pub period_limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct UnitSnapshotQuery {
    pub source: &'static SourceSpec,
    pub site_keys: Vec<String>,
    pub as_of: Option<NaiveDateTime>,
    pub unit_field: &'static str,
    pub mortality_field: &'static str,
    pub stock_field: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    preview_limit: u32,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_LIMIT)
    }
}

impl QueryBuilder {
    pub fn new(preview_limit: u32) -> Self {
        Self { preview_limit }
    }

    pub fn timeseries(
        &self,
        site_keys: Vec<String>,
        source: &'static SourceSpec,
        metrics: &[String],
        window: DateWindow,
        limit: Option<u32>,
    ) -> ToolResult<TimeseriesQuery> {
        validate_limit(limit)?;
        let columns = source.project(metrics)?;
        let decision = decide_limit(&window, limit, self.preview_limit);
        Ok(TimeseriesQuery {
            source,
            site_keys,
            window,
            columns,
            order: RecordOrder::NewestFirst,
            limit: decision.limit,
            default_limit_used: decision.default_limit_used,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn aggregation(
        &self,
        site_keys: Vec<String>,
        source: &'static SourceSpec,
        metrics: &[String],
        op: AggregateOp,
        granularity: Granularity,
        window: DateWindow,
        period_limit: Option<u32>,
    ) -> ToolResult<AggregationQuery> {
        validate_limit(period_limit)?;
        let columns = source.project(metrics)?;
        Ok(AggregationQuery {
            source,
            site_keys,
            window,
            columns,
            op,
            granularity,
            period_limit,
        })
    }

    /// Single record holding the highest (or lowest) non-null value of a metric.
    pub fn extremum(
        &self,
        site_key: String,
        source: &'static SourceSpec,
        metric: &str,
        mode: &str,
    ) -> ToolResult<TimeseriesQuery> {
        let column = source.require_metric(metric)?;
        let order = match mode.trim().to_ascii_lowercase().as_str() {
            "max" => RecordOrder::MetricDescending(column.field),
            "min" => RecordOrder::MetricAscending(column.field),
            _ => return Err(ToolError::InvalidMode(mode.to_string())),
        };
        Ok(TimeseriesQuery {
            source,
            site_keys: vec![site_key],
            window: DateWindow::default(),
            columns: vec![column],
            order,
            limit: Some(1),
            default_limit_used: false,
        })
    }

    pub fn latest(&self, site_key: String, source: &'static SourceSpec, metric: &str) -> ToolResult<TimeseriesQuery> {
        let column = source.require_metric(metric)?;
        Ok(TimeseriesQuery {
            source,
            site_keys: vec![site_key],
            window: DateWindow::default(),
            columns: vec![column],
            order: RecordOrder::NewestFirst,
            limit: Some(1),
            default_limit_used: false,
        })
    }
}

fn validate_limit(limit: Option<u32>) -> ToolResult<()> {
    if limit == Some(0) {
        return Err(ToolError::InvalidParameters("limit must be at least 1".to_string()));
    }
    Ok(())
}

/// Intersection of two sources' available periods at day granularity.
pub fn overlapping_window(
    first: (NaiveDateTime, NaiveDateTime),
    second: (NaiveDateTime, NaiveDateTime),
) -> ToolResult<DateWindow> {
    let start = first.0.date().max(second.0.date());
    let end = first.1.date().min(second.1.date());
    if start > end {
        return Err(ToolError::NoOverlappingPeriod);
    }
    Ok(DateWindow::days(start, end))
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::WEATHER;

    fn day(raw: &str) -> NaiveDateTime {
        parse_start(raw).expect("valid date")
    }

    #[test]
    fn preview_limit_applies_only_without_range_or_limit() {
        let builder = QueryBuilder::default();
        let metrics = vec!["temperature".to_string()];

        let preview = builder
            .timeseries(vec!["A".to_string()], &WEATHER, &metrics, DateWindow::default(), None)
            .expect("query");
        assert_eq!(preview.limit, Some(20));
        assert!(preview.default_limit_used);

        let explicit = builder
            .timeseries(vec!["A".to_string()], &WEATHER, &metrics, DateWindow::default(), Some(5))
            .expect("query");
        assert_eq!(explicit.limit, Some(5));
        assert!(!explicit.default_limit_used);

        let ranged = builder
            .timeseries(
                vec!["A".to_string()],
                &WEATHER,
                &metrics,
                DateWindow::parse(Some("2024-01-01"), Some("2024-02-01")).expect("window"),
                None,
            )
            .expect("query");
        assert_eq!(ranged.limit, None);
        assert!(!ranged.default_limit_used);

        let ranged_with_limit = builder
            .timeseries(
                vec!["A".to_string()],
                &WEATHER,
                &metrics,
                DateWindow::parse(Some("2024-01-01"), None).expect("window"),
                Some(3),
            )
            .expect("query");
        assert_eq!(ranged_with_limit.limit, Some(3));
    }

    #[test]
    fn end_date_covers_the_whole_day() {
        let window = DateWindow::parse(Some("2024-03-01"), Some("2024-03-31")).expect("window");
        assert_eq!(window.from.map(|at| at.to_string()), Some("2024-03-01 00:00:00".to_string()));
        assert_eq!(window.to.map(|at| at.to_string()), Some("2024-03-31 23:59:59".to_string()));
        assert!(matches!(
            DateWindow::parse(Some("31/03/2024"), None),
            Err(ToolError::InvalidDate(_))
        ));
    }

    #[test]
    fn overlap_is_the_intersection_of_both_periods() {
        let window = overlapping_window(
            (day("2024-01-01"), day("2024-03-31")),
            (day("2024-02-01"), day("2024-04-30")),
        )
        .expect("overlap");
        assert_eq!(window.describe().as_deref(), Some("2024-02-01 to 2024-03-31"));

        let disjoint = overlapping_window(
            (day("2024-01-01"), day("2024-03-31")),
            (day("2024-06-01"), day("2024-06-30")),
        );
        assert_eq!(disjoint, Err(ToolError::NoOverlappingPeriod));
    }

    #[test]
    fn aggregation_operator_is_validated() {
        assert_eq!(AggregateOp::parse("AVG"), Ok(AggregateOp::Avg));
        assert!(matches!(AggregateOp::parse("median"), Err(ToolError::InvalidAggregation(_))));
    }

    #[test]
    fn extremum_mode_is_validated() {
        let builder = QueryBuilder::default();
        let query = builder
            .extremum("A".to_string(), &WEATHER, "wind", "max")
            .expect("extremum");
        assert_eq!(query.order, RecordOrder::MetricDescending("VIENTO_VEL_MS"));
        assert_eq!(query.limit, Some(1));
        assert!(matches!(
            builder.extremum("A".to_string(), &WEATHER, "wind", "median"),
            Err(ToolError::InvalidMode(_))
        ));
    }

    #[test]
    fn rounds_to_two_places() {
        assert_eq!(round_to(8.004_9, 2), 8.0);
        assert_eq!(round_to(3.456, 2), 3.46);
    }
}
