use super::args::{self, AggregationArgs};
use super::series::resolve_filters;
use super::sites::{display_name, site_names_by_alias};
use super::{AggregateRecord, AggregationResult, ToolExecutor, ToolOutput, ToolParams};
use crate::catalog;
use crate::errors::{ToolError, ToolResult};
use crate::models::SiteRef;
use crate::query::{round_to, AggregateOp, DateWindow, Granularity};
use chrono::NaiveDate;

pub fn get_monthly_aggregation(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    aggregate_by(executor, params, Granularity::Month)
}

pub fn get_annual_aggregation(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    aggregate_by(executor, params, Granularity::Year)
}

fn aggregate_by(executor: &ToolExecutor, params: &ToolParams, granularity: Granularity) -> ToolResult<ToolOutput> {
    let args: AggregationArgs = args::parse(params)?;
    let source = catalog::require_source(&args.source)?;
    let op = AggregateOp::parse(&args.aggregation)?;
    let site_ids = args::site_ids(args.center_ids.clone())?;
    let period_limit = args::limit(args.limit.clone())?;
    let window = match &args.year {
        Some(year) => year_window(year.as_i64()?)?,
        None => DateWindow::parse(args.start_date.as_deref(), args.end_date.as_deref())?,
    };

    // No explicit sites means every site the source knows about.
    let (site_keys, names) = if site_ids.is_empty() {
        (Vec::new(), site_names_by_alias(executor, source)?)
    } else {
        let filters = resolve_filters(executor, &site_ids, source)?;
        let keys: Vec<String> = filters.iter().map(|filter| filter.alias.clone()).collect();
        let names: Vec<(String, SiteRef)> = filters.into_iter().map(|filter| (filter.alias, filter.site)).collect();
        (keys, names)
    };

    let query = executor.builder.aggregation(
        site_keys,
        source,
        &args.metric_names(),
        op,
        granularity,
        window,
        period_limit,
    )?;
    let rows = executor.store.aggregate(&query)?;
    tracing::debug!(source = source.name, op = op.as_str(), groups = rows.len(), "aggregated");

    Ok(ToolOutput::Aggregation(AggregationResult {
        columns: query
            .columns
            .iter()
            .map(|column| format!("{}_{}", column.name, op.as_str()))
            .collect(),
        rows: rows
            .into_iter()
            .map(|row| AggregateRecord {
                centro: display_name(&names, &row.site_key),
                year: row.year,
                month: row.month,
                values: row.values.into_iter().map(|value| value.map(|value| round_to(value, 2))).collect(),
            })
            .collect(),
    }))
}

fn year_window(year: i64) -> ToolResult<DateWindow> {
    let year = i32::try_from(year).map_err(|_| ToolError::InvalidParameters(format!("invalid year {year}")))?;
    let first = NaiveDate::from_ymd_opt(year, 1, 1);
    let last = NaiveDate::from_ymd_opt(year, 12, 31);
    match first.zip(last) {
        Some((first, last)) => Ok(DateWindow::days(first, last)),
        None => Err(ToolError::InvalidParameters(format!("invalid year {year}"))),
    }
}
