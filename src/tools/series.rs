use super::args::{self, CorrelationArgs, MetricLookupArgs, TimeseriesArgs};
use super::{CorrelationResult, SeriesPoint, TimeseriesResult, ToolExecutor, ToolOutput, ToolParams};
use crate::catalog::alias::{self, SiteFilter};
use crate::catalog::{self, SourceSpec};
use crate::errors::{ToolError, ToolResult};
use crate::query::{overlapping_window, DateWindow, TimeseriesQuery};
use crate::store::RawRecord;
use std::collections::HashMap;

pub fn get_timeseries_data(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: TimeseriesArgs = args::parse(params)?;
    let source = catalog::require_source(&args.source)?;
    let site_ids = args::required_site_ids(args.center_id.clone())?;
    let window = DateWindow::parse(args.start_date.as_deref(), args.end_date.as_deref())?;
    let limit = args::limit(args.limit.clone())?;

    let filters = resolve_filters(executor, &site_ids, source)?;
    let query = executor.builder.timeseries(
        filters.iter().map(|filter| filter.alias.clone()).collect(),
        source,
        &args.metric_names(),
        window,
        limit,
    )?;
    let records = executor.store.fetch(&query)?;
    tracing::debug!(source = source.name, sites = filters.len(), count = records.len(), "fetched timeseries");
    Ok(ToolOutput::Series(assemble(&filters, &query, records)))
}

/// Joins the secondary source onto each primary record by calendar day.
pub fn correlate_timeseries_data(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: CorrelationArgs = args::parse(params)?;
    let site_id = args.center_id.as_i64()?;
    let primary = catalog::require_source(&args.primary_source)?;
    let secondary = catalog::require_source(&args.secondary_source)?;
    let primary_filter = alias::resolve_filter(executor.directory.as_ref(), site_id, primary)?;
    let secondary_filter = alias::resolve_filter(executor.directory.as_ref(), site_id, secondary)?;
    let limit = args::limit(args.limit.clone())?;

    let window = if args.start_date.is_none() && args.end_date.is_none() {
        let primary_range = executor.store.date_range(primary, &[primary_filter.alias.clone()])?;
        let secondary_range = executor.store.date_range(secondary, &[secondary_filter.alias.clone()])?;
        match (primary_range, secondary_range) {
            (Some(first), Some(second)) => overlapping_window(first, second)?,
            (None, _) => return Err(ToolError::InsufficientData(format!("no {} records", primary.name))),
            (_, None) => return Err(ToolError::InsufficientData(format!("no {} records", secondary.name))),
        }
    } else {
        DateWindow::parse(args.start_date.as_deref(), args.end_date.as_deref())?
    };
    let date_range_used = window.describe().unwrap_or_default();

    let primary_query = executor.builder.timeseries(
        vec![primary_filter.alias.clone()],
        primary,
        &args.primary_metrics.into_vec(),
        window,
        limit,
    )?;
    let secondary_columns = secondary.project(&args.secondary_metrics.into_vec())?;
    let primary_filters = [primary_filter];
    let mut series = assemble(&primary_filters, &primary_query, executor.store.fetch(&primary_query)?);

    let mut secondary_names = Vec::with_capacity(secondary_columns.len());
    for column in &secondary_columns {
        let name = if series.metrics.contains(&column.name) {
            format!("{}_{}", secondary.name, column.name)
        } else {
            column.name.clone()
        };
        secondary_names.push(name);
    }

    let span = series.points.first().zip(series.points.last()).map(|(first, last)| (first.fecha, last.fecha));
    let mut by_day: HashMap<chrono::NaiveDate, Vec<Option<f64>>> = HashMap::new();
    if let Some((first, last)) = span {
        let secondary_query = TimeseriesQuery {
            source: secondary,
            site_keys: vec![secondary_filter.alias.clone()],
            window: DateWindow::days(first.date(), last.date()),
            columns: secondary_columns.clone(),
            order: crate::query::RecordOrder::NewestFirst,
            limit: None,
            default_limit_used: false,
        };
        // Oldest first, so the first record of each day wins.
        for record in executor.store.fetch(&secondary_query)? {
            by_day.entry(record.recorded_at.date()).or_insert(record.values);
        }
    }

    for point in &mut series.points {
        match by_day.get(&point.fecha.date()) {
            Some(values) => point.values.extend(values.iter().copied()),
            None => point.values.extend(std::iter::repeat(None).take(secondary_names.len())),
        }
    }
    series.metrics.extend(secondary_names);

    tracing::debug!(
        site_id,
        primary = primary.name,
        secondary = secondary.name,
        count = series.points.len(),
        "correlated sources"
    );
    Ok(ToolOutput::Correlation(CorrelationResult {
        series,
        date_range_used,
    }))
}

pub fn get_extrema_for_metric(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: MetricLookupArgs = args::parse(params)?;
    let source = catalog::require_source(&args.source)?;
    let filter = alias::resolve_filter(executor.directory.as_ref(), args.center_id.as_i64()?, source)?;
    let mode = args.mode.as_deref().unwrap_or("max");
    let query = executor
        .builder
        .extremum(filter.alias.clone(), source, &args.metric, mode)?;
    let records = executor.store.fetch(&query)?;
    Ok(ToolOutput::Records(assemble(&[filter], &query, records)))
}

pub fn get_last_reading_for_metric(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: MetricLookupArgs = args::parse(params)?;
    let source = catalog::require_source(&args.source)?;
    let filter = alias::resolve_filter(executor.directory.as_ref(), args.center_id.as_i64()?, source)?;
    let query = executor.builder.latest(filter.alias.clone(), source, &args.metric)?;
    let records = executor.store.fetch(&query)?;
    Ok(ToolOutput::Records(assemble(&[filter], &query, records)))
}

/// A single requested site keeps its precise resolution error.
pub(crate) fn resolve_filters(executor: &ToolExecutor, site_ids: &[i64], source: &SourceSpec) -> ToolResult<Vec<SiteFilter>> {
    match site_ids {
        [site_id] => Ok(vec![alias::resolve_filter(executor.directory.as_ref(), *site_id, source)?]),
        many => alias::resolve_many(executor.directory.as_ref(), many, source),
    }
}

fn assemble(filters: &[SiteFilter], query: &TimeseriesQuery, records: Vec<RawRecord>) -> TimeseriesResult {
    let mut points: Vec<SeriesPoint> = records
        .into_iter()
        .filter_map(|record| {
            let site = filters.iter().find(|filter| filter.alias == record.site_key)?.site.clone();
            Some(SeriesPoint {
                fecha: record.recorded_at,
                site,
                values: record.values,
            })
        })
        .collect();
    points.sort_by_key(|point| point.fecha);
    TimeseriesResult {
        sites: filters.iter().map(|filter| filter.site.clone()).collect(),
        metrics: query.columns.iter().map(|column| column.name.clone()).collect(),
        points,
        default_limit_used: query.default_limit_used,
    }
}
