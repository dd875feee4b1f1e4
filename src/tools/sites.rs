use super::args::{self, DirectAnswerArgs, NameArgs, SiteSourceArgs, SourceArgs};
use super::{ToolExecutor, ToolOutput, ToolParams};
use crate::catalog::{self, alias, SourceSpec};
use crate::errors::{ToolError, ToolResult};
use crate::models::{DataRange, SiteRef};
use crate::query::DATE_FORMAT;

pub fn get_center_id_by_name(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: NameArgs = args::parse(params)?;
    let site = executor
        .directory
        .find_by_name(&args.name)?
        .ok_or_else(|| ToolError::SiteNameNotFound(args.name.clone()))?;
    Ok(ToolOutput::SiteMatch(site.reference()))
}

pub fn get_all_centers(executor: &ToolExecutor, _params: &ToolParams) -> ToolResult<ToolOutput> {
    let sites = executor.directory.list_sites()?;
    Ok(ToolOutput::SiteList(sites.iter().map(|site| site.reference()).collect()))
}

pub fn find_centers_with_data(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: SourceArgs = args::parse(params)?;
    let source = catalog::require_source(&args.source)?;
    let mut with_data = Vec::new();
    for site in executor.directory.list_sites()? {
        let Some(alias) = alias::alias_for(&site, source) else {
            continue;
        };
        if executor.store.has_records(source, &alias)? {
            with_data.push(site.reference());
        }
    }
    Ok(ToolOutput::CentersWithData {
        source: source.name.to_string(),
        sites: with_data,
    })
}

pub fn get_data_range_for_source(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: SiteSourceArgs = args::parse(params)?;
    let source = catalog::require_source(&args.source)?;
    Ok(ToolOutput::DataRange(available_range(executor, args.center_id.as_i64()?, source)?))
}

/// First and last record dates a site has in `source`.
pub fn available_range(executor: &ToolExecutor, site_id: i64, source: &SourceSpec) -> ToolResult<DataRange> {
    let filter = alias::resolve_filter(executor.directory.as_ref(), site_id, source)?;
    let range = executor.store.date_range(source, &[filter.alias])?;
    Ok(match range {
        Some((first, last)) => DataRange {
            has_data: true,
            center_id: Some(site_id),
            first_record: Some(first.format(DATE_FORMAT).to_string()),
            last_record: Some(last.format(DATE_FORMAT).to_string()),
        },
        None => DataRange {
            has_data: false,
            center_id: Some(site_id),
            first_record: None,
            last_record: None,
        },
    })
}

pub fn direct_answer(_executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: DirectAnswerArgs = args::parse(params)?;
    Ok(ToolOutput::DirectAnswer(args.response))
}

/// Maps store-side site identifiers back to canonical sites for display.
pub(crate) fn site_names_by_alias(executor: &ToolExecutor, source: &SourceSpec) -> ToolResult<Vec<(String, SiteRef)>> {
    Ok(executor
        .directory
        .list_sites()?
        .into_iter()
        .filter_map(|site| alias::alias_for(&site, source).map(|alias| (alias, site.reference())))
        .collect())
}

pub(crate) fn display_name(names: &[(String, SiteRef)], site_key: &str) -> String {
    names
        .iter()
        .find(|(alias, _)| alias == site_key)
        .map(|(_, site)| site.name.clone())
        .unwrap_or_else(|| site_key.to_string())
}
