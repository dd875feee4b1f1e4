//! Storage seams. Tools only talk to these traits; SQLite is one implementation.

use crate::catalog::SourceSpec;
use crate::errors::AppResult;
use crate::models::Site;
use crate::query::{AggregationQuery, TimeseriesQuery, UnitSnapshotQuery};
use chrono::NaiveDateTime;

pub trait SiteDirectory: Send + Sync {
    fn site(&self, id: i64) -> AppResult<Option<Site>>;
    /// Best case-insensitive partial match on the canonical name.
    fn find_by_name(&self, fragment: &str) -> AppResult<Option<Site>>;
    fn list_sites(&self) -> AppResult<Vec<Site>>;
}

/// One stored record reduced to the projected metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub site_key: String,
    pub recorded_at: NaiveDateTime,
    /// Same order as the query's columns.
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub site_key: String,
    pub year: i32,
    pub month: Option<u32>,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitSnapshot {
    pub site_key: String,
    pub unit: String,
    pub mortality_percent: Option<f64>,
    pub stock: Option<f64>,
}

pub trait TimeseriesStore: Send + Sync {
    /// Matching records, limited per the query and returned oldest first.
    fn fetch(&self, query: &TimeseriesQuery) -> AppResult<Vec<RawRecord>>;
    fn aggregate(&self, query: &AggregationQuery) -> AppResult<Vec<AggregateRow>>;
    /// Earliest and latest timestamps across the given sites.
    fn date_range(&self, source: &SourceSpec, site_keys: &[String]) -> AppResult<Option<(NaiveDateTime, NaiveDateTime)>>;
    fn has_records(&self, source: &SourceSpec, site_key: &str) -> AppResult<bool>;
    /// Newest record per (site, unit).
    fn latest_per_unit(&self, query: &UnitSnapshotQuery) -> AppResult<Vec<UnitSnapshot>>;
}
