use crate::catalog::SourceSpec;
use crate::errors::{AppError, AppResult};
use crate::models::Site;
use crate::query::{
    parse_timestamp, AggregateOp, AggregationQuery, DateWindow, Granularity, RecordOrder, TimeseriesQuery,
    UnitSnapshotQuery, TIMESTAMP_FORMAT,
};
use crate::store::{AggregateRow, RawRecord, SiteDirectory, TimeseriesStore, UnitSnapshot};
use chrono::NaiveDateTime;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn insert_site(
        &self,
        id: Option<i64>,
        canonical_name: &str,
        canonical_code: Option<&str>,
        aliases: &serde_json::Value,
    ) -> AppResult<Site> {
        let aliases_json = serde_json::to_string(aliases)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sites (id, canonical_name, canonical_code, aliases_json) VALUES (?1, ?2, ?3, ?4)",
            params![id, canonical_name, canonical_code, aliases_json],
        )?;
        Ok(Site {
            id: id.unwrap_or_else(|| conn.last_insert_rowid()),
            canonical_name: canonical_name.to_string(),
            canonical_code: canonical_code.map(ToString::to_string),
            aliases: aliases.clone(),
        })
    }

    /// Stores a raw source document. Its timestamp and site identifier are
    /// read from the source's own field names.
    pub fn insert_record(&self, source: &SourceSpec, document: &serde_json::Value) -> AppResult<i64> {
        let conn = self.lock()?;
        insert_record_with(&conn, source, document)
    }

    pub fn import_records(&self, source: &SourceSpec, documents: &[serde_json::Value]) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for document in documents {
            insert_record_with(&tx, source, document)?;
        }
        tx.commit()?;
        Ok(documents.len())
    }
}

fn insert_record_with(conn: &Connection, source: &SourceSpec, document: &serde_json::Value) -> AppResult<i64> {
    let recorded_at = document
        .get(source.date_field)
        .and_then(serde_json::Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| {
            AppError::Internal(format!(
                "{} record has no valid '{}' timestamp",
                source.name, source.date_field
            ))
        })?;
    let site_key = match document.get(source.site_field) {
        Some(serde_json::Value::String(value)) if !value.trim().is_empty() => value.trim().to_string(),
        Some(serde_json::Value::Number(value)) => value.to_string(),
        _ => {
            return Err(AppError::Internal(format!(
                "{} record has no '{}' site identifier",
                source.name, source.site_field
            )))
        }
    };
    conn.execute(
        "INSERT INTO records (source, site_key, recorded_at, document_json) VALUES (?1, ?2, ?3, ?4)",
        params![
            source.name,
            site_key,
            recorded_at.format(TIMESTAMP_FORMAT).to_string(),
            serde_json::to_string(document)?,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl SiteDirectory for Database {
    fn site(&self, id: i64) -> AppResult<Option<Site>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, canonical_name, canonical_code, aliases_json FROM sites WHERE id = ?1",
            [id],
            parse_site_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn find_by_name(&self, fragment: &str) -> AppResult<Option<Site>> {
        let wanted = fragment.trim().to_lowercase();
        if wanted.is_empty() {
            return Ok(None);
        }
        let pattern = format!("%{}%", escape_like(&wanted));
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, canonical_name, canonical_code, aliases_json FROM sites
             WHERE lower(canonical_name) LIKE ?1 ESCAPE '\\'
             ORDER BY CASE WHEN lower(canonical_name) = ?2 THEN 0 ELSE 1 END, length(canonical_name), id
             LIMIT 1",
            params![pattern, wanted],
            parse_site_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_sites(&self) -> AppResult<Vec<Site>> {
        let conn = self.lock()?;
        let mut statement =
            conn.prepare("SELECT id, canonical_name, canonical_code, aliases_json FROM sites ORDER BY id ASC")?;
        let rows = statement.query_map([], parse_site_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl TimeseriesStore for Database {
    fn fetch(&self, query: &TimeseriesQuery) -> AppResult<Vec<RawRecord>> {
        let mut params_vec: Vec<SqlValue> = Vec::new();
        let mut sql = String::from("SELECT site_key, recorded_at");
        for index in 0..query.columns.len() {
            sql.push_str(&format!(", m{index}"));
        }
        sql.push_str(" FROM (SELECT id, site_key, recorded_at");
        for (index, column) in query.columns.iter().enumerate() {
            sql.push_str(&format!(", json_extract(document_json, ?) AS m{index}"));
            params_vec.push(SqlValue::Text(json_path(column.field)));
        }
        sql.push_str(" FROM records WHERE source = ?");
        params_vec.push(SqlValue::Text(query.source.name.to_string()));
        push_site_filter(&mut sql, &mut params_vec, &query.site_keys);
        push_window(&mut sql, &mut params_vec, &query.window);

        match query.order {
            RecordOrder::NewestFirst => sql.push_str(" ORDER BY recorded_at DESC, id DESC"),
            RecordOrder::MetricDescending(field) | RecordOrder::MetricAscending(field) => {
                let direction = if matches!(query.order, RecordOrder::MetricDescending(_)) {
                    "DESC"
                } else {
                    "ASC"
                };
                sql.push_str(" AND json_extract(document_json, ?) IS NOT NULL");
                sql.push_str(&format!(
                    " ORDER BY json_extract(document_json, ?) {direction}, recorded_at DESC, id DESC"
                ));
                params_vec.push(SqlValue::Text(json_path(field)));
                params_vec.push(SqlValue::Text(json_path(field)));
            }
        }
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params_vec.push(SqlValue::Integer(i64::from(limit)));
        }
        sql.push_str(") ORDER BY recorded_at ASC, site_key ASC, id ASC");

        let width = query.columns.len();
        let conn = self.lock()?;
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(numeric(row.get::<_, SqlValue>(2 + index)?));
            }
            Ok(RawRecord {
                site_key: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                recorded_at: parse_stored_time(&row.get::<_, String>(1)?)?,
                values,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn aggregate(&self, query: &AggregationQuery) -> AppResult<Vec<AggregateRow>> {
        let function = match query.op {
            AggregateOp::Sum => "SUM",
            AggregateOp::Avg => "AVG",
        };
        let mut params_vec: Vec<SqlValue> = Vec::new();
        let mut sql = String::from(
            "WITH grouped AS (SELECT site_key, CAST(strftime('%Y', recorded_at) AS INTEGER) AS year, ",
        );
        sql.push_str(match query.granularity {
            Granularity::Month => "CAST(strftime('%m', recorded_at) AS INTEGER) AS month",
            Granularity::Year => "NULL AS month",
        });
        for (index, column) in query.columns.iter().enumerate() {
            sql.push_str(&format!(", {function}(json_extract(document_json, ?)) AS m{index}"));
            params_vec.push(SqlValue::Text(json_path(column.field)));
        }
        sql.push_str(" FROM records WHERE source = ?");
        params_vec.push(SqlValue::Text(query.source.name.to_string()));
        push_site_filter(&mut sql, &mut params_vec, &query.site_keys);
        push_window(&mut sql, &mut params_vec, &query.window);
        sql.push_str(match query.granularity {
            Granularity::Month => " GROUP BY site_key, year, month)",
            Granularity::Year => " GROUP BY site_key, year)",
        });

        sql.push_str(" SELECT site_key, year, month");
        for index in 0..query.columns.len() {
            sql.push_str(&format!(", m{index}"));
        }
        sql.push_str(" FROM grouped");
        if let Some(limit) = query.period_limit {
            sql.push_str(
                " WHERE year * 100 + COALESCE(month, 0) IN (
                   SELECT DISTINCT year * 100 + COALESCE(month, 0) AS period FROM grouped
                   ORDER BY period DESC LIMIT ?)",
            );
            params_vec.push(SqlValue::Integer(i64::from(limit)));
        }
        sql.push_str(" ORDER BY year ASC, month ASC, site_key ASC");

        let width = query.columns.len();
        let conn = self.lock()?;
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(numeric(row.get::<_, SqlValue>(3 + index)?));
            }
            Ok(AggregateRow {
                site_key: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                year: row.get::<_, i64>(1)? as i32,
                month: row.get::<_, Option<i64>>(2)?.map(|month| month as u32),
                values,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn date_range(&self, source: &SourceSpec, site_keys: &[String]) -> AppResult<Option<(NaiveDateTime, NaiveDateTime)>> {
        let mut params_vec = vec![SqlValue::Text(source.name.to_string())];
        let mut sql = String::from("SELECT MIN(recorded_at), MAX(recorded_at) FROM records WHERE source = ?");
        push_site_filter(&mut sql, &mut params_vec, site_keys);

        let conn = self.lock()?;
        let (first, last): (Option<String>, Option<String>) =
            conn.query_row(&sql, rusqlite::params_from_iter(params_vec.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        match (first, last) {
            (Some(first), Some(last)) => Ok(Some((parse_stored_time(&first)?, parse_stored_time(&last)?))),
            _ => Ok(None),
        }
    }

    fn has_records(&self, source: &SourceSpec, site_key: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE source = ?1 AND site_key = ?2)",
            params![source.name, site_key],
            |row| row.get(0),
        )
        .map_err(AppError::from)
    }

    fn latest_per_unit(&self, query: &UnitSnapshotQuery) -> AppResult<Vec<UnitSnapshot>> {
        let unit_path = json_path(query.unit_field);
        let mut params_vec: Vec<SqlValue> = vec![
            SqlValue::Text(unit_path.clone()),
            SqlValue::Text(json_path(query.mortality_field)),
            SqlValue::Text(json_path(query.stock_field)),
            SqlValue::Text(unit_path),
            SqlValue::Text(query.source.name.to_string()),
        ];
        let mut sql = String::from(
            "SELECT site_key, unit, mortality, stock FROM (
               SELECT site_key, recorded_at,
                      json_extract(document_json, ?) AS unit,
                      json_extract(document_json, ?) AS mortality,
                      json_extract(document_json, ?) AS stock,
                      ROW_NUMBER() OVER (
                        PARTITION BY site_key, json_extract(document_json, ?)
                        ORDER BY recorded_at DESC, id DESC
                      ) AS rn
               FROM records WHERE source = ?",
        );
        push_site_filter(&mut sql, &mut params_vec, &query.site_keys);
        if let Some(as_of) = query.as_of {
            sql.push_str(" AND recorded_at <= ?");
            params_vec.push(SqlValue::Text(as_of.format(TIMESTAMP_FORMAT).to_string()));
        }
        sql.push_str(") WHERE rn = 1 ORDER BY site_key ASC, unit ASC");

        let conn = self.lock()?;
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
            Ok(UnitSnapshot {
                site_key: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                unit: display_value(row.get::<_, SqlValue>(1)?),
                mortality_percent: numeric(row.get::<_, SqlValue>(2)?),
                stock: numeric(row.get::<_, SqlValue>(3)?),
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn push_site_filter(sql: &mut String, params_vec: &mut Vec<SqlValue>, site_keys: &[String]) {
    if site_keys.is_empty() {
        sql.push_str(" AND site_key IS NOT NULL");
        return;
    }
    let placeholders = vec!["?"; site_keys.len()].join(", ");
    sql.push_str(&format!(" AND site_key IN ({placeholders})"));
    params_vec.extend(site_keys.iter().cloned().map(SqlValue::Text));
}

fn push_window(sql: &mut String, params_vec: &mut Vec<SqlValue>, window: &DateWindow) {
    if let Some(from) = window.from {
        sql.push_str(" AND recorded_at >= ?");
        params_vec.push(SqlValue::Text(from.format(TIMESTAMP_FORMAT).to_string()));
    }
    if let Some(to) = window.to {
        sql.push_str(" AND recorded_at <= ?");
        params_vec.push(SqlValue::Text(to.format(TIMESTAMP_FORMAT).to_string()));
    }
}

/// JSON path for a top-level document field; field names carry spaces, accents and `%`.
fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn numeric(value: SqlValue) -> Option<f64> {
    match value {
        SqlValue::Integer(number) => Some(number as f64),
        SqlValue::Real(number) => Some(number),
        SqlValue::Text(text) => text.trim().parse::<f64>().ok(),
        SqlValue::Null | SqlValue::Blob(_) => None,
    }
}

fn display_value(value: SqlValue) -> String {
    match value {
        SqlValue::Integer(number) => number.to_string(),
        SqlValue::Real(number) => number.to_string(),
        SqlValue::Text(text) => text,
        SqlValue::Null | SqlValue::Blob(_) => String::new(),
    }
}

fn parse_site_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Site> {
    let aliases_json: String = row.get(3)?;
    Ok(Site {
        id: row.get(0)?,
        canonical_name: row.get(1)?,
        canonical_code: row.get(2)?,
        aliases: serde_json::from_str(&aliases_json).unwrap_or(serde_json::Value::Null),
    })
}

fn parse_stored_time(raw: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
        )
    })
}
