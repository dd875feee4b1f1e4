//! Translates canonical site ids into the identifier each source stores.

use super::SourceSpec;
use crate::errors::{ToolError, ToolResult};
use crate::models::{Site, SiteRef};
use crate::store::SiteDirectory;
use serde_json::Value;

/// Equality filter selecting one site's records inside a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteFilter {
    pub site: SiteRef,
    pub alias: String,
}

/// Reads a site's alias for `source`. Aliases may arrive as an object or as
/// a JSON-encoded string; empty values count as missing.
pub fn alias_for(site: &Site, source: &SourceSpec) -> Option<String> {
    let parsed;
    let aliases = match &site.aliases {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).ok()?;
            &parsed
        }
        other => other,
    };
    match aliases.get(source.alias_key)? {
        Value::String(alias) if !alias.trim().is_empty() => Some(alias.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn resolve_filter(
    directory: &dyn SiteDirectory,
    site_id: i64,
    source: &SourceSpec,
) -> ToolResult<SiteFilter> {
    let site = directory
        .site(site_id)?
        .ok_or(ToolError::SiteNotFound(site_id))?;
    let alias = alias_for(&site, source).ok_or_else(|| ToolError::MissingAlias {
        site_id,
        source_name: source.name.to_string(),
    })?;
    Ok(SiteFilter {
        site: site.reference(),
        alias,
    })
}

/// Resolves every id it can. Unresolvable sites are skipped; having none left is an error.
pub fn resolve_many(
    directory: &dyn SiteDirectory,
    site_ids: &[i64],
    source: &SourceSpec,
) -> ToolResult<Vec<SiteFilter>> {
    let mut filters: Vec<SiteFilter> = Vec::with_capacity(site_ids.len());
    for site_id in site_ids {
        if filters.iter().any(|filter| filter.site.id == *site_id) {
            continue;
        }
        match resolve_filter(directory, *site_id, source) {
            Ok(filter) => filters.push(filter),
            Err(ToolError::Store(message)) => return Err(ToolError::Store(message)),
            Err(error) => {
                tracing::warn!(site_id, source = source.name, error = %error, "skipping unresolvable site");
            }
        }
    }
    if filters.is_empty() {
        return Err(ToolError::NoResolvableSite(source.name.to_string()));
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FEEDING, WEATHER};
    use crate::db::Database;
    use serde_json::json;
    use tempfile::tempdir;

    fn site(aliases: Value) -> Site {
        Site {
            id: 1,
            canonical_name: "Northsite".to_string(),
            canonical_code: None,
            aliases,
        }
    }

    #[test]
    fn reads_aliases_from_object_or_encoded_string() {
        let object = site(json!({ "climaV2_db_code": "NS-01" }));
        assert_eq!(alias_for(&object, &WEATHER).as_deref(), Some("NS-01"));

        let encoded = site(Value::String(r#"{"resumenAlimentacion_db_name":"North"}"#.to_string()));
        assert_eq!(alias_for(&encoded, &FEEDING).as_deref(), Some("North"));

        let numeric = site(json!({ "climaV2_db_code": 417 }));
        assert_eq!(alias_for(&numeric, &WEATHER).as_deref(), Some("417"));

        let blank = site(json!({ "climaV2_db_code": "  " }));
        assert_eq!(alias_for(&blank, &WEATHER), None);
    }

    #[test]
    fn skips_sites_without_alias_when_resolving_many() {
        let dir = tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("sites.db")).expect("db");
        db.insert_site(Some(1), "Northsite", None, &json!({ "climaV2_db_code": "NS" }))
            .expect("site");
        db.insert_site(Some(2), "Eastbay", None, &json!({}))
            .expect("site");

        let filters = resolve_many(&db, &[1, 2, 99], &WEATHER).expect("filters");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].alias, "NS");

        let missing = resolve_filter(&db, 2, &WEATHER).expect_err("no alias");
        assert_eq!(missing.code(), "missing_alias");
        assert!(matches!(
            resolve_many(&db, &[2], &WEATHER),
            Err(ToolError::NoResolvableSite(_))
        ));
    }
}
