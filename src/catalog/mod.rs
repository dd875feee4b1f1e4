//! Static metric vocabulary per data source.
//!
//! Callers and plans only ever see logical metric names; the underlying
//! document fields stay inside the query layer.

pub mod alias;

use crate::errors::{ToolError, ToolResult};

#[derive(Debug)]
pub struct SourceSpec {
    pub name: &'static str,
    pub date_field: &'static str,
    pub site_field: &'static str,
    /// Key inside a site's alias document holding this source's identifier.
    pub alias_key: &'static str,
    pub unit_field: Option<&'static str>,
    pub metrics: &'static [(&'static str, &'static str)],
    pub legacy_names: &'static [&'static str],
}

/// A requested metric paired with the document field that backs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricColumn {
    pub name: String,
    pub field: &'static str,
}

pub static WEATHER: SourceSpec = SourceSpec {
    name: "weather",
    date_field: "FECHA",
    site_field: "NAME",
    alias_key: "climaV2_db_code",
    unit_field: None,
    metrics: &[
        ("temperature_min", "TEMP_MIN_C"),
        ("temperature_max", "TEMP_MAX_C"),
        ("temperature", "TEMP_TARDE"),
        ("pressure", "PRESION_HPA"),
        ("humidity", "HUMEDAD_%"),
        ("wind", "VIENTO_VEL_MS"),
        ("precipitation", "PRECIPITACION_TOTAL_MM"),
    ],
    legacy_names: &["clima"],
};

pub static FEEDING: SourceSpec = SourceSpec {
    name: "feeding",
    date_field: "Fecha",
    site_field: "Centro",
    alias_key: "resumenAlimentacion_db_name",
    unit_field: Some("Unidad"),
    metrics: &[
        ("feed_total", "Alimentos"),
        ("sfr", "SFR en período"),
        ("fcr_biological", "FCR Biológico Acum"),
        ("gross_growth", "Crecimiento bruto"),
        ("sgr", "SGR en período"),
        // percent
        ("mortality", "Mortalidad"),
        // tonnes
        ("mortality_biomass", "Biomasa Mortalidad Acum"),
        ("sea_temperature", "Temperatura Promedio"),
        // grams
        ("average_weight", "Desarrollo del Peso Promedio"),
        // kilograms
        ("current_biomass", "Saldo Final Biomasa"),
        ("stocked_fish", "Número Ingreso"),
    ],
    legacy_names: &["alimentacion"],
};

pub static CATALOG: [&SourceSpec; 2] = [&WEATHER, &FEEDING];

/// Looks up a source by its logical name (or a legacy spelling), case-insensitively.
pub fn source(name: &str) -> Option<&'static SourceSpec> {
    let wanted = name.trim().to_ascii_lowercase();
    CATALOG.iter().copied().find(|spec| {
        spec.name == wanted || spec.legacy_names.iter().any(|legacy| *legacy == wanted)
    })
}

pub fn require_source(name: &str) -> ToolResult<&'static SourceSpec> {
    source(name).ok_or_else(|| ToolError::UnknownSource(name.to_string()))
}

impl SourceSpec {
    pub fn field_for(&self, metric: &str) -> Option<&'static str> {
        self.metrics
            .iter()
            .find(|(name, _)| *name == metric)
            .map(|(_, field)| *field)
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metrics.iter().map(|(name, _)| *name)
    }

    /// Keeps the requested metrics this source knows, in request order and
    /// without duplicates. Fails only when nothing valid is left.
    pub fn project(&self, requested: &[String]) -> ToolResult<Vec<MetricColumn>> {
        let mut columns: Vec<MetricColumn> = Vec::new();
        for metric in requested {
            let metric = metric.trim();
            match self.field_for(metric) {
                Some(field) => {
                    if !columns.iter().any(|column| column.name == metric) {
                        columns.push(MetricColumn {
                            name: metric.to_string(),
                            field,
                        });
                    }
                }
                None => {
                    tracing::debug!(source = self.name, metric, "dropping metric unknown to source");
                }
            }
        }
        if columns.is_empty() {
            return Err(ToolError::NoValidMetric(requested.to_vec()));
        }
        Ok(columns)
    }

    pub fn require_metric(&self, metric: &str) -> ToolResult<MetricColumn> {
        self.field_for(metric.trim())
            .map(|field| MetricColumn {
                name: metric.trim().to_string(),
                field,
            })
            .ok_or_else(|| ToolError::NoValidMetric(vec![metric.to_string()]))
    }
}

#[cfg(test)]
mod tests {
    use super::{source, FEEDING, WEATHER};
    use crate::errors::ToolError;

    #[test]
    fn resolves_logical_and_legacy_source_names() {
        assert_eq!(source("weather").map(|spec| spec.name), Some("weather"));
        assert_eq!(source(" Clima ").map(|spec| spec.name), Some("weather"));
        assert_eq!(source("alimentacion").map(|spec| spec.name), Some("feeding"));
        assert!(source("sonar").is_none());
    }

    #[test]
    fn projection_drops_unknown_metrics_and_keeps_order() {
        let columns = WEATHER
            .project(&[
                "wind".to_string(),
                "bogus".to_string(),
                "temperature".to_string(),
                "wind".to_string(),
            ])
            .expect("projection");
        let names: Vec<_> = columns.iter().map(|column| column.name.as_str()).collect();
        assert_eq!(names, vec!["wind", "temperature"]);
        assert_eq!(columns[1].field, "TEMP_TARDE");
    }

    #[test]
    fn projection_without_any_valid_metric_fails() {
        let error = FEEDING
            .project(&["temperature".to_string()])
            .expect_err("weather metric is not a feeding metric");
        assert!(matches!(error, ToolError::NoValidMetric(_)));
    }
}
