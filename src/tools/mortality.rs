//! Weighted mortality: each unit's latest percentage is converted back into a
//! fish count against its initial stock, and the ratio is recomputed from the
//! totals. Percentages are never averaged.

use super::args::{self, MortalityArgs};
use super::series::resolve_filters;
use super::sites::{display_name, site_names_by_alias};
use super::{MortalityResult, MortalityRow, ToolExecutor, ToolOutput, ToolParams};
use crate::catalog::FEEDING;
use crate::errors::{ToolError, ToolResult};
use crate::models::SiteRef;
use crate::query::{parse_end, round_to, UnitSnapshotQuery};
use crate::store::UnitSnapshot;
use std::collections::BTreeMap;

const MORTALITY_FIELD: &str = "Mortalidad";
const STOCK_FIELD: &str = "Número Ingreso";

pub fn get_mortality_rate(executor: &ToolExecutor, params: &ToolParams) -> ToolResult<ToolOutput> {
    let args: MortalityArgs = args::parse(params)?;
    let site_ids = args::site_ids(args.center_ids.clone())?;
    let as_of = args.end_date.as_deref().map(parse_end).transpose()?;
    if args.start_date.is_some() {
        tracing::debug!("mortality is cumulative; start_date ignored");
    }
    let unit_field = FEEDING
        .unit_field
        .ok_or_else(|| ToolError::InvalidParameters("feeding source has no unit field".to_string()))?;

    let (site_keys, names) = if site_ids.is_empty() {
        (Vec::new(), site_names_by_alias(executor, &FEEDING)?)
    } else {
        let filters = resolve_filters(executor, &site_ids, &FEEDING)?;
        let keys: Vec<String> = filters.iter().map(|filter| filter.alias.clone()).collect();
        let names: Vec<(String, SiteRef)> = filters.into_iter().map(|filter| (filter.alias, filter.site)).collect();
        (keys, names)
    };

    let snapshots = executor.store.latest_per_unit(&UnitSnapshotQuery {
        source: &FEEDING,
        site_keys,
        as_of,
        unit_field,
        mortality_field: MORTALITY_FIELD,
        stock_field: STOCK_FIELD,
    })?;

    let mut totals: BTreeMap<String, Totals> = BTreeMap::new();
    for snapshot in &snapshots {
        totals
            .entry(display_name(&names, &snapshot.site_key))
            .or_default()
            .add(snapshot);
    }

    let data: Vec<MortalityRow> = totals.iter().map(|(centro, totals)| totals.row(centro)).collect();
    let overall = (data.len() > 1).then(|| {
        let mut combined = Totals::default();
        for site_totals in totals.values() {
            combined.dead += site_totals.dead;
            combined.stock += site_totals.stock;
        }
        combined.row("overall")
    });

    Ok(ToolOutput::Mortality(MortalityResult {
        count: data.len(),
        data,
        overall,
    }))
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    dead: f64,
    stock: f64,
}

impl Totals {
    fn add(&mut self, snapshot: &UnitSnapshot) {
        if let Some(stock) = snapshot.stock {
            self.stock += stock;
            if let Some(percent) = snapshot.mortality_percent {
                self.dead += percent / 100.0 * stock;
            }
        }
    }

    fn row(&self, centro: &str) -> MortalityRow {
        let percent = if self.stock > 0.0 {
            self.dead / self.stock * 100.0
        } else {
            0.0
        };
        MortalityRow {
            centro: centro.to_string(),
            total_peces_ingresados: self.stock,
            total_peces_muertos: round_to(self.dead, 0),
            porcentaje_mortalidad_total: round_to(percent, 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Totals;
    use crate::store::UnitSnapshot;

    fn snapshot(percent: Option<f64>, stock: Option<f64>) -> UnitSnapshot {
        UnitSnapshot {
            site_key: "North".to_string(),
            unit: "J1".to_string(),
            mortality_percent: percent,
            stock,
        }
    }

    #[test]
    fn ratio_is_weighted_by_stock() {
        let mut totals = Totals::default();
        totals.add(&snapshot(Some(10.0), Some(900.0)));
        totals.add(&snapshot(Some(1.0), Some(100.0)));
        let row = totals.row("North");
        assert_eq!(row.total_peces_ingresados, 1000.0);
        assert_eq!(row.total_peces_muertos, 91.0);
        assert_eq!(row.porcentaje_mortalidad_total, 9.1);
    }

    #[test]
    fn missing_values_do_not_poison_totals() {
        let mut totals = Totals::default();
        totals.add(&snapshot(None, Some(200.0)));
        totals.add(&snapshot(Some(5.0), None));
        let row = totals.row("North");
        assert_eq!(row.total_peces_ingresados, 200.0);
        assert_eq!(row.total_peces_muertos, 0.0);
        assert_eq!(row.porcentaje_mortalidad_total, 0.0);

        assert_eq!(Totals::default().row("Empty").porcentaje_mortalidad_total, 0.0);
    }
}
