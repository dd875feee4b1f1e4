//! Folds every time series result in a context onto one shared timeline.

use crate::interpreter::ExecutionContext;
use crate::models::{ChartData, ChartSeries, SiteRef};
use crate::query::TIMESTAMP_FORMAT;
use chrono::NaiveDateTime;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesIdentity {
    metric: String,
    site: SiteRef,
}

/// Replaces the raw series entries with a single merged chart. Returns false,
/// leaving the context untouched, when there is nothing to plot.
pub fn merge_series(context: &mut ExecutionContext) -> bool {
    let keys: Vec<String> = context
        .entries()
        .filter(|(_, outcome)| outcome.output().and_then(|output| output.timeseries()).is_some())
        .map(|(key, _)| key.to_string())
        .collect();

    let mut identities: Vec<SeriesIdentity> = Vec::new();
    let mut values: HashMap<SeriesIdentity, HashMap<NaiveDateTime, f64>> = HashMap::new();
    let mut timeline: BTreeSet<NaiveDateTime> = BTreeSet::new();

    for key in &keys {
        let Some(result) = context
            .get(key)
            .and_then(|outcome| outcome.output())
            .and_then(|output| output.timeseries())
        else {
            continue;
        };
        for point in &result.points {
            timeline.insert(point.fecha);
            for (metric, value) in result.metrics.iter().zip(&point.values) {
                let identity = SeriesIdentity {
                    metric: metric.clone(),
                    site: point.site.clone(),
                };
                if !identities.contains(&identity) {
                    identities.push(identity.clone());
                }
                let slot = values.entry(identity).or_default();
                if let Some(value) = value {
                    slot.insert(point.fecha, *value);
                }
            }
        }
    }

    if timeline.is_empty() {
        return false;
    }

    let mut sites: Vec<&SiteRef> = Vec::new();
    let mut metrics: Vec<&str> = Vec::new();
    for identity in &identities {
        if !sites.contains(&&identity.site) {
            sites.push(&identity.site);
        }
        if !metrics.contains(&identity.metric.as_str()) {
            metrics.push(identity.metric.as_str());
        }
    }
    let multi_site = sites.len() > 1;

    let series = identities
        .iter()
        .map(|identity| {
            let by_time = values.get(identity);
            ChartSeries {
                name: if multi_site {
                    format!("{} ({})", title_case(&identity.metric), identity.site.name)
                } else {
                    title_case(&identity.metric)
                },
                data: timeline
                    .iter()
                    .map(|at| by_time.and_then(|points| points.get(at)).copied())
                    .collect(),
            }
        })
        .collect();

    let chart = ChartData {
        chart_type: "line".to_string(),
        title: format!(
            "Chart of {} for {}",
            metrics.iter().map(|metric| title_case(metric)).collect::<Vec<_>>().join(", "),
            sites.iter().map(|site| site.name.as_str()).collect::<Vec<_>>().join(", "),
        ),
        x_axis: timeline
            .iter()
            .map(|at| at.format(TIMESTAMP_FORMAT).to_string())
            .collect(),
        series,
    };

    for key in &keys {
        context.remove(key);
    }
    tracing::info!(merged = keys.len(), series = identities.len(), points = timeline.len(), "merged series");
    context.set_merged_chart(chart);
    true
}

fn title_case(metric: &str) -> String {
    metric
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::StepOutcome;
    use crate::tools::{SeriesPoint, TimeseriesResult, ToolOutput};
    use chrono::NaiveDate;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .expect("timestamp")
    }

    fn site(id: i64, name: &str) -> SiteRef {
        SiteRef {
            id,
            name: name.to_string(),
        }
    }

    fn series(site: SiteRef, days: &[(u32, f64)]) -> StepOutcome {
        StepOutcome::Success(ToolOutput::Series(TimeseriesResult {
            sites: vec![site.clone()],
            metrics: vec!["temperature".to_string()],
            points: days
                .iter()
                .map(|(day, value)| SeriesPoint {
                    fecha: at(*day),
                    site: site.clone(),
                    values: vec![Some(*value)],
                })
                .collect(),
            default_limit_used: false,
        }))
    }

    #[test]
    fn aligns_sites_on_a_shared_axis() {
        let mut context = ExecutionContext::default();
        context.insert("a".to_string(), series(site(1, "Alpha"), &[(1, 10.0), (2, 11.0)]));
        context.insert("b".to_string(), series(site(2, "Bravo"), &[(2, 20.0), (3, 21.0)]));
        context.insert("s".to_string(), StepOutcome::Success(ToolOutput::SiteMatch(site(1, "Alpha"))));

        assert!(merge_series(&mut context));
        let chart = context.merged_chart().expect("chart");
        assert_eq!(
            chart.x_axis,
            vec!["2024-01-01 00:00:00", "2024-01-02 00:00:00", "2024-01-03 00:00:00"]
        );
        assert_eq!(chart.series.len(), 2);
        assert_eq!(chart.series[0].name, "Temperature (Alpha)");
        assert_eq!(chart.series[0].data, vec![Some(10.0), Some(11.0), None]);
        assert_eq!(chart.series[1].name, "Temperature (Bravo)");
        assert_eq!(chart.series[1].data, vec![None, Some(20.0), Some(21.0)]);
        assert_eq!(chart.title, "Chart of Temperature for Alpha, Bravo");

        assert!(context.get("a").is_none());
        assert!(context.get("b").is_none());
        assert!(context.get("s").is_some());
    }

    #[test]
    fn merging_twice_is_a_no_op() {
        let mut context = ExecutionContext::default();
        context.insert("a".to_string(), series(site(1, "Alpha"), &[(1, 10.0)]));
        assert!(merge_series(&mut context));
        let first = context.to_json();
        assert!(!merge_series(&mut context));
        assert_eq!(context.to_json(), first);
        assert_eq!(context.merged_chart().map(|chart| chart.series[0].name.as_str()), Some("Temperature"));
    }

    #[test]
    fn empty_results_leave_the_context_alone() {
        let mut context = ExecutionContext::default();
        context.insert("a".to_string(), series(site(1, "Alpha"), &[]));
        assert!(!merge_series(&mut context));
        assert!(context.get("a").is_some());
        assert!(context.merged_chart().is_none());
    }

    #[test]
    fn metric_names_are_title_cased() {
        assert_eq!(title_case("temperature_max"), "Temperature Max");
        assert_eq!(title_case("sfr"), "Sfr");
    }
}
