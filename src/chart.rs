//! Pulls a chart embedded by the synthesizer out of its answer text.

use crate::models::ChartData;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static CHART_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json\s*(\{[\s\S]*?\})\s*```").expect("valid chart block regex"));

static CHART_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["type", "title", "xAxis", "series"],
        "properties": {
            "type": { "type": "string", "minLength": 1 },
            "title": { "type": "string" },
            "xAxis": { "type": "array", "items": { "type": "string" } },
            "series": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "data"],
                    "properties": {
                        "name": { "type": "string" },
                        "data": { "type": "array", "items": { "type": ["number", "null"] } }
                    }
                }
            }
        }
    })
});

#[derive(Debug, Clone, PartialEq)]
pub struct ChartExtraction {
    pub text: String,
    pub chart: Option<ChartData>,
    pub errors: Vec<String>,
}

/// Finds the first fenced `{"chart": {...}}` block. The block is removed from
/// the text whenever it parses, even if the chart itself is rejected.
pub fn extract_chart(answer: &str) -> ChartExtraction {
    for captures in CHART_BLOCK_RE.captures_iter(answer) {
        let (Some(block), Some(body)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let Ok(Value::Object(mut document)) = serde_json::from_str::<Value>(body.as_str()) else {
            continue;
        };
        let Some(chart_value) = document.remove("chart") else {
            continue;
        };

        let mut text = String::with_capacity(answer.len());
        text.push_str(&answer[..block.start()]);
        text.push_str(&answer[block.end()..]);
        let text = text.trim().to_string();

        return match validate_chart(&chart_value) {
            Ok(chart) => ChartExtraction {
                text,
                chart: Some(chart),
                errors: Vec::new(),
            },
            Err(errors) => {
                tracing::warn!(errors = ?errors, "discarding invalid chart from answer");
                ChartExtraction {
                    text,
                    chart: None,
                    errors,
                }
            }
        };
    }

    ChartExtraction {
        text: answer.to_string(),
        chart: None,
        errors: Vec::new(),
    }
}

pub fn validate_chart(value: &Value) -> Result<ChartData, Vec<String>> {
    let compiled = jsonschema::JSONSchema::compile(&CHART_SCHEMA)
        .map_err(|error| vec![format!("Failed to compile chart schema: {}", error)])?;

    let errors: Vec<String> = compiled
        .validate(value)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if !errors.is_empty() {
        return Err(errors);
    }

    let chart: ChartData = serde_json::from_value(value.clone()).map_err(|error| vec![error.to_string()])?;
    let misaligned: Vec<String> = chart
        .series
        .iter()
        .filter(|series| series.data.len() != chart.x_axis.len())
        .map(|series| format!("series '{}' has {} points for {} axis labels", series.name, series.data.len(), chart.x_axis.len()))
        .collect();
    if !misaligned.is_empty() {
        return Err(misaligned);
    }
    Ok(chart)
}
