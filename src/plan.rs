//! Declarative plans as produced by the planner.
//!
//! Parameters are parsed once into [`ParamValue`]s so placeholder detection
//! never happens at dispatch time.

use crate::errors::{AppError, AppResult};
use crate::fallback::RANGE_INFO_SUFFIX;
use crate::interpreter::MERGED_CHART_KEY;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{([^{}]*)\}$|^\{\{([^{}]*)\}\}$").expect("valid placeholder regex"));

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json)?\s*(.*?)\s*```$").expect("valid fence regex"));

/// `key.field.subfield`; an empty path means the whole stored result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub key: String,
    pub path: Vec<String>,
}

impl Reference {
    pub fn parse(raw: &str) -> Option<Self> {
        let captures = PLACEHOLDER_RE.captures(raw.trim())?;
        let inner = captures.get(1).or_else(|| captures.get(2))?.as_str().trim();
        let mut parts = inner.split('.').map(str::trim);
        let key = parts.next().filter(|key| !key.is_empty())?.to_string();
        let path: Vec<String> = parts.map(ToString::to_string).collect();
        if path.iter().any(String::is_empty) {
            return None;
        }
        Some(Self { key, path })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "${{{}}}", self.key)
        } else {
            write!(f, "${{{}.{}}}", self.key, self.path.join("."))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Literal(Value),
    Ref(Reference),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(raw) => match Reference::parse(&raw) {
                Some(reference) => Self::Ref(reference),
                None => Self::Literal(Value::String(raw)),
            },
            Value::Array(items) => {
                let parsed: Vec<ParamValue> = items.into_iter().map(Self::from_json).collect();
                if parsed.iter().all(|item| matches!(item, Self::Literal(_))) {
                    Self::Literal(Value::Array(
                        parsed
                            .into_iter()
                            .filter_map(|item| match item {
                                Self::Literal(value) => Some(value),
                                _ => None,
                            })
                            .collect(),
                    ))
                } else {
                    Self::List(parsed)
                }
            }
            other => Self::Literal(other),
        }
    }

    pub fn references(&self) -> Vec<&Reference> {
        match self {
            Self::Literal(_) => Vec::new(),
            Self::Ref(reference) => vec![reference],
            Self::List(items) => items.iter().flat_map(Self::references).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub tool: String,
    pub parameters: Vec<(String, ParamValue)>,
    pub result_key: String,
}

impl PlanStep {
    pub fn references(&self) -> impl Iterator<Item = &Reference> + '_ {
        self.parameters.iter().flat_map(|(_, value)| value.references())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanIssue {
    DuplicateKey { step: usize, key: String },
    ForwardReference { step: usize, key: String },
    UnknownReference { step: usize, key: String },
    /// The key collides with a name the context reserves for range hints or the merged chart.
    ReservedKey { step: usize, key: String },
}

impl fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey { step, key } => write!(f, "step {step} overwrites result '{key}'"),
            Self::ForwardReference { step, key } => {
                write!(f, "step {step} references '{key}' before it is produced")
            }
            Self::UnknownReference { step, key } => write!(f, "step {step} references unknown result '{key}'"),
            Self::ReservedKey { step, key } => write!(f, "step {step} stores its result under reserved name '{key}'"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        let body = FENCE_RE
            .captures(trimmed)
            .and_then(|captures| captures.get(1))
            .map(|body| body.as_str())
            .unwrap_or(trimmed);
        let value: Value =
            serde_json::from_str(body).map_err(|error| AppError::Plan(format!("plan is not valid JSON: {error}")))?;
        Self::from_json(value)
    }

    /// Accepts `{"plan": [...]}`. A planner error document becomes a plan error.
    pub fn from_json(value: Value) -> AppResult<Self> {
        let Value::Object(mut document) = value else {
            return Err(AppError::Plan("plan document must be a JSON object".to_string()));
        };
        if let Some(error) = document.get("error") {
            let details = document.get("details").map(Value::to_string).unwrap_or_default();
            return Err(AppError::Plan(format!("planner reported {error} {details}").trim().to_string()));
        }
        let Some(Value::Array(raw_steps)) = document.remove("plan") else {
            return Err(AppError::Plan("missing 'plan' array".to_string()));
        };

        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, raw_step) in raw_steps.into_iter().enumerate() {
            match parse_step(raw_step) {
                Some(step) => steps.push(step),
                None => tracing::warn!(step = index, "skipping malformed plan step"),
            }
        }
        Ok(Self { steps })
    }

    /// Whether `key` is produced by step `index` or a later one.
    pub fn produced_from(&self, index: usize, key: &str) -> bool {
        self.steps
            .iter()
            .skip(index)
            .any(|step| step.result_key == key)
    }

    pub fn validate(&self) -> Vec<PlanIssue> {
        let mut issues = Vec::new();
        let mut first_producer: HashMap<&str, usize> = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if is_reserved_key(&step.result_key) {
                issues.push(PlanIssue::ReservedKey {
                    step: index,
                    key: step.result_key.clone(),
                });
            }
            if first_producer.contains_key(step.result_key.as_str()) {
                issues.push(PlanIssue::DuplicateKey {
                    step: index,
                    key: step.result_key.clone(),
                });
            } else {
                first_producer.insert(step.result_key.as_str(), index);
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            for reference in step.references() {
                let key = reference.key.clone();
                match first_producer.get(reference.key.as_str()) {
                    Some(producer) if *producer < index => {}
                    Some(_) => issues.push(PlanIssue::ForwardReference { step: index, key }),
                    None => issues.push(PlanIssue::UnknownReference { step: index, key }),
                }
            }
        }
        issues
    }
}

pub fn is_reserved_key(key: &str) -> bool {
    key == MERGED_CHART_KEY || key.ends_with(RANGE_INFO_SUFFIX)
}

fn parse_step(raw: Value) -> Option<PlanStep> {
    let Value::Object(mut step) = raw else {
        return None;
    };
    let tool = non_empty_string(step.remove("tool"))?;
    let result_key = non_empty_string(step.remove("store_result_as"))?;
    let parameters = match step.remove("parameters") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(parameters)) => parameters,
        Some(_) => return None,
    };
    Some(PlanStep {
        tool,
        parameters: parameters
            .into_iter()
            .map(|(name, value)| (name, ParamValue::from_json(value)))
            .collect(),
        result_key,
    })
}

fn non_empty_string(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(raw)) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn both_placeholder_forms_are_recognised() {
        let dollar = Reference::parse("${site.center_id}").expect("dollar form");
        assert_eq!(dollar.key, "site");
        assert_eq!(dollar.path, vec!["center_id".to_string()]);

        let braces = Reference::parse("{{ a.b.c }}").expect("brace form");
        assert_eq!(braces.key, "a");
        assert_eq!(braces.path, vec!["b".to_string(), "c".to_string()]);

        assert!(Reference::parse("temperature").is_none());
        assert!(Reference::parse("prefix ${a.b}").is_none());
        assert!(Reference::parse("${a..b}").is_none());
    }

    #[test]
    fn text_with_several_placeholders_stays_literal() {
        assert!(Reference::parse("${a.b} and ${c.d}").is_none());
        assert!(Reference::parse("{{a.b}} {{c}}").is_none());
        assert_eq!(
            ParamValue::from_json(json!("${a.b} and ${c.d}")),
            ParamValue::Literal(json!("${a.b} and ${c.d}"))
        );
    }

    #[test]
    fn parameters_are_typed_in_one_pass() {
        let plan = Plan::from_json(json!({
            "plan": [
                { "tool": "get_center_id_by_name", "parameters": { "name": "Northsite" }, "store_result_as": "s" },
                {
                    "tool": "get_timeseries_data",
                    "parameters": {
                        "center_ids": ["${s.center_id}", 9],
                        "metrics": ["temperature"],
                        "source": "weather"
                    },
                    "store_result_as": "t"
                },
                { "tool": "get_all_centers" },
                "not a step"
            ]
        }))
        .expect("plan");

        assert_eq!(plan.steps.len(), 2);
        let params = &plan.steps[1].parameters;
        let centers = params.iter().find(|(name, _)| name == "center_ids").map(|(_, value)| value);
        assert!(matches!(centers, Some(ParamValue::List(items)) if items.len() == 2));
        let metrics = params.iter().find(|(name, _)| name == "metrics").map(|(_, value)| value);
        assert_eq!(metrics, Some(&ParamValue::Literal(json!(["temperature"]))));
        assert!(plan.validate().is_empty());
    }

    #[test]
    fn validation_reports_duplicates_and_bad_references() {
        let plan = Plan::from_json(json!({
            "plan": [
                { "tool": "get_timeseries_data", "parameters": { "center_id": "${later.center_id}" }, "store_result_as": "a" },
                { "tool": "get_center_id_by_name", "parameters": { "name": "x" }, "store_result_as": "later" },
                { "tool": "get_center_id_by_name", "parameters": { "name": "${ghost.name}" }, "store_result_as": "later" }
            ]
        }))
        .expect("plan");
        let issues = plan.validate();
        assert!(issues.contains(&PlanIssue::DuplicateKey { step: 2, key: "later".to_string() }));
        assert!(issues.contains(&PlanIssue::ForwardReference { step: 0, key: "later".to_string() }));
        assert!(issues.contains(&PlanIssue::UnknownReference { step: 2, key: "ghost".to_string() }));
    }

    #[test]
    fn validation_flags_reserved_result_keys() {
        let plan = Plan::from_json(json!({
            "plan": [
                { "tool": "get_all_centers", "store_result_as": "merged_chart_data" },
                { "tool": "get_all_centers", "store_result_as": "t_range_info" },
                { "tool": "get_all_centers", "store_result_as": "range" }
            ]
        }))
        .expect("plan");
        assert_eq!(
            plan.validate(),
            vec![
                PlanIssue::ReservedKey { step: 0, key: "merged_chart_data".to_string() },
                PlanIssue::ReservedKey { step: 1, key: "t_range_info".to_string() },
            ]
        );
    }

    #[test]
    fn planner_errors_and_fenced_plans() {
        let error = Plan::from_json(json!({ "error": "no plan", "details": "bad question" })).expect_err("error");
        assert!(error.to_string().starts_with("PLAN_INVALID"));

        let fenced = "```json\n{\"plan\": [{\"tool\": \"get_all_centers\", \"store_result_as\": \"all\"}]}\n```";
        assert_eq!(Plan::parse(fenced).expect("fenced plan").steps.len(), 1);
        assert!(Plan::parse("plan?").is_err());
    }
}
