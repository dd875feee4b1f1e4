//! Runs a [`Plan`] step by step against a [`ToolExecutor`].
//!
//! Steps run strictly in order. Each step's outcome, success or failure, is
//! recorded under its result key; a failing step never stops the plan.

use crate::errors::{ErrorCategory, ToolError, ToolResult};
use crate::fallback::{self, RANGE_INFO_SUFFIX};
use crate::models::ChartData;
use crate::plan::{ParamValue, Plan, PlanStep, Reference};
use crate::tools::{ToolExecutor, ToolId, ToolOutput, ToolParams};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

pub const MERGED_CHART_KEY: &str = "merged_chart_data";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub tool: String,
    pub code: &'static str,
    pub category: ErrorCategory,
    pub message: String,
}

impl StepError {
    fn new(tool: &str, error: &ToolError) -> Self {
        Self {
            tool: tool.to_string(),
            code: error.code(),
            category: error.category(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(ToolOutput),
    Failure(StepError),
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn output(&self) -> Option<&ToolOutput> {
        match self {
            Self::Success(output) => Some(output),
            Self::Failure(_) => None,
        }
    }

    /// Failures always carry an `error` key so downstream readers can detect them.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success(output) => output.to_json(),
            Self::Failure(error) => json!({
                "error": format!("{} failed", error.tool),
                "code": error.code,
                "category": error.category,
                "reason": error.message,
            }),
        }
    }
}

/// Per-question results, keyed by `store_result_as`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    entries: Vec<(String, StepOutcome)>,
    supplements: Vec<(String, ToolOutput)>,
    merged_chart: Option<ChartData>,
}

impl ExecutionContext {
    /// Last write wins; the entry keeps its original position. A range hint
    /// left by the previous outcome under the same key is dropped with it.
    pub fn insert(&mut self, key: String, outcome: StepOutcome) {
        let range_key = format!("{key}{RANGE_INFO_SUFFIX}");
        self.supplements.retain(|(existing, _)| *existing != range_key);
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => {
                tracing::warn!(key = %key, "result key written twice, keeping the latest outcome");
                slot.1 = outcome;
            }
            None => self.entries.push((key, outcome)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&StepOutcome> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, outcome)| outcome)
    }

    pub fn remove(&mut self, key: &str) -> Option<StepOutcome> {
        let position = self.entries.iter().position(|(existing, _)| existing == key)?;
        Some(self.entries.remove(position).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &StepOutcome)> + '_ {
        self.entries.iter().map(|(key, outcome)| (key.as_str(), outcome))
    }

    pub fn supplement(&mut self, key: String, output: ToolOutput) {
        self.supplements.retain(|(existing, _)| *existing != key);
        self.supplements.push((key, output));
    }

    pub fn supplement_for(&self, key: &str) -> Option<&ToolOutput> {
        self.supplements
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, output)| output)
    }

    pub fn merged_chart(&self) -> Option<&ChartData> {
        self.merged_chart.as_ref()
    }

    pub fn set_merged_chart(&mut self, chart: ChartData) {
        self.merged_chart = Some(chart);
    }

    pub fn take_merged_chart(&mut self) -> Option<ChartData> {
        self.merged_chart.take()
    }

    fn lookup_json(&self, key: &str) -> Option<Value> {
        self.get(key)
            .map(StepOutcome::to_json)
            .or_else(|| self.supplement_for(key).map(ToolOutput::to_json))
    }

    /// Flat view handed to synthesis: step results, range supplements and the merged chart.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, outcome) in &self.entries {
            map.insert(key.clone(), outcome.to_json());
        }
        for (key, output) in &self.supplements {
            if map.insert(key.clone(), output.to_json()).is_some() {
                tracing::warn!(key = %key, "range hint shadows a step result with the same key");
            }
        }
        if let Some(chart) = &self.merged_chart {
            let shadowed = map
                .insert(
                    MERGED_CHART_KEY.to_string(),
                    serde_json::to_value(chart).unwrap_or(Value::Null),
                )
                .is_some();
            if shadowed {
                tracing::warn!(key = MERGED_CHART_KEY, "merged chart shadows a step result with the same key");
            }
        }
        Value::Object(map)
    }
}

#[derive(Clone)]
pub struct PlanInterpreter {
    executor: Arc<ToolExecutor>,
    step_timeout: Duration,
}

impl PlanInterpreter {
    pub fn new(executor: Arc<ToolExecutor>, step_timeout: Duration) -> Self {
        Self {
            executor,
            step_timeout,
        }
    }

    pub async fn run(&self, plan: &Plan) -> ExecutionContext {
        for issue in plan.validate() {
            tracing::warn!(%issue, "plan issue");
        }

        let mut context = ExecutionContext::default();
        for (index, step) in plan.steps.iter().enumerate() {
            let span = tracing::info_span!("step", index, tool = %step.tool, key = %step.result_key);
            self.run_step(plan, index, step, &mut context).instrument(span).await;
        }
        tracing::info!(steps = plan.steps.len(), results = context.len(), "plan finished");
        context
    }

    async fn run_step(&self, plan: &Plan, index: usize, step: &PlanStep, context: &mut ExecutionContext) {
        let params = match resolve_parameters(plan, index, step, context) {
            Ok(params) => params,
            Err(error) => {
                tracing::warn!(error = %error, "placeholder resolution failed");
                context.insert(step.result_key.clone(), StepOutcome::Failure(StepError::new(&step.tool, &error)));
                return;
            }
        };

        let tool = step.tool.clone();
        let call_params = params.clone();
        let result = self
            .blocking(move |executor| executor.execute(&tool, &call_params))
            .await;

        let output = match result {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(code = error.code(), error = %error, "step failed");
                context.insert(step.result_key.clone(), StepOutcome::Failure(StepError::new(&step.tool, &error)));
                return;
            }
        };
        tracing::debug!(count = ?output.record_count(), "step succeeded");

        let request = step
            .tool
            .parse::<ToolId>()
            .ok()
            .and_then(|tool| fallback::trigger(tool, &step.result_key, &params, &output));
        context.insert(step.result_key.clone(), StepOutcome::Success(output));

        if let Some(request) = request {
            let key = request.key.clone();
            match self.blocking(move |executor| fallback::lookup(executor, &request)).await {
                Ok(range) => {
                    tracing::info!(key = %key, "empty result, attached available range");
                    context.supplement(key, range);
                }
                Err(error) => tracing::warn!(error = %error, "available range lookup failed"),
            }
        }
    }

    /// Runs a synchronous tool call on the blocking pool under the step timeout.
    async fn blocking<F>(&self, job: F) -> ToolResult<ToolOutput>
    where
        F: FnOnce(&ToolExecutor) -> ToolResult<ToolOutput> + Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        let task = tokio::task::spawn_blocking(move || job(executor.as_ref()));
        match tokio::time::timeout(self.step_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ToolError::Store(format!("tool task aborted: {join_error}"))),
            Err(_) => Err(ToolError::Timeout(self.step_timeout.as_millis() as u64)),
        }
    }
}

pub fn resolve_parameters(
    plan: &Plan,
    index: usize,
    step: &PlanStep,
    context: &ExecutionContext,
) -> ToolResult<ToolParams> {
    let mut params = ToolParams::new();
    for (name, value) in &step.parameters {
        params.insert(name.clone(), resolve_value(plan, index, value, context)?);
    }
    Ok(params)
}

fn resolve_value(plan: &Plan, index: usize, value: &ParamValue, context: &ExecutionContext) -> ToolResult<Value> {
    match value {
        ParamValue::Literal(literal) => Ok(literal.clone()),
        ParamValue::Ref(reference) => resolve_reference(plan, index, reference, context),
        ParamValue::List(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                match (item, resolve_value(plan, index, item, context)?) {
                    // A reference to a list is spliced in place.
                    (ParamValue::Ref(_), Value::Array(values)) => resolved.extend(values),
                    (_, value) => resolved.push(value),
                }
            }
            Ok(Value::Array(resolved))
        }
    }
}

pub fn resolve_reference(
    plan: &Plan,
    index: usize,
    reference: &Reference,
    context: &ExecutionContext,
) -> ToolResult<Value> {
    let placeholder = reference.to_string();
    if context.get(&reference.key).is_some_and(StepOutcome::is_failure) {
        tracing::debug!(key = %reference.key, "placeholder points at a failed step");
        return Err(ToolError::UnresolvedReference(placeholder));
    }
    let Some(mut current) = context.lookup_json(&reference.key) else {
        if plan.produced_from(index, &reference.key) {
            return Err(ToolError::ForwardReference(placeholder));
        }
        return Err(ToolError::UnresolvedReference(placeholder));
    };
    for segment in &reference.path {
        let next = match current {
            Value::Object(mut map) => map.remove(segment.as_str()),
            Value::Array(mut items) => segment
                .parse::<usize>()
                .ok()
                .filter(|position| *position < items.len())
                .map(|position| items.swap_remove(position)),
            _ => None,
        };
        current = next.ok_or_else(|| ToolError::UnresolvedReference(placeholder.clone()))?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppResult;
    use crate::models::{Site, SiteRef};
    use crate::query::{AggregationQuery, QueryBuilder, TimeseriesQuery, UnitSnapshotQuery};
    use crate::store::{AggregateRow, RawRecord, SiteDirectory, TimeseriesStore, UnitSnapshot};
    use chrono::NaiveDateTime;
    use serde_json::json;

    struct SingleSite;

    impl SiteDirectory for SingleSite {
        fn site(&self, id: i64) -> AppResult<Option<Site>> {
            Ok(Some(Site {
                id,
                canonical_name: "Northsite".to_string(),
                canonical_code: None,
                aliases: json!({ "climaV2_db_code": "NS" }),
            }))
        }

        fn find_by_name(&self, _fragment: &str) -> AppResult<Option<Site>> {
            Ok(None)
        }

        fn list_sites(&self) -> AppResult<Vec<Site>> {
            Ok(self.site(1)?.into_iter().collect())
        }
    }

    /// Every fetch outlasts any reasonable step timeout.
    struct StalledStore;

    impl TimeseriesStore for StalledStore {
        fn fetch(&self, _query: &TimeseriesQuery) -> AppResult<Vec<RawRecord>> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }

        fn aggregate(&self, _query: &AggregationQuery) -> AppResult<Vec<AggregateRow>> {
            Ok(Vec::new())
        }

        fn date_range(
            &self,
            _source: &crate::catalog::SourceSpec,
            _site_keys: &[String],
        ) -> AppResult<Option<(NaiveDateTime, NaiveDateTime)>> {
            Ok(None)
        }

        fn has_records(&self, _source: &crate::catalog::SourceSpec, _site_key: &str) -> AppResult<bool> {
            Ok(false)
        }

        fn latest_per_unit(&self, _query: &UnitSnapshotQuery) -> AppResult<Vec<UnitSnapshot>> {
            Ok(Vec::new())
        }
    }

    fn plan(value: Value) -> Plan {
        Plan::from_json(value).expect("plan")
    }

    fn context_with_site() -> ExecutionContext {
        let mut context = ExecutionContext::default();
        context.insert(
            "a".to_string(),
            StepOutcome::Success(ToolOutput::SiteMatch(SiteRef {
                id: 7,
                name: "Northsite".to_string(),
            })),
        );
        context
    }

    #[test]
    fn resolves_fields_and_reports_missing_ones() {
        let plan = plan(json!({ "plan": [] }));
        let context = context_with_site();
        let present = Reference::parse("${a.center_id}").expect("reference");
        assert_eq!(resolve_reference(&plan, 0, &present, &context), Ok(json!(7)));

        let missing = Reference::parse("${a.y}").expect("reference");
        assert_eq!(
            resolve_reference(&plan, 0, &missing, &context),
            Err(ToolError::UnresolvedReference("${a.y}".to_string()))
        );
    }

    #[test]
    fn references_to_failed_or_later_steps_fail() {
        let plan = plan(json!({
            "plan": [
                { "tool": "get_all_centers", "parameters": { "x": "${later.count}" }, "store_result_as": "first" },
                { "tool": "get_all_centers", "store_result_as": "later" }
            ]
        }));
        let mut context = ExecutionContext::default();
        let forward = Reference::parse("${later.count}").expect("reference");
        assert!(matches!(
            resolve_reference(&plan, 0, &forward, &context),
            Err(ToolError::ForwardReference(_))
        ));

        context.insert(
            "later".to_string(),
            StepOutcome::Failure(StepError::new("get_all_centers", &ToolError::Timeout(5))),
        );
        assert!(matches!(
            resolve_reference(&plan, 2, &forward, &context),
            Err(ToolError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn list_references_are_spliced() {
        let plan = plan(json!({ "plan": [] }));
        let mut context = ExecutionContext::default();
        context.insert(
            "all".to_string(),
            StepOutcome::Success(ToolOutput::SiteList(vec![
                SiteRef { id: 1, name: "A".to_string() },
                SiteRef { id: 2, name: "B".to_string() },
            ])),
        );
        let value = ParamValue::from_json(json!(["${all.center_ids}", 9]));
        assert_eq!(resolve_value(&plan, 1, &value, &context), Ok(json!([1, 2, 9])));
    }

    #[test]
    fn duplicate_keys_keep_the_last_outcome() {
        let mut context = context_with_site();
        context.insert("a".to_string(), StepOutcome::Success(ToolOutput::DirectAnswer("hi".to_string())));
        assert_eq!(context.len(), 1);
        assert_eq!(context.to_json()["a"]["answer"], "hi");
    }

    #[test]
    fn overwriting_a_key_drops_its_stale_range_hint() {
        let mut context = ExecutionContext::default();
        context.insert("t".to_string(), StepOutcome::Success(ToolOutput::DirectAnswer("empty".to_string())));
        context.supplement(
            "t_range_info".to_string(),
            ToolOutput::DataRange(crate::models::DataRange {
                has_data: true,
                center_id: Some(4),
                first_record: Some("2024-01-01".to_string()),
                last_record: Some("2024-03-01".to_string()),
            }),
        );
        context.supplement("u_range_info".to_string(), ToolOutput::DirectAnswer("kept".to_string()));

        context.insert("t".to_string(), StepOutcome::Success(ToolOutput::DirectAnswer("data".to_string())));
        assert!(context.supplement_for("t_range_info").is_none());
        assert!(context.supplement_for("u_range_info").is_some());
        let json = context.to_json();
        assert!(json.get("t_range_info").is_none());
        assert_eq!(json["t"]["answer"], "data");
    }

    #[tokio::test]
    async fn slow_steps_time_out_and_the_plan_continues() {
        let executor = ToolExecutor::new(Arc::new(SingleSite), Arc::new(StalledStore), QueryBuilder::default());
        let interpreter = PlanInterpreter::new(Arc::new(executor), Duration::from_millis(10));
        let plan = plan(json!({
            "plan": [
                {
                    "tool": "get_timeseries_data",
                    "parameters": { "center_id": 1, "source": "weather", "metrics": ["temperature"] },
                    "store_result_as": "slow"
                },
                { "tool": "get_all_centers", "store_result_as": "sites" }
            ]
        }));

        let context = interpreter.run(&plan).await.to_json();
        assert_eq!(context["slow"]["code"], "timeout");
        assert_eq!(context["slow"]["category"], "transport");
        assert!(context.get("slow_range_info").is_none());
        assert_eq!(context["sites"]["count"], 1);
        assert_eq!(context["sites"]["center_ids"], json!([1]));
    }

    #[test]
    fn failures_serialize_with_an_error_key() {
        let outcome = StepOutcome::Failure(StepError::new("get_timeseries_data", &ToolError::NoValidMetric(vec![])));
        let value = outcome.to_json();
        assert_eq!(value["error"], "get_timeseries_data failed");
        assert_eq!(value["code"], "no_valid_metric");
        assert_eq!(value["category"], "validation");
    }
}
