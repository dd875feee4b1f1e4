//! Question orchestration around the interpreter: planner in, synthesizer out.

use crate::chart::extract_chart;
use crate::errors::{AppError, AppResult};
use crate::interpreter::{ExecutionContext, PlanInterpreter, StepOutcome};
use crate::merge::merge_series;
use crate::models::{FinalAnswer, QuestionRequest};
use crate::plan::Plan;
use crate::settings::EngineSettings;
use crate::tools::{ToolId, ToolOutput};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

pub type Turn = Map<String, Value>;

const DROPPED_TURN_FIELDS: [&str; 2] = ["audioBase64", "debug_context"];

/// Produces a plan document (`{"plan": [...]}` or `{"error": ..., "details": ...}`).
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, question: &str, center_id: Option<i64>, history: &[Turn]) -> AppResult<Value>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, question: &str, context: &Value) -> AppResult<String>;
}

pub struct QuestionPipeline {
    planner: Arc<dyn Planner>,
    synthesizer: Arc<dyn Synthesizer>,
    interpreter: PlanInterpreter,
    settings: EngineSettings,
}

impl QuestionPipeline {
    pub fn new(
        planner: Arc<dyn Planner>,
        synthesizer: Arc<dyn Synthesizer>,
        interpreter: PlanInterpreter,
        settings: EngineSettings,
    ) -> Self {
        Self {
            planner,
            synthesizer,
            interpreter,
            settings,
        }
    }

    pub async fn answer(&self, request: QuestionRequest) -> AppResult<FinalAnswer> {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("question", request_id = %request_id, center_id = ?request.center_id);
        self.answer_inner(request, request_id).instrument(span).await
    }

    async fn answer_inner(&self, request: QuestionRequest, request_id: String) -> AppResult<FinalAnswer> {
        let history = clean_history(&request.contexto_previo, self.settings.history_max_turns);
        let plan_document = tokio::time::timeout(
            self.settings.planner_timeout(),
            self.planner.plan(&request.user_question, request.center_id, &history),
        )
        .await
        .map_err(|_| AppError::Planner(format!("no plan after {} ms", self.settings.planner_timeout_ms)))?
        .map_err(|error| AppError::Planner(error.to_string()))?;

        let plan = Plan::from_json(plan_document.clone())?;
        tracing::info!(steps = plan.steps.len(), "plan accepted");
        let mut context = self.interpreter.run(&plan).await;

        let chart_requested = request
            .wants_chart
            .unwrap_or_else(|| wants_chart(&request.user_question, &self.settings.chart_keywords));
        if chart_requested {
            merge_series(&mut context);
        }
        let context_json = context.to_json();
        let debug_context = json!({
            "request_id": request_id,
            "plan": plan_document,
            "execution_context": context_json,
        });

        if let Some(answer) = direct_answer(&plan, &context) {
            return Ok(FinalAnswer {
                answer,
                chart: None,
                debug_context,
            });
        }

        let text = tokio::time::timeout(
            self.settings.synthesis_timeout(),
            self.synthesizer.synthesize(&request.user_question, &context_json),
        )
        .await
        .map_err(|_| AppError::Synthesis(format!("no answer after {} ms", self.settings.synthesis_timeout_ms)))?
        .map_err(|error| AppError::Synthesis(error.to_string()))?;

        let extraction = extract_chart(&text);
        let chart = match context.take_merged_chart() {
            Some(merged) => Some(merged),
            None if chart_requested => extraction.chart,
            None => None,
        };
        Ok(FinalAnswer {
            answer: extraction.text,
            chart,
            debug_context,
        })
    }
}

/// A plan made only of `direct_answer` steps needs no synthesis.
fn direct_answer(plan: &Plan, context: &ExecutionContext) -> Option<String> {
    if plan.steps.is_empty()
        || !plan
            .steps
            .iter()
            .all(|step| step.tool.parse::<ToolId>().ok() == Some(ToolId::DirectAnswer))
    {
        return None;
    }
    let answers: Vec<String> = context
        .entries()
        .map(|(_, outcome)| match outcome {
            StepOutcome::Success(ToolOutput::DirectAnswer(answer)) => Some(answer.clone()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(answers.join("\n\n"))
}

/// Strips heavy per-turn fields and keeps the newest `max_turns` turns.
pub fn clean_history(turns: &[Turn], max_turns: usize) -> Vec<Turn> {
    let skip = turns.len().saturating_sub(max_turns);
    turns
        .iter()
        .skip(skip)
        .map(|turn| {
            let mut turn = turn.clone();
            for field in DROPPED_TURN_FIELDS {
                turn.remove(field);
            }
            turn
        })
        .collect()
}

pub fn wants_chart(question: &str, keywords: &[String]) -> bool {
    let question = question.to_lowercase();
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && question.contains(&keyword.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(value: Value) -> Turn {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn history_is_trimmed_and_cleaned() {
        let turns: Vec<Turn> = (0..8)
            .map(|index| turn(json!({ "q": index, "audioBase64": "xx", "debug_context": {} })))
            .collect();
        let cleaned = clean_history(&turns, 6);
        assert_eq!(cleaned.len(), 6);
        assert_eq!(cleaned[0]["q"], 2);
        assert!(cleaned.iter().all(|turn| !turn.contains_key("audioBase64") && !turn.contains_key("debug_context")));
        assert_eq!(clean_history(&turns[..2], 6).len(), 2);
    }

    #[test]
    fn chart_intent_uses_keywords() {
        let keywords = crate::settings::EngineSettings::default().chart_keywords;
        assert!(wants_chart("Muestra un GRÁFICO de temperatura", &keywords));
        assert!(wants_chart("plot wind for Northsite", &keywords));
        assert!(!wants_chart("what was the temperature yesterday?", &keywords));
    }
}
