//! Single-turn agent execution.
//!
//! A turn is a function of (run state, agent kind) to (state delta, turn
//! record). The runtime selects the model, assembles the prompt from the
//! template library and the run's working set, issues the call under the
//! remaining wall-clock budget, parses the structured output for the agent
//! kind and accounts tokens, latency and cost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::executor::CancelToken;
use crate::llm::{ModelCatalog, ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::state::{AgentKind, RunState, TurnRecord};

use super::outputs::{
    clean_prose, parse_analysis, parse_findings, parse_verdict, AnalysisReport, CriticVerdict,
    ResearchFindings,
};
use super::prompts::PromptLibrary;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const REPAIR_DIRECTIVE: &str = "\n\nA resposta anterior não pôde ser interpretada. Responda \
    APENAS no formato pedido, sem comentários adicionais.";

/// What a turn wants written back into the run state. The executor owns the
/// state and applies the delta at the resume point.
#[derive(Debug, Clone)]
pub enum StateDelta {
    Analysis(AnalysisReport),
    Findings(ResearchFindings),
    Draft(String),
    Critique(CriticVerdict),
    Formatted(String),
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub delta: StateDelta,
    pub record: TurnRecord,
    pub cost_micros: u64,
}

pub struct AgentRuntime {
    client: Arc<dyn ModelClient>,
    catalog: ModelCatalog,
    prompts: Arc<PromptLibrary>,
    attempts: u32,
    per_turn_ceiling: Duration,
}

impl AgentRuntime {
    pub fn new(
        client: Arc<dyn ModelClient>,
        catalog: ModelCatalog,
        prompts: Arc<PromptLibrary>,
        attempts: u32,
        per_turn_ceiling: Duration,
    ) -> Self {
        Self {
            client,
            catalog,
            prompts,
            attempts: attempts.max(1),
            per_turn_ceiling,
        }
    }

    /// Execute one agent turn against the current state.
    pub async fn run_turn(
        &self,
        state: &RunState,
        kind: AgentKind,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome> {
        let model = state
            .options
            .model_for(kind)
            .unwrap_or_else(|| self.catalog.default_model(kind))
            .to_string();

        let template = self.prompts.get(kind, &state.document_type).await;
        let prompt = template.render(
            &state.redacted_query,
            &context_block(state),
            &working_block(state, kind),
            &state.document_type,
        );

        let timeout = state.remaining_deadline().min(self.per_turn_ceiling);
        if timeout.is_zero() {
            return Err(EngineError::Model(ModelError::Transient(
                "no wall-clock budget left for a model call".to_string(),
            )));
        }

        let request = ModelRequest {
            model: model.clone(),
            system: template.system.clone(),
            prompt,
            max_tokens: 4_096,
            temperature: 0.2,
            timeout,
        };

        debug!(
            target: "agent_runtime",
            agent = %kind,
            model = %model,
            template = %template.version,
            timeout_ms = timeout.as_millis() as u64,
            "Dispatching turn"
        );

        let started = Instant::now();
        let mut response = self.call_with_retries(&request, cancel).await?;

        // One repair retry when the structured output cannot be parsed.
        let mut delta = parse_delta(kind, &response.text);
        if delta.is_none() {
            warn!(target: "agent_runtime", agent = %kind, "Output parse failed; retrying with repair directive");
            let mut repair = request.clone();
            repair.prompt.push_str(REPAIR_DIRECTIVE);
            response = self.call_with_retries(&repair, cancel).await?;
            delta = parse_delta(kind, &response.text);
        }
        let delta = delta.ok_or_else(|| {
            EngineError::ParseFailure(format!("{kind} output unusable after repair retry"))
        })?;

        let duration_ms = started.elapsed().as_millis() as u64;
        let cost_micros = self.catalog.cost_micros(&response.model, response.usage);

        let record = TurnRecord {
            agent: kind,
            model: response.model.clone(),
            tokens_in: response.usage.input,
            tokens_out: response.usage.output,
            duration_ms,
            summary: summarise(&delta),
            error: None,
        };

        info!(
            target: "agent_runtime",
            agent = %kind,
            model = %record.model,
            tokens_in = record.tokens_in,
            tokens_out = record.tokens_out,
            duration_ms,
            "Turn complete"
        );

        Ok(TurnOutcome {
            delta,
            record,
            cost_micros,
        })
    }

    /// Retry transient model errors with exponential backoff and full
    /// jitter. Fatal errors and cancellation surface immediately.
    async fn call_with_retries(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> Result<ModelResponse> {
        let mut last_transient = String::new();
        for attempt in 0..self.attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let call = self.client.generate(request);
            let result = tokio::select! {
                res = call => res,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(ModelError::Fatal(reason)) => {
                    return Err(EngineError::Model(ModelError::Fatal(reason)));
                }
                Err(ModelError::Transient(reason)) => {
                    warn!(
                        target: "agent_runtime",
                        attempt = attempt + 1,
                        max_attempts = self.attempts,
                        error = %reason,
                        "Transient model error"
                    );
                    last_transient = reason;
                    if attempt + 1 < self.attempts {
                        tokio::time::sleep(jittered_backoff(attempt)).await;
                    }
                }
            }
        }
        // Retries exhausted: the turn is no longer recoverable.
        Err(EngineError::Model(ModelError::Fatal(format!(
            "transient errors exhausted after {} attempts: {last_transient}",
            self.attempts
        ))))
    }
}

/// Full-jitter backoff: uniform in [0, base · 2^attempt], capped.
fn jittered_backoff(attempt: u32) -> Duration {
    let ceiling = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_CAP);
    let millis = ceiling.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

fn parse_delta(kind: AgentKind, text: &str) -> Option<StateDelta> {
    match kind {
        AgentKind::Analyser => parse_analysis(text).map(StateDelta::Analysis),
        AgentKind::Researcher => parse_findings(text).map(StateDelta::Findings),
        AgentKind::Drafter => clean_prose(text).map(StateDelta::Draft),
        AgentKind::Critic => parse_verdict(text).map(StateDelta::Critique),
        AgentKind::Formatter => clean_prose(text).map(StateDelta::Formatted),
    }
}

fn summarise(delta: &StateDelta) -> String {
    match delta {
        StateDelta::Analysis(report) => format!(
            "analysis complete (complexity: {}, needs external info: {})",
            if report.complexity.is_empty() {
                "unspecified"
            } else {
                &report.complexity
            },
            report.needs_external_info
        ),
        StateDelta::Findings(findings) => {
            format!("research noted {} useful sources", findings.useful_sources.len())
        }
        StateDelta::Draft(text) => format!("draft produced ({} chars)", text.len()),
        StateDelta::Critique(verdict) => format!(
            "critic verdict: {}",
            if verdict.is_accept() { "accept" } else { "revise" }
        ),
        StateDelta::Formatted(text) => format!("formatting applied ({} chars)", text.len()),
    }
}

/// Top retrieval items rendered for the prompt, redacted query included
/// upstream. At most five excerpts.
fn context_block(state: &RunState) -> String {
    let mut out = String::new();
    if let Some(record) = state.retrievals.last() {
        for hit in record.hits.iter().take(5) {
            out.push_str(&format!("[{}] {}\n", hit.source_id, hit.excerpt));
        }
    }
    if out.is_empty() {
        out.push_str("(sem contexto recuperado)");
    }
    out
}

fn working_block(state: &RunState, kind: AgentKind) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(analysis) = &state.working.analysis {
        if let Ok(json) = serde_json::to_string(&analysis.value) {
            parts.push(format!("Análise: {json}"));
        }
    }

    match kind {
        AgentKind::Critic | AgentKind::Formatter => {
            if let Some(draft) = &state.working.draft {
                parts.push(format!("Rascunho (v{}):\n{}", draft.version, draft.value));
            }
        }
        AgentKind::Drafter => {
            if let Some(assessment) = state.working.assessments.last() {
                parts.push(format!(
                    "Revisão anterior: {}\nSugestões: {}",
                    assessment.verdict.report,
                    assessment.verdict.suggestions.join("; ")
                ));
            }
            if let Some(draft) = &state.working.draft {
                parts.push(format!("Rascunho anterior:\n{}", draft.value));
            }
            if let Some(findings) = &state.working.findings {
                parts.push(format!("Pesquisa: {}", findings.value.summary));
            }
        }
        _ => {}
    }

    if parts.is_empty() {
        "(nenhum)".to_string()
    } else {
        parts.join("\n\n")
    }
}
