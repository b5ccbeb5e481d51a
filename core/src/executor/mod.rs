//! The graph executor (supervisor).
//!
//! Owns the run state and drives a run to termination: consults policy at
//! the named checkpoints, fetches context through the tool registry, routes
//! agent turns off the routing function, enforces the three budgets,
//! observes cooperative cancellation and hands the terminated state to the
//! audit recorder. No document leaves without a sealed record.

pub mod router;

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agents::{AgentRuntime, StateDelta};
use crate::audit::{AuditRecord, AuditRecorder};
use crate::error::{EngineError, Result};
use crate::policy::{self, Checkpoint, PolicyDecision};
use crate::retrieval::types::RetrievalRecord;
use crate::state::{AgentKind, RunError, RunState, RunStatus, TurnRecord};
use crate::tools::ToolRegistry;

/// Cooperative cancellation signal, observed between turns and at every
/// suspension point inside retrieval and model calls.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// What `execute` hands back to the engine boundary.
pub struct ExecutionResult {
    pub state: RunState,
    pub record: Option<AuditRecord>,
    /// Present only when the terminal status permits emitting a document.
    pub final_text: Option<String>,
}

pub struct GraphExecutor {
    runtime: AgentRuntime,
    tools: Arc<ToolRegistry>,
    recorder: AuditRecorder,
    max_revisions: u32,

    runs_started: Counter<u64>,
    runs_completed: Counter<u64>,
    run_duration: Histogram<f64>,
}

impl GraphExecutor {
    pub fn new(
        runtime: AgentRuntime,
        tools: Arc<ToolRegistry>,
        recorder: AuditRecorder,
        max_revisions: u32,
    ) -> Self {
        let meter = global::meter("chancery.executor");

        let runs_started = meter
            .u64_counter("chancery.executor.runs_started")
            .with_description("Runs accepted by the executor")
            .init();

        let runs_completed = meter
            .u64_counter("chancery.executor.runs_completed")
            .with_description("Runs reaching a terminal status")
            .init();

        let run_duration = meter
            .f64_histogram("chancery.executor.run_duration_ms")
            .with_description("Wall-clock run duration in milliseconds")
            .init();

        Self {
            runtime,
            tools,
            recorder,
            max_revisions,
            runs_started,
            runs_completed,
            run_duration,
        }
    }

    /// Drive a run to termination and seal its audit record.
    pub async fn execute(&self, mut state: RunState, cancel: CancelToken) -> ExecutionResult {
        let started = Instant::now();
        self.runs_started.add(1, &[]);
        state.status = RunStatus::Running;

        info!(
            target: "executor",
            run_id = %state.run_id,
            tenant = %state.tenant_id,
            task = state.task.as_str(),
            "Run started"
        );

        let outcome = self.drive(&mut state, &cancel).await;

        let (status, run_error) = match &outcome {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(EngineError::BudgetExhausted(breach)) => (
                RunStatus::BudgetExhausted,
                Some(RunError {
                    kind: "budget_exhausted".to_string(),
                    cause: breach.to_string(),
                }),
            ),
            Err(EngineError::Cancelled) => (
                RunStatus::Cancelled,
                Some(RunError {
                    kind: "cancelled".to_string(),
                    cause: "cooperative cancellation observed".to_string(),
                }),
            ),
            Err(e) => (
                RunStatus::Failed,
                Some(RunError {
                    kind: e.kind().to_string(),
                    cause: e.to_string(),
                }),
            ),
        };

        let final_text = match status {
            RunStatus::Succeeded | RunStatus::BudgetExhausted => {
                state.best_text().map(String::from)
            }
            _ => None,
        };

        // Seal before committing the terminal status: a run only becomes
        // `succeeded` once its record exists.
        let sealed = self
            .recorder
            .seal(&state, status, final_text.as_deref(), run_error.clone())
            .await;

        let result = match sealed {
            Ok(record) => {
                state.status = status;
                state.error = run_error;
                ExecutionResult {
                    state,
                    record: Some(record),
                    final_text,
                }
            }
            Err(e) => {
                state.fail("audit_write_failed", e.to_string());
                ExecutionResult {
                    state,
                    record: None,
                    final_text: None,
                }
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.run_duration.record(elapsed_ms, &[]);
        self.runs_completed.add(
            1,
            &[KeyValue::new(
                "status",
                format!("{:?}", result.state.status).to_lowercase(),
            )],
        );

        info!(
            target: "executor",
            run_id = %result.state.run_id,
            status = ?result.state.status,
            iterations = result.state.iterations,
            cost_micros = result.state.cost_micros,
            "Run terminated"
        );

        result
    }

    async fn drive(&self, state: &mut RunState, cancel: &CancelToken) -> Result<()> {
        self.checkpoint(state, Checkpoint::OnIngest)?;

        // Initial context fetch: the executor asks the federator (through
        // the registry) before the first agent turn whenever there is
        // anything to search.
        if state.options.use_internal_rag || !state.external_docs.is_empty() {
            self.run_retrieval(state, cancel, false).await?;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            if let Some(breach) = state.budget_breach() {
                warn!(target: "executor", run_id = %state.run_id, breach = %breach, "Budget breached");
                if state.working.formatted.is_none() && state.working.draft.is_some() {
                    self.best_effort_format(state, cancel).await;
                }
                return Err(EngineError::BudgetExhausted(breach));
            }

            let Some(next) = router::route(state, self.max_revisions) else {
                self.checkpoint(state, Checkpoint::BeforeEmit)?;
                self.checkpoint(state, Checkpoint::OnExport)?;
                return Ok(());
            };

            // The researcher's job starts with an actual retrieval pass
            // when none happened yet (e.g. internal RAG disabled).
            if next == AgentKind::Researcher && state.retrievals.is_empty() {
                self.run_retrieval(state, cancel, true).await?;
            }

            self.checkpoint(state, Checkpoint::BeforeModelCall)?;

            state.status = RunStatus::AwaitingModel;
            let turn = self.runtime.run_turn(state, next, cancel).await;
            state.status = RunStatus::Running;

            match turn {
                Ok(outcome) => {
                    apply_delta(state, outcome.delta);
                    state.record_turn(outcome.record);
                    state.cost_micros += outcome.cost_micros;
                    state.iterations += 1;
                }
                Err(e) => {
                    state.record_turn(TurnRecord {
                        agent: next,
                        model: String::new(),
                        tokens_in: 0,
                        tokens_out: 0,
                        duration_ms: 0,
                        summary: "turn aborted".to_string(),
                        error: Some(e.to_string()),
                    });
                    return Err(e);
                }
            }
        }
    }

    /// One federated search through the `retrieve` tool. With `required`
    /// set, an all-legs failure without caller documents fails the run;
    /// otherwise it is recorded and the run proceeds on whatever is left.
    async fn run_retrieval(
        &self,
        state: &mut RunState,
        cancel: &CancelToken,
        required: bool,
    ) -> Result<()> {
        self.checkpoint(state, Checkpoint::BeforeRetrieval)?;

        let args = json!({
            "query": state.redacted_query,
            "tenant_id": state.tenant_id,
            "k": state.options.k_total,
            "use_internal": state.options.use_internal_rag,
            "personalise": state.options.enable_personalisation,
            "alpha": state.options.personalisation_alpha,
            "external_docs": state.external_docs,
        });

        state.status = RunStatus::AwaitingTool;
        // Recoverable tool errors get one retry, per tool policy.
        let mut result = tokio::select! {
            r = self.tools.call("retrieve", args.clone()) => r,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        if matches!(&result, Err(e) if e.recoverable()) {
            warn!(target: "executor", run_id = %state.run_id, "Retrieval tool error was recoverable; retrying once");
            result = tokio::select! {
                r = self.tools.call("retrieve", args) => r,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            };
        }
        state.status = RunStatus::Running;

        let value = result.map_err(EngineError::Tool)?;
        let record: RetrievalRecord =
            serde_json::from_value(value["record"].clone()).map_err(|e| {
                EngineError::RetrievalFailed(format!("malformed retrieval record: {e}"))
            })?;
        let failed = value["failed"].as_bool().unwrap_or(false);

        for hit in &record.hits {
            state.sources_consumed.insert(hit.source_id.clone());
        }
        state.retrievals.push(record);

        if failed && required && state.external_docs.is_empty() {
            return Err(EngineError::RetrievalFailed(
                "all retrieval legs failed and no external documents were supplied".to_string(),
            ));
        }
        Ok(())
    }

    /// Final formatter pass over the best available draft after a budget
    /// breach. Does not count as an iteration; failure keeps the raw draft.
    async fn best_effort_format(&self, state: &mut RunState, cancel: &CancelToken) {
        if self.checkpoint(state, Checkpoint::BeforeModelCall).is_err() {
            return;
        }
        match self.runtime.run_turn(state, AgentKind::Formatter, cancel).await {
            Ok(outcome) => {
                apply_delta(state, outcome.delta);
                state.record_turn(outcome.record);
                state.cost_micros += outcome.cost_micros;
            }
            Err(e) => {
                warn!(
                    target: "executor",
                    run_id = %state.run_id,
                    error = %e,
                    "Best-effort formatting failed; emitting the raw draft"
                );
            }
        }
    }

    fn checkpoint(&self, state: &mut RunState, checkpoint: Checkpoint) -> Result<()> {
        let ctx = policy_context(state, checkpoint);
        match policy::evaluate(&state.policy, checkpoint, &ctx) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::AnnotateAndContinue(rule_ids) => {
                for rule_id in rule_ids {
                    if !state.policy_annotations.contains(&rule_id) {
                        state.policy_annotations.push(rule_id);
                    }
                }
                Ok(())
            }
            // Ingress redaction is unconditional, so a redact decision at a
            // later checkpoint is already satisfied; acknowledge it.
            PolicyDecision::RedactThenContinue { rule_id } => {
                if !state.policy_annotations.contains(&rule_id) {
                    state.policy_annotations.push(rule_id);
                }
                Ok(())
            }
            PolicyDecision::RequireHumanReview { rule_id } => Err(EngineError::PolicyDeny {
                rule_id,
                reason: "human review required before continuing".to_string(),
            }),
            PolicyDecision::Deny { rule_id, reason } => {
                Err(EngineError::PolicyDeny { rule_id, reason })
            }
        }
    }
}

fn apply_delta(state: &mut RunState, delta: StateDelta) {
    match delta {
        StateDelta::Analysis(report) => state.working.set_analysis(report, AgentKind::Analyser),
        StateDelta::Findings(findings) => {
            state.working.set_findings(findings, AgentKind::Researcher)
        }
        StateDelta::Draft(text) => state.working.set_draft(text, AgentKind::Drafter),
        StateDelta::Critique(verdict) => state.working.push_assessment(verdict),
        StateDelta::Formatted(text) => state.working.set_formatted(text, AgentKind::Formatter),
    }
}

fn policy_context(state: &RunState, checkpoint: Checkpoint) -> Map<String, Value> {
    let mut ctx = Map::new();
    ctx.insert("tenant_id".to_string(), json!(state.tenant_id));
    ctx.insert("task".to_string(), json!(state.task.as_str()));
    ctx.insert("checkpoint".to_string(), json!(checkpoint.as_str()));
    ctx.insert("document_type".to_string(), json!(state.document_type));
    ctx.insert("pii_detected".to_string(), json!(state.pii.total() > 0));
    ctx.insert("pii_count".to_string(), json!(state.pii.total()));
    ctx.insert("iteration".to_string(), json!(state.iterations));
    ctx.insert(
        "has_draft".to_string(),
        json!(state.working.draft.is_some()),
    );
    ctx
}
