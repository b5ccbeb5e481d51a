//! The engine boundary: request validation, run admission, and the
//! feedback/audit read paths.
//!
//! `Engine` wires the subsystems together the way a host would: external
//! collaborators (embedding service, indexes, model provider, stores) come
//! in as trait objects, everything else is built here. Runs execute on a
//! bounded worker pool; the queue is bounded too, and overflow is a client
//! error at ingress.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{AgentRuntime, PromptLibrary};
use crate::audit::{AuditRecord, AuditRecorder, AuditStore, InMemoryAuditStore, VerificationEntry};
use crate::config::{EngineConfig, RunOptions};
use crate::error::{EngineError, Result};
use crate::executor::{CancelToken, GraphExecutor};
use crate::feedback::{
    FeedbackEvent, FeedbackIntake, FeedbackRequest, FeedbackStore, FeedbackSummary,
    InMemoryFeedbackStore,
};
use crate::llm::{ModelCatalog, ModelClient};
use crate::pii::{self, PiiDetector, PiiReport};
use crate::policy::{PolicyCache, PolicySet};
use crate::retrieval::personalize::CentroidStore;
use crate::retrieval::types::Origin;
use crate::retrieval::{Embedder, Federator, FederatorConfig, FederatorStats, LexicalIndex, VectorIndex};
use crate::state::{Budget, ExternalDocument, RunError, RunState, RunStatus, TaskKind, WorkingSet};
use crate::tools::{
    CannedJurisprudence, DocumentAnalyseTool, FormatCitationTool, JurisprudenceProvider,
    JurisprudenceSearchTool, QualityScoreTool, RetrieveTool, ToolRegistry,
};

const MAX_QUERY_BYTES: usize = 32 * 1024;
const MAX_EXTERNAL_DOCS: usize = 10;
const MAX_DOC_BYTES: usize = 512 * 1024;
const MAX_AGGREGATE_BYTES: usize = 2 * 1024 * 1024;

/// One submit-run request as it arrives from the edge. Identities are
/// trusted inputs; authentication happens upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub query: String,
    pub task: TaskKind,
    pub tenant_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub external_docs: Vec<ExternalDocument>,
    #[serde(default)]
    pub options: RunOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSummary {
    pub total: usize,
    pub internal: usize,
    pub external: usize,
    pub personalisation_applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumedSource {
    pub source_id: String,
    pub rank: u32,
    pub fused_score: f32,
}

/// What the caller gets back. Failed runs still carry the run id so the
/// caller can correlate with the audit record; no internal detail beyond
/// the machine-readable kind and cause crosses this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub final_text: Option<String>,
    pub document_type: String,
    pub context: ContextSummary,
    pub external_sources: Vec<ConsumedSource>,
    pub duration_ms: u64,
    pub error: Option<RunError>,
}

/// Builder over the external collaborators the engine cannot provide
/// itself.
pub struct EngineBuilder {
    cfg: EngineConfig,
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    model: Arc<dyn ModelClient>,
    jurisprudence: Arc<dyn JurisprudenceProvider>,
    audit_store: Arc<dyn AuditStore>,
    feedback_store: Arc<dyn FeedbackStore>,
    catalog: ModelCatalog,
}

impl EngineBuilder {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            cfg: EngineConfig::default(),
            embedder,
            vector,
            lexical,
            model,
            jurisprudence: Arc::new(CannedJurisprudence),
            audit_store: Arc::new(InMemoryAuditStore::new()),
            feedback_store: Arc::new(InMemoryFeedbackStore::new()),
            catalog: ModelCatalog::default(),
        }
    }

    pub fn with_config(mut self, cfg: EngineConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_jurisprudence(mut self, provider: Arc<dyn JurisprudenceProvider>) -> Self {
        self.jurisprudence = provider;
        self
    }

    pub fn with_audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = store;
        self
    }

    pub fn with_feedback_store(mut self, store: Arc<dyn FeedbackStore>) -> Self {
        self.feedback_store = store;
        self
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn build(self) -> Engine {
        let centroids = Arc::new(CentroidStore::new(self.cfg.centroid_ttl));
        let federator = Arc::new(Federator::new(
            self.embedder,
            self.vector,
            self.lexical,
            Arc::clone(&centroids),
            FederatorConfig {
                k_rrf: 60,
                hard_ceiling: self.cfg.k_hard_ceiling,
                leg_timeout: self.cfg.leg_timeout,
                external_embed_limit: 1_000,
            },
        ));

        let tools = Arc::new(ToolRegistry::new(self.cfg.tool_timeout));
        tools.register(Arc::new(RetrieveTool::new(Arc::clone(&federator))));
        tools.register(Arc::new(JurisprudenceSearchTool::new(self.jurisprudence)));
        tools.register(Arc::new(FormatCitationTool));
        tools.register(Arc::new(QualityScoreTool::new()));
        tools.register(Arc::new(DocumentAnalyseTool::new()));

        let prompts = Arc::new(PromptLibrary::new());
        let runtime = AgentRuntime::new(
            self.model,
            self.catalog,
            Arc::clone(&prompts),
            self.cfg.model_attempts,
            self.cfg.per_turn_timeout,
        );

        let recorder = AuditRecorder::new(Arc::clone(&self.audit_store));
        let executor = Arc::new(GraphExecutor::new(
            runtime,
            Arc::clone(&tools),
            recorder,
            self.cfg.max_revisions,
        ));

        Engine {
            pool: Arc::new(Semaphore::new(self.cfg.pool_size)),
            waiting: AtomicUsize::new(0),
            detector: PiiDetector::new(),
            policy_cache: Arc::new(PolicyCache::new()),
            federator,
            tools,
            prompts,
            executor,
            recorder: AuditRecorder::new(Arc::clone(&self.audit_store)),
            feedback: FeedbackIntake::new(
                Arc::clone(&self.audit_store),
                self.feedback_store,
            ),
            audit_store: self.audit_store,
            cancels: DashMap::new(),
            cfg: self.cfg,
        }
    }
}

pub struct Engine {
    cfg: EngineConfig,
    pool: Arc<Semaphore>,
    waiting: AtomicUsize,
    detector: PiiDetector,
    policy_cache: Arc<PolicyCache>,
    federator: Arc<Federator>,
    tools: Arc<ToolRegistry>,
    prompts: Arc<PromptLibrary>,
    executor: Arc<GraphExecutor>,
    recorder: AuditRecorder,
    feedback: FeedbackIntake,
    audit_store: Arc<dyn AuditStore>,
    cancels: DashMap<Uuid, CancelToken>,
}

impl Engine {
    pub fn builder(
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        model: Arc<dyn ModelClient>,
    ) -> EngineBuilder {
        EngineBuilder::new(embedder, vector, lexical, model)
    }

    pub fn policy_cache(&self) -> &Arc<PolicyCache> {
        &self.policy_cache
    }

    pub fn federator(&self) -> &Arc<Federator> {
        &self.federator
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn prompts(&self) -> &Arc<PromptLibrary> {
        &self.prompts
    }

    /// Publish a tenant policy set; runs started after this observe it.
    pub async fn publish_policy(&self, set: PolicySet) {
        self.policy_cache.publish(set).await;
    }

    /// Submit a run and wait for its terminal state.
    ///
    /// `Err` means the request never became a run (validation or capacity);
    /// every other failure terminates through the executor and comes back
    /// as a `RunResponse` with a failed status, so the caller always has a
    /// run id to correlate with the audit record.
    pub async fn submit(&self, request: RunRequest) -> Result<RunResponse> {
        validate(&request)?;

        // Bounded admission queue in front of the worker pool.
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= self.cfg.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            warn!(target: "engine", tenant = %request.tenant_id, "Run queue is full");
            return Err(EngineError::InputInvalid(
                "run queue is full; retry later".to_string(),
            ));
        }
        let permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::InputInvalid("engine is shutting down".to_string()))?;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let state = self.admit(request).await;
        let run_id = state.run_id;
        let document_type = state.document_type.clone();

        let cancel = CancelToken::new();
        self.cancels.insert(run_id, cancel.clone());
        let result = self.executor.execute(state, cancel).await;
        self.cancels.remove(&run_id);
        drop(permit);

        let state = result.state;
        let last_retrieval = state.retrievals.last();
        let context = ContextSummary {
            total: last_retrieval.map(|r| r.hits.len()).unwrap_or(0),
            internal: last_retrieval.map(|r| r.internal_count()).unwrap_or(0),
            external: last_retrieval.map(|r| r.external_count()).unwrap_or(0),
            personalisation_applied: last_retrieval
                .map(|r| r.fusion.personalisation_applied)
                .unwrap_or(false),
        };
        let external_sources = last_retrieval
            .map(|record| {
                record
                    .hits
                    .iter()
                    .filter(|h| matches!(h.origin, Origin::External | Origin::Both))
                    .map(|h| ConsumedSource {
                        source_id: h.source_id.clone(),
                        rank: h.rank,
                        fused_score: h.fused_score,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(RunResponse {
            run_id,
            status: state.status,
            final_text: result.final_text,
            document_type,
            context,
            external_sources,
            duration_ms: state.elapsed().as_millis() as u64,
            error: state.error,
        })
    }

    /// Run ids currently in flight.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.cancels.iter().map(|entry| *entry.key()).collect()
    }

    /// Signal cooperative cancellation to an in-flight run.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancels.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn submit_feedback(&self, request: FeedbackRequest) -> Result<FeedbackEvent> {
        self.feedback.submit(request).await
    }

    pub async fn feedback_summary(&self, run_id: Uuid) -> Result<FeedbackSummary> {
        self.feedback.summary(run_id).await
    }

    /// Read an audit record; the read itself is access-logged.
    pub async fn audit_record(
        &self,
        run_id: Uuid,
        reader_id: &str,
        reason: &str,
    ) -> Result<Option<AuditRecord>> {
        self.audit_store
            .fetch(run_id, reader_id, reason)
            .await
            .map_err(|e| EngineError::AuditWriteFailed(e.to_string()))
    }

    /// Recompute digests for a sealed record and append to its
    /// verification history.
    pub async fn verify_audit(
        &self,
        run_id: Uuid,
        final_text: &str,
        reader_id: &str,
    ) -> Result<VerificationEntry> {
        self.recorder
            .verify(run_id, final_text, reader_id)
            .await
            .map_err(|e| EngineError::AuditWriteFailed(e.to_string()))
    }

    pub async fn retrieval_stats(&self, tenant_id: &str) -> FederatorStats {
        self.federator.stats(tenant_id).await
    }

    /// Turn an accepted request into the initial run state: policy snapshot
    /// captured, query and external documents redacted, budgets resolved.
    async fn admit(&self, request: RunRequest) -> RunState {
        let options = request.options.normalise(&self.cfg);
        let snapshot = self.policy_cache.snapshot(&request.tenant_id).await;

        let mut pii_report = PiiReport::default();
        let (redacted_query, query_detections) =
            pii::redact(&self.detector, &request.query, options.pii_strategy);
        pii_report.extend(query_detections);

        // External documents are immutable once accepted; what the run
        // accepts is the redacted view, so raw PII never reaches prompts,
        // excerpts or the audit trail.
        let external_docs: Vec<ExternalDocument> = request
            .external_docs
            .into_iter()
            .map(|doc| {
                let (text, detections) =
                    pii::redact(&self.detector, &doc.text, options.pii_strategy);
                pii_report.extend(detections);
                ExternalDocument {
                    source_id: doc.source_id,
                    text,
                    metadata: doc.metadata,
                }
            })
            .collect();

        let budget = Budget {
            max_iterations: options.max_iterations,
            deadline: options.deadline(),
            cost_ceiling_micros: options.cost_ceiling_micros(&self.cfg),
        };

        let state = RunState {
            run_id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            task: request.task,
            document_type: options.document_type.clone(),
            started_at: Utc::now(),
            query: request.query,
            redacted_query,
            external_docs,
            options,
            working: WorkingSet::default(),
            trace: Vec::new(),
            retrievals: Vec::new(),
            policy: snapshot,
            policy_annotations: Vec::new(),
            pii: pii_report,
            budget,
            iterations: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_micros: 0,
            status: RunStatus::Pending,
            error: None,
            sources_consumed: Default::default(),
        };

        info!(
            target: "engine",
            run_id = %state.run_id,
            tenant = %state.tenant_id,
            task = state.task.as_str(),
            external_docs = state.external_docs.len(),
            pii_detections = state.pii.total(),
            "Run admitted"
        );

        state
    }
}

fn validate(request: &RunRequest) -> Result<()> {
    if request.query.trim().is_empty() {
        return Err(EngineError::InputInvalid("query must not be empty".into()));
    }
    if request.query.len() > MAX_QUERY_BYTES {
        return Err(EngineError::InputInvalid(format!(
            "query exceeds {MAX_QUERY_BYTES} bytes"
        )));
    }
    if request.tenant_id.trim().is_empty() {
        return Err(EngineError::InputInvalid("tenant id must not be empty".into()));
    }
    if request.external_docs.len() > MAX_EXTERNAL_DOCS {
        return Err(EngineError::InputInvalid(format!(
            "at most {MAX_EXTERNAL_DOCS} external documents are accepted"
        )));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut aggregate = 0usize;
    for doc in &request.external_docs {
        if doc.source_id.trim().is_empty() {
            return Err(EngineError::InputInvalid(
                "external document source id must not be empty".into(),
            ));
        }
        if !seen.insert(doc.source_id.as_str()) {
            return Err(EngineError::InputInvalid(format!(
                "duplicate external source id '{}'",
                doc.source_id
            )));
        }
        if doc.text.len() > MAX_DOC_BYTES {
            return Err(EngineError::InputInvalid(format!(
                "external document '{}' exceeds {MAX_DOC_BYTES} bytes",
                doc.source_id
            )));
        }
        aggregate += doc.text.len();
    }
    if aggregate > MAX_AGGREGATE_BYTES {
        return Err(EngineError::InputInvalid(format!(
            "external documents exceed {MAX_AGGREGATE_BYTES} aggregate bytes"
        )));
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RunRequest {
        RunRequest {
            query: "resumo de obrigações contratuais".into(),
            task: TaskKind::Draft,
            tenant_id: "T1".into(),
            user_id: None,
            external_docs: vec![],
            options: RunOptions::default(),
        }
    }

    #[test]
    fn empty_query_is_rejected() {
        let mut req = request();
        req.query = "   ".into();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn oversized_query_is_rejected() {
        let mut req = request();
        req.query = "x".repeat(MAX_QUERY_BYTES + 1);
        assert!(validate(&req).is_err());
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let mut req = request();
        req.external_docs = vec![
            ExternalDocument {
                source_id: "a".into(),
                text: "um".into(),
                metadata: Default::default(),
            },
            ExternalDocument {
                source_id: "a".into(),
                text: "dois".into(),
                metadata: Default::default(),
            },
        ];
        assert!(validate(&req).is_err());
    }

    #[test]
    fn document_count_and_size_limits_hold() {
        let mut req = request();
        req.external_docs = (0..11)
            .map(|i| ExternalDocument {
                source_id: format!("d{i}"),
                text: "texto".into(),
                metadata: Default::default(),
            })
            .collect();
        assert!(validate(&req).is_err());

        let mut req = request();
        req.external_docs = vec![ExternalDocument {
            source_id: "big".into(),
            text: "x".repeat(MAX_DOC_BYTES + 1),
            metadata: Default::default(),
        }];
        assert!(validate(&req).is_err());
    }

    #[test]
    fn aggregate_size_limit_holds() {
        let mut req = request();
        req.external_docs = (0..5)
            .map(|i| ExternalDocument {
                source_id: format!("d{i}"),
                text: "x".repeat(450 * 1024),
                metadata: Default::default(),
            })
            .collect();
        assert!(validate(&req).is_err());
    }
}
