//! Boundary behaviours: zero-k retrieval, model failure, audit write
//! failure, cancellation and replay determinism.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chancery_core::audit::{
    AccessLogEntry, AuditError, AuditRecord, AuditStore, InMemoryAuditStore, VerificationEntry,
};
use chancery_core::llm::{ModelClient, ModelError, ModelRequest, ModelResponse, TokenUsage};
use chancery_core::retrieval::{Embedder, LexicalIndex, VectorIndex};
use chancery_core::{Engine, RunOptions, RunRequest, RunStatus, TaskKind};
use uuid::Uuid;

use common::{engine_with, CountingEmbedder, FixedLexical, FixedVector, ScriptedModel};

fn draft_request() -> RunRequest {
    RunRequest {
        query: "resumo de obrigações contratuais".to_string(),
        task: TaskKind::Draft,
        tenant_id: "T1".to_string(),
        user_id: None,
        external_docs: vec![],
        options: RunOptions::default(),
    }
}

#[tokio::test]
async fn k_zero_performs_no_network_calls() {
    let t = engine_with(ScriptedModel::new(vec!["accept"]));
    let mut request = draft_request();
    request.options.k_total = 0;

    let resp = t.engine.submit(request).await.unwrap();
    assert_eq!(resp.status, RunStatus::Succeeded);
    assert_eq!(resp.context.total, 0);

    assert_eq!(t.embedder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(t.vector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(t.lexical.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_model_attempts_fail_the_run_with_sealed_audit() {
    let t = engine_with(ScriptedModel::failing());
    let resp = t.engine.submit(draft_request()).await.unwrap();

    assert_eq!(resp.status, RunStatus::Failed);
    assert_eq!(resp.error.as_ref().unwrap().kind, "model_fatal");
    assert!(resp.final_text.is_none());

    let audit = t
        .engine
        .audit_record(resp.run_id, "test", "boundary assertion")
        .await
        .unwrap()
        .expect("audit sealed even though every model attempt failed");
    assert!(!audit.success);
    // The aborted turn is on the trace with its error.
    assert!(audit.trace.iter().any(|turn| turn.error.is_some()));
}

struct RejectingAuditStore {
    inner: InMemoryAuditStore,
}

#[async_trait]
impl AuditStore for RejectingAuditStore {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        Err(AuditError::Storage(format!(
            "refusing to persist run {}",
            record.run_id
        )))
    }

    async fn fetch(
        &self,
        run_id: Uuid,
        reader_id: &str,
        reason: &str,
    ) -> Result<Option<AuditRecord>, AuditError> {
        self.inner.fetch(run_id, reader_id, reason).await
    }

    async fn access_log(&self, run_id: Uuid) -> Result<Vec<AccessLogEntry>, AuditError> {
        self.inner.access_log(run_id).await
    }

    async fn append_verification(
        &self,
        run_id: Uuid,
        entry: VerificationEntry,
    ) -> Result<(), AuditError> {
        self.inner.append_verification(run_id, entry).await
    }

    async fn verifications(&self, run_id: Uuid) -> Result<Vec<VerificationEntry>, AuditError> {
        self.inner.verifications(run_id).await
    }
}

#[tokio::test]
async fn audit_write_failure_withholds_the_document() {
    let embedder = CountingEmbedder::new();
    let vector = FixedVector::new(vec![common::hit("doc-a", 1)]);
    let lexical = FixedLexical::new(vec![]);
    let model = ScriptedModel::new(vec!["accept"]);

    let engine = Engine::builder(
        embedder as Arc<dyn Embedder>,
        vector as Arc<dyn VectorIndex>,
        lexical as Arc<dyn LexicalIndex>,
        model as Arc<dyn ModelClient>,
    )
    .with_audit_store(Arc::new(RejectingAuditStore {
        inner: InMemoryAuditStore::new(),
    }))
    .build();

    let resp = engine.submit(draft_request()).await.unwrap();
    // Generation succeeded, but without a sealed record no text leaves.
    assert_eq!(resp.status, RunStatus::Failed);
    assert_eq!(resp.error.as_ref().unwrap().kind, "audit_write_failed");
    assert!(resp.final_text.is_none());
}

#[tokio::test]
async fn identical_inputs_and_outputs_replay_identically() {
    let first = engine_with(ScriptedModel::new(vec!["revise", "accept"]));
    let second = engine_with(ScriptedModel::new(vec!["revise", "accept"]));

    let a = first.engine.submit(draft_request()).await.unwrap();
    let b = second.engine.submit(draft_request()).await.unwrap();

    let audit_a = first
        .engine
        .audit_record(a.run_id, "test", "replay")
        .await
        .unwrap()
        .unwrap();
    let audit_b = second
        .engine
        .audit_record(b.run_id, "test", "replay")
        .await
        .unwrap()
        .unwrap();

    let agents =
        |r: &AuditRecord| r.trace.iter().map(|t| t.agent).collect::<Vec<_>>();
    assert_eq!(agents(&audit_a), agents(&audit_b));
    assert_eq!(audit_a.output_hash, audit_b.output_hash);
    assert_eq!(audit_a.input_hash, audit_b.input_hash);
    assert_eq!(audit_a.context_hash, audit_b.context_hash);
}

struct StallingModel;

#[async_trait]
impl ModelClient for StallingModel {
    async fn generate(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ModelResponse {
            text: "{}".to_string(),
            model: req.model.clone(),
            usage: TokenUsage::default(),
        })
    }
}

#[tokio::test]
async fn cancellation_terminates_cooperatively_and_seals_audit() {
    let embedder = CountingEmbedder::new();
    let vector = FixedVector::new(vec![common::hit("doc-a", 1)]);
    let lexical = FixedLexical::new(vec![]);

    let engine = Arc::new(
        Engine::builder(
            embedder as Arc<dyn Embedder>,
            vector as Arc<dyn VectorIndex>,
            lexical as Arc<dyn LexicalIndex>,
            Arc::new(StallingModel) as Arc<dyn ModelClient>,
        )
        .build(),
    );

    let worker = Arc::clone(&engine);
    let handle = tokio::spawn(async move { worker.submit(draft_request()).await });

    // Wait for the run to register, then signal cancellation.
    let mut run_id = None;
    for _ in 0..100 {
        if let Some(id) = engine.active_runs().first().copied() {
            run_id = Some(id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let run_id = run_id.expect("run became active");
    assert!(engine.cancel(run_id));

    let resp = handle.await.unwrap().unwrap();
    assert_eq!(resp.run_id, run_id);
    assert_eq!(resp.status, RunStatus::Cancelled);
    assert!(resp.final_text.is_none());

    let audit = engine
        .audit_record(run_id, "test", "boundary assertion")
        .await
        .unwrap()
        .expect("cancelled runs still seal an audit record");
    assert_eq!(audit.status, RunStatus::Cancelled);
}
