//! Forensic audit: sealing, storage and integrity verification.
//!
//! One record per terminated run, append-only. Every read of a record
//! leaves an access-log entry; integrity verifications accumulate on the
//! record's history rather than mutating it. A run whose record cannot be
//! written fails regardless of how the generation went.

pub mod canon;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pii::PiiReport;
use crate::policy::PolicySnapshot;
use crate::state::{RunError, RunState, RunStatus, TaskKind, TurnRecord};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit record for run {0} already sealed")]
    AlreadySealed(Uuid),
    #[error("audit record for run {0} not found")]
    NotFound(Uuid),
    #[error("audit storage error: {0}")]
    Storage(String),
}

/// Immutable forensic record of one terminated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub task: TaskKind,
    pub document_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub success: bool,
    pub error: Option<RunError>,

    pub input_hash: String,
    pub output_hash: String,
    pub context_hash: String,

    pub trace: Vec<TurnRecord>,
    pub policy: PolicySnapshot,
    pub pii: PiiReport,
    pub sources_used: Vec<String>,

    pub iterations: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_micros: u64,
}

/// Append-only log entry for one read of an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub run_id: Uuid,
    pub reader_id: String,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// One integrity check bound to the record's digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEntry {
    pub at: DateTime<Utc>,
    pub output_hash_ok: bool,
    pub context_hash_ok: bool,
}

/// Persistence boundary for audit records. Writes are append-only; updates
/// do not exist in the interface.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// Fetch a record, leaving an access-log entry.
    async fn fetch(
        &self,
        run_id: Uuid,
        reader_id: &str,
        reason: &str,
    ) -> Result<Option<AuditRecord>, AuditError>;

    async fn access_log(&self, run_id: Uuid) -> Result<Vec<AccessLogEntry>, AuditError>;

    async fn append_verification(
        &self,
        run_id: Uuid,
        entry: VerificationEntry,
    ) -> Result<(), AuditError>;

    async fn verifications(&self, run_id: Uuid) -> Result<Vec<VerificationEntry>, AuditError>;
}

/// In-process store used by tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: RwLock<HashMap<Uuid, AuditRecord>>,
    access: RwLock<Vec<AccessLogEntry>>,
    verifications: RwLock<HashMap<Uuid, Vec<VerificationEntry>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.run_id) {
            return Err(AuditError::AlreadySealed(record.run_id));
        }
        records.insert(record.run_id, record);
        Ok(())
    }

    async fn fetch(
        &self,
        run_id: Uuid,
        reader_id: &str,
        reason: &str,
    ) -> Result<Option<AuditRecord>, AuditError> {
        let record = self.records.read().await.get(&run_id).cloned();
        if record.is_some() {
            self.access.write().await.push(AccessLogEntry {
                run_id,
                reader_id: reader_id.to_string(),
                at: Utc::now(),
                reason: reason.to_string(),
            });
        }
        Ok(record)
    }

    async fn access_log(&self, run_id: Uuid) -> Result<Vec<AccessLogEntry>, AuditError> {
        Ok(self
            .access
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn append_verification(
        &self,
        run_id: Uuid,
        entry: VerificationEntry,
    ) -> Result<(), AuditError> {
        if !self.records.read().await.contains_key(&run_id) {
            return Err(AuditError::NotFound(run_id));
        }
        self.verifications
            .write()
            .await
            .entry(run_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn verifications(&self, run_id: Uuid) -> Result<Vec<VerificationEntry>, AuditError> {
        Ok(self
            .verifications
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Builds and seals audit records at run termination.
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Compute the three digests and write the record for a run reaching
    /// `status`. Returns the sealed record, or the storage error that makes
    /// the run fail.
    pub async fn seal(
        &self,
        state: &RunState,
        status: RunStatus,
        final_text: Option<&str>,
        error: Option<RunError>,
    ) -> Result<AuditRecord, AuditError> {
        debug_assert!(status.is_terminal());

        let input_hash = canon::input_hash(
            &state.query,
            &state.tenant_id,
            state.user_id.as_deref(),
            &state.options,
            state.budget.cost_ceiling_micros,
        );
        let output_hash = canon::output_hash(final_text.unwrap_or(""));
        let context_hash = canon::context_hash(state.sources_consumed.iter());

        let ended_at = Utc::now();
        let record = AuditRecord {
            run_id: state.run_id,
            tenant_id: state.tenant_id.clone(),
            user_id: state.user_id.clone(),
            task: state.task,
            document_type: state.document_type.clone(),
            started_at: state.started_at,
            ended_at,
            duration_ms: (ended_at - state.started_at).num_milliseconds().max(0) as u64,
            status,
            success: matches!(status, RunStatus::Succeeded | RunStatus::BudgetExhausted)
                && final_text.is_some(),
            error,
            input_hash,
            output_hash,
            context_hash,
            trace: state.trace.clone(),
            policy: state.policy.clone(),
            pii: state.pii.clone(),
            sources_used: state.sources_consumed.iter().cloned().collect(),
            iterations: state.iterations,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            cost_micros: state.cost_micros,
        };

        match self.store.append(record.clone()).await {
            Ok(()) => {
                info!(
                    target: "audit",
                    run_id = %record.run_id,
                    tenant = %record.tenant_id,
                    status = ?record.status,
                    cost_micros = record.cost_micros,
                    sources = record.sources_used.len(),
                    "Audit record sealed"
                );
                Ok(record)
            }
            Err(e) => {
                warn!(target: "audit", run_id = %state.run_id, error = %e, "Audit write failed");
                Err(e)
            }
        }
    }

    /// Recompute the output and context digests for a sealed record and
    /// append the outcome to its verification history.
    pub async fn verify(
        &self,
        run_id: Uuid,
        final_text: &str,
        reader_id: &str,
    ) -> Result<VerificationEntry, AuditError> {
        let record = self
            .store
            .fetch(run_id, reader_id, "integrity verification")
            .await?
            .ok_or(AuditError::NotFound(run_id))?;

        let entry = VerificationEntry {
            at: Utc::now(),
            output_hash_ok: canon::output_hash(final_text) == record.output_hash,
            context_hash_ok: canon::context_hash(record.sources_used.iter()) == record.context_hash,
        };
        self.store.append_verification(run_id, entry.clone()).await?;
        Ok(entry)
    }
}
