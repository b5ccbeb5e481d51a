//! Shared run state.
//!
//! One `RunState` is exclusively owned by the executor task driving the run.
//! Concurrent subsystems (retrieval legs, tool calls, model calls) never see
//! it; they return values that the executor merges between suspension points.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::outputs::{AnalysisReport, CriticVerdict, ResearchFindings};
use crate::config::RunOptions;
use crate::pii::PiiReport;
use crate::policy::PolicySnapshot;
use crate::retrieval::types::RetrievalRecord;

/// The task the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Draft,
    Review,
    Summarise,
    Answer,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Review => "review",
            Self::Summarise => "summarise",
            Self::Answer => "answer",
        }
    }
}

/// Specialist roles the executor routes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Analyser,
    Researcher,
    Drafter,
    Critic,
    Formatter,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyser => "analyser",
            Self::Researcher => "researcher",
            Self::Drafter => "drafter",
            Self::Critic => "critic",
            Self::Formatter => "formatter",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run lifecycle.
///
/// `AwaitingTool` and `AwaitingModel` are the two suspension states; the
/// remaining four non-pending values are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingTool,
    AwaitingModel,
    Succeeded,
    Failed,
    Cancelled,
    BudgetExhausted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::BudgetExhausted
        )
    }
}

/// A working-set slot: the value plus who wrote it and a monotonic version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub written_by: AgentKind,
    pub version: u32,
}

/// A critic assessment pinned to the draft version it judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticAssessment {
    pub verdict: CriticVerdict,
    pub draft_version: u32,
}

/// Everything the agents have produced so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingSet {
    pub analysis: Option<Versioned<AnalysisReport>>,
    pub findings: Option<Versioned<ResearchFindings>>,
    pub draft: Option<Versioned<String>>,
    pub assessments: Vec<CriticAssessment>,
    pub formatted: Option<Versioned<String>>,
}

impl WorkingSet {
    pub fn set_analysis(&mut self, report: AnalysisReport, by: AgentKind) {
        let version = self.analysis.as_ref().map(|v| v.version + 1).unwrap_or(1);
        self.analysis = Some(Versioned {
            value: report,
            written_by: by,
            version,
        });
    }

    pub fn set_findings(&mut self, findings: ResearchFindings, by: AgentKind) {
        let version = self.findings.as_ref().map(|v| v.version + 1).unwrap_or(1);
        self.findings = Some(Versioned {
            value: findings,
            written_by: by,
            version,
        });
    }

    pub fn set_draft(&mut self, text: String, by: AgentKind) {
        let version = self.draft.as_ref().map(|v| v.version + 1).unwrap_or(1);
        self.draft = Some(Versioned {
            value: text,
            written_by: by,
            version,
        });
    }

    pub fn push_assessment(&mut self, verdict: CriticVerdict) {
        let draft_version = self.draft.as_ref().map(|d| d.version).unwrap_or(0);
        self.assessments.push(CriticAssessment {
            verdict,
            draft_version,
        });
    }

    pub fn set_formatted(&mut self, text: String, by: AgentKind) {
        let version = self.formatted.as_ref().map(|v| v.version + 1).unwrap_or(1);
        self.formatted = Some(Versioned {
            value: text,
            written_by: by,
            version,
        });
    }

    /// Latest assessment of the *current* draft version, if any.
    ///
    /// A verdict issued against a superseded draft does not count: a redraft
    /// always goes back through the critic. When the critic has judged the
    /// same draft more than once the latest verdict is authoritative.
    pub fn assessment_of_current_draft(&self) -> Option<&CriticAssessment> {
        let current = self.draft.as_ref()?.version;
        self.assessments
            .iter()
            .rev()
            .find(|a| a.draft_version == current)
    }
}

/// One agent invocation and its recorded outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub agent: AgentKind,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub duration_ms: u64,
    pub summary: String,
    pub error: Option<String>,
}

/// The three independently enforced ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub max_iterations: u32,
    #[serde(with = "duration_millis")]
    pub deadline: Duration,
    /// Monetary ceiling in millionths of a currency unit (six decimal places).
    pub cost_ceiling_micros: u64,
}

/// Which ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetBreach {
    Iterations,
    Deadline,
    Cost,
}

impl std::fmt::Display for BudgetBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Iterations => "iteration ceiling reached",
            Self::Deadline => "wall-clock deadline passed",
            Self::Cost => "monetary ceiling reached",
        })
    }
}

/// A caller-supplied document, immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDocument {
    pub source_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Error recorded on a terminated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub cause: String,
}

/// Mutable state of one in-flight run. Never shared across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    // Identity
    pub run_id: Uuid,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub task: TaskKind,
    pub document_type: String,
    pub started_at: DateTime<Utc>,

    // Inputs (immutable after creation)
    pub query: String,
    pub redacted_query: String,
    pub external_docs: Vec<ExternalDocument>,
    pub options: RunOptions,

    // Working set and trace
    pub working: WorkingSet,
    pub trace: Vec<TurnRecord>,
    pub retrievals: Vec<RetrievalRecord>,

    // Policy and PII
    pub policy: PolicySnapshot,
    /// Rule ids of annotate-and-continue decisions taken during the run.
    pub policy_annotations: Vec<String>,
    pub pii: PiiReport,

    // Budget and accounting
    pub budget: Budget,
    pub iterations: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_micros: u64,

    pub status: RunStatus,
    pub error: Option<RunError>,

    /// Source ids consumed by any tool call, deduplicated and ordered.
    pub sources_consumed: BTreeSet<String>,
}

impl RunState {
    /// Append a turn record and fold its accounting into the run totals.
    /// The trace is append-only; records are never revised.
    pub fn record_turn(&mut self, record: TurnRecord) {
        self.tokens_in += u64::from(record.tokens_in);
        self.tokens_out += u64::from(record.tokens_out);
        self.trace.push(record);
    }

    pub fn elapsed(&self) -> Duration {
        let ms = (Utc::now() - self.started_at).num_milliseconds().max(0);
        Duration::from_millis(ms as u64)
    }

    /// Wall-clock budget still available.
    pub fn remaining_deadline(&self) -> Duration {
        self.budget.deadline.saturating_sub(self.elapsed())
    }

    /// First breached ceiling, if any. All three are checked independently.
    pub fn budget_breach(&self) -> Option<BudgetBreach> {
        if self.iterations >= self.budget.max_iterations {
            Some(BudgetBreach::Iterations)
        } else if self.elapsed() >= self.budget.deadline {
            Some(BudgetBreach::Deadline)
        } else if self.cost_micros >= self.budget.cost_ceiling_micros {
            Some(BudgetBreach::Cost)
        } else {
            None
        }
    }

    /// Best text available for emission: formatter output, else latest draft.
    pub fn best_text(&self) -> Option<&str> {
        self.working
            .formatted
            .as_ref()
            .map(|v| v.value.as_str())
            .or_else(|| self.working.draft.as_ref().map(|v| v.value.as_str()))
    }

    pub fn fail(&mut self, kind: &str, cause: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(RunError {
            kind: kind.to_string(),
            cause: cause.into(),
        });
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_set_versions_are_monotonic() {
        let mut ws = WorkingSet::default();
        ws.set_draft("v1".into(), AgentKind::Drafter);
        ws.set_draft("v2".into(), AgentKind::Drafter);
        let draft = ws.draft.as_ref().unwrap();
        assert_eq!(draft.version, 2);
        assert_eq!(draft.written_by, AgentKind::Drafter);
    }

    #[test]
    fn stale_assessment_does_not_cover_new_draft() {
        let mut ws = WorkingSet::default();
        ws.set_draft("v1".into(), AgentKind::Drafter);
        ws.push_assessment(CriticVerdict::revise("needs work"));
        assert!(ws.assessment_of_current_draft().is_some());

        ws.set_draft("v2".into(), AgentKind::Drafter);
        assert!(ws.assessment_of_current_draft().is_none());
    }

    #[test]
    fn latest_verdict_is_authoritative() {
        let mut ws = WorkingSet::default();
        ws.set_draft("v1".into(), AgentKind::Drafter);
        ws.push_assessment(CriticVerdict::accept("fine"));
        ws.push_assessment(CriticVerdict::revise("changed my mind"));
        let latest = ws.assessment_of_current_draft().unwrap();
        assert!(!latest.verdict.is_accept());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::BudgetExhausted.is_terminal());
        assert!(!RunStatus::AwaitingModel.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }
}
