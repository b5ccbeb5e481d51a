use thiserror::Error;

use crate::llm::ModelError;
use crate::state::BudgetBreach;
use crate::tools::ToolError;

/// Top-level engine error.
///
/// Every failure that crosses a subsystem boundary is one of these tagged
/// values; free-form strings never travel on their own. `kind()` yields the
/// short machine-readable code returned to callers alongside the run id.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("policy rule {rule_id} denied the run: {reason}")]
    PolicyDeny { rule_id: String, reason: String },

    #[error("retrieval failed on every leg: {0}")]
    RetrievalFailed(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("structured output could not be parsed: {0}")]
    ParseFailure(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(BudgetBreach),

    #[error("run cancelled")]
    Cancelled,

    #[error("audit record could not be persisted: {0}")]
    AuditWriteFailed(String),
}

impl EngineError {
    /// Short machine-readable code surfaced at the engine boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputInvalid(_) => "input_invalid",
            Self::PolicyDeny { .. } => "policy_deny",
            Self::RetrievalFailed(_) => "retrieval_failed",
            Self::Tool(e) if e.recoverable() => "tool_recoverable",
            Self::Tool(_) => "tool_fatal",
            Self::Model(ModelError::Transient(_)) => "model_transient",
            Self::Model(ModelError::Fatal(_)) => "model_fatal",
            Self::ParseFailure(_) => "parse_failure",
            Self::BudgetExhausted(_) => "budget_exhausted",
            Self::Cancelled => "cancelled",
            Self::AuditWriteFailed(_) => "audit_write_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
