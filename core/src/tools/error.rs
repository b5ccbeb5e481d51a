use thiserror::Error;

/// Typed tool failure with an explicit recoverability flag: recoverable
/// errors may be retried by the caller, fatal ones surface to the executor.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool {tool} failed: {message}")]
    Execution {
        tool: String,
        message: String,
        recoverable: bool,
    },

    #[error("tool {0} timed out")]
    Timeout(String),
}

impl ToolError {
    pub fn recoverable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Execution { recoverable, .. } => *recoverable,
            Self::NotFound(_) | Self::InvalidArguments { .. } => false,
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;
