//! Agent layer: structured outputs, the versioned prompt library and the
//! single-turn runtime.

pub mod outputs;
pub mod prompts;
pub mod runtime;

pub use outputs::{AnalysisReport, CriticVerdict, ResearchFindings, Verdict};
pub use prompts::{PromptLibrary, PromptTemplate};
pub use runtime::{AgentRuntime, StateDelta, TurnOutcome};
