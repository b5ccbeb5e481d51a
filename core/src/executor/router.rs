//! The routing function: pure over (state, policy-derived limits).
//!
//! Given identical inputs and identical agent outputs the decision sequence
//! is identical; nothing here consults a clock or randomness.

use crate::state::{AgentKind, RunState};

/// Decide the next agent, or `None` to terminate successfully.
pub fn route(state: &RunState, max_revisions: u32) -> Option<AgentKind> {
    let ws = &state.working;

    if ws.formatted.is_some() {
        return None;
    }

    let Some(analysis) = &ws.analysis else {
        return Some(AgentKind::Analyser);
    };

    if analysis.value.needs_external_info && state.retrievals.is_empty() {
        return Some(AgentKind::Researcher);
    }

    let Some(draft) = &ws.draft else {
        return Some(AgentKind::Drafter);
    };

    match ws.assessment_of_current_draft() {
        None => Some(AgentKind::Critic),
        Some(a) if a.verdict.is_accept() => Some(AgentKind::Formatter),
        // Revise: re-enter the drafter while the revision budget allows,
        // otherwise send the latest draft onward.
        Some(_) if draft.version < max_revisions => Some(AgentKind::Drafter),
        Some(_) => Some(AgentKind::Formatter),
    }
}
