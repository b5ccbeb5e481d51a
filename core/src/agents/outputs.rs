//! Structured agent outputs and the parsers that recover them from model
//! text.
//!
//! Models are asked for JSON but are not trusted to return it cleanly:
//! parsing tries the raw text, then a fenced block, then the outermost
//! brace span. A failure at all three levels is a recoverable parse error;
//! the runtime retries once with a repair directive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the analyser concluded about the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisReport {
    pub thesis: String,
    pub needs_external_info: bool,
    pub gaps: Vec<String>,
    pub recommended_approach: String,
    pub complexity: String,
}

/// What the researcher brought back from a retrieval pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchFindings {
    pub summary: String,
    pub useful_sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Revise,
}

/// The critic's judgement of one draft version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticVerdict {
    pub verdict: Verdict,
    pub report: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub quality_score: f32,
}

impl CriticVerdict {
    pub fn accept(report: &str) -> Self {
        Self {
            verdict: Verdict::Accept,
            report: report.to_string(),
            suggestions: Vec::new(),
            quality_score: 0.0,
        }
    }

    pub fn revise(report: &str) -> Self {
        Self {
            verdict: Verdict::Revise,
            report: report.to_string(),
            suggestions: Vec::new(),
            quality_score: 0.0,
        }
    }

    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}

/// Recover a JSON object from model text: raw parse first, then a fenced
/// ```json block, then the outermost brace span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        if let Some(end) = after[body_start..].find("```") {
            let body = &after[body_start..body_start + end];
            if let Ok(v) = serde_json::from_str::<Value>(body.trim()) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

pub fn parse_analysis(text: &str) -> Option<AnalysisReport> {
    extract_json(text).and_then(|v| serde_json::from_value(v).ok())
}

pub fn parse_findings(text: &str) -> Option<ResearchFindings> {
    extract_json(text).and_then(|v| serde_json::from_value(v).ok())
}

pub fn parse_verdict(text: &str) -> Option<CriticVerdict> {
    extract_json(text).and_then(|v| serde_json::from_value(v).ok())
}

/// Drafter and formatter turns return prose; strip a surrounding markdown
/// fence if the model wrapped its answer in one.
pub fn clean_prose(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = rest[body_start..].trim_end_matches("```").trim();
        if !body.is_empty() {
            return Some(body.to_string());
        }
    }
    Some(trimmed.to_string())
}
