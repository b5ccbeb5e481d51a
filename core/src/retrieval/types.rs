//! Data types shared by the retrieval legs and the fusion step.

use serde::{Deserialize, Serialize};

/// Where a hit came from after deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Internal,
    External,
    Both,
}

/// The three search legs feeding fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegKind {
    Semantic,
    Lexical,
    External,
}

impl LegKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Lexical => "lexical",
            Self::External => "external",
        }
    }
}

/// A single result from one leg, before fusion. Rank is 1-based within the
/// leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHit {
    pub source_id: String,
    pub score: f32,
    pub rank: u32,
    pub excerpt: String,
}

/// A fused, deduplicated, ranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub source_id: String,
    pub excerpt: String,
    pub origin: Origin,
    pub semantic_score: Option<f32>,
    pub lexical_score: Option<f32>,
    pub fused_score: f32,
    pub rank: u32,
    pub personalised_score: Option<f32>,
}

/// Parameters fusion ran with, kept for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionParams {
    pub k_rrf: u32,
    pub personalisation_alpha: f32,
    pub personalisation_applied: bool,
}

/// How many results each leg contributed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LegCounts {
    pub semantic: usize,
    pub lexical: usize,
    pub external: usize,
}

/// Everything recorded about one retrieval call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRecord {
    pub query: String,
    pub theme: Option<String>,
    pub requested_k: usize,
    pub hits: Vec<RetrievalHit>,
    pub fusion: FusionParams,
    pub leg_counts: LegCounts,
    /// Free-form flags: `personalisation_skipped`, leg failures, clamping.
    pub annotations: Vec<String>,
}

impl RetrievalRecord {
    pub fn internal_count(&self) -> usize {
        self.hits
            .iter()
            .filter(|h| matches!(h.origin, Origin::Internal | Origin::Both))
            .count()
    }

    pub fn external_count(&self) -> usize {
        self.hits
            .iter()
            .filter(|h| matches!(h.origin, Origin::External | Origin::Both))
            .count()
    }
}
