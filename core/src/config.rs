//! Engine and per-run configuration.
//!
//! `EngineConfig` is loaded once at startup, with environment overrides in
//! the same shape the model client config uses. `RunOptions` is the
//! recognised option bundle of a single submit-run request; unknown keys are
//! rejected at ingress, out-of-range values are clamped.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pii::RedactionStrategy;
use crate::state::AgentKind;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker executors serving runs.
    pub pool_size: usize,
    /// Bounded queue of runs waiting for a worker.
    pub queue_depth: usize,
    /// Hard ceiling on `k_total`, regardless of what the caller asks for.
    pub k_hard_ceiling: usize,
    /// Upper bound on any single model call, on top of the run deadline.
    pub per_turn_timeout: Duration,
    /// Independent deadline for each retrieval leg.
    pub leg_timeout: Duration,
    /// Model attempts for transient errors (first try included).
    pub model_attempts: u32,
    /// Re-drafting rounds allowed after a "revise" verdict.
    pub max_revisions: u32,
    /// Tenant-wide default cost ceiling, in millionths of a currency unit.
    pub default_cost_ceiling_micros: u64,
    /// Centroids older than this are treated as absent.
    pub centroid_ttl: Duration,
    /// Per-tool invocation timeout.
    pub tool_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: env_usize("CHANCERY_POOL_SIZE", 8),
            queue_depth: env_usize("CHANCERY_QUEUE_DEPTH", 64),
            k_hard_ceiling: 100,
            per_turn_timeout: Duration::from_millis(env_u64("CHANCERY_TURN_TIMEOUT_MS", 60_000)),
            leg_timeout: Duration::from_millis(env_u64("CHANCERY_LEG_TIMEOUT_MS", 5_000)),
            model_attempts: 3,
            max_revisions: 2,
            default_cost_ceiling_micros: env_u64("CHANCERY_COST_CEILING_MICROS", 5_000_000),
            centroid_ttl: Duration::from_secs(env_u64("CHANCERY_CENTROID_TTL_S", 3_600)),
            tool_timeout: Duration::from_millis(env_u64("CHANCERY_TOOL_TIMEOUT_MS", 30_000)),
        }
    }
}

/// Recognised options of one submit-run request.
///
/// Defaults follow the request contract; `normalise` applies the documented
/// clamps so downstream code never re-checks ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunOptions {
    pub use_internal_rag: bool,
    pub k_total: usize,
    pub enable_personalisation: bool,
    pub personalisation_alpha: f32,
    pub max_iterations: u32,
    pub deadline_ms: u64,
    /// Cost ceiling in currency units; six decimal places are significant.
    /// Absent means the tenant-wide default applies.
    pub cost_ceiling: Option<f64>,
    pub model_preferences: BTreeMap<AgentKind, String>,
    pub pii_strategy: RedactionStrategy,
    pub document_type: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_internal_rag: true,
            k_total: 20,
            enable_personalisation: true,
            personalisation_alpha: 0.25,
            max_iterations: 10,
            deadline_ms: 300_000,
            cost_ceiling: None,
            model_preferences: BTreeMap::new(),
            pii_strategy: RedactionStrategy::Typed,
            document_type: "parecer".to_string(),
        }
    }
}

impl RunOptions {
    /// Clamp every option into its documented range.
    pub fn normalise(mut self, cfg: &EngineConfig) -> Self {
        self.k_total = self.k_total.min(cfg.k_hard_ceiling);
        self.personalisation_alpha = self.personalisation_alpha.clamp(0.0, 1.0);
        self.max_iterations = self.max_iterations.max(1);
        if self.document_type.trim().is_empty() {
            self.document_type = RunOptions::default().document_type;
        }
        self
    }

    /// Resolved cost ceiling in micro-units of the fixed currency.
    pub fn cost_ceiling_micros(&self, cfg: &EngineConfig) -> u64 {
        match self.cost_ceiling {
            Some(c) if c.is_finite() && c > 0.0 => (c * 1_000_000.0).round() as u64,
            _ => cfg.default_cost_ceiling_micros,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn model_for(&self, kind: AgentKind) -> Option<&str> {
        self.model_preferences.get(&kind).map(|s| s.as_str())
    }
}
