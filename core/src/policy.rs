//! Tenant policy model, checkpoint evaluation and the process-wide cache.
//!
//! Policies are versioned and immutable per version. A run captures one
//! snapshot at start; edits published mid-run are only observed by later
//! runs. Rule predicates are data-driven comparisons over a JSON context
//! snapshot, so new rules are rows, not code.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    AccessControl,
    PiiHandling,
    AuditLevel,
    DataRetention,
    ContentFilter,
    ExportRestriction,
}

/// Named points in the executor loop at which policies are re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    OnIngest,
    BeforeRetrieval,
    BeforeModelCall,
    BeforeEmit,
    OnExport,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnIngest => "on_ingest",
            Self::BeforeRetrieval => "before_retrieval",
            Self::BeforeModelCall => "before_model_call",
            Self::BeforeEmit => "before_emit",
            Self::OnExport => "on_export",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    Gt,
    Lt,
    In,
}

/// One comparison against the context snapshot. A rule matches when every
/// one of its predicates holds (missing fields never match).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePredicate {
    pub field: String,
    pub op: PredicateOp,
    pub value: Value,
}

impl RulePredicate {
    fn holds(&self, ctx: &Map<String, Value>) -> bool {
        let Some(actual) = ctx.get(&self.field) else {
            return false;
        };
        match self.op {
            PredicateOp::Eq => actual == &self.value,
            PredicateOp::Ne => actual != &self.value,
            PredicateOp::Gt => cmp_numbers(actual, &self.value)
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            PredicateOp::Lt => cmp_numbers(actual, &self.value)
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false),
            PredicateOp::In => self
                .value
                .as_array()
                .map(|arr| arr.contains(actual))
                .unwrap_or(false),
        }
    }
}

fn cmp_numbers(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// Action a matching rule requests, ordered least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Annotate,
    Redact,
    RequireHumanReview,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub description: String,
    /// Checkpoints this rule applies at; empty means every checkpoint.
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// All predicates must hold for the rule to match.
    pub predicates: Vec<RulePredicate>,
    pub action: RuleAction,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub kind: PolicyKind,
    pub version: u32,
    pub rules: Vec<PolicyRule>,
    pub effective_from: DateTime<Utc>,
}

/// A tenant's policy set as published to the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySet {
    pub tenant_id: String,
    pub version: u32,
    pub policies: Vec<Policy>,
}

/// The immutable copy of a tenant's effective policies captured at run
/// start. Referenced by version in the audit record and carried by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub tenant_id: String,
    pub version: u32,
    pub captured_at: DateTime<Utc>,
    pub policies: Vec<Policy>,
}

impl PolicySnapshot {
    pub fn capture(set: &PolicySet) -> Self {
        Self {
            tenant_id: set.tenant_id.clone(),
            version: set.version,
            captured_at: Utc::now(),
            policies: set.policies.clone(),
        }
    }
}

/// Outcome of evaluating a checkpoint. When several rules match, the most
/// restrictive action wins; annotations from all matching annotate rules are
/// kept.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow,
    AnnotateAndContinue(Vec<String>),
    RedactThenContinue { rule_id: String },
    RequireHumanReview { rule_id: String },
    Deny { rule_id: String, reason: String },
}

/// Evaluate a snapshot against a named checkpoint and a context snapshot.
pub fn evaluate(
    snapshot: &PolicySnapshot,
    checkpoint: Checkpoint,
    ctx: &Map<String, Value>,
) -> PolicyDecision {
    let mut annotations = Vec::new();
    let mut redact: Option<String> = None;
    let mut review: Option<String> = None;

    for policy in &snapshot.policies {
        for rule in &policy.rules {
            if !rule.enabled {
                continue;
            }
            if !rule.checkpoints.is_empty() && !rule.checkpoints.contains(&checkpoint) {
                continue;
            }
            if !rule.predicates.iter().all(|p| p.holds(ctx)) {
                continue;
            }
            debug!(
                target: "policy",
                rule = %rule.id,
                checkpoint = checkpoint.as_str(),
                action = ?rule.action,
                "Policy rule matched"
            );
            match rule.action {
                RuleAction::Deny => {
                    return PolicyDecision::Deny {
                        rule_id: rule.id.clone(),
                        reason: rule.description.clone(),
                    };
                }
                RuleAction::RequireHumanReview => {
                    review.get_or_insert_with(|| rule.id.clone());
                }
                RuleAction::Redact => {
                    redact.get_or_insert_with(|| rule.id.clone());
                }
                RuleAction::Annotate => annotations.push(rule.id.clone()),
                RuleAction::Allow => {}
            }
        }
    }

    if let Some(rule_id) = review {
        PolicyDecision::RequireHumanReview { rule_id }
    } else if let Some(rule_id) = redact {
        PolicyDecision::RedactThenContinue { rule_id }
    } else if !annotations.is_empty() {
        PolicyDecision::AnnotateAndContinue(annotations)
    } else {
        PolicyDecision::Allow
    }
}

/// Process-wide tenant policy cache.
///
/// Published sets are wrapped in `Arc` so a reader holds one consistent
/// snapshot for as long as it needs; publication swaps the pointer.
#[derive(Default)]
pub struct PolicyCache {
    inner: RwLock<HashMap<String, Arc<PolicySet>>>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, set: PolicySet) {
        let tenant = set.tenant_id.clone();
        self.inner.write().await.insert(tenant, Arc::new(set));
    }

    /// Current set for a tenant; a default set is synthesised for tenants
    /// with no published policies so every run has a versioned snapshot.
    pub async fn snapshot(&self, tenant_id: &str) -> PolicySnapshot {
        if let Some(set) = self.inner.read().await.get(tenant_id) {
            return PolicySnapshot::capture(set);
        }
        PolicySnapshot::capture(&default_policy_set(tenant_id))
    }
}

/// Baseline policy set a tenant starts with: automatic PII redaction plus
/// audit annotation on every model call.
pub fn default_policy_set(tenant_id: &str) -> PolicySet {
    PolicySet {
        tenant_id: tenant_id.to_string(),
        version: 1,
        policies: vec![
            Policy {
                id: format!("pii-{tenant_id}"),
                kind: PolicyKind::PiiHandling,
                version: 1,
                effective_from: Utc::now(),
                rules: vec![PolicyRule {
                    id: "pii-auto-redact".to_string(),
                    description: "detected PII must be redacted before use".to_string(),
                    checkpoints: vec![Checkpoint::OnIngest, Checkpoint::BeforeModelCall],
                    predicates: vec![RulePredicate {
                        field: "pii_detected".to_string(),
                        op: PredicateOp::Eq,
                        value: Value::Bool(true),
                    }],
                    action: RuleAction::Redact,
                    enabled: true,
                }],
            },
            Policy {
                id: format!("audit-{tenant_id}"),
                kind: PolicyKind::AuditLevel,
                version: 1,
                effective_from: Utc::now(),
                rules: vec![PolicyRule {
                    id: "audit-pii-note".to_string(),
                    description: "PII occurrences are annotated for the audit trail".to_string(),
                    checkpoints: vec![],
                    predicates: vec![RulePredicate {
                        field: "pii_count".to_string(),
                        op: PredicateOp::Gt,
                        value: Value::from(0),
                    }],
                    action: RuleAction::Annotate,
                    enabled: true,
                }],
            },
        ],
    }
}
