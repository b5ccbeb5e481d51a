//! End-to-end engine scenarios against scripted collaborators.

mod common;

use std::sync::atomic::Ordering;

use chancery_core::audit::canon;
use chancery_core::feedback::{ErrorSpan, FeedbackRequest, MissingSource};
use chancery_core::pii::PiiKind;
use chancery_core::policy::{
    Checkpoint, Policy, PolicyKind, PolicyRule, PolicySet, PredicateOp, RuleAction, RulePredicate,
};
use chancery_core::{AgentKind, ExternalDocument, RunOptions, RunRequest, RunStatus, TaskKind};
use chrono::Utc;
use serde_json::json;

use common::{engine_with, ScriptedModel};

fn draft_request() -> RunRequest {
    RunRequest {
        query: "resumo de obrigações contratuais".to_string(),
        task: TaskKind::Draft,
        tenant_id: "T1".to_string(),
        user_id: Some("adv-1".to_string()),
        external_docs: vec![],
        options: RunOptions::default(),
    }
}

fn trace_agents(trace: &[chancery_core::state::TurnRecord]) -> Vec<AgentKind> {
    trace.iter().map(|t| t.agent).collect()
}

#[tokio::test]
async fn happy_path_internal_rag_only() {
    let t = engine_with(ScriptedModel::new(vec!["accept"]));
    let resp = t.engine.submit(draft_request()).await.unwrap();

    assert_eq!(resp.status, RunStatus::Succeeded);
    let final_text = resp.final_text.as_deref().expect("document produced");

    // At most one retrieval call went to the network.
    assert_eq!(t.vector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(t.lexical.calls.load(Ordering::SeqCst), 1);

    let audit = t
        .engine
        .audit_record(resp.run_id, "test", "scenario assertion")
        .await
        .unwrap()
        .expect("audit sealed");

    assert_eq!(
        trace_agents(&audit.trace),
        vec![
            AgentKind::Analyser,
            AgentKind::Drafter,
            AgentKind::Critic,
            AgentKind::Formatter,
        ]
    );

    // The context digest covers exactly the source ids of the retrieval
    // record, and the output digest covers the returned text.
    assert_eq!(
        audit.context_hash,
        canon::context_hash(["doc-a", "doc-b", "doc-c"])
    );
    assert_eq!(audit.output_hash, canon::output_hash(final_text));
    assert!(audit.success);
    assert!(audit.iterations <= 10);

    assert_eq!(resp.context.total, 3);
    assert_eq!(resp.context.internal, 3);
    assert_eq!(resp.context.external, 0);
    assert!(!resp.context.personalisation_applied);
}

#[tokio::test]
async fn critic_revise_loop_reenters_drafter_once() {
    let t = engine_with(ScriptedModel::new(vec!["revise", "accept"]));
    let resp = t.engine.submit(draft_request()).await.unwrap();

    assert_eq!(resp.status, RunStatus::Succeeded);
    let audit = t
        .engine
        .audit_record(resp.run_id, "test", "scenario assertion")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        trace_agents(&audit.trace),
        vec![
            AgentKind::Analyser,
            AgentKind::Drafter,
            AgentKind::Critic,
            AgentKind::Drafter,
            AgentKind::Critic,
            AgentKind::Formatter,
        ]
    );
    assert_eq!(audit.iterations, 6);
    // Still exactly one retrieve call.
    assert_eq!(t.vector.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn external_only_run_redacts_tax_id_everywhere() {
    let t = engine_with(ScriptedModel::new(vec!["accept"]));

    let mut request = draft_request();
    request.options.use_internal_rag = false;
    request.external_docs = vec![ExternalDocument {
        source_id: "contrato-ext".to_string(),
        text: "Contrato firmado por pessoa física, CPF 123.456.789-09, sobre obrigações \
               contratuais de locação."
            .to_string(),
        metadata: Default::default(),
    }];

    let resp = t.engine.submit(request).await.unwrap();
    assert_eq!(resp.status, RunStatus::Succeeded);

    // The internal corpus was never touched.
    assert_eq!(t.vector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(t.lexical.calls.load(Ordering::SeqCst), 0);

    // Model inputs carry the redaction token, never the digits.
    let prompts = t.model.all_prompts();
    assert!(prompts
        .iter()
        .any(|(_, prompt)| prompt.contains("[CPF_REDACTED]")));
    assert!(prompts
        .iter()
        .all(|(system, prompt)| !system.contains("123.456.789-09")
            && !prompt.contains("123.456.789-09")));

    let audit = t
        .engine
        .audit_record(resp.run_id, "test", "scenario assertion")
        .await
        .unwrap()
        .unwrap();

    // Nothing in the sealed record leaks the original value.
    let serialised = serde_json::to_string(&audit).unwrap();
    assert!(!serialised.contains("123.456.789-09"));

    let tax_ids: Vec<_> = audit.pii.of_kind(PiiKind::TaxId).collect();
    assert_eq!(tax_ids.len(), 1);
    assert!(tax_ids[0].confidence >= 0.9);
    assert_eq!(tax_ids[0].check_digits_valid, Some(true));

    assert_eq!(audit.context_hash, canon::context_hash(["contrato-ext"]));
    assert_eq!(resp.external_sources.len(), 1);
    assert_eq!(resp.external_sources[0].source_id, "contrato-ext");
    assert_eq!(resp.external_sources[0].rank, 1);
}

#[tokio::test]
async fn budget_exhaustion_formats_best_draft() {
    let t = engine_with(ScriptedModel::new(vec!["revise", "revise", "revise"]));

    let mut request = draft_request();
    request.options.max_iterations = 3;

    let resp = t.engine.submit(request).await.unwrap();
    assert_eq!(resp.status, RunStatus::BudgetExhausted);
    assert!(resp.final_text.is_some(), "best available draft is emitted");

    let audit = t
        .engine
        .audit_record(resp.run_id, "test", "scenario assertion")
        .await
        .unwrap()
        .expect("audit sealed despite the breach");
    assert_eq!(audit.iterations, 3);

    // analyser + drafter + critic + the best-effort formatter pass; the
    // breach leaves no room for anything further.
    assert_eq!(t.model.prompt_count(), 4);
    assert_eq!(audit.error.as_ref().unwrap().kind, "budget_exhausted");
}

#[tokio::test]
async fn policy_deny_at_ingress_seals_audit_without_any_calls() {
    let t = engine_with(ScriptedModel::new(vec![]));

    t.engine
        .publish_policy(PolicySet {
            tenant_id: "T1".to_string(),
            version: 3,
            policies: vec![Policy {
                id: "task-filter".to_string(),
                kind: PolicyKind::ContentFilter,
                version: 3,
                effective_from: Utc::now(),
                rules: vec![PolicyRule {
                    id: "deny-answer".to_string(),
                    description: "task kind answer is not contracted for this tenant".to_string(),
                    checkpoints: vec![Checkpoint::OnIngest],
                    predicates: vec![RulePredicate {
                        field: "task".to_string(),
                        op: PredicateOp::Eq,
                        value: json!("answer"),
                    }],
                    action: RuleAction::Deny,
                    enabled: true,
                }],
            }],
        })
        .await;

    let mut request = draft_request();
    request.task = TaskKind::Answer;

    let resp = t.engine.submit(request).await.unwrap();
    assert_eq!(resp.status, RunStatus::Failed);
    let error = resp.error.as_ref().expect("error surfaced");
    assert_eq!(error.kind, "policy_deny");
    assert!(error.cause.contains("deny-answer"));
    assert!(resp.final_text.is_none());

    // No retrieval and no model call happened.
    assert_eq!(t.vector.calls.load(Ordering::SeqCst), 0);
    assert_eq!(t.lexical.calls.load(Ordering::SeqCst), 0);
    assert_eq!(t.model.prompt_count(), 0);

    // The audit record exists and pins the policy version seen at start.
    let audit = t
        .engine
        .audit_record(resp.run_id, "test", "scenario assertion")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(audit.policy.version, 3);
    assert!(!audit.success);
}

#[tokio::test]
async fn feedback_round_trip_leaves_audit_untouched() {
    let t = engine_with(ScriptedModel::new(vec!["accept"]));
    let resp = t.engine.submit(draft_request()).await.unwrap();
    assert_eq!(resp.status, RunStatus::Succeeded);

    let before = serde_json::to_string(
        &t.engine
            .audit_record(resp.run_id, "test", "baseline read")
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();

    t.engine
        .submit_feedback(FeedbackRequest {
            run_id: resp.run_id,
            rater_id: "adv-1".to_string(),
            rating: 1,
            comment: Some("faltou uma jurisprudência específica".to_string()),
            error_spans: vec![
                ErrorSpan {
                    start: 150,
                    end: 200,
                    label: "fundamentacao_incompleta".to_string(),
                    suggestion: Some("citar art. 186 CC".to_string()),
                },
                ErrorSpan {
                    start: 300,
                    end: 320,
                    label: "citacao_errada".to_string(),
                    suggestion: None,
                },
            ],
            missing_sources: vec![MissingSource {
                raw: "STJ REsp 1234567/SP".to_string(),
                classification: Some("jurisprudencia".to_string()),
                relevance: Some(0.95),
            }],
            edited_text: None,
            tags: vec!["jurisprudencia".to_string()],
        })
        .await
        .unwrap();

    let summary = t.engine.feedback_summary(resp.run_id).await.unwrap();
    assert_eq!(summary.events, 1);
    assert!((summary.mean_rating - 1.0).abs() < f64::EPSILON);
    assert_eq!(summary.total_error_spans, 2);
    assert_eq!(summary.distinct_missing_sources, 1);

    let after = serde_json::to_string(
        &t.engine
            .audit_record(resp.run_id, "test", "post-feedback read")
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(before, after, "feedback never modifies the audit record");
}
