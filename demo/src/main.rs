//! One full generation run against in-process stand-ins: a deterministic
//! embedder, a six-document corpus and an offline model. Prints the routed
//! trace, the sealed digests and a feedback round-trip.

use std::sync::Arc;

use async_trait::async_trait;
use chancery_core::feedback::FeedbackRequest;
use chancery_core::llm::{ModelClient, ModelError, ModelRequest, ModelResponse, TokenUsage};
use chancery_core::retrieval::types::RawHit;
use chancery_core::retrieval::{Embedder, LexicalIndex, RetrievalError, VectorIndex};
use chancery_core::{
    telemetry, Engine, ExternalDocument, RunOptions, RunRequest, TaskKind,
};
use tracing::info;

/// Character-histogram embedder: deterministic and dependency-free.
struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut v = vec![0.0f32; 16];
        for (i, c) in text.chars().enumerate() {
            v[(c as usize + i) % 16] += 1.0;
        }
        Ok(v)
    }
}

struct DemoCorpus;

fn corpus_hits() -> Vec<RawHit> {
    [
        ("clausulas-reajuste-2023", "Cláusula 7.2 prevê reajuste anual pelo IPCA em contratos de locação comercial."),
        ("precedente-locacao-stj", "O STJ reconhece a validade de cláusulas de reajuste pactuadas livremente."),
        ("modelo-parecer-locacao", "Modelo interno de parecer sobre obrigações do locatário e do locador."),
    ]
    .iter()
    .enumerate()
    .map(|(i, &(id, excerpt))| RawHit {
        source_id: id.to_string(),
        score: 1.0 - i as f32 * 0.2,
        rank: (i + 1) as u32,
        excerpt: excerpt.to_string(),
    })
    .collect()
}

#[async_trait]
impl VectorIndex for DemoCorpus {
    async fn search(
        &self,
        _tenant: &str,
        _query: &[f32],
        k: usize,
    ) -> Result<Vec<RawHit>, RetrievalError> {
        Ok(corpus_hits().into_iter().take(k).collect())
    }
}

#[async_trait]
impl LexicalIndex for DemoCorpus {
    async fn search(
        &self,
        _tenant: &str,
        _query: &str,
        k: usize,
    ) -> Result<Vec<RawHit>, RetrievalError> {
        let mut hits = corpus_hits();
        hits.reverse();
        for (i, hit) in hits.iter_mut().enumerate() {
            hit.rank = (i + 1) as u32;
        }
        Ok(hits.into_iter().take(k).collect())
    }
}

/// Offline model scripted per agent role; the critic asks for one revision
/// so the revise loop is visible in the trace.
struct OfflineModel {
    critic_calls: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl ModelClient for OfflineModel {
    async fn generate(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let text = if req.system.contains("analista") {
            r#"{"thesis": "o reajuste é válido, com ressalvas", "needs_external_info": false,
                "gaps": [], "recommended_approach": "análise contratual e jurisprudencial",
                "complexity": "média"}"#
                .to_string()
        } else if req.system.contains("revisor") {
            let n = self
                .critic_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                r#"{"verdict": "revise", "report": "faltou citar o precedente do STJ",
                    "suggestions": ["citar precedente-locacao-stj"], "quality_score": 0.6}"#
                    .to_string()
            } else {
                r#"{"verdict": "accept", "report": "fundamentação adequada", "quality_score": 0.9}"#
                    .to_string()
            }
        } else if req.system.contains("redator") {
            "## Parecer\n\n### I. Dos Fatos\nConsulta sobre reajuste em locação comercial.\n\n\
             ### II. Análise\nConforme [clausulas-reajuste-2023] e [precedente-locacao-stj], o \
             reajuste pactuado é válido.\n\n### III. Conclusão\nO reajuste deve ser mantido."
                .to_string()
        } else {
            "# PARECER JURÍDICO\n\nDocumento formatado conforme normas ABNT.\n\nO reajuste \
             pactuado é válido e deve ser mantido, conforme fundamentação apresentada."
                .to_string()
        };

        Ok(ModelResponse {
            text,
            model: req.model.clone(),
            usage: TokenUsage {
                input: 200,
                output: 120,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_telemetry("chancery-demo");

    let engine = Engine::builder(
        Arc::new(HashEmbedder),
        Arc::new(DemoCorpus),
        Arc::new(DemoCorpus),
        Arc::new(OfflineModel {
            critic_calls: Default::default(),
        }),
    )
    .build();

    let request = RunRequest {
        query: "Parecer sobre cláusula de reajuste em contrato de locação comercial".to_string(),
        task: TaskKind::Draft,
        tenant_id: "cliente_acme".to_string(),
        user_id: Some("adv-17".to_string()),
        external_docs: vec![ExternalDocument {
            source_id: "minuta-cliente".to_string(),
            text: "Minuta enviada pelo cliente. Locatária: ACME LTDA, CNPJ 11.222.333/0001-81. \
                   Reajuste anual pelo IPCA na cláusula 7.2."
                .to_string(),
            metadata: Default::default(),
        }],
        options: RunOptions::default(),
    };

    let response = engine.submit(request).await?;

    info!(
        target = "demo",
        run_id = %response.run_id,
        status = ?response.status,
        duration_ms = response.duration_ms,
        "Run finished"
    );

    println!("run {} -> {:?}", response.run_id, response.status);
    println!(
        "context: {} hits ({} internal, {} external)",
        response.context.total, response.context.internal, response.context.external
    );
    for source in &response.external_sources {
        println!(
            "external source {} at rank {} (fused {:.4})",
            source.source_id, source.rank, source.fused_score
        );
    }
    if let Some(text) = &response.final_text {
        println!("\n--- documento final ---\n{text}\n");
    }

    let audit = engine
        .audit_record(response.run_id, "demo", "display")
        .await?
        .expect("terminated runs are sealed");
    println!("trace:");
    for turn in &audit.trace {
        println!(
            "  {:<10} {:<18} {:>4} -> {:>4} tokens  {}",
            turn.agent.as_str(),
            turn.model,
            turn.tokens_in,
            turn.tokens_out,
            turn.summary
        );
    }
    println!("input_hash:   {}", audit.input_hash);
    println!("output_hash:  {}", audit.output_hash);
    println!("context_hash: {}", audit.context_hash);
    println!("cost: {} micro-units over {} iterations", audit.cost_micros, audit.iterations);

    engine
        .submit_feedback(FeedbackRequest {
            run_id: response.run_id,
            rater_id: "adv-17".to_string(),
            rating: 1,
            comment: Some("bom resultado; revisar a seção de fundamentação".to_string()),
            error_spans: vec![],
            missing_sources: vec![],
            edited_text: None,
            tags: vec!["reajuste".to_string()],
        })
        .await?;
    let summary = engine.feedback_summary(response.run_id).await?;
    println!(
        "feedback: {} evento(s), média {:.1}",
        summary.events, summary.mean_rating
    );

    Ok(())
}
