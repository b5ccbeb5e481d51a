#![allow(dead_code)]
//! Shared mock collaborators for the end-to-end engine tests.
//!
//! The model client is scripted per agent role (recognised from the system
//! prompt), the indexes return fixed rankings, and every mock counts its
//! calls so tests can assert on network behaviour.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chancery_core::llm::{ModelClient, ModelError, ModelRequest, ModelResponse, TokenUsage};
use chancery_core::retrieval::types::RawHit;
use chancery_core::retrieval::{Embedder, LexicalIndex, RetrievalError, VectorIndex};
use chancery_core::Engine;

pub struct CountingEmbedder {
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut v = vec![0.0f32; 8];
        for (i, c) in text.chars().enumerate() {
            v[(c as usize + i) % 8] += 1.0;
        }
        Ok(v)
    }
}

pub fn hit(id: &str, rank: u32) -> RawHit {
    RawHit {
        source_id: id.to_string(),
        score: 1.0 / rank as f32,
        rank,
        excerpt: format!("trecho de {id} sobre obrigações contratuais"),
    }
}

pub struct FixedVector {
    pub hits: Vec<RawHit>,
    pub calls: AtomicUsize,
}

impl FixedVector {
    pub fn new(hits: Vec<RawHit>) -> Arc<Self> {
        Arc::new(Self {
            hits,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl VectorIndex for FixedVector {
    async fn search(
        &self,
        _tenant: &str,
        _query: &[f32],
        _k: usize,
    ) -> Result<Vec<RawHit>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.clone())
    }
}

pub struct FixedLexical {
    pub hits: Vec<RawHit>,
    pub calls: AtomicUsize,
}

impl FixedLexical {
    pub fn new(hits: Vec<RawHit>) -> Arc<Self> {
        Arc::new(Self {
            hits,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LexicalIndex for FixedLexical {
    async fn search(
        &self,
        _tenant: &str,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<RawHit>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.clone())
    }
}

/// Scripted model: answers per agent role, with critic verdicts consumed
/// from a queue. Records every (system, prompt) pair it sees.
pub struct ScriptedModel {
    pub critic_verdicts: Mutex<VecDeque<&'static str>>,
    pub prompts: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
    pub analysis_needs_external: bool,
    pub fail_all: bool,
}

impl ScriptedModel {
    pub fn new(critic_verdicts: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            critic_verdicts: Mutex::new(critic_verdicts.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            analysis_needs_external: false,
            fail_all: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            critic_verdicts: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            analysis_needs_external: false,
            fail_all: true,
        })
    }

    pub fn prompt_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn all_prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push((req.system.clone(), req.prompt.clone()));

        if self.fail_all {
            return Err(ModelError::Transient("rate limited".to_string()));
        }

        let text = if req.system.contains("analista") {
            format!(
                r#"{{"thesis": "pedido procede", "needs_external_info": {}, "gaps": [], "recommended_approach": "análise contratual", "complexity": "média"}}"#,
                self.analysis_needs_external
            )
        } else if req.system.contains("pesquisador") {
            r#"{"summary": "fontes suficientes localizadas", "useful_sources": []}"#.to_string()
        } else if req.system.contains("redator") {
            "## Parecer\n\n### I. Dos Fatos\nTrata-se de consulta contratual.\n\n### II. Análise\nConforme o contexto, as obrigações persistem.\n\n### III. Conclusão\nProcede."
                .to_string()
        } else if req.system.contains("revisor") {
            let verdict = self
                .critic_verdicts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or("accept");
            format!(
                r#"{{"verdict": "{verdict}", "report": "revisão concluída", "suggestions": ["detalhar fundamentação"], "quality_score": 0.85}}"#
            )
        } else {
            // formatter
            "# PARECER JURÍDICO\n\nDocumento formatado conforme normas ABNT.\n\nTexto final aprovado."
                .to_string()
        };

        Ok(ModelResponse {
            text,
            model: req.model.clone(),
            usage: TokenUsage {
                input: 120,
                output: 80,
            },
        })
    }
}

pub struct EngineUnderTest {
    pub engine: Engine,
    pub model: Arc<ScriptedModel>,
    pub embedder: Arc<CountingEmbedder>,
    pub vector: Arc<FixedVector>,
    pub lexical: Arc<FixedLexical>,
}

/// Engine wired to the standard internal corpus (doc-a, doc-b from the
/// vector leg; doc-b, doc-c from the lexical leg).
pub fn engine_with(model: Arc<ScriptedModel>) -> EngineUnderTest {
    let embedder = CountingEmbedder::new();
    let vector = FixedVector::new(vec![hit("doc-a", 1), hit("doc-b", 2)]);
    let lexical = FixedLexical::new(vec![hit("doc-b", 1), hit("doc-c", 2)]);
    let engine = Engine::builder(
        Arc::clone(&embedder) as Arc<dyn Embedder>,
        Arc::clone(&vector) as Arc<dyn VectorIndex>,
        Arc::clone(&lexical) as Arc<dyn LexicalIndex>,
        Arc::clone(&model) as Arc<dyn ModelClient>,
    )
    .build();
    EngineUnderTest {
        engine,
        model,
        embedder,
        vector,
        lexical,
    }
}
