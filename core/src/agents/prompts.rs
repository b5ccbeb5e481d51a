//! Versioned prompt templates.
//!
//! Templates are keyed by (agent kind, document type) with a `*` wildcard
//! document type as fallback. The library is process-wide and published
//! copy-on-write: a run resolves its templates from one snapshot and never
//! observes a mid-run reload.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::state::AgentKind;

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub version: String,
    pub system: String,
    /// Instructions with `{query}`, `{context}`, `{working}`,
    /// `{document_type}` placeholders.
    pub instructions: String,
}

impl PromptTemplate {
    pub fn render(&self, query: &str, context: &str, working: &str, document_type: &str) -> String {
        self.instructions
            .replace("{query}", query)
            .replace("{context}", context)
            .replace("{working}", working)
            .replace("{document_type}", document_type)
    }
}

type TemplateMap = HashMap<(AgentKind, String), Arc<PromptTemplate>>;

pub struct PromptLibrary {
    inner: RwLock<Arc<TemplateMap>>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptLibrary {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(builtin_templates())),
        }
    }

    /// Resolve the template for (kind, document type), falling back to the
    /// wildcard entry for the kind.
    pub async fn get(&self, kind: AgentKind, document_type: &str) -> Arc<PromptTemplate> {
        let map = Arc::clone(&*self.inner.read().await);
        map.get(&(kind, document_type.to_string()))
            .or_else(|| map.get(&(kind, "*".to_string())))
            .cloned()
            .expect("builtin templates cover every agent kind")
    }

    /// Publish a replacement template set. In-flight runs keep the snapshot
    /// they resolved from.
    pub async fn publish(&self, kind: AgentKind, document_type: &str, template: PromptTemplate) {
        let mut guard = self.inner.write().await;
        let mut next: TemplateMap = (**guard).clone();
        next.insert((kind, document_type.to_string()), Arc::new(template));
        *guard = Arc::new(next);
    }
}

fn builtin_templates() -> TemplateMap {
    let mut map = TemplateMap::new();

    map.insert(
        (AgentKind::Analyser, "*".to_string()),
        Arc::new(PromptTemplate {
            version: "analyser/1".to_string(),
            system: "Você é um analista jurídico sênior. Responda somente com JSON.".to_string(),
            instructions: "Pedido do cliente: {query}\n\nContexto recuperado:\n{context}\n\n\
                Analise o pedido para um documento do tipo '{document_type}'. Responda com um \
                objeto JSON com os campos: thesis (string), needs_external_info (bool), \
                gaps (lista de strings), recommended_approach (string), complexity (string)."
                .to_string(),
        }),
    );

    map.insert(
        (AgentKind::Researcher, "*".to_string()),
        Arc::new(PromptTemplate {
            version: "researcher/1".to_string(),
            system: "Você é um pesquisador jurídico. Responda somente com JSON.".to_string(),
            instructions: "Pedido: {query}\n\nResultados de busca:\n{context}\n\n\
                Resuma o que foi encontrado e aponte as fontes úteis. Responda com um objeto \
                JSON com os campos: summary (string), useful_sources (lista de ids)."
                .to_string(),
        }),
    );

    map.insert(
        (AgentKind::Drafter, "*".to_string()),
        Arc::new(PromptTemplate {
            version: "drafter/1".to_string(),
            system: "Você é um redator jurídico experiente. Escreva em markdown.".to_string(),
            instructions: "Pedido: {query}\n\nAnálise e trabalho anterior:\n{working}\n\n\
                Contexto:\n{context}\n\nRedija o documento do tipo '{document_type}' completo, \
                com seções numeradas (Fatos, Análise, Fundamentação, Conclusão). Cite as fontes \
                pelo id entre colchetes."
                .to_string(),
        }),
    );

    map.insert(
        (AgentKind::Critic, "*".to_string()),
        Arc::new(PromptTemplate {
            version: "critic/1".to_string(),
            system: "Você é um revisor jurídico rigoroso. Responda somente com JSON.".to_string(),
            instructions: "Pedido original: {query}\n\nRascunho a revisar:\n{working}\n\n\
                Avalie fundamentação, coerência e uso das fontes. Responda com um objeto JSON \
                com os campos: verdict ('accept' ou 'revise'), report (string), suggestions \
                (lista de strings), quality_score (número entre 0 e 1)."
                .to_string(),
        }),
    );

    map.insert(
        (AgentKind::Formatter, "*".to_string()),
        Arc::new(PromptTemplate {
            version: "formatter/1".to_string(),
            system: "Você aplica formatação ABNT a documentos jurídicos. Devolva apenas o texto \
                final."
                .to_string(),
            instructions: "Documento aprovado:\n{working}\n\nAplique a formatação final ABNT \
                para um documento do tipo '{document_type}': títulos, citações e referências \
                normalizadas. Devolva o texto completo."
                .to_string(),
        }),
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wildcard_fallback_resolves() {
        let lib = PromptLibrary::new();
        let t = lib.get(AgentKind::Drafter, "contrato").await;
        assert_eq!(t.version, "drafter/1");
    }

    #[tokio::test]
    async fn specific_document_type_wins() {
        let lib = PromptLibrary::new();
        lib.publish(
            AgentKind::Drafter,
            "contrato",
            PromptTemplate {
                version: "drafter/contrato/2".to_string(),
                system: "s".to_string(),
                instructions: "i".to_string(),
            },
        )
        .await;
        let t = lib.get(AgentKind::Drafter, "contrato").await;
        assert_eq!(t.version, "drafter/contrato/2");
        // Other document types keep the wildcard.
        let t = lib.get(AgentKind::Drafter, "parecer").await;
        assert_eq!(t.version, "drafter/1");
    }

    #[tokio::test]
    async fn render_substitutes_placeholders() {
        let lib = PromptLibrary::new();
        let t = lib.get(AgentKind::Analyser, "parecer").await;
        let rendered = t.render("minha consulta", "ctx", "w", "parecer");
        assert!(rendered.contains("minha consulta"));
        assert!(rendered.contains("'parecer'"));
        assert!(!rendered.contains("{query}"));
    }
}
