//! The built-in tool set: retrieval, jurisprudence lookup, citation
//! formatting, quality scoring and document analysis.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::executor::CancelToken;
use crate::retrieval::{Federator, RetrievalRequest};
use crate::state::ExternalDocument;

use super::error::{ToolError, ToolResult};
use super::registry::Tool;
use super::schema::{ParamKind, ParamSpec, ToolSchema};

fn execution_error(tool: &str, message: impl Into<String>, recoverable: bool) -> ToolError {
    ToolError::Execution {
        tool: tool.to_string(),
        message: message.into(),
        recoverable,
    }
}

// ---------------------------------------------------------------------------
// retrieve
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RetrieveArgs {
    query: String,
    tenant_id: String,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default = "default_true")]
    use_internal: bool,
    #[serde(default = "default_true")]
    personalise: bool,
    #[serde(default = "default_alpha")]
    alpha: f32,
    #[serde(default)]
    external_docs: Vec<ExternalDocument>,
}

fn default_k() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_alpha() -> f32 {
    0.25
}

/// Federated search exposed through the registry. The caller merges the
/// returned record into the run state; the tool itself holds no state.
pub struct RetrieveTool {
    federator: Arc<Federator>,
}

impl RetrieveTool {
    pub fn new(federator: Arc<Federator>) -> Self {
        Self { federator }
    }
}

#[async_trait]
impl Tool for RetrieveTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "retrieve".into(),
            description: "Federated hybrid search over the tenant corpus and caller documents"
                .into(),
            params: vec![
                ParamSpec::required("query", ParamKind::String, "search query"),
                ParamSpec::required("tenant_id", ParamKind::String, "owning tenant"),
                ParamSpec::optional("k", ParamKind::Integer, "desired total result count"),
                ParamSpec::optional("use_internal", ParamKind::Boolean, "search the internal corpus"),
                ParamSpec::optional("personalise", ParamKind::Boolean, "apply centroid bias"),
                ParamSpec::optional("alpha", ParamKind::Float, "personalisation strength"),
                ParamSpec::optional("external_docs", ParamKind::Array, "caller-supplied documents"),
            ],
            returns: "retrieval record with fused, ranked hits".into(),
        }
    }

    async fn call(&self, args: Value) -> ToolResult<Value> {
        let args: RetrieveArgs = serde_json::from_value(args)
            .map_err(|e| execution_error("retrieve", e.to_string(), false))?;
        let outcome = self
            .federator
            .search(
                RetrievalRequest {
                    query: args.query,
                    tenant_id: args.tenant_id,
                    k: args.k,
                    use_internal: args.use_internal,
                    personalise: args.personalise,
                    alpha: args.alpha,
                    external_docs: args.external_docs,
                },
                &CancelToken::new(),
            )
            .await;
        Ok(json!({
            "record": outcome.record,
            "degraded": outcome.degraded,
            "failed": outcome.failed,
        }))
    }
}

// ---------------------------------------------------------------------------
// jurisprudence_search
// ---------------------------------------------------------------------------

/// One precedent entry from a court search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precedent {
    pub id: String,
    pub court: String,
    pub case_number: String,
    pub rapporteur: String,
    pub decided_on: String,
    pub headnote: String,
    pub relevance: f32,
}

/// Upstream jurisprudence source boundary.
#[async_trait]
pub trait JurisprudenceProvider: Send + Sync {
    async fn search(&self, topic: &str, court: &str, limit: usize) -> ToolResult<Vec<Precedent>>;
}

/// Offline provider producing deterministic entries derived from the topic.
/// Stands in until a real court API client is wired up.
pub struct CannedJurisprudence;

#[async_trait]
impl JurisprudenceProvider for CannedJurisprudence {
    async fn search(&self, topic: &str, court: &str, limit: usize) -> ToolResult<Vec<Precedent>> {
        let entries = vec![
            Precedent {
                id: format!("{court}-0001"),
                court: court.to_string(),
                case_number: "123456-78.2023.8.00.0000".to_string(),
                rapporteur: "Min. Rel. designado".to_string(),
                decided_on: "2023-06-15".to_string(),
                headnote: format!("Entendimento consolidado sobre {topic}."),
                relevance: 0.95,
            },
            Precedent {
                id: format!("{court}-0002"),
                court: court.to_string(),
                case_number: "654321-12.2023.8.00.0000".to_string(),
                rapporteur: "Min. Rel. substituto".to_string(),
                decided_on: "2023-08-22".to_string(),
                headnote: format!("Precedente com análise aprofundada de {topic}."),
                relevance: 0.88,
            },
        ];
        Ok(entries.into_iter().take(limit).collect())
    }
}

pub struct JurisprudenceSearchTool {
    provider: Arc<dyn JurisprudenceProvider>,
}

impl JurisprudenceSearchTool {
    pub fn new(provider: Arc<dyn JurisprudenceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for JurisprudenceSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "jurisprudence_search".into(),
            description: "Search superior-court precedents on a topic".into(),
            params: vec![
                ParamSpec::required("topic", ParamKind::String, "legal topic to search"),
                ParamSpec::optional("court", ParamKind::String, "court identifier, default STJ"),
                ParamSpec::optional("limit", ParamKind::Integer, "maximum results, default 3"),
            ],
            returns: "list of precedents with headnotes and relevance".into(),
        }
    }

    async fn call(&self, args: Value) -> ToolResult<Value> {
        let topic = args["topic"].as_str().unwrap_or_default().to_string();
        let court = args["court"].as_str().unwrap_or("STJ").to_string();
        let limit = args["limit"].as_u64().unwrap_or(3) as usize;
        debug!(target: "tools.jurisprudence", %topic, %court, limit, "Searching precedents");
        let results = self.provider.search(&topic, &court, limit).await?;
        Ok(json!({
            "topic": topic,
            "court": court,
            "results": results,
        }))
    }
}

// ---------------------------------------------------------------------------
// format_citation
// ---------------------------------------------------------------------------

/// Normalise a raw citation string into ABNT-flavoured reference form.
pub struct FormatCitationTool;

#[async_trait]
impl Tool for FormatCitationTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "format_citation".into(),
            description: "Format a raw citation in ABNT reference style".into(),
            params: vec![
                ParamSpec::required("raw", ParamKind::String, "raw citation text"),
                ParamSpec::optional(
                    "kind",
                    ParamKind::String,
                    "one of case, statute, doctrine; default case",
                ),
            ],
            returns: "formatted citation string".into(),
        }
    }

    async fn call(&self, args: Value) -> ToolResult<Value> {
        let raw = args["raw"].as_str().unwrap_or_default().trim();
        if raw.is_empty() {
            return Err(execution_error("format_citation", "empty citation", false));
        }
        let kind = args["kind"].as_str().unwrap_or("case");
        let formatted = match kind {
            "statute" => format!("BRASIL. {}.", capitalise_first(raw)),
            "doctrine" => {
                // "Author, Title" becomes "AUTHOR. Title."
                match raw.split_once(',') {
                    Some((author, title)) => {
                        format!("{}. {}.", author.trim().to_uppercase(), title.trim())
                    }
                    None => format!("{}.", capitalise_first(raw)),
                }
            }
            _ => format!("{}.", raw.trim_end_matches('.').to_uppercase()),
        };
        Ok(json!({ "kind": kind, "formatted": formatted }))
    }
}

fn capitalise_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// quality_score
// ---------------------------------------------------------------------------

/// Heuristic draft quality metrics: context recall, faithfulness of the
/// draft's sentences to the retrieved excerpts, citation accuracy against
/// the supplied source ids, plus structure, length and answer relevancy.
pub struct QualityScoreTool {
    citation: Regex,
}

impl Default for QualityScoreTool {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityScoreTool {
    pub fn new() -> Self {
        Self {
            // Drafts cite sources by id between square brackets.
            citation: Regex::new(r"\[([A-Za-z0-9][A-Za-z0-9_.:-]*)\]").expect("static pattern"),
        }
    }
}

fn content_tokens(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(String::from)
        .collect()
}

#[async_trait]
impl Tool for QualityScoreTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "quality_score".into(),
            description: "Score a draft against the retrieved context".into(),
            params: vec![
                ParamSpec::required("draft", ParamKind::String, "draft text"),
                ParamSpec::optional(
                    "context_sources",
                    ParamKind::Array,
                    "source ids supplied to the drafter",
                ),
                ParamSpec::optional(
                    "context_excerpts",
                    ParamKind::Array,
                    "excerpts of the retrieved context, for faithfulness",
                ),
                ParamSpec::optional("query", ParamKind::String, "original request"),
            ],
            returns: "metric map with an overall score in [0, 1]".into(),
        }
    }

    async fn call(&self, args: Value) -> ToolResult<Value> {
        let draft = args["draft"].as_str().unwrap_or_default();
        if draft.trim().is_empty() {
            return Err(execution_error("quality_score", "empty draft", false));
        }
        let sources: Vec<String> = args["context_sources"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let excerpts: Vec<String> = args["context_excerpts"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let cited = sources
            .iter()
            .filter(|s| draft.contains(s.as_str()))
            .count();
        let context_recall = if sources.is_empty() {
            1.0
        } else {
            cited as f64 / sources.len() as f64
        };

        // Faithfulness: share of draft sentences grounded in at least one
        // retrieved excerpt (by content-token overlap). With no excerpts
        // there is nothing to contradict.
        let excerpt_tokens: std::collections::HashSet<String> = excerpts
            .iter()
            .flat_map(|e| content_tokens(e))
            .collect();
        let faithfulness = if excerpt_tokens.is_empty() {
            1.0
        } else {
            let sentences: Vec<std::collections::HashSet<String>> = draft
                .split(['.', '!', '?', '\n'])
                .map(content_tokens)
                .filter(|tokens| !tokens.is_empty())
                .collect();
            if sentences.is_empty() {
                1.0
            } else {
                let supported = sentences
                    .iter()
                    .filter(|tokens| tokens.iter().any(|t| excerpt_tokens.contains(t)))
                    .count();
                supported as f64 / sentences.len() as f64
            }
        };

        // Citation accuracy: bracketed citations must resolve to supplied
        // source ids. With sources but no citations at all, the draft is
        // uncited; with no sources there is nothing to cite.
        let citations: Vec<&str> = self
            .citation
            .captures_iter(draft)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        let citation_accuracy = if sources.is_empty() {
            1.0
        } else if citations.is_empty() {
            0.0
        } else {
            let resolved = citations
                .iter()
                .filter(|c| sources.iter().any(|s| s == *c))
                .count();
            resolved as f64 / citations.len() as f64
        };

        let sections = draft.matches("##").count();
        let structure = (sections as f64 / 4.0).min(1.0);

        let words = draft.split_whitespace().count();
        let length_score = ((words as f64) / 400.0).min(1.0);

        let query_terms: Vec<String> = args["query"]
            .as_str()
            .unwrap_or_default()
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 3)
            .map(String::from)
            .collect();
        let draft_lower = draft.to_lowercase();
        let answered = if query_terms.is_empty() {
            1.0
        } else {
            query_terms
                .iter()
                .filter(|t| draft_lower.contains(t.as_str()))
                .count() as f64
                / query_terms.len() as f64
        };

        let overall = 0.25 * context_recall
            + 0.2 * faithfulness
            + 0.2 * citation_accuracy
            + 0.15 * structure
            + 0.1 * length_score
            + 0.1 * answered;

        Ok(json!({
            "context_recall": context_recall,
            "faithfulness": faithfulness,
            "citation_accuracy": citation_accuracy,
            "structure": structure,
            "length_score": length_score,
            "answer_relevancy": answered,
            "overall": overall,
        }))
    }
}

// ---------------------------------------------------------------------------
// document_analyse
// ---------------------------------------------------------------------------

/// Extract clause references, deadlines and monetary amounts from a
/// document. Regex-driven; aspects are selectable.
pub struct DocumentAnalyseTool {
    clause: Regex,
    deadline: Regex,
    amount: Regex,
}

impl Default for DocumentAnalyseTool {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentAnalyseTool {
    pub fn new() -> Self {
        Self {
            clause: Regex::new(r"(?i)\bcl[áa]usula\s+(\d+(?:\.\d+)*)").expect("static pattern"),
            deadline: Regex::new(r"(?i)\b(\d+)\s+(dias?|meses|anos?)\b").expect("static pattern"),
            amount: Regex::new(r"R\$\s?\d{1,3}(?:\.\d{3})*(?:,\d{2})?").expect("static pattern"),
        }
    }
}

#[async_trait]
impl Tool for DocumentAnalyseTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "document_analyse".into(),
            description: "Extract clauses, deadlines and amounts from a document".into(),
            params: vec![
                ParamSpec::required("text", ParamKind::String, "document text"),
                ParamSpec::optional(
                    "aspects",
                    ParamKind::Array,
                    "subset of clauses, deadlines, amounts; default all",
                ),
            ],
            returns: "map from aspect to extracted values".into(),
        }
    }

    async fn call(&self, args: Value) -> ToolResult<Value> {
        let text = args["text"].as_str().unwrap_or_default();
        if text.trim().is_empty() {
            return Err(execution_error("document_analyse", "empty document", false));
        }
        let aspects: Vec<String> = args["aspects"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    "clauses".to_string(),
                    "deadlines".to_string(),
                    "amounts".to_string(),
                ]
            });

        let mut out = serde_json::Map::new();
        for aspect in &aspects {
            let values: Vec<String> = match aspect.as_str() {
                "clauses" => self
                    .clause
                    .captures_iter(text)
                    .map(|c| c[1].to_string())
                    .collect(),
                "deadlines" => self
                    .deadline
                    .find_iter(text)
                    .map(|m| m.as_str().to_string())
                    .collect(),
                "amounts" => self
                    .amount
                    .find_iter(text)
                    .map(|m| m.as_str().to_string())
                    .collect(),
                other => {
                    return Err(execution_error(
                        "document_analyse",
                        format!("unknown aspect '{other}'"),
                        false,
                    ));
                }
            };
            out.insert(aspect.clone(), json!(values));
        }

        Ok(Value::Object(out))
    }
}
