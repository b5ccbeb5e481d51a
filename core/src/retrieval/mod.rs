//! Federated retrieval.
//!
//! Three legs run concurrently with independent deadlines: semantic search
//! over the tenant's vector index, lexical search over the same corpus, and
//! in-memory ranking of caller-supplied documents. Their rankings are merged
//! with reciprocal-rank fusion, deduplicated and truncated. Partial failure
//! degrades; only an all-legs failure with no external documents counts as a
//! retrieval failure, and even that is recorded rather than thrown so the
//! supervisor can decide what it means for the run.

pub mod fusion;
pub mod personalize;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::executor::CancelToken;
use crate::state::ExternalDocument;
use fusion::reciprocal_rank_fusion;
use personalize::{cosine, infer_theme, shift_query, CentroidStore};
use types::{FusionParams, LegCounts, LegKind, RawHit, RetrievalRecord};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("leg deadline exceeded")]
    LegTimeout,
}

/// Embedding service boundary. The engine never embeds text itself.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// Tenant-scoped vector index boundary.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(
        &self,
        tenant_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<RawHit>, RetrievalError>;
}

/// Tenant-scoped lexical index boundary.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<RawHit>, RetrievalError>;
}

/// One retrieval request, as issued by the supervisor (directly or through
/// the `retrieve` tool).
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub tenant_id: String,
    pub k: usize,
    pub use_internal: bool,
    pub personalise: bool,
    pub alpha: f32,
    pub external_docs: Vec<ExternalDocument>,
}

/// Outcome of a federated search: the record that goes on the run state plus
/// coarse health flags for the supervisor.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub record: RetrievalRecord,
    pub degraded: bool,
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct FederatorConfig {
    pub k_rrf: u32,
    pub hard_ceiling: usize,
    pub leg_timeout: Duration,
    /// External documents are embedded over at most this many leading bytes.
    pub external_embed_limit: usize,
}

impl Default for FederatorConfig {
    fn default() -> Self {
        Self {
            k_rrf: 60,
            hard_ceiling: 100,
            leg_timeout: Duration::from_secs(5),
            external_embed_limit: 1_000,
        }
    }
}

/// Per-tenant retrieval statistics: live centroids plus search counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FederatorStats {
    pub tenant_id: String,
    pub centroid_count: usize,
    pub live_centroid_themes: Vec<String>,
    pub searches_total: u64,
    pub last_search_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct SearchCounter {
    searches: u64,
    last_search_at: DateTime<Utc>,
}

pub struct Federator {
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    centroids: Arc<CentroidStore>,
    counters: DashMap<String, SearchCounter>,
    cfg: FederatorConfig,
}

impl Federator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        centroids: Arc<CentroidStore>,
        cfg: FederatorConfig,
    ) -> Self {
        Self {
            embedder,
            vector,
            lexical,
            centroids,
            counters: DashMap::new(),
            cfg,
        }
    }

    pub fn centroids(&self) -> &Arc<CentroidStore> {
        &self.centroids
    }

    pub async fn stats(&self, tenant_id: &str) -> FederatorStats {
        let themes = self.centroids.themes(tenant_id).await;
        let (searches_total, last_search_at) = self
            .counters
            .get(tenant_id)
            .map(|c| (c.searches, Some(c.last_search_at)))
            .unwrap_or((0, None));
        FederatorStats {
            tenant_id: tenant_id.to_string(),
            centroid_count: themes.len(),
            live_centroid_themes: themes,
            searches_total,
            last_search_at,
        }
    }

    fn note_search(&self, tenant_id: &str) {
        let mut entry = self
            .counters
            .entry(tenant_id.to_string())
            .or_insert_with(|| SearchCounter {
                searches: 0,
                last_search_at: Utc::now(),
            });
        entry.searches += 1;
        entry.last_search_at = Utc::now();
    }

    /// Run the federated search. Cancellation is observed at every leg await.
    pub async fn search(&self, req: RetrievalRequest, cancel: &CancelToken) -> RetrievalOutcome {
        self.note_search(&req.tenant_id);
        let mut annotations: Vec<String> = Vec::new();
        let mut fusion = FusionParams {
            k_rrf: self.cfg.k_rrf,
            personalisation_alpha: req.alpha,
            personalisation_applied: false,
        };

        // k = 0 short-circuits before any network call.
        if req.k == 0 {
            return RetrievalOutcome {
                record: RetrievalRecord {
                    query: req.query,
                    theme: None,
                    requested_k: 0,
                    hits: Vec::new(),
                    fusion,
                    leg_counts: LegCounts::default(),
                    annotations,
                },
                degraded: false,
                failed: false,
            };
        }

        let mut k = req.k;
        if k > self.cfg.hard_ceiling {
            annotations.push(format!(
                "k_clamped: requested {} exceeds ceiling {}",
                k, self.cfg.hard_ceiling
            ));
            warn!(target: "retrieval", requested = k, ceiling = self.cfg.hard_ceiling, "Clamping k");
            k = self.cfg.hard_ceiling;
        }

        let wants_vectors = req.use_internal || !req.external_docs.is_empty();
        let mut query_vec: Option<Vec<f32>> = None;
        if wants_vectors {
            match timeout(self.cfg.leg_timeout, self.embedder.embed(&req.query)).await {
                Ok(Ok(v)) => query_vec = Some(personalize::normalise(v)),
                Ok(Err(e)) => {
                    annotations.push(format!("query_embedding_failed: {e}"));
                    warn!(target: "retrieval", error = %e, "Query embedding failed");
                }
                Err(_) => {
                    annotations.push("query_embedding_failed: deadline exceeded".to_string());
                }
            }
        }

        // Personalisation shifts the query vector toward the tenant centroid
        // for the inferred theme; absence or staleness skips it silently.
        let theme = infer_theme(&req.query).to_string();
        let mut semantic_query = query_vec.clone();
        if req.personalise && req.use_internal {
            match (&query_vec, self.centroids.get(&req.tenant_id, &theme).await) {
                (Some(q), Some(centroid)) => {
                    match shift_query(q, &centroid, req.alpha.clamp(0.0, 1.0)) {
                        Some(shifted) => {
                            debug!(
                                target: "retrieval.personalise",
                                tenant = %req.tenant_id,
                                theme = %theme,
                                alpha = req.alpha,
                                similarity = cosine(q, &shifted),
                                "Personalisation applied"
                            );
                            semantic_query = Some(shifted);
                            fusion.personalisation_applied = true;
                        }
                        None => {
                            annotations.push("personalisation_skipped".to_string());
                        }
                    }
                }
                _ => annotations.push("personalisation_skipped".to_string()),
            }
        }

        // Over-fetch per leg so fusion has room to disagree with any single
        // ranking, then truncate after dedup.
        let k_leg = (k * 2).min(self.cfg.hard_ceiling);

        let semantic_fut = async {
            let Some(vector) = &semantic_query else {
                return None;
            };
            if !req.use_internal {
                return None;
            }
            Some(
                timeout(
                    self.cfg.leg_timeout,
                    self.vector.search(&req.tenant_id, vector, k_leg),
                )
                .await
                .map_err(|_| RetrievalError::LegTimeout)
                .and_then(|r| r),
            )
        };
        let lexical_fut = async {
            if !req.use_internal {
                return None;
            }
            Some(
                timeout(
                    self.cfg.leg_timeout,
                    self.lexical.search(&req.tenant_id, &req.query, k_leg),
                )
                .await
                .map_err(|_| RetrievalError::LegTimeout)
                .and_then(|r| r),
            )
        };
        let external_fut = async {
            if req.external_docs.is_empty() {
                return None;
            }
            Some(
                self.score_external(&req.query, query_vec.as_deref(), &req.external_docs)
                    .await,
            )
        };

        let (semantic_res, lexical_res, external_res) = tokio::select! {
            res = async { tokio::join!(semantic_fut, lexical_fut, external_fut) } => res,
            _ = cancel.cancelled() => {
                annotations.push("cancelled".to_string());
                (None, None, None)
            }
        };

        let mut legs: Vec<(LegKind, Vec<RawHit>)> = Vec::new();
        let mut attempted = 0usize;
        let mut failed_legs = 0usize;
        let mut leg_counts = LegCounts::default();

        for (kind, res) in [
            (LegKind::Semantic, semantic_res),
            (LegKind::Lexical, lexical_res),
            (LegKind::External, external_res.map(Ok)),
        ] {
            let Some(res) = res else { continue };
            attempted += 1;
            match res {
                Ok(hits) => {
                    match kind {
                        LegKind::Semantic => leg_counts.semantic = hits.len(),
                        LegKind::Lexical => leg_counts.lexical = hits.len(),
                        LegKind::External => leg_counts.external = hits.len(),
                    }
                    legs.push((kind, hits));
                }
                Err(e) => {
                    failed_legs += 1;
                    annotations.push(format!("{}_leg_failed: {e}", kind.as_str()));
                    warn!(target: "retrieval", leg = kind.as_str(), error = %e, "Retrieval leg failed");
                }
            }
        }

        let degraded = failed_legs > 0 && failed_legs < attempted;
        let failed = attempted > 0 && failed_legs == attempted;
        if degraded {
            annotations.push("retrieval_degraded".to_string());
        }
        if failed {
            annotations.push("retrieval_failed".to_string());
        }

        let mut hits = reciprocal_rank_fusion(&legs, self.cfg.k_rrf);
        hits.truncate(k);
        for (i, hit) in hits.iter_mut().enumerate() {
            hit.rank = (i + 1) as u32;
            if fusion.personalisation_applied {
                hit.personalised_score = hit.semantic_score;
            }
        }

        info!(
            target: "retrieval",
            tenant = %req.tenant_id,
            theme = %theme,
            total = hits.len(),
            semantic = leg_counts.semantic,
            lexical = leg_counts.lexical,
            external = leg_counts.external,
            degraded,
            "Federated search complete"
        );

        RetrievalOutcome {
            record: RetrievalRecord {
                query: req.query,
                theme: Some(theme),
                requested_k: req.k,
                hits,
                fusion,
                leg_counts,
                annotations,
            },
            degraded,
            failed,
        }
    }

    /// Score caller-supplied documents in memory with the same scorers the
    /// internal legs use: embedding cosine blended with lexical overlap.
    async fn score_external(
        &self,
        query: &str,
        query_vec: Option<&[f32]>,
        docs: &[ExternalDocument],
    ) -> Vec<RawHit> {
        let query_tokens: Vec<String> = tokenize(query);
        let mut scored: Vec<(String, f32, String)> = Vec::with_capacity(docs.len());

        for doc in docs {
            let overlap = lexical_overlap(&query_tokens, &doc.text);
            let semantic = match query_vec {
                Some(qv) => {
                    let head = truncate_on_char_boundary(&doc.text, self.cfg.external_embed_limit);
                    match self.embedder.embed(head).await {
                        Ok(dv) => cosine(qv, &dv),
                        Err(e) => {
                            debug!(
                                target: "retrieval",
                                source = %doc.source_id,
                                error = %e,
                                "External document embedding failed; lexical score only"
                            );
                            0.0
                        }
                    }
                }
                None => 0.0,
            };
            let score = if query_vec.is_some() {
                0.6 * semantic + 0.4 * overlap
            } else {
                overlap
            };
            scored.push((doc.source_id.clone(), score, excerpt_of(&doc.text)));
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .enumerate()
            .map(|(i, (source_id, score, excerpt))| RawHit {
                source_id,
                score,
                rank: (i + 1) as u32,
                excerpt,
            })
            .collect()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

fn lexical_overlap(query_tokens: &[String], doc: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens: std::collections::HashSet<String> = tokenize(doc).into_iter().collect();
    let matched = query_tokens
        .iter()
        .filter(|t| doc_tokens.contains(*t))
        .count();
    matched as f32 / query_tokens.len() as f32
}

fn excerpt_of(text: &str) -> String {
    truncate_on_char_boundary(text, 280).to_string()
}

fn truncate_on_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
