//! Centroid personalisation.
//!
//! Each (tenant, theme) pair may have a precomputed centroid vector built
//! from the tenant's historical documents. When personalisation is on, the
//! query embedding is pulled toward that centroid before the semantic leg
//! runs. Centroids are published copy-on-write and expire after a TTL; an
//! absent or stale centroid silently disables the shift.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

/// Deterministic keyword classifier for the query's legal theme.
///
/// Themes and their keyword lists mirror the tenant corpora this engine is
/// tuned for. Ties resolve to the earliest theme in declaration order, so
/// classification is stable across runs.
const THEME_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "contratos_imobiliarios",
        &["imóvel", "imovel", "aluguel", "locação", "locacao", "compra", "venda", "propriedade"],
    ),
    (
        "litigios_tributarios",
        &["imposto", "tributo", "fisco", "receita", "icms", "ipi", "irpf"],
    ),
    (
        "direito_trabalhista",
        &["trabalho", "empregado", "salário", "salario", "férias", "ferias", "rescisão", "clt"],
    ),
    (
        "direito_civil",
        &["civil", "família", "familia", "divórcio", "sucessão", "herança", "responsabilidade"],
    ),
    (
        "direito_penal",
        &["crime", "penal", "denúncia", "denuncia", "prisão", "sentença"],
    ),
    (
        "direito_empresarial",
        &["empresa", "societário", "societario", "contrato", "negócio", "comercial", "cnpj"],
    ),
];

const FALLBACK_THEME: &str = "direito_civil";

/// Infer the thematic tag for a query. Pure and deterministic.
pub fn infer_theme(query: &str) -> &'static str {
    let lower = query.to_lowercase();
    let mut best: Option<(&'static str, usize)> = None;
    for (theme, keywords) in THEME_KEYWORDS {
        let score = keywords.iter().filter(|k| lower.contains(*k)).count();
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((theme, score));
        }
    }
    best.map(|(t, _)| t).unwrap_or(FALLBACK_THEME)
}

struct CentroidEntry {
    vector: Arc<Vec<f32>>,
    published_at: Instant,
}

/// Process-wide centroid cache with TTL-based staleness.
pub struct CentroidStore {
    ttl: Duration,
    inner: RwLock<HashMap<(String, String), CentroidEntry>>,
}

impl CentroidStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn publish(&self, tenant_id: &str, theme: &str, vector: Vec<f32>) {
        let mut guard = self.inner.write().await;
        guard.insert(
            (tenant_id.to_string(), theme.to_string()),
            CentroidEntry {
                vector: Arc::new(normalise(vector)),
                published_at: Instant::now(),
            },
        );
    }

    /// Fresh centroid for (tenant, theme); stale entries read as absent.
    pub async fn get(&self, tenant_id: &str, theme: &str) -> Option<Arc<Vec<f32>>> {
        let guard = self.inner.read().await;
        let entry = guard.get(&(tenant_id.to_string(), theme.to_string()))?;
        if entry.published_at.elapsed() > self.ttl {
            debug!(target: "retrieval.personalise", tenant = tenant_id, theme, "Centroid is stale");
            return None;
        }
        Some(Arc::clone(&entry.vector))
    }

    /// Themes with a live centroid for a tenant.
    pub async fn themes(&self, tenant_id: &str) -> Vec<String> {
        let guard = self.inner.read().await;
        let mut themes: Vec<String> = guard
            .iter()
            .filter(|((t, _), e)| t == tenant_id && e.published_at.elapsed() <= self.ttl)
            .map(|((_, theme), _)| theme.clone())
            .collect();
        themes.sort();
        themes
    }
}

/// Shift a query embedding toward a centroid:
/// `q' = normalise((1 − α)·q + α·c)`. Returns `None` on dimension mismatch.
pub fn shift_query(query: &[f32], centroid: &[f32], alpha: f32) -> Option<Vec<f32>> {
    if query.len() != centroid.len() || query.is_empty() {
        return None;
    }
    let blended: Vec<f32> = query
        .iter()
        .zip(centroid)
        .map(|(q, c)| (1.0 - alpha) * q + alpha * c)
        .collect();
    Some(normalise(blended))
}

pub fn normalise(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
