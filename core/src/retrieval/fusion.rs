//! Reciprocal-rank fusion over the per-leg rankings.

use std::collections::BTreeMap;

use super::types::{LegKind, Origin, RawHit, RetrievalHit};

#[derive(Debug, Default)]
struct FusedDoc {
    fused: f64,
    min_rank: u32,
    excerpt: String,
    semantic_score: Option<f32>,
    lexical_score: Option<f32>,
    external_score: Option<f32>,
    internal: bool,
    external: bool,
}

/// Fuse the per-leg rankings with RRF.
///
/// Fused score of a document is `Σ 1 / (k_rrf + rank)` over the legs it
/// appears in. Ordering is stable: equal fused scores break by the better
/// (lower) single-leg rank, then by source id lexical order. A source id
/// seen both internally and externally collapses to one hit tagged `Both`.
pub fn reciprocal_rank_fusion(legs: &[(LegKind, Vec<RawHit>)], k_rrf: u32) -> Vec<RetrievalHit> {
    let mut docs: BTreeMap<String, FusedDoc> = BTreeMap::new();

    for (leg, hits) in legs {
        for hit in hits {
            let entry = docs.entry(hit.source_id.clone()).or_insert_with(|| FusedDoc {
                min_rank: u32::MAX,
                ..Default::default()
            });
            entry.fused += 1.0 / f64::from(k_rrf + hit.rank);
            entry.min_rank = entry.min_rank.min(hit.rank);
            if entry.excerpt.is_empty() {
                entry.excerpt = hit.excerpt.clone();
            }
            match leg {
                LegKind::Semantic => {
                    entry.semantic_score = Some(hit.score);
                    entry.internal = true;
                }
                LegKind::Lexical => {
                    entry.lexical_score = Some(hit.score);
                    entry.internal = true;
                }
                LegKind::External => {
                    entry.external_score = Some(hit.score);
                    entry.external = true;
                }
            }
        }
    }

    let mut fused: Vec<(String, FusedDoc)> = docs.into_iter().collect();
    fused.sort_by(|(id_a, a), (id_b, b)| {
        b.fused
            .total_cmp(&a.fused)
            .then(a.min_rank.cmp(&b.min_rank))
            .then(id_a.cmp(id_b))
    });

    fused
        .into_iter()
        .enumerate()
        .map(|(i, (source_id, doc))| {
            let origin = match (doc.internal, doc.external) {
                (true, true) => Origin::Both,
                (false, true) => Origin::External,
                _ => Origin::Internal,
            };
            RetrievalHit {
                source_id,
                excerpt: doc.excerpt,
                origin,
                semantic_score: doc.semantic_score,
                lexical_score: doc.lexical_score.or(doc.external_score),
                fused_score: doc.fused as f32,
                rank: (i + 1) as u32,
                personalised_score: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, rank: u32) -> RawHit {
        RawHit {
            source_id: id.to_string(),
            score: 1.0 / rank as f32,
            rank,
            excerpt: format!("excerpt {id}"),
        }
    }

    #[test]
    fn document_in_both_legs_outranks_single_leg() {
        let legs = vec![
            (LegKind::Semantic, vec![hit("a", 1), hit("b", 2)]),
            (LegKind::Lexical, vec![hit("b", 1), hit("c", 2)]),
        ];
        let fused = reciprocal_rank_fusion(&legs, 60);
        assert_eq!(fused[0].source_id, "b");
        assert_eq!(fused[0].rank, 1);
        // 1/61 + 1/62 > 1/61
        assert!(fused[0].fused_score > fused[1].fused_score);
    }

    #[test]
    fn ties_break_by_min_rank_then_source_id() {
        // "x" at rank 2 semantic, "y" at rank 2 lexical: identical fused
        // score and identical min rank, so lexical source-id order decides.
        let legs = vec![
            (LegKind::Semantic, vec![hit("a", 1), hit("y", 2)]),
            (LegKind::Lexical, vec![hit("a", 1), hit("x", 2)]),
        ];
        let fused = reciprocal_rank_fusion(&legs, 60);
        let order: Vec<&str> = fused.iter().map(|h| h.source_id.as_str()).collect();
        assert_eq!(order, vec!["a", "x", "y"]);
    }

    #[test]
    fn single_leg_preserves_ranks() {
        let legs = vec![(
            LegKind::External,
            vec![hit("d1", 1), hit("d2", 2), hit("d3", 3)],
        )];
        let fused = reciprocal_rank_fusion(&legs, 60);
        let order: Vec<&str> = fused.iter().map(|h| h.source_id.as_str()).collect();
        assert_eq!(order, vec!["d1", "d2", "d3"]);
        assert_eq!(fused[0].origin, Origin::External);
    }

    #[test]
    fn duplicate_across_internal_and_external_becomes_both() {
        let legs = vec![
            (LegKind::Semantic, vec![hit("dup", 1)]),
            (LegKind::External, vec![hit("dup", 1)]),
        ];
        let fused = reciprocal_rank_fusion(&legs, 60);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].origin, Origin::Both);
    }

    #[test]
    fn fusion_is_deterministic() {
        let legs = vec![
            (LegKind::Semantic, vec![hit("a", 1), hit("b", 2), hit("c", 3)]),
            (LegKind::Lexical, vec![hit("c", 1), hit("a", 2)]),
        ];
        let one = reciprocal_rank_fusion(&legs, 60);
        let two = reciprocal_rank_fusion(&legs, 60);
        let ids = |v: &[RetrievalHit]| v.iter().map(|h| h.source_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&one), ids(&two));
    }
}
