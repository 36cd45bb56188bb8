use std::collections::HashMap;

use crate::scoring::min_max_normalize;

/// Reciprocal rank fusion (spec.md §4.4 step 2, k=60): combines independently-ranked
/// candidate lists into one score per chunk id by rank position alone, so an item
/// that's merely present in both lists with mediocre scores doesn't outrank an item
/// that tops one of them.
pub fn reciprocal_rank_fusion(lists: &[&[(String, f32)]], k: f32) -> HashMap<String, f32> {
    let mut fused: HashMap<String, f32> = HashMap::new();
    for list in lists {
        for (rank, (id, _score)) in list.iter().enumerate() {
            *fused.entry(id.clone()).or_insert(0.0) += 1.0 / (k + (rank + 1) as f32);
        }
    }
    fused
}

/// Weighted min-max-normalized sum fusion (spec.md §4.4 step 2, used when
/// `semantic_weight`/`keyword_weight` are supplied instead of RRF).
pub fn weighted_sum_fusion(
    semantic: &[(String, f32)],
    keyword: &[(String, f32)],
    semantic_weight: f32,
    keyword_weight: f32,
) -> HashMap<String, f32> {
    let mut fused: HashMap<String, f32> = HashMap::new();

    let semantic_scores: Vec<f32> = semantic.iter().map(|(_, score)| *score).collect();
    let semantic_norm = min_max_normalize(&semantic_scores);
    for ((id, _), norm) in semantic.iter().zip(semantic_norm) {
        *fused.entry(id.clone()).or_insert(0.0) += norm * semantic_weight;
    }

    let keyword_scores: Vec<f32> = keyword.iter().map(|(_, score)| *score).collect();
    let keyword_norm = min_max_normalize(&keyword_scores);
    for ((id, _), norm) in keyword.iter().zip(keyword_norm) {
        *fused.entry(id.clone()).or_insert(0.0) += norm * keyword_weight;
    }

    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_favors_top_rank_over_mid_rank_in_both_lists() {
        let list_a: Vec<(String, f32)> = vec![("top".into(), 0.9), ("mid".into(), 0.5)];
        let list_b: Vec<(String, f32)> = vec![("other".into(), 0.9), ("mid".into(), 0.5)];

        let fused = reciprocal_rank_fusion(&[&list_a, &list_b], 60.0);
        assert!(fused["top"] < fused["mid"]);
    }

    #[test]
    fn weighted_sum_defaults_favor_semantic() {
        let semantic: Vec<(String, f32)> = vec![("a".into(), 1.0), ("b".into(), 0.0)];
        let keyword: Vec<(String, f32)> = vec![("b".into(), 1.0), ("a".into(), 0.0)];

        let fused = weighted_sum_fusion(&semantic, &keyword, 0.7, 0.3);
        assert!(fused["a"] > fused["b"]);
    }
}
