//! Cosine similarity and top-K ranking over embedding vectors.
//!
//! Everything here is pure: no allocation beyond the returned results and no
//! shared state, so the same functions back both the compute worker's `Rank`
//! handler and caller-side ranking.

use serde::{Deserialize, Serialize};

/// A ranked match for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Path of the matched file
    pub path: String,
    /// Cosine similarity score
    pub score: f32,
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when either vector has zero magnitude, the lengths differ, or
/// a component is not finite.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    similarity_with_norm(a, l2_norm(a), b)
}

/// Cosine similarity with the query norm precomputed.
fn similarity_with_norm(query: &[f32], query_norm: f32, target: &[f32]) -> f32 {
    if query.len() != target.len() || query_norm < f32::EPSILON {
        return 0.0;
    }

    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    let score = dot_product / (query_norm * target_norm);
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Indices and scores of the `k` corpus vectors most similar to `query`.
///
/// Sorted by descending score. Equal scores keep corpus order.
pub fn top_k<'a, I>(query: &[f32], corpus: I, k: usize) -> Vec<(usize, f32)>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    if k == 0 {
        return Vec::new();
    }

    let query_norm = l2_norm(query);
    let mut scored: Vec<(usize, f32)> = corpus
        .into_iter()
        .enumerate()
        .map(|(idx, vector)| (idx, similarity_with_norm(query, query_norm, vector)))
        .collect();

    // sort_by is stable, so ties stay in insertion order
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}

/// Rank `(path, vector)` pairs against `query`, keeping the best `k`.
pub fn rank(query: &[f32], corpus: &[(String, Vec<f32>)], k: usize) -> Vec<SearchResult> {
    top_k(query, corpus.iter().map(|(_, v)| v.as_slice()), k)
        .into_iter()
        .map(|(idx, score)| SearchResult {
            path: corpus[idx].0.clone(),
            score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(vectors: &[(&str, Vec<f32>)]) -> Vec<(String, Vec<f32>)> {
        vectors
            .iter()
            .map(|(p, v)| (p.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let pairs = [
            (vec![1.0, 2.0, 3.0], vec![-0.5, 4.0, 0.25]),
            (vec![0.3, 0.0, -7.0], vec![1.0, 1.0, 1.0]),
            (vec![9.0, -9.0, 0.1], vec![0.0, 0.0, 0.0]),
        ];

        for (a, b) in pairs {
            assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
        }
    }

    #[test]
    fn test_self_similarity_is_one() {
        for v in [vec![1.0, 0.0, 0.0], vec![0.2, -3.0, 5.5], vec![1e-3, 1e-3, 1e-3]] {
            assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];

        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn test_length_mismatch_scores_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_top_k_respects_limit_and_order() {
        let vectors: Vec<Vec<f32>> = (0..10).map(|i| vec![1.0, i as f32 * 0.1, 0.0]).collect();
        let query = vec![1.0, 0.0, 0.0];

        let results = top_k(&query, vectors.iter().map(|v| v.as_slice()), 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, 0);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }

        let all = top_k(&query, vectors.iter().map(|v| v.as_slice()), 50);
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn test_top_k_zero_returns_nothing() {
        let vectors = vec![vec![1.0, 0.0]];
        assert!(top_k(&[1.0, 0.0], vectors.iter().map(|v| v.as_slice()), 0).is_empty());
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let corpus = corpus(&[
            ("c.txt", vec![0.0, 1.0]),
            ("a.txt", vec![1.0, 0.0]),
            ("b.txt", vec![2.0, 0.0]),
            ("d.txt", vec![3.0, 0.0]),
        ]);

        let results = rank(&[1.0, 0.0], &corpus, 10);
        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "d.txt", "c.txt"]);
    }

    #[test]
    fn test_rank_maps_paths() {
        let corpus = corpus(&[
            ("/docs/tax.pdf", vec![0.9, 0.1, 0.0]),
            ("/music/song.mp3", vec![0.0, 0.0, 1.0]),
        ]);

        let results = rank(&[1.0, 0.0, 0.0], &corpus, 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/docs/tax.pdf");
        assert!(results[0].score > 0.9);
    }

    #[test]
    fn test_non_finite_components_score_zero() {
        let v = vec![1.0, 0.0];
        assert_eq!(cosine_similarity(&v, &[f32::NAN, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[f32::INFINITY, 0.0], &v), 0.0);
    }

    #[test]
    fn test_nan_vectors_rank_last() {
        let corpus = corpus(&[
            ("nan.txt", vec![f32::NAN, f32::NAN]),
            ("near.txt", vec![1.0, 0.1]),
            ("inf.txt", vec![f32::INFINITY, 0.0]),
            ("far.txt", vec![0.1, 1.0]),
        ]);

        let results = rank(&[1.0, 0.0], &corpus, 10);
        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["near.txt", "far.txt", "nan.txt", "inf.txt"]);
        assert!(results.iter().all(|r| r.score.is_finite()));
    }
}
