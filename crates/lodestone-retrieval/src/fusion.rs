//! Merging lexical and dense recall into one candidate pool.

use std::collections::HashMap;

use crate::store::{DenseHit, LexicalHit};

/// Reciprocal Rank Fusion constant.
pub const RRF_K: f64 = 60.0;

/// A chunk that survived fusion, with its per-list ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    /// Chunk id.
    pub chunk_id: i64,
    /// `Σ 1 / (RRF_K + rank + 1)` over the lists containing the chunk.
    pub rrf_score: f64,
    /// 0-based rank in the lexical list.
    pub lexical_rank: Option<usize>,
    /// 0-based rank in the dense list.
    pub dense_rank: Option<usize>,
}

/// Merge lexical and dense hits, deduplicating by chunk id.
///
/// Lexical hits keep their order and come first; dense hits not already
/// present follow in their own order. The RRF score is carried along for
/// use when reranking degrades, but does not reorder the pool.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::fusion::fuse;
/// use lodestone_retrieval::store::{DenseHit, LexicalHit};
///
/// let lexical = [LexicalHit { chunk_id: 2, score: 3.0 }, LexicalHit { chunk_id: 1, score: 1.0 }];
/// let dense = [DenseHit { chunk_id: 1, score: 0.9 }, DenseHit { chunk_id: 7, score: 0.5 }];
/// let ids: Vec<i64> = fuse(&lexical, &dense).iter().map(|c| c.chunk_id).collect();
/// assert_eq!(ids, vec![2, 1, 7]);
/// ```
pub fn fuse(lexical: &[LexicalHit], dense: &[DenseHit]) -> Vec<FusedCandidate> {
    let mut pool: Vec<FusedCandidate> = Vec::with_capacity(lexical.len() + dense.len());
    let mut position: HashMap<i64, usize> = HashMap::new();

    let lexical_ids = lexical.iter().map(|h| h.chunk_id);
    for (rank, id) in lexical_ids.enumerate() {
        if position.contains_key(&id) {
            continue;
        }
        position.insert(id, pool.len());
        pool.push(FusedCandidate {
            chunk_id: id,
            rrf_score: rrf(rank),
            lexical_rank: Some(rank),
            dense_rank: None,
        });
    }

    for (rank, hit) in dense.iter().enumerate() {
        match position.get(&hit.chunk_id) {
            Some(&i) => {
                let candidate = &mut pool[i];
                if candidate.dense_rank.is_none() {
                    candidate.dense_rank = Some(rank);
                    candidate.rrf_score += rrf(rank);
                }
            }
            None => {
                position.insert(hit.chunk_id, pool.len());
                pool.push(FusedCandidate {
                    chunk_id: hit.chunk_id,
                    rrf_score: rrf(rank),
                    lexical_rank: None,
                    dense_rank: Some(rank),
                });
            }
        }
    }

    pool
}

fn rrf(rank: usize) -> f64 {
    1.0 / (RRF_K + rank as f64 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(ids: &[i64]) -> Vec<LexicalHit> {
        ids.iter()
            .map(|&chunk_id| LexicalHit { chunk_id, score: 1.0 })
            .collect()
    }

    fn dense(ids: &[i64]) -> Vec<DenseHit> {
        ids.iter()
            .map(|&chunk_id| DenseHit { chunk_id, score: 0.5 })
            .collect()
    }

    #[test]
    fn each_id_appears_once_with_lexical_order_first() {
        let fused = fuse(&lex(&[5, 3, 9]), &dense(&[9, 4, 5, 8]));
        let ids: Vec<i64> = fused.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![5, 3, 9, 4, 8]);
    }

    #[test]
    fn shared_ids_accumulate_rrf() {
        let fused = fuse(&lex(&[1, 2]), &dense(&[2]));
        let shared = &fused[1];
        assert_eq!(shared.lexical_rank, Some(1));
        assert_eq!(shared.dense_rank, Some(0));
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((shared.rrf_score - expected).abs() < 1e-12);
        assert!(shared.rrf_score > fused[0].rrf_score);
    }

    #[test]
    fn duplicate_ids_within_a_list_are_ignored() {
        let fused = fuse(&lex(&[1, 1]), &dense(&[2, 2]));
        assert_eq!(fused.len(), 2);
        assert!((fused[1].rrf_score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn empty_inputs() {
        assert!(fuse(&[], &[]).is_empty());
        assert_eq!(fuse(&[], &dense(&[3]))[0].chunk_id, 3);
    }
}
