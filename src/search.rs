//! Shared top-k ranking: a bounded max-heap per worker thread, merged
//! into one sorted result list. Used by both the flat-store driver
//! (bit-cosine / dense-cosine over every resident row) and the
//! inverted-index driver (cosine over postings reachable from a query's
//! word list).

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::id::Id;

/// Default number of candidates a sparse (inverted-index) search must
/// collect hits for before it is considered resolvable; queries whose
/// word lists touch fewer distinct rows than this return whatever they
/// found rather than erroring.
pub const DEFAULT_HIT_THRESHOLD: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct Hit {
    pub id: Id,
    pub similarity: f32,
}

impl Eq for Hit {}

impl Ord for Hit {
    fn cmp(&self, other: &Hit) -> Ordering {
        // Reverse so a `BinaryHeap<Hit>` is a min-heap on similarity,
        // letting `push`+pop-smallest implement a bounded top-k heap.
        other
            .similarity
            .partial_cmp(&self.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.as_bytes().cmp(other.id.as_bytes()))
    }
}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Hit) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A bounded min-heap keeping the `limit` highest-similarity hits seen
/// so far.
struct TopK {
    limit: usize,
    heap: std::collections::BinaryHeap<Hit>,
}

impl TopK {
    fn new(limit: usize) -> TopK {
        TopK {
            limit,
            heap: std::collections::BinaryHeap::with_capacity(limit + 1),
        }
    }

    fn offer(&mut self, hit: Hit) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() < self.limit {
            self.heap.push(hit);
        } else if let Some(worst) = self.heap.peek() {
            if hit.similarity > worst.similarity {
                self.heap.pop();
                self.heap.push(hit);
            }
        }
    }

    fn into_sorted(self) -> Vec<Hit> {
        let mut v: Vec<Hit> = self.heap.into_vec();
        v.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
        });
        v
    }
}

/// Rank `candidates` against a scoring closure, in parallel, returning
/// the top `limit` by descending similarity. Each rayon thread keeps
/// its own bounded heap; partial heaps are merged by folding `offer`
/// calls from the smaller into the larger, avoiding a single
/// lock-contended shared structure.
pub fn rank_top_k<T, F>(candidates: &[T], limit: usize, score: F) -> Vec<Hit>
where
    T: Sync,
    F: Fn(&T) -> Option<(Id, f32)> + Sync,
{
    if limit == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let chunk_size = (candidates.len() / num_cpus::get().max(1)).max(1);
    let merged = candidates
        .par_chunks(chunk_size)
        .map(|chunk| {
            let mut local = TopK::new(limit);
            for item in chunk {
                if let Some((id, similarity)) = score(item) {
                    local.offer(Hit { id, similarity });
                }
            }
            local.into_sorted()
        })
        .reduce(Vec::new, |mut acc, chunk_top| {
            let mut merged = TopK::new(limit);
            for hit in acc.drain(..).chain(chunk_top) {
                merged.offer(hit);
            }
            merged.into_sorted()
        });
    merged
}

/// Cosine similarity between two sparse word lists (both strictly
/// ascending, deduplicated), with a per-word weight function applied to
/// both numerator and the query's own norm contribution. Words absent
/// from the per-word weight table default to weight `1.0` via the
/// `weight` closure's own default.
pub fn sparse_cosine<F>(a: &[u32], b: &[u32], weight: F) -> f32
where
    F: Fn(u32) -> f32,
{
    let mut i = 0usize;
    let mut j = 0usize;
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => {
                let w = weight(a[i]);
                norm_a += w * w;
                i += 1;
            }
            Ordering::Greater => {
                let w = weight(b[j]);
                norm_b += w * w;
                j += 1;
            }
            Ordering::Equal => {
                let w = weight(a[i]);
                dot += w * w;
                norm_a += w * w;
                norm_b += w * w;
                i += 1;
                j += 1;
            }
        }
    }
    for &w in &a[i..] {
        let v = weight(w);
        norm_a += v * v;
    }
    for &w in &b[j..] {
        let v = weight(w);
        norm_b += v * v;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

#[cfg(test)]
mod search_test {
    use super::*;

    #[test]
    fn test_rank_top_k_orders_descending_and_truncates() {
        let candidates: Vec<(Id, f32)> = (0..20)
            .map(|i| (Id::of_data(format!("item-{}", i).as_bytes()), i as f32))
            .collect();
        let hits = rank_top_k(&candidates, 3, |(id, sim)| Some((*id, *sim)));
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].similarity, 19.0);
        assert_eq!(hits[1].similarity, 18.0);
        assert_eq!(hits[2].similarity, 17.0);
    }

    #[test]
    fn test_rank_top_k_skips_none_scores() {
        let candidates: Vec<i32> = vec![1, 2, 3, 4];
        let hits = rank_top_k(&candidates, 10, |v| {
            if *v % 2 == 0 {
                Some((Id::of_data(&v.to_le_bytes()), *v as f32))
            } else {
                None
            }
        });
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_rank_top_k_limit_zero_returns_empty() {
        let candidates = vec![1, 2, 3];
        let hits = rank_top_k(&candidates, 0, |v| Some((Id::of_data(&v.to_le_bytes()), *v as f32)));
        assert!(hits.is_empty());
    }

    #[test]
    fn test_sparse_cosine_identical_lists_is_one() {
        let a = vec![1, 5, 9];
        let sim = sparse_cosine(&a, &a, |_| 1.0);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sparse_cosine_disjoint_lists_is_zero() {
        let a = vec![1, 2, 3];
        let b = vec![4, 5, 6];
        assert_eq!(sparse_cosine(&a, &b, |_| 1.0), 0.0);
    }

    #[test]
    fn test_sparse_cosine_partial_overlap() {
        let a = vec![1, 2, 3];
        let b = vec![2, 3, 4];
        let sim = sparse_cosine(&a, &b, |_| 1.0);
        // dot = 2, norm_a = norm_b = sqrt(3)
        assert!((sim - 2.0 / 3.0).abs() < 1e-5);
    }
}
