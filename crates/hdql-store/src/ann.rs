//! HNSW index over one entity type's dense vectors.
//!
//! Vectors are unit-normalized, so L2 ranking agrees with cosine ranking.
//! Callers re-score candidates exactly; the index only narrows the pool.

use hnsw_rs::prelude::{DistL2, Hnsw};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    pub max_connections: usize,
    pub ef_construction: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            max_connections: 16,
            ef_construction: 200,
        }
    }
}

pub struct AnnIndex {
    // Snapshot ordinals aligned with HNSW data ids.
    ordinals: Vec<u32>,
    hnsw: Mutex<Hnsw<'static, f32, DistL2>>,
}

impl std::fmt::Debug for AnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnIndex")
            .field("points", &self.ordinals.len())
            .finish()
    }
}

impl AnnIndex {
    /// Returns `None` for an empty point set.
    pub fn build<'a>(
        points: impl IntoIterator<Item = (u32, &'a [f32])>,
        params: HnswParams,
    ) -> Option<Self> {
        let points: Vec<(u32, &[f32])> = points.into_iter().collect();
        if points.is_empty() {
            return None;
        }

        let nb_elem = points.len();
        let max_layer = 16.min((nb_elem as f32).ln().trunc() as usize).max(1);
        let hnsw = Hnsw::<f32, DistL2>::new(
            params.max_connections,
            nb_elem,
            max_layer,
            params.ef_construction,
            DistL2 {},
        );

        let mut ordinals = Vec::with_capacity(nb_elem);
        for (i, (ordinal, v)) in points.into_iter().enumerate() {
            hnsw.insert((v, i));
            ordinals.push(ordinal);
        }

        Some(Self {
            ordinals,
            hnsw: Mutex::new(hnsw),
        })
    }

    pub fn len(&self) -> usize {
        self.ordinals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordinals.is_empty()
    }

    /// Up to `k` candidate ordinals near `query`, unordered beyond HNSW's own
    /// ranking. Data ids outside the ordinal table are reported as corrupt.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Result<Vec<u32>, usize> {
        let k = k.clamp(1, self.ordinals.len());
        let neighbours = self.hnsw.lock().search(query, k, ef_search.max(k));
        let mut out = Vec::with_capacity(neighbours.len());
        for n in neighbours {
            let Some(ordinal) = self.ordinals.get(n.d_id) else {
                return Err(n.d_id);
            };
            out.push(*ordinal);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_exact_point_among_many() {
        let vectors: Vec<Vec<f32>> = (0..200)
            .map(|i| {
                let angle = i as f32 * 0.031;
                vec![angle.cos(), angle.sin()]
            })
            .collect();
        let index = AnnIndex::build(
            vectors
                .iter()
                .enumerate()
                .map(|(i, v)| (1000 + i as u32, v.as_slice())),
            HnswParams::default(),
        )
        .unwrap();
        assert_eq!(index.len(), 200);
        let hits = index.search(&vectors[42], 5, 64).unwrap();
        assert!(hits.contains(&1042));
    }

    #[test]
    fn empty_input_builds_nothing() {
        assert!(AnnIndex::build(std::iter::empty(), HnswParams::default()).is_none());
    }
}
