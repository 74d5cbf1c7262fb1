//! Running top-k neighbour rows.
//!
//! A [`TopKRow`] keeps the `k` best `(global index, correlation)` pairs seen
//! so far for one sample. Order is descending correlation, ties broken by the
//! smaller global index. Merging new candidate columns re-selects over the
//! union of the kept entries and the new columns, which is equivalent to a
//! single selection over every column seen so far.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::correlation::{MaskMode, SENTINEL};

/// Neighbour index carried by padding entries.
pub const PAD_INDEX: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub index: usize,
    pub value: f64,
}

impl Neighbor {
    pub fn new(index: usize, value: f64) -> Self {
        Self { index, value }
    }

    pub fn pad() -> Self {
        Self {
            index: PAD_INDEX,
            value: SENTINEL,
        }
    }

    pub fn is_pad(&self) -> bool {
        self.index == PAD_INDEX
    }
}

/// Descending value, then ascending index.
#[inline]
pub fn rank_order(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.value
        .partial_cmp(&a.value)
        .unwrap_or(Ordering::Equal)
        .then(a.index.cmp(&b.index))
}

/// Keep the `k` best candidates, sorted by [`rank_order`], padded to `k`.
pub fn select_top_k(candidates: &mut Vec<Neighbor>, k: usize) {
    if k == 0 {
        candidates.clear();
        return;
    }
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k, rank_order);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(rank_order);
    candidates.resize(k, Neighbor::pad());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKRow {
    k: usize,
    entries: Vec<Neighbor>,
}

impl TopKRow {
    /// A row with nothing seen yet: `k` padding entries.
    pub fn empty(k: usize) -> Self {
        Self {
            k,
            entries: vec![Neighbor::pad(); k],
        }
    }

    /// Seed a row from an initial candidate set.
    pub fn seed(k: usize, mut candidates: Vec<Neighbor>) -> Self {
        select_top_k(&mut candidates, k);
        Self {
            k,
            entries: candidates,
        }
    }

    /// Rebuild a row from persisted, already ordered entries.
    pub fn from_entries(entries: Vec<Neighbor>) -> Self {
        Self {
            k: entries.len(),
            entries,
        }
    }

    /// Merge new candidate columns into the row.
    pub fn merge<I>(&mut self, candidates: I)
    where
        I: IntoIterator<Item = Neighbor>,
    {
        let mut pool: Vec<Neighbor> = self.entries.drain(..).filter(|n| !n.is_pad()).collect();
        pool.extend(candidates);
        select_top_k(&mut pool, self.k);
        self.entries = pool;
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn entries(&self) -> &[Neighbor] {
        &self.entries
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|n| n.index)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|n| n.value)
    }

    /// Smallest kept value; [`SENTINEL`] while padding remains.
    pub fn min_value(&self) -> f64 {
        self.entries.last().map(|n| n.value).unwrap_or(SENTINEL)
    }

    /// True once every slot holds a real neighbour.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|n| !n.is_pad())
    }
}

/// Seed the rows of a diagonal block.
///
/// `block` is the `n × n` self-correlation of a batch starting at global index
/// `global_start`, already masked with [`SENTINEL`]. Masked cells are skipped;
/// local column indices are shifted to global indices.
pub fn seed_diagonal(
    block: &[f64],
    n: usize,
    global_start: usize,
    k: usize,
    mode: MaskMode,
) -> Vec<TopKRow> {
    (0..n)
        .into_par_iter()
        .map(|i| {
            let row = &block[i * n..(i + 1) * n];
            let candidates: Vec<Neighbor> = row
                .iter()
                .enumerate()
                .filter(|&(j, _)| !mode.is_masked(i, j))
                .map(|(j, &v)| Neighbor::new(global_start + j, v))
                .collect();
            TopKRow::seed(k, candidates)
        })
        .collect()
}

/// Merge a `rows.len() × col_index.len()` correlation block (row-major) into
/// the running rows. `col_index[j]` is the global index of column `j`.
pub fn merge_block(rows: &mut [TopKRow], block: &[f64], col_index: &[usize]) {
    let m = col_index.len();
    if m == 0 {
        return;
    }
    rows.par_iter_mut()
        .zip(block.par_chunks(m))
        .for_each(|(row, values)| {
            row.merge(
                col_index
                    .iter()
                    .zip(values)
                    .map(|(&index, &value)| Neighbor::new(index, value)),
            );
        });
}
