//! Batch sizing and the row/column pairing schedule.
//!
//! The N×N correlation grid is cut into `B0` row batches. Every worker owns
//! one batch (one row of the grid) and scans every *other* batch as columns.
//! The other batches are grouped into bins so that one bulk read covers several
//! batches at once:
//!
//! ```text
//!            col batch
//!          0    1    2    3
//!        ---------------------
//!   0    | D  | x  | x  | x  |     D = diagonal block (own batch)
//!   1    | x  | D  | x  | x  |     x = off-diagonal block, scanned by
//!   2    | x  | x  | D  | x  |         the worker owning the row
//!   3    | x  | x  | x  | D  |
//!        ---------------------
//! ```

use std::ops::Range;

/// Split `total` items into `batches` near-equal parts.
///
/// The first `total % batches` parts get `ceil(total / batches)` items, the
/// rest `floor(total / batches)`, so max − min ≤ 1 and the parts sum to
/// `total`. Returns an empty list when `batches == 0`.
pub fn get_batch_num_list(total: usize, batches: usize) -> Vec<usize> {
    if batches == 0 {
        return Vec::new();
    }
    let base = total / batches;
    let redundant = total % batches;

    let mut sizes = vec![base + 1; redundant];
    sizes.extend(std::iter::repeat_n(base, batches - redundant));
    sizes
}

/// Contiguous global ranges of the batches produced by [`get_batch_num_list`].
pub fn batch_ranges(total: usize, batches: usize) -> Vec<Range<usize>> {
    let mut start = 0;
    get_batch_num_list(total, batches)
        .into_iter()
        .map(|size| {
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Column batches scanned by the owner of batch `own`, ascending.
pub fn other_batches(own: usize, n_batches: usize) -> Vec<usize> {
    (0..n_batches).filter(|&b| b != own).collect()
}

/// Group the column batches of `own` into at most `bins` consecutive bins.
///
/// `bins` is clamped to `[1, n_batches - 1]`; sizes follow
/// [`get_batch_num_list`]. Returns no bins when there is a single batch.
pub fn group_bins(own: usize, n_batches: usize, bins: usize) -> Vec<Vec<usize>> {
    let others = other_batches(own, n_batches);
    if others.is_empty() {
        return Vec::new();
    }
    let n_bins = bins.clamp(1, others.len());

    let mut cursor = 0;
    get_batch_num_list(others.len(), n_bins)
        .into_iter()
        .map(|size| {
            let bin = others[cursor..cursor + size].to_vec();
            cursor += size;
            bin
        })
        .collect()
}
