//! Pearson correlation kernels over row-major sample blocks.
//!
//! Per-sample statistics are taken over the flattened feature vector of one
//! sample (population standard deviation, `ddof = 0`). Correlations are
//! computed on centered vectors:
//!
//! ```text
//! corr(i, j) = <x_i - m_i, x_j - m_j> / D / (s_i * s_j)
//!            = (<x_i, x_j> / D - m_i * m_j) / (s_i * s_j)
//! ```
//!
//! The centered form avoids the cancellation of the second expression when
//! means are large compared to the spread.

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Value written into masked cells; below any valid correlation.
pub const SENTINEL: f64 = -10.0;

/// Which cells of a diagonal (self) block never enter a top-k.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaskMode {
    /// Mask `col <= row`: diagonal and lower triangle.
    #[default]
    Upper,
    /// Mask `col == row` only.
    SelfOnly,
}

impl MaskMode {
    #[inline]
    pub fn is_masked(&self, row: usize, col: usize) -> bool {
        match self {
            MaskMode::Upper => col <= row,
            MaskMode::SelfOnly => col == row,
        }
    }

    /// Smallest number of candidates a row can ever see, given the total
    /// number of samples and the size of the largest batch.
    pub fn min_candidates(&self, total: usize, max_batch: usize) -> usize {
        match self {
            MaskMode::Upper => total.saturating_sub(max_batch),
            MaskMode::SelfOnly => total.saturating_sub(1),
        }
    }
}

impl FromStr for MaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upper" => Ok(MaskMode::Upper),
            "self" | "self_only" => Ok(MaskMode::SelfOnly),
            other => Err(format!("unknown mask mode '{}'", other)),
        }
    }
}

impl fmt::Display for MaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskMode::Upper => write!(f, "upper"),
            MaskMode::SelfOnly => write!(f, "self_only"),
        }
    }
}

/// Per-sample mean and standard deviation, in sample order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl SampleStats {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            mean: Vec::with_capacity(n),
            std: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    pub fn push(&mut self, mean: f64, std: f64) {
        self.mean.push(mean);
        self.std.push(std);
    }

    /// Append `other` after `self` (batch order concatenation).
    pub fn extend(&mut self, other: &SampleStats) {
        self.mean.extend_from_slice(&other.mean);
        self.std.extend_from_slice(&other.std);
    }
}

/// Mean and population standard deviation of one sample, two-pass.
///
/// Finite samples whose squared deviations overflow are redone in units of
/// their largest magnitude. Non-finite input yields non-finite moments.
pub fn row_moments(row: &[f64]) -> (f64, f64) {
    if row.is_empty() {
        return (0.0, 0.0);
    }
    let (mean, std) = scaled_moments(row, 1.0);
    if mean.is_finite() && std.is_finite() {
        return (mean, std);
    }
    let scale = row.iter().fold(0.0_f64, |m, x| m.max(x.abs()));
    if !scale.is_finite() || scale == 0.0 || row.iter().any(|x| x.is_nan()) {
        return (mean, std);
    }
    let (mean, std) = scaled_moments(row, scale);
    (mean * scale, std * scale)
}

fn scaled_moments(row: &[f64], scale: f64) -> (f64, f64) {
    let d = row.len() as f64;
    let mean = row.iter().map(|x| x / scale).sum::<f64>() / d;
    let var = row
        .iter()
        .map(|x| {
            let c = x / scale - mean;
            c * c
        })
        .sum::<f64>()
        / d;
    (mean, var.sqrt())
}

/// Row-major block of samples, `n_rows × dim`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    data: Vec<f64>,
    n_rows: usize,
    dim: usize,
}

impl Block {
    pub fn new(dim: usize) -> Self {
        Self {
            data: Vec::new(),
            n_rows: 0,
            dim,
        }
    }

    pub fn with_capacity(n_rows: usize, dim: usize) -> Self {
        Self {
            data: Vec::with_capacity(n_rows * dim),
            n_rows: 0,
            dim,
        }
    }

    /// Append one sample. Returns `false` and leaves the block untouched if
    /// the row length differs from `dim`.
    pub fn push_row(&mut self, row: &[f64]) -> bool {
        if row.len() != self.dim {
            return false;
        }
        self.data.extend_from_slice(row);
        self.n_rows += 1;
        true
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Subtract `means[i]` from every feature of row `i`.
    pub fn center(&mut self, means: &[f64]) {
        debug_assert_eq!(means.len(), self.n_rows);
        if self.dim == 0 {
            return;
        }
        self.data
            .par_chunks_mut(self.dim)
            .zip(means.par_iter())
            .for_each(|(row, &m)| row.iter_mut().for_each(|x| *x -= m));
    }
}

/// Correlation of two centered samples with standard deviations `std_a`, `std_b`.
///
/// A constant sample (zero deviation) correlates 0 with everything. The
/// result is clamped to `[-1, 1]`.
#[inline]
pub fn pearson_centered(a: &[f64], b: &[f64], std_a: f64, std_b: f64) -> f64 {
    if std_a == 0.0 || std_b == 0.0 || a.is_empty() {
        return 0.0;
    }
    let d = a.len() as f64;
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mut r = dot / d / (std_a * std_b);
    if !r.is_finite() {
        // products out of range: correlate the standardized vectors instead
        r = a
            .iter()
            .zip(b)
            .map(|(x, y)| (x / std_a) * (y / std_b))
            .sum::<f64>()
            / d;
    }
    r.clamp(-1.0, 1.0)
}

/// Dense `rows.n_rows() × cols.n_rows()` correlation block, row-major.
///
/// Both blocks must already be centered. Rows are processed in parallel; each
/// cell is a sequential dot product so the result is scheduling independent.
pub fn correlation_block(rows: &Block, row_std: &[f64], cols: &Block, col_std: &[f64]) -> Vec<f64> {
    let m = cols.n_rows();
    let mut out = vec![0.0; rows.n_rows() * m];
    if m == 0 {
        return out;
    }
    out.par_chunks_mut(m).enumerate().for_each(|(i, out_row)| {
        let a = rows.row(i);
        for (j, cell) in out_row.iter_mut().enumerate() {
            *cell = pearson_centered(a, cols.row(j), row_std[i], col_std[j]);
        }
    });
    out
}

/// Overwrite the masked cells of a square self block with [`SENTINEL`].
pub fn apply_diagonal_mask(block: &mut [f64], n: usize, mode: MaskMode) {
    block
        .par_chunks_mut(n.max(1))
        .enumerate()
        .for_each(|(i, row)| {
            for (j, cell) in row.iter_mut().enumerate() {
                if mode.is_masked(i, j) {
                    *cell = SENTINEL;
                }
            }
        });
}
