use corrgraph_core::correlation::{pearson_centered, row_moments};
use corrgraph_core::topk::{Neighbor, rank_order};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::aggregator::AdjacencyMatrix;
use crate::source::MemorySource;

/// `n × d` samples drawn uniformly from `[-1, 1)` plus a per-sample offset,
/// so means differ between samples.
pub fn random_samples(seed: u64, n: usize, d: usize) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let offset = rng.random_range(-5.0..5.0);
            (0..d).map(|_| offset + rng.random_range(-1.0..1.0)).collect()
        })
        .collect()
}

pub fn to_matrix(rows: &[Vec<f64>]) -> DenseMatrix<f64> {
    DenseMatrix::from_2d_vec(&rows.to_vec()).unwrap()
}

/// Spread `rows` over files and datasets: `layout[f]` lists the dataset sizes
/// of file `f`. Sizes must sum to `rows.len()`.
pub fn memory_source(rows: &[Vec<f64>], layout: &[&[usize]]) -> MemorySource {
    let mut source = MemorySource::new();
    let mut cursor = 0;
    for (f, sizes) in layout.iter().enumerate() {
        for (d, &size) in sizes.iter().enumerate() {
            source = source.with_dataset(
                &format!("file_{}.parquet", f),
                &format!("dataset_{}", d),
                to_matrix(&rows[cursor..cursor + size]),
            );
            cursor += size;
        }
    }
    assert_eq!(cursor, rows.len(), "layout does not cover every sample");
    source
}

/// Full correlation matrix computed sample by sample.
pub fn dense_correlation(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let centered: Vec<(Vec<f64>, f64)> = rows
        .iter()
        .map(|r| {
            let (mean, std) = row_moments(r);
            (r.iter().map(|x| x - mean).collect(), std)
        })
        .collect();
    centered
        .iter()
        .map(|(a, sa)| {
            centered
                .iter()
                .map(|(b, sb)| pearson_centered(a, b, *sa, *sb))
                .collect()
        })
        .collect()
}

/// Reference top-k of every row over the candidates `allowed(i, j)` admits.
pub fn brute_force_topk<F>(rows: &[Vec<f64>], k: usize, allowed: F) -> Vec<Vec<Neighbor>>
where
    F: Fn(usize, usize) -> bool,
{
    let corr = dense_correlation(rows);
    (0..rows.len())
        .map(|i| {
            let mut candidates: Vec<Neighbor> = (0..rows.len())
                .filter(|&j| allowed(i, j))
                .map(|j| Neighbor::new(j, corr[i][j]))
                .collect();
            candidates.sort_by(rank_order);
            candidates.truncate(k);
            candidates
        })
        .collect()
}

/// Assert every row of `graph` holds exactly the reference neighbours.
pub fn assert_matches_reference(graph: &AdjacencyMatrix, reference: &[Vec<Neighbor>]) {
    assert_eq!(graph.n_samples(), reference.len());
    for (i, expected) in reference.iter().enumerate() {
        let got = graph.neighbors(i);
        let got_idx: Vec<usize> = got.iter().map(|(j, _)| *j).collect();
        let exp_idx: Vec<usize> = expected.iter().map(|n| n.index).collect();
        assert_eq!(got_idx, exp_idx, "neighbours of sample {}", i);
        for ((_, v), n) in got.iter().zip(expected) {
            approx::assert_relative_eq!(*v, n.value, epsilon = 1e-12);
        }
    }
}
