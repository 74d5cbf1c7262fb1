//! Aggregator stages: concatenating worker statistics and assembling the
//! distance patches into the sparse adjacency matrix.

use std::cmp::Ordering;
use std::time::Instant;

use corrgraph_core::correlation::SampleStats;
use corrgraph_core::topk::rank_order;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use crate::errors::{PipelineError, PipelineResult};
use crate::partition::PartitionPlan;
use crate::storage::parquet::{
    CORRELATION_MATRIX, MEAN_ALL, STD_ALL, distance_patch_path, load_distance_patch,
    save_sparse_matrix, save_vector,
};

/// Per-sample statistics of the whole dataset, in global index order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub mean_all: Vec<f64>,
    pub std_all: Vec<f64>,
}

impl GlobalStats {
    pub fn len(&self) -> usize {
        self.mean_all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean_all.is_empty()
    }
}

/// Sparse `N × N` kNN graph: row `i` holds the `k` neighbours of sample `i`.
#[derive(Debug, Clone)]
pub struct AdjacencyMatrix {
    matrix: CsMat<f64>,
    k: usize,
}

impl AdjacencyMatrix {
    pub fn n_samples(&self) -> usize {
        self.matrix.rows()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.matrix.get(row, col).copied()
    }

    /// Neighbours of `row` ordered by descending correlation, ties by index.
    pub fn neighbors(&self, row: usize) -> Vec<(usize, f64)> {
        let mut out: Vec<(usize, f64)> = self
            .matrix
            .outer_view(row)
            .map(|v| v.iter().map(|(j, &x)| (j, x)).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        out
    }

    pub fn as_csmat(&self) -> &CsMat<f64> {
        &self.matrix
    }

    pub fn into_inner(self) -> CsMat<f64> {
        self.matrix
    }
}

#[derive(Debug)]
pub struct AggregatorState {
    plan: PartitionPlan,
}

impl AggregatorState {
    pub fn new(plan: PartitionPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    /// Concatenate per-batch statistics (indexed by batch) into `mean_all`
    /// and `std_all`, and persist both vectors.
    pub fn collect_stats(&self, reports: Vec<SampleStats>) -> PipelineResult<GlobalStats> {
        if reports.len() != self.plan.n_batches() {
            return Err(PipelineError::Computation(format!(
                "received statistics for {} batches, expected {}",
                reports.len(),
                self.plan.n_batches()
            )));
        }

        let mut all = SampleStats::with_capacity(self.plan.total_samples());
        for (layout, report) in self.plan.batches().iter().zip(&reports) {
            if report.len() != layout.len() || report.std.len() != layout.len() {
                return Err(PipelineError::Computation(format!(
                    "batch {} reported {} statistics, expected {}",
                    layout.id,
                    report.len(),
                    layout.len()
                )));
            }
            all.extend(report);
        }

        let out = self.plan.config().output_dir();
        std::fs::create_dir_all(out).map_err(|e| {
            PipelineError::Computation(format!("cannot create {}: {}", out.display(), e))
        })?;
        save_vector(&all.mean, out, MEAN_ALL)?;
        save_vector(&all.std, out, STD_ALL)?;
        info!("Aggregator: statistics for {} samples saved", all.len());

        Ok(GlobalStats {
            mean_all: all.mean,
            std_all: all.std,
        })
    }

    /// Read every distance patch and build the adjacency matrix. All patches
    /// are validated before the matrix is written; any missing or malformed
    /// patch aborts with an assembly error.
    pub fn assemble(&self) -> PipelineResult<AdjacencyMatrix> {
        let start = Instant::now();
        let n = self.plan.total_samples();
        let k = self.plan.neighbors();
        let out = self.plan.config().output_dir();

        let mut trimat = TriMat::with_capacity((n, n), n * k);
        for layout in self.plan.batches() {
            let path = distance_patch_path(out, layout.id);
            let patch = load_distance_patch(&path).map_err(|e| {
                PipelineError::Assembly(format!(
                    "patch of batch {} at {}: {}",
                    layout.id,
                    path.display(),
                    e
                ))
            })?;

            if patch.batch != layout.id
                || patch.global_start != layout.range.start
                || patch.n_rows() != layout.len()
            {
                return Err(PipelineError::Assembly(format!(
                    "patch of batch {} covers batch {} rows {}..{}, expected {:?}",
                    layout.id,
                    patch.batch,
                    patch.global_start,
                    patch.global_start + patch.n_rows(),
                    layout.range
                )));
            }

            for (i, row) in patch.rows.iter().enumerate() {
                let global = layout.range.start + i;
                if row.k() != k {
                    return Err(PipelineError::Assembly(format!(
                        "sample {} has {} neighbours, expected {}",
                        global,
                        row.k(),
                        k
                    )));
                }
                let entries = row.entries();
                let mut seen: Vec<usize> = entries.iter().map(|nb| nb.index).collect();
                seen.sort_unstable();
                if seen.windows(2).any(|w| w[0] == w[1]) {
                    return Err(PipelineError::Assembly(format!(
                        "sample {} lists a neighbour more than once",
                        global
                    )));
                }
                if entries
                    .windows(2)
                    .any(|w| rank_order(&w[0], &w[1]) != Ordering::Less)
                {
                    return Err(PipelineError::Assembly(format!(
                        "neighbours of sample {} are not in descending order",
                        global
                    )));
                }
                for nb in entries {
                    if nb.is_pad() || nb.index >= n || nb.index == global {
                        return Err(PipelineError::Assembly(format!(
                            "sample {} has invalid neighbour {}",
                            global, nb.index
                        )));
                    }
                    trimat.add_triplet(global, nb.index, nb.value);
                }
            }
            debug!("Aggregator: patch {} accepted", layout.id);
        }

        let matrix: CsMat<f64> = trimat.to_csr();
        save_sparse_matrix(
            &matrix,
            out,
            CORRELATION_MATRIX,
            Some(self.plan.config().config_typed()),
        )?;
        info!(
            "Aggregator: {}x{} matrix with {} entries assembled in {:?}",
            n,
            n,
            matrix.nnz(),
            start.elapsed()
        );

        Ok(AdjacencyMatrix { matrix, k })
    }
}
