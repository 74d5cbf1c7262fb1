//! Worker stages: the diagonal block of the owned batch, then every column
//! bin merged into running top-k rows.

use std::path::PathBuf;
use std::time::Instant;

use corrgraph_core::correlation::{
    Block, SampleStats, apply_diagonal_mask, correlation_block, row_moments,
};
use corrgraph_core::topk::{TopKRow, merge_block, seed_diagonal};
use log::{debug, info, trace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array;

use crate::aggregator::GlobalStats;
use crate::errors::{PipelineError, PipelineResult};
use crate::partition::{BatchLayout, PartitionPlan};
use crate::source::{DataSource, ReadSpec, matrix_rows};
use crate::storage::parquet::save_distance_patch;

/// Top-k rows of one batch, as persisted under `distances/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistancePatch {
    pub batch: usize,
    pub global_start: usize,
    pub rows: Vec<TopKRow>,
}

impl DistancePatch {
    pub fn k(&self) -> usize {
        self.rows.first().map(|r| r.k()).unwrap_or(0)
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Load `reads` into one block, `chunk` samples per source call.
/// Any read or shape failure is a computation error.
pub fn load_block(
    source: &dyn DataSource,
    reads: &[ReadSpec],
    chunk: usize,
    dim: usize,
) -> PipelineResult<Block> {
    let n: usize = reads.iter().map(|r| r.len()).sum();
    let mut block = Block::with_capacity(n, dim);

    for read in reads {
        for part in read.chunks(chunk) {
            let matrix = source.read(&part).map_err(|e| {
                PipelineError::Computation(format!(
                    "failed to load {:?} of dataset ({}, {}): {}",
                    part.range, part.file, part.dataset, e
                ))
            })?;
            let (n_rows, n_cols) = matrix.shape();
            if n_rows != part.len() || n_cols != dim {
                return Err(PipelineError::Computation(format!(
                    "read of {:?} in dataset ({}, {}) returned {}x{}, expected {}x{}",
                    part.range,
                    part.file,
                    part.dataset,
                    n_rows,
                    n_cols,
                    part.len(),
                    dim
                )));
            }
            for row in matrix_rows(&matrix) {
                block.push_row(&row);
            }
            trace!("loaded {} samples", n_rows);
        }
    }
    Ok(block)
}

/// State of the unit owning one row batch.
#[derive(Debug)]
pub struct WorkerState {
    plan: PartitionPlan,
    batch: usize,
    /// Centered samples of the owned batch, resident after the diagonal stage.
    rows: Option<Block>,
    stats: SampleStats,
    topk: Vec<TopKRow>,
}

impl WorkerState {
    pub fn new(plan: PartitionPlan, batch: usize) -> PipelineResult<Self> {
        if plan.batch(batch).is_none() {
            return Err(PipelineError::Configuration(format!(
                "batch {} does not exist in a plan of {} batches",
                batch,
                plan.n_batches()
            )));
        }
        Ok(Self {
            plan,
            batch,
            rows: None,
            stats: SampleStats::default(),
            topk: Vec::new(),
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn layout(&self) -> &BatchLayout {
        &self.plan.batches()[self.batch]
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn stats(&self) -> &SampleStats {
        &self.stats
    }

    pub fn topk(&self) -> &[TopKRow] {
        &self.topk
    }

    /// Load the owned batch, compute per-sample statistics and seed the
    /// top-k rows from the masked self block.
    pub fn diagonal_stage(&mut self, source: &dyn DataSource) -> PipelineResult<SampleStats> {
        let start = Instant::now();
        let layout = self.layout().clone();
        let config = self.plan.config();
        let dim = self.plan.feature_dim();
        info!(
            "Worker {}: diagonal stage over {:?} ({} reads)",
            self.batch,
            layout.range,
            layout.reads.len()
        );

        if source.catalog() != self.plan.catalog() {
            return Err(PipelineError::Configuration(format!(
                "worker {} sees a different catalog than the aggregator",
                self.batch
            )));
        }

        let mut block = load_block(source, &layout.reads, config.chunk_size(), dim)?;
        if block.n_rows() != layout.len() {
            return Err(PipelineError::Computation(format!(
                "batch {} loaded {} samples, expected {}",
                self.batch,
                block.n_rows(),
                layout.len()
            )));
        }

        let moments: Vec<(f64, f64)> = (0..block.n_rows())
            .into_par_iter()
            .map(|i| row_moments(block.row(i)))
            .collect();
        let mut stats = SampleStats::with_capacity(moments.len());
        for (i, (mean, std)) in moments.into_iter().enumerate() {
            if !mean.is_finite() || !std.is_finite() {
                return Err(PipelineError::Computation(format!(
                    "sample {} has non-finite statistics (mean {}, std {})",
                    layout.range.start + i,
                    mean,
                    std
                )));
            }
            stats.push(mean, std);
        }

        block.center(&stats.mean);
        let n = block.n_rows();
        let mut corr = correlation_block(&block, &stats.std, &block, &stats.std);
        apply_diagonal_mask(&mut corr, n, config.mask());
        self.topk = seed_diagonal(
            &corr,
            n,
            layout.range.start,
            config.neighbors(),
            config.mask(),
        );

        self.rows = Some(block);
        self.stats = stats.clone();
        info!(
            "Worker {}: diagonal stage done in {:?}",
            self.batch,
            start.elapsed()
        );
        Ok(stats)
    }

    /// Scan every bin of the owned batch with the broadcast statistics and
    /// merge each cross block into the running top-k rows.
    pub fn off_diagonal_stage(
        &mut self,
        source: &dyn DataSource,
        global: &GlobalStats,
    ) -> PipelineResult<DistancePatch> {
        let start = Instant::now();
        let total = self.plan.total_samples();
        if global.len() != total {
            return Err(PipelineError::Computation(format!(
                "worker {} received statistics for {} samples, expected {}",
                self.batch,
                global.len(),
                total
            )));
        }
        let rows = self.rows.as_ref().ok_or_else(|| {
            PipelineError::Computation(format!(
                "worker {}: off-diagonal stage before diagonal stage",
                self.batch
            ))
        })?;

        let dim = self.plan.feature_dim();
        let bins = self.plan.bins(self.batch);
        info!(
            "Worker {}: off-diagonal stage over {} bins",
            self.batch,
            bins.len()
        );

        for (b, bin) in bins.iter().enumerate() {
            let mut cols = load_block(source, &bin.reads, usize::MAX, dim)?;
            let col_index = bin.columns();
            if cols.n_rows() != col_index.len() {
                return Err(PipelineError::Computation(format!(
                    "bin {} of worker {} loaded {} samples, expected {}",
                    b,
                    self.batch,
                    cols.n_rows(),
                    col_index.len()
                )));
            }

            let col_mean: Vec<f64> = col_index.iter().map(|&j| global.mean_all[j]).collect();
            let col_std: Vec<f64> = col_index.iter().map(|&j| global.std_all[j]).collect();
            cols.center(&col_mean);

            let block = correlation_block(rows, &self.stats.std, &cols, &col_std);
            merge_block(&mut self.topk, &block, &col_index);
            debug!(
                "Worker {}: bin {}/{} (batches {:?}, {} columns) merged",
                self.batch,
                b + 1,
                bins.len(),
                bin.batches,
                col_index.len()
            );
        }

        info!(
            "Worker {}: off-diagonal stage done in {:?}",
            self.batch,
            start.elapsed()
        );
        Ok(DistancePatch {
            batch: self.batch,
            global_start: self.layout().range.start,
            rows: self.topk.clone(),
        })
    }

    pub fn save_patch(&self, patch: &DistancePatch) -> PipelineResult<PathBuf> {
        let path = save_distance_patch(patch, self.plan.config().output_dir())?;
        debug!("Worker {}: patch written to {}", self.batch, path.display());
        Ok(path)
    }
}
