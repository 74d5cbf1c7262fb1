//! Batch partitioning over the global sample index.
//!
//! The catalog's datasets are laid end to end (file order, then dataset
//! order) to form the global index space `[0, N)`. The [`Partitioner`] cuts
//! that space into `batches_dim0` row batches and, for every batch, groups the
//! other batches into column bins. Every batch and every bin is resolved to
//! the minimal list of contiguous [`ReadSpec`]s, so a worker never issues a
//! per-sample read.

use std::collections::HashSet;
use std::ops::Range;

use corrgraph_core::batching::{batch_ranges, group_bins};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::source::{Catalog, ReadSpec};

/// A run of consecutive global indices stored in one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: usize,
    pub len: usize,
    pub file: usize,
    pub dataset: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Global index → (file, dataset, local offset), stored as ordered segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIndexMap {
    segments: Vec<Segment>,
    total: usize,
}

impl GlobalIndexMap {
    /// Empty datasets take no global indices.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut segments = Vec::new();
        let mut start = 0;
        for (file, source_file) in catalog.files.iter().enumerate() {
            for (dataset, info) in source_file.datasets.iter().enumerate() {
                if info.n_samples == 0 {
                    continue;
                }
                segments.push(Segment {
                    start,
                    len: info.n_samples,
                    file,
                    dataset,
                });
                start += info.n_samples;
            }
        }
        Self {
            segments,
            total: start,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// `(file, dataset, local offset)` of a global index.
    pub fn locate(&self, global: usize) -> Option<(usize, usize, usize)> {
        if global >= self.total {
            return None;
        }
        let pos = self.segments.partition_point(|s| s.end() <= global);
        let seg = self.segments.get(pos)?;
        Some((seg.file, seg.dataset, global - seg.start))
    }

    /// Minimal reads covering `range`: one per dataset the range touches.
    /// Out-of-range indices are ignored.
    pub fn resolve(&self, range: Range<usize>) -> Vec<ReadSpec> {
        let end = range.end.min(self.total);
        if range.start >= end {
            return Vec::new();
        }
        let first = self.segments.partition_point(|s| s.end() <= range.start);

        self.segments[first..]
            .iter()
            .take_while(|s| s.start < end)
            .map(|s| {
                let lo = range.start.max(s.start) - s.start;
                let hi = end.min(s.end()) - s.start;
                ReadSpec {
                    file: s.file,
                    dataset: s.dataset,
                    range: lo..hi,
                }
            })
            .collect()
    }
}

/// One row batch with the reads that materialise it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLayout {
    pub id: usize,
    pub range: Range<usize>,
    pub reads: Vec<ReadSpec>,
}

impl BatchLayout {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// A group of column batches loaded with one bulk read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bin {
    pub batches: Vec<usize>,
    /// Global ranges of the batches, ascending.
    pub ranges: Vec<Range<usize>>,
    pub reads: Vec<ReadSpec>,
}

impl Bin {
    /// Global index of every column, in read order.
    pub fn columns(&self) -> Vec<usize> {
        self.ranges.iter().flat_map(|r| r.clone()).collect()
    }

    pub fn n_columns(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }
}

/// Everything a unit needs to take part in the job; broadcast by the
/// aggregator before any computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    config: JobConfig,
    catalog: Catalog,
    index_map: GlobalIndexMap,
    feature_shape: Vec<usize>,
    batches: Vec<BatchLayout>,
    /// `bins[b]`: column bins scanned by the owner of batch `b`.
    bins: Vec<Vec<Bin>>,
}

impl PartitionPlan {
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn index_map(&self) -> &GlobalIndexMap {
        &self.index_map
    }

    pub fn feature_shape(&self) -> &[usize] {
        &self.feature_shape
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_shape.iter().product()
    }

    pub fn total_samples(&self) -> usize {
        self.index_map.total()
    }

    pub fn neighbors(&self) -> usize {
        self.config.neighbors()
    }

    pub fn n_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn batches(&self) -> &[BatchLayout] {
        &self.batches
    }

    pub fn batch(&self, id: usize) -> Option<&BatchLayout> {
        self.batches.get(id)
    }

    pub fn bins(&self, batch: usize) -> &[Bin] {
        self.bins.get(batch).map(|b| b.as_slice()).unwrap_or(&[])
    }

    pub fn max_batch_len(&self) -> usize {
        self.batches.iter().map(|b| b.len()).max().unwrap_or(0)
    }
}

pub struct Partitioner {
    config: JobConfig,
}

impl Partitioner {
    pub fn new(config: JobConfig) -> Self {
        Self { config }
    }

    /// Validate the catalog against the configuration and lay out batches
    /// and bins. Every failure is a configuration error.
    pub fn plan(&self, catalog: &Catalog) -> PipelineResult<PartitionPlan> {
        info!("Partitioning with {}", self.config);

        let mut seen = HashSet::new();
        for file in &catalog.files {
            if !seen.insert(&file.path) {
                return Err(PipelineError::Configuration(format!(
                    "file {} is listed more than once",
                    file.path.display()
                )));
            }
        }

        let feature_shape = catalog
            .feature_shape()
            .map(|s| s.to_vec())
            .ok_or_else(|| PipelineError::Configuration("no datasets to process".to_string()))?;
        for file in &catalog.files {
            for dataset in &file.datasets {
                if dataset.shape != feature_shape {
                    return Err(PipelineError::Configuration(format!(
                        "dataset {} in {} has shape {:?}, expected {:?}",
                        dataset.name,
                        file.path.display(),
                        dataset.shape,
                        feature_shape
                    )));
                }
            }
        }

        let index_map = GlobalIndexMap::from_catalog(catalog);
        let total = index_map.total();
        let n_batches = self.config.batches_dim0();
        let k = self.config.neighbors();

        if total == 0 {
            return Err(PipelineError::Configuration(
                "datasets hold no samples".to_string(),
            ));
        }
        if n_batches == 0 || n_batches > total {
            return Err(PipelineError::Configuration(format!(
                "cannot split {} samples into {} batches",
                total, n_batches
            )));
        }
        if self.config.bins_dim1() == 0 {
            return Err(PipelineError::Configuration(
                "bins_dim1 must be at least 1".to_string(),
            ));
        }
        if k == 0 {
            return Err(PipelineError::Configuration(
                "number of neighbours must be at least 1".to_string(),
            ));
        }

        let ranges = batch_ranges(total, n_batches);
        let max_batch = ranges.iter().map(|r| r.len()).max().unwrap_or(0);
        let reachable = self.config.mask().min_candidates(total, max_batch);
        if k > reachable {
            return Err(PipelineError::Configuration(format!(
                "k={} exceeds the {} candidates every sample is guaranteed to see \
                 ({} samples, largest batch {}, mask {})",
                k,
                reachable,
                total,
                max_batch,
                self.config.mask()
            )));
        }

        let batches: Vec<BatchLayout> = ranges
            .iter()
            .enumerate()
            .map(|(id, range)| BatchLayout {
                id,
                range: range.clone(),
                reads: index_map.resolve(range.clone()),
            })
            .collect();

        let bins: Vec<Vec<Bin>> = (0..n_batches)
            .map(|own| {
                group_bins(own, n_batches, self.config.bins_dim1())
                    .into_iter()
                    .map(|group| {
                        let ranges: Vec<Range<usize>> =
                            group.iter().map(|&b| ranges[b].clone()).collect();
                        Bin {
                            reads: coalesce(
                                ranges.iter().flat_map(|r| index_map.resolve(r.clone())),
                            ),
                            batches: group,
                            ranges,
                        }
                    })
                    .collect()
            })
            .collect();

        for batch in &batches {
            debug!(
                "batch {}: {:?} in {} reads, {} bins",
                batch.id,
                batch.range,
                batch.reads.len(),
                bins[batch.id].len()
            );
        }

        Ok(PartitionPlan {
            config: self.config.clone(),
            catalog: catalog.clone(),
            index_map,
            feature_shape,
            batches,
            bins,
        })
    }
}

/// Merge reads of the same dataset that touch end to end.
fn coalesce(reads: impl IntoIterator<Item = ReadSpec>) -> Vec<ReadSpec> {
    let mut out: Vec<ReadSpec> = Vec::new();
    for read in reads {
        match out.last_mut() {
            Some(last)
                if last.file == read.file
                    && last.dataset == read.dataset
                    && last.range.end == read.range.start =>
            {
                last.range.end = read.range.end;
            }
            _ => out.push(read),
        }
    }
    out
}
