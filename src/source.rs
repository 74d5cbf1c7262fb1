//! Data sources: where samples live and how to read a contiguous slice of them.
//!
//! The pipeline only talks to a [`DataSource`]: it asks for the [`Catalog`]
//! (files, datasets, sample counts, feature shapes) once, and for
//! [`ReadSpec`]s (one dataset, one contiguous local range) afterwards. Two
//! sources ship with the crate:
//!
//! - [`ParquetSource`](crate::storage::parquet::ParquetSource): chunked Parquet
//!   files listed in a [`Manifest`]
//! - [`MemorySource`]: named in-memory matrices, used by tests
//!
//! A manifest is a text file in the following format; `Dataset:` lines select
//! (and order) the datasets of the preceding file, otherwise every dataset of
//! the file is used in lexicographic order:
//!
//! ```text
//! File:/data/run_0001.parquet
//! Dataset:detector_a
//! Dataset:detector_b
//! File:/data/run_0002.parquet
//! ```

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::{Array, Array2};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::storage::{StorageError, StorageResult};

/// One dataset inside a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub n_samples: usize,
    /// Per-sample feature shape; the flattened size is its product.
    pub shape: Vec<usize>,
}

impl DatasetInfo {
    pub fn feature_dim(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub datasets: Vec<DatasetInfo>,
}

/// Ordered list of files and their datasets. The order defines global indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub files: Vec<SourceFile>,
}

impl Catalog {
    pub fn total_samples(&self) -> usize {
        self.files
            .iter()
            .flat_map(|f| f.datasets.iter())
            .map(|d| d.n_samples)
            .sum()
    }

    /// Shape of the first dataset; the reference every other dataset must match.
    pub fn feature_shape(&self) -> Option<&[usize]> {
        self.files
            .iter()
            .flat_map(|f| f.datasets.iter())
            .next()
            .map(|d| d.shape.as_slice())
    }

    pub fn dataset(&self, file: usize, dataset: usize) -> Option<&DatasetInfo> {
        self.files.get(file).and_then(|f| f.datasets.get(dataset))
    }
}

/// One contiguous read: `range` of local offsets inside one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSpec {
    pub file: usize,
    pub dataset: usize,
    pub range: Range<usize>,
}

impl ReadSpec {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Split into consecutive reads of at most `chunk` samples.
    pub fn chunks(&self, chunk: usize) -> Vec<ReadSpec> {
        let chunk = chunk.max(1);
        (self.range.start..self.range.end)
            .step_by(chunk)
            .map(|start| ReadSpec {
                file: self.file,
                dataset: self.dataset,
                range: start..start.saturating_add(chunk).min(self.range.end),
            })
            .collect()
    }
}

/// Narrow interface between the pipeline and the stored samples.
pub trait DataSource: Send + Sync {
    fn catalog(&self) -> &Catalog;

    /// Materialise a read as `samples × flattened features`.
    fn read(&self, spec: &ReadSpec) -> StorageResult<DenseMatrix<f64>>;

    fn total_samples(&self) -> usize {
        self.catalog().total_samples()
    }

    fn feature_shape(&self) -> Vec<usize> {
        self.catalog()
            .feature_shape()
            .map(|s| s.to_vec())
            .unwrap_or_default()
    }
}

/// Copy the rows of a dense matrix into row-major vectors.
pub fn matrix_rows(matrix: &DenseMatrix<f64>) -> Vec<Vec<f64>> {
    let (n_rows, _) = matrix.shape();
    (0..n_rows)
        .map(|i| matrix.get_row(i).iterator(0).copied().collect())
        .collect()
}

// ============================================================================
// In-memory source
// ============================================================================

/// Datasets held in memory, addressed by (file name, dataset name).
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    catalog: Catalog,
    data: HashMap<(usize, usize), DenseMatrix<f64>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset whose samples are flat vectors (shape `[n_cols]`).
    pub fn with_dataset(self, file: &str, dataset: &str, data: DenseMatrix<f64>) -> Self {
        let (_, n_cols) = data.shape();
        self.with_shaped_dataset(file, dataset, vec![n_cols], data)
    }

    /// Add a dataset with an explicit per-sample shape. Datasets are kept in
    /// insertion order; a new file name starts a new file.
    pub fn with_shaped_dataset(
        mut self,
        file: &str,
        dataset: &str,
        shape: Vec<usize>,
        data: DenseMatrix<f64>,
    ) -> Self {
        let path = PathBuf::from(file);
        let file_idx = match self.catalog.files.iter().position(|f| f.path == path) {
            Some(idx) => idx,
            None => {
                self.catalog.files.push(SourceFile {
                    path,
                    datasets: Vec::new(),
                });
                self.catalog.files.len() - 1
            }
        };

        let (n_samples, _) = data.shape();
        let datasets = &mut self.catalog.files[file_idx].datasets;
        datasets.push(DatasetInfo {
            name: dataset.to_string(),
            n_samples,
            shape,
        });
        let dataset_idx = datasets.len() - 1;
        trace!(
            "MemorySource: {}/{} holds {} samples",
            file, dataset, n_samples
        );
        self.data.insert((file_idx, dataset_idx), data);
        self
    }

    /// Register a file entry that repeats an existing path.
    pub fn with_duplicate_file(mut self, file: &str) -> Self {
        if let Some(existing) = self
            .catalog
            .files
            .iter()
            .find(|f| f.path == Path::new(file))
            .cloned()
        {
            self.catalog.files.push(existing);
        }
        self
    }
}

impl DataSource for MemorySource {
    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn read(&self, spec: &ReadSpec) -> StorageResult<DenseMatrix<f64>> {
        let matrix = self.data.get(&(spec.file, spec.dataset)).ok_or_else(|| {
            StorageError::Missing(format!("dataset ({}, {})", spec.file, spec.dataset))
        })?;
        let (n_rows, n_cols) = matrix.shape();
        if spec.range.end > n_rows {
            return Err(StorageError::Invalid(format!(
                "read {:?} beyond {} samples of dataset ({}, {})",
                spec.range, n_rows, spec.file, spec.dataset
            )));
        }

        let values: Vec<f64> = spec
            .range
            .clone()
            .flat_map(|i| (0..n_cols).map(move |j| *matrix.get((i, j))))
            .collect();
        Ok(DenseMatrix::from_iterator(
            values.into_iter(),
            spec.len(),
            n_cols,
            0,
        ))
    }
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    /// User-selected datasets, in order; `None` means all, lexicographic.
    pub datasets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Parse `File:` / `Dataset:` lines. Lines are trimmed; blank lines and
    /// anything else are ignored. A `Dataset:` line before any `File:` line is
    /// an error.
    pub fn parse(text: &str) -> StorageResult<Self> {
        let mut entries: Vec<ManifestEntry> = Vec::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if let Some(path) = line.strip_prefix("File:") {
                entries.push(ManifestEntry {
                    path: PathBuf::from(path.trim()),
                    datasets: None,
                });
            } else if let Some(name) = line.strip_prefix("Dataset:") {
                let entry = entries.last_mut().ok_or_else(|| {
                    StorageError::Invalid(format!(
                        "line {}: Dataset entry before any File entry",
                        line_no + 1
                    ))
                })?;
                entry
                    .datasets
                    .get_or_insert_with(Vec::new)
                    .push(name.trim().to_string());
            }
        }

        debug!("Parsed manifest with {} files", entries.len());
        Ok(Self { entries })
    }

    pub fn from_file(path: impl AsRef<Path>) -> StorageResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StorageError::Io(format!(
                "Failed to read manifest {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Self {
        Self {
            entries: paths
                .iter()
                .map(|p| ManifestEntry {
                    path: p.as_ref().to_path_buf(),
                    datasets: None,
                })
                .collect(),
        }
    }
}
