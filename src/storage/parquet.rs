use arrow::{
    array::{Array as _, Float64Array, RecordBatch, StringArray, UInt64Array},
    datatypes::{DataType, Field, Schema, SchemaRef},
};
use log::{debug, info, trace};
use parquet::{
    arrow::{
        ArrowWriter, ProjectionMask,
        arrow_reader::{ParquetRecordBatchReaderBuilder, RowSelection, RowSelector},
    },
    basic::Compression,
    file::properties::WriterProperties,
    format::KeyValue,
};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::{
    arrays::{Array, Array2},
    matrix::DenseMatrix,
};
use sprs::{CsMat, TriMat};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use corrgraph_core::topk::{Neighbor, TopKRow};

use crate::{
    config::ConfigValue,
    errors::{PipelineError, PipelineResult},
    source::{Catalog, DataSource, DatasetInfo, Manifest, ReadSpec, SourceFile},
    storage::{StorageError, StorageResult},
    worker::DistancePatch,
};

/// Key-value metadata entry holding the JSON per-sample shape of a source file.
pub const FEATURE_SHAPE_KEY: &str = "feature_shape";
/// Column naming the dataset a source row belongs to.
pub const DATASET_COLUMN: &str = "dataset";

pub const MEAN_ALL: &str = "mean_all";
pub const STD_ALL: &str = "std_all";
pub const CORRELATION_MATRIX: &str = "correlation_matrix";
pub const DISTANCES_DIR: &str = "distances";

// ============================================================================
// Metadata
// ============================================================================

/// Metadata stored next to the assembled matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name_id: String,
    pub timestamp: String,

    pub n_rows: usize,
    pub n_cols: usize,

    /// Job configuration (typed values)
    pub job_config: HashMap<String, ConfigValue>,

    pub files: HashMap<String, FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub file_type: String, // "vector", "patch" or "sparse"
    pub rows: usize,
    pub cols: usize,
    pub nnz: Option<usize>,
    pub size_bytes: Option<u64>,
}

impl JobMetadata {
    pub fn new(name_id: &str) -> Self {
        Self {
            name_id: name_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            n_rows: 0,
            n_cols: 0,
            job_config: HashMap::new(),
            files: HashMap::new(),
        }
    }

    pub fn with_job_config(mut self, config: HashMap<String, ConfigValue>) -> Self {
        self.job_config = config;
        self
    }

    pub fn with_dimensions(mut self, rows: usize, cols: usize) -> Self {
        self.n_rows = rows;
        self.n_cols = cols;
        self
    }

    pub fn add_file(mut self, key: &str, info: FileInfo) -> Self {
        self.files.insert(key.to_string(), info);
        self
    }

    pub fn get_config<'a>(&'a self, key: &str) -> Option<&'a ConfigValue> {
        self.job_config.get(key)
    }

    pub fn neighbors(&self) -> Option<usize> {
        self.get_config("neighbors").and_then(|v| v.as_usize())
    }
}

pub fn save_metadata(
    metadata: &JobMetadata,
    path: impl AsRef<Path>,
    name_id: &str,
) -> StorageResult<()> {
    let metadata_path = path.as_ref().join(format!("{}_metadata.json", name_id));

    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| StorageError::Serde(format!("Failed to serialize metadata: {}", e)))?;

    std::fs::write(&metadata_path, json)
        .map_err(|e| StorageError::Io(format!("Failed to write metadata: {}", e)))?;

    Ok(())
}

pub fn load_metadata(path: impl AsRef<Path>, name_id: &str) -> StorageResult<JobMetadata> {
    let metadata_path = path.as_ref().join(format!("{}_metadata.json", name_id));

    debug!("loading metadata from {:?}", metadata_path);
    let json = std::fs::read_to_string(&metadata_path)
        .map_err(|e| StorageError::Io(format!("Failed to read metadata: {}", e)))?;

    serde_json::from_str(&json)
        .map_err(|e| StorageError::Serde(format!("Failed to parse metadata: {}", e)))
}

// ============================================================================
// Shared reader / writer plumbing
// ============================================================================

pub(crate) fn write_record_batch(
    file_path: &Path,
    schema: SchemaRef,
    batch: &RecordBatch,
    key_value_metadata: Option<Vec<KeyValue>>,
) -> StorageResult<()> {
    let file = File::create(file_path).map_err(|e| StorageError::Io(e.to_string()))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(key_value_metadata)
        .build();

    let mut writer = ArrowWriter::try_new(file, schema, Some(props))
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    writer
        .write(batch)
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    writer
        .close()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    Ok(())
}

fn open_reader(path: &Path) -> StorageResult<ParquetRecordBatchReaderBuilder<File>> {
    if !path.exists() {
        return Err(StorageError::Missing(path.display().to_string()));
    }
    let file = File::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
    ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| StorageError::Parquet(e.to_string()))
}

fn u64_column<'a>(batch: &'a RecordBatch, name: &str) -> StorageResult<&'a UInt64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
        .ok_or_else(|| StorageError::Invalid(format!("{} column missing", name)))
}

fn f64_column<'a>(batch: &'a RecordBatch, name: &str) -> StorageResult<&'a Float64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| StorageError::Invalid(format!("{} column missing", name)))
}

fn str_column<'a>(batch: &'a RecordBatch, name: &str) -> StorageResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| StorageError::Invalid(format!("{} column missing", name)))
}

fn feature_column(j: usize) -> String {
    format!("f_{}", j)
}

// ============================================================================
// Source files
// ============================================================================

/// Write a chunked source file: one row per sample, datasets stored one after
/// the other in the given order.
///
/// All datasets must share the same number of columns. `feature_shape`
/// defaults to `[n_cols]`.
///
/// # Example
/// ```ignore
/// use corrgraph::storage::parquet::write_source_file;
/// write_source_file("./data/run_0001.parquet", &[("detector_a", &matrix)], Some([4, 4].as_slice())).unwrap();
/// ```
pub fn write_source_file(
    path: impl AsRef<Path>,
    datasets: &[(&str, &DenseMatrix<f64>)],
    feature_shape: Option<&[usize]>,
) -> StorageResult<()> {
    let n_cols = datasets.first().map(|(_, m)| m.shape().1).unwrap_or(0);
    if let Some((name, m)) = datasets.iter().find(|(_, m)| m.shape().1 != n_cols) {
        return Err(StorageError::Invalid(format!(
            "dataset {} has {} columns, expected {}",
            name,
            m.shape().1,
            n_cols
        )));
    }
    let shape: Vec<usize> = feature_shape.map(|s| s.to_vec()).unwrap_or(vec![n_cols]);

    let mut fields = vec![Field::new(DATASET_COLUMN, DataType::Utf8, false)];
    for j in 0..n_cols {
        fields.push(Field::new(feature_column(j), DataType::Float64, false));
    }
    let schema = Arc::new(Schema::new(fields));

    let mut names: Vec<&str> = Vec::new();
    let mut columns_data: Vec<Vec<f64>> = vec![Vec::new(); n_cols];
    for (name, matrix) in datasets {
        let (n_rows, _) = matrix.shape();
        names.extend(std::iter::repeat_n(*name, n_rows));
        for (j, col) in columns_data.iter_mut().enumerate() {
            col.extend((0..n_rows).map(|i| *matrix.get((i, j))));
        }
    }

    let mut columns: Vec<Arc<dyn arrow::array::Array>> = vec![Arc::new(StringArray::from(names))];
    for col in columns_data {
        columns.push(Arc::new(Float64Array::from(col)));
    }

    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| StorageError::Arrow(e.to_string()))?;

    let shape_json = serde_json::to_string(&shape).map_err(|e| StorageError::Serde(e.to_string()))?;
    write_record_batch(
        path.as_ref(),
        schema,
        &batch,
        Some(vec![KeyValue::new(FEATURE_SHAPE_KEY.to_string(), shape_json)]),
    )
}

/// Datasets of a source file in storage order, with the file row offset at
/// which each one starts.
pub fn inspect_source_file(path: impl AsRef<Path>) -> StorageResult<Vec<(DatasetInfo, usize)>> {
    let builder = open_reader(path.as_ref())?;

    let n_features = builder
        .schema()
        .fields()
        .iter()
        .filter(|f| f.name().starts_with("f_"))
        .count();

    let shape: Vec<usize> = match builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kv| kv.iter().find(|e| e.key == FEATURE_SHAPE_KEY))
        .and_then(|e| e.value.clone())
    {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| StorageError::Serde(format!("bad {}: {}", FEATURE_SHAPE_KEY, e)))?,
        None => vec![n_features],
    };
    if shape.iter().product::<usize>() != n_features {
        return Err(StorageError::Invalid(format!(
            "{}: shape {:?} does not match {} feature columns",
            path.as_ref().display(),
            shape,
            n_features
        )));
    }

    let dataset_leaf = builder
        .parquet_schema()
        .columns()
        .iter()
        .position(|c| c.name() == DATASET_COLUMN)
        .ok_or_else(|| StorageError::Invalid(format!("{} column missing", DATASET_COLUMN)))?;
    let mask = ProjectionMask::leaves(builder.parquet_schema(), [dataset_leaf]);
    let reader = builder
        .with_projection(mask)
        .build()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    // (name, start row, count) in storage order
    let mut runs: Vec<(String, usize, usize)> = Vec::new();
    let mut row = 0;
    for batch_result in reader {
        let batch = batch_result.map_err(|e| StorageError::Parquet(e.to_string()))?;
        let names = str_column(&batch, DATASET_COLUMN)?;
        for i in 0..names.len() {
            let name = names.value(i);
            match runs.last_mut() {
                Some((last, _, count)) if last == name => *count += 1,
                _ => {
                    if runs.iter().any(|(n, _, _)| n == name) {
                        return Err(StorageError::Invalid(format!(
                            "{}: dataset {} is not contiguous",
                            path.as_ref().display(),
                            name
                        )));
                    }
                    runs.push((name.to_string(), row, 1));
                }
            }
            row += 1;
        }
    }

    Ok(runs
        .into_iter()
        .map(|(name, start, count)| {
            (
                DatasetInfo {
                    name,
                    n_samples: count,
                    shape: shape.clone(),
                },
                start,
            )
        })
        .collect())
}

/// Read `len` rows starting at file row `offset`, checking they belong to
/// `dataset`. Only the selected row range is decoded.
pub fn read_source_rows(
    path: impl AsRef<Path>,
    dataset: &str,
    offset: usize,
    len: usize,
    n_features: usize,
) -> StorageResult<DenseMatrix<f64>> {
    let builder = open_reader(path.as_ref())?;
    let n_stored = builder.metadata().file_metadata().num_rows().max(0) as usize;
    if offset + len > n_stored {
        return Err(StorageError::Invalid(format!(
            "{}: rows {}..{} beyond {} stored rows",
            path.as_ref().display(),
            offset,
            offset + len,
            n_stored
        )));
    }
    let mut selectors = Vec::with_capacity(3);
    if offset > 0 {
        selectors.push(RowSelector::skip(offset));
    }
    selectors.push(RowSelector::select(len));
    if offset + len < n_stored {
        selectors.push(RowSelector::skip(n_stored - offset - len));
    }
    let selection = RowSelection::from(selectors);
    let reader = builder
        .with_row_selection(selection)
        .build()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    let mut values: Vec<f64> = Vec::with_capacity(len * n_features);
    let mut n_read = 0;
    for batch_result in reader {
        let batch = batch_result.map_err(|e| StorageError::Parquet(e.to_string()))?;
        let names = str_column(&batch, DATASET_COLUMN)?;
        if let Some(i) = (0..names.len()).find(|&i| names.value(i) != dataset) {
            return Err(StorageError::Invalid(format!(
                "row {} of {} belongs to {}, expected {}",
                offset + n_read + i,
                path.as_ref().display(),
                names.value(i),
                dataset
            )));
        }
        let cols: Vec<&Float64Array> = (0..n_features)
            .map(|j| f64_column(&batch, &feature_column(j)))
            .collect::<StorageResult<_>>()?;
        for i in 0..batch.num_rows() {
            values.extend(cols.iter().map(|c| c.value(i)));
        }
        n_read += batch.num_rows();
    }

    if n_read != len {
        return Err(StorageError::Invalid(format!(
            "{}: expected {} rows from offset {}, read {}",
            path.as_ref().display(),
            len,
            offset,
            n_read
        )));
    }
    trace!(
        "read {} rows of {} from {}",
        len,
        dataset,
        path.as_ref().display()
    );

    Ok(DenseMatrix::from_iterator(values.into_iter(), len, n_features, 0))
}

/// Source backed by chunked Parquet files. File handles are opened per read
/// and closed when the read returns.
#[derive(Debug, Clone)]
pub struct ParquetSource {
    catalog: Catalog,
    /// File row offset of every (file, dataset) in catalog order.
    offsets: Vec<Vec<usize>>,
}

impl ParquetSource {
    /// Inspect every file of the manifest. Missing or unreadable files and
    /// unknown dataset names are configuration errors.
    pub fn open(manifest: &Manifest) -> PipelineResult<Self> {
        info!("Opening {} source files", manifest.entries.len());
        let mut catalog = Catalog::default();
        let mut offsets = Vec::with_capacity(manifest.entries.len());

        for entry in &manifest.entries {
            let stored = inspect_source_file(&entry.path).map_err(|e| {
                PipelineError::Configuration(format!(
                    "source file {} does not exist or is damaged: {}",
                    entry.path.display(),
                    e
                ))
            })?;

            let by_name: BTreeMap<&str, &(DatasetInfo, usize)> =
                stored.iter().map(|s| (s.0.name.as_str(), s)).collect();

            let selected: Vec<&(DatasetInfo, usize)> = match &entry.datasets {
                Some(names) => names
                    .iter()
                    .map(|n| {
                        by_name.get(n.as_str()).copied().ok_or_else(|| {
                            PipelineError::Configuration(format!(
                                "dataset {} not found in {}",
                                n,
                                entry.path.display()
                            ))
                        })
                    })
                    .collect::<PipelineResult<_>>()?,
                // BTreeMap iteration is lexicographic
                None => by_name.values().copied().collect(),
            };

            debug!(
                "{}: {} datasets selected",
                entry.path.display(),
                selected.len()
            );
            offsets.push(selected.iter().map(|(_, off)| *off).collect());
            catalog.files.push(SourceFile {
                path: entry.path.clone(),
                datasets: selected.into_iter().map(|(d, _)| d.clone()).collect(),
            });
        }

        Ok(Self { catalog, offsets })
    }
}

impl DataSource for ParquetSource {
    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn read(&self, spec: &ReadSpec) -> StorageResult<DenseMatrix<f64>> {
        let info = self
            .catalog
            .dataset(spec.file, spec.dataset)
            .ok_or_else(|| StorageError::Missing(format!("dataset ({}, {})", spec.file, spec.dataset)))?;
        if spec.range.end > info.n_samples {
            return Err(StorageError::Invalid(format!(
                "read {:?} beyond {} samples of {}",
                spec.range, info.n_samples, info.name
            )));
        }
        let path = &self.catalog.files[spec.file].path;
        let offset = self.offsets[spec.file][spec.dataset] + spec.range.start;
        read_source_rows(path, &info.name, offset, spec.len(), info.feature_dim())
    }
}

// ============================================================================
// Vectors
// ============================================================================

/// Save a per-sample vector (e.g. `mean_all`) as `<name_id>.parquet`.
pub fn save_vector(values: &[f64], path: impl AsRef<Path>, name_id: &str) -> StorageResult<()> {
    let n_values = values.len();

    let schema = Arc::new(Schema::new(vec![
        Field::new("name_id", DataType::Utf8, false),
        Field::new("n_values", DataType::UInt64, false),
        Field::new("row_index", DataType::UInt64, false),
        Field::new("value", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(vec![name_id; n_values])),
            Arc::new(UInt64Array::from(vec![n_values as u64; n_values])),
            Arc::new(UInt64Array::from((0..n_values as u64).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(values.to_vec())),
        ],
    )
    .map_err(|e| StorageError::Arrow(e.to_string()))?;

    let file_path = path.as_ref().join(format!("{}.parquet", name_id));
    write_record_batch(&file_path, schema, &batch, None)
}

/// Load a vector written by [`save_vector`], in row order.
pub fn load_vector(path: impl AsRef<Path>) -> StorageResult<Vec<f64>> {
    let reader = open_reader(path.as_ref())?
        .build()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    let mut values = Vec::new();
    for batch_result in reader {
        let batch = batch_result.map_err(|e| StorageError::Parquet(e.to_string()))?;
        if values.is_empty() && batch.num_rows() > 0 {
            values.reserve(u64_column(&batch, "n_values")?.value(0) as usize);
        }
        values.extend_from_slice(f64_column(&batch, "value")?.values());
    }
    Ok(values)
}

// ============================================================================
// Distance patches
// ============================================================================

pub fn distance_patch_path(output_dir: impl AsRef<Path>, batch: usize) -> PathBuf {
    output_dir
        .as_ref()
        .join(DISTANCES_DIR)
        .join(format!("distance_batch_{}.parquet", batch))
}

/// Write one batch's top-k rows to `distances/distance_batch_<batch>.parquet`.
///
/// One parquet row per (sample, rank) pair, sample-major.
pub fn save_distance_patch(
    patch: &DistancePatch,
    output_dir: impl AsRef<Path>,
) -> StorageResult<PathBuf> {
    let dir = output_dir.as_ref().join(DISTANCES_DIR);
    std::fs::create_dir_all(&dir)
        .map_err(|e| StorageError::Io(format!("Failed to create directory: {}", e)))?;

    let n_rows = patch.rows.len();
    let k = patch.k();
    let n = n_rows * k;

    let mut rows = Vec::with_capacity(n);
    let mut ranks = Vec::with_capacity(n);
    let mut neighbors = Vec::with_capacity(n);
    let mut values = Vec::with_capacity(n);
    for (i, row) in patch.rows.iter().enumerate() {
        for (r, nb) in row.entries().iter().enumerate() {
            rows.push((patch.global_start + i) as u64);
            ranks.push(r as u64);
            neighbors.push(nb.index as u64);
            values.push(nb.value);
        }
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("batch_id", DataType::UInt64, false),
        Field::new("global_start", DataType::UInt64, false),
        Field::new("n_rows", DataType::UInt64, false),
        Field::new("k", DataType::UInt64, false),
        Field::new("row", DataType::UInt64, false),
        Field::new("rank", DataType::UInt64, false),
        Field::new("neighbor", DataType::UInt64, false),
        Field::new("value", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt64Array::from(vec![patch.batch as u64; n])),
            Arc::new(UInt64Array::from(vec![patch.global_start as u64; n])),
            Arc::new(UInt64Array::from(vec![n_rows as u64; n])),
            Arc::new(UInt64Array::from(vec![k as u64; n])),
            Arc::new(UInt64Array::from(rows)),
            Arc::new(UInt64Array::from(ranks)),
            Arc::new(UInt64Array::from(neighbors)),
            Arc::new(Float64Array::from(values)),
        ],
    )
    .map_err(|e| StorageError::Arrow(e.to_string()))?;

    let file_path = distance_patch_path(output_dir, patch.batch);
    write_record_batch(&file_path, schema, &batch, None)?;
    Ok(file_path)
}

/// Load a distance patch. Rows must arrive sample-major with ranks `0..k`.
pub fn load_distance_patch(path: impl AsRef<Path>) -> StorageResult<DistancePatch> {
    let reader = open_reader(path.as_ref())?
        .build()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    let mut header: Option<(usize, usize, usize, usize)> = None;
    let mut entries: Vec<(usize, usize, Neighbor)> = Vec::new();

    for batch_result in reader {
        let batch = batch_result.map_err(|e| StorageError::Parquet(e.to_string()))?;
        if batch.num_rows() == 0 {
            continue;
        }
        if header.is_none() {
            header = Some((
                u64_column(&batch, "batch_id")?.value(0) as usize,
                u64_column(&batch, "global_start")?.value(0) as usize,
                u64_column(&batch, "n_rows")?.value(0) as usize,
                u64_column(&batch, "k")?.value(0) as usize,
            ));
        }
        let row = u64_column(&batch, "row")?;
        let rank = u64_column(&batch, "rank")?;
        let neighbor = u64_column(&batch, "neighbor")?;
        let value = f64_column(&batch, "value")?;
        for i in 0..batch.num_rows() {
            entries.push((
                row.value(i) as usize,
                rank.value(i) as usize,
                Neighbor::new(neighbor.value(i) as usize, value.value(i)),
            ));
        }
    }

    let (batch, global_start, n_rows, k) =
        header.ok_or_else(|| StorageError::Invalid("No data in patch file".to_string()))?;
    if entries.len() != n_rows * k {
        return Err(StorageError::Invalid(format!(
            "patch {} holds {} entries, header claims {} x {}",
            batch,
            entries.len(),
            n_rows,
            k
        )));
    }

    let mut rows = Vec::with_capacity(n_rows);
    for (i, chunk) in entries.chunks(k.max(1)).enumerate().take(n_rows) {
        let expected_row = global_start + i;
        if chunk
            .iter()
            .enumerate()
            .any(|(r, (row, rank, _))| *row != expected_row || *rank != r)
        {
            return Err(StorageError::Invalid(format!(
                "patch {}: entries of sample {} out of order",
                batch, expected_row
            )));
        }
        rows.push(TopKRow::from_entries(
            chunk.iter().map(|(_, _, nb)| *nb).collect(),
        ));
    }

    Ok(DistancePatch {
        batch,
        global_start,
        rows,
    })
}

// ============================================================================
// Sparse matrix
// ============================================================================

/// Save a sparse matrix as Snappy-compressed COO triplets, with optional
/// job metadata written to `<name_id>_metadata.json`.
pub fn save_sparse_matrix(
    matrix: &CsMat<f64>,
    path: impl AsRef<Path>,
    name_id: &str,
    job_config: Option<HashMap<String, ConfigValue>>,
) -> StorageResult<()> {
    let (n_rows, n_cols) = matrix.shape();
    let nnz = matrix.nnz();

    let mut rows = Vec::with_capacity(nnz);
    let mut cols = Vec::with_capacity(nnz);
    let mut vals = Vec::with_capacity(nnz);

    for (value, (row_idx, col_idx)) in matrix.iter() {
        rows.push(row_idx as u64);
        cols.push(col_idx as u64);
        vals.push(*value);
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("name_id", DataType::Utf8, false),
        Field::new("n_rows", DataType::UInt64, false),
        Field::new("n_cols", DataType::UInt64, false),
        Field::new("nnz", DataType::UInt64, false),
        Field::new("row", DataType::UInt64, false),
        Field::new("col", DataType::UInt64, false),
        Field::new("value", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(vec![name_id; nnz])),
            Arc::new(UInt64Array::from(vec![n_rows as u64; nnz])),
            Arc::new(UInt64Array::from(vec![n_cols as u64; nnz])),
            Arc::new(UInt64Array::from(vec![nnz as u64; nnz])),
            Arc::new(UInt64Array::from(rows)),
            Arc::new(UInt64Array::from(cols)),
            Arc::new(Float64Array::from(vals)),
        ],
    )
    .map_err(|e| StorageError::Arrow(e.to_string()))?;

    let file_path = path.as_ref().join(format!("{}.parquet", name_id));
    write_record_batch(&file_path, schema, &batch, None)?;

    let file_size = std::fs::metadata(&file_path).map(|m| m.len()).ok();

    if let Some(config) = job_config {
        let metadata = JobMetadata::new(name_id)
            .with_job_config(config)
            .with_dimensions(n_rows, n_cols)
            .add_file(
                "matrix",
                FileInfo {
                    filename: format!("{}.parquet", name_id),
                    file_type: "sparse".to_string(),
                    rows: n_rows,
                    cols: n_cols,
                    nnz: Some(nnz),
                    size_bytes: file_size,
                },
            );

        save_metadata(&metadata, path.as_ref(), name_id)?;
    }

    Ok(())
}

/// Load a sparse matrix written by [`save_sparse_matrix`] as CSR.
pub fn load_sparse_matrix(path: impl AsRef<Path>) -> StorageResult<CsMat<f64>> {
    let reader = open_reader(path.as_ref())?
        .build()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    let mut trimat: Option<TriMat<f64>> = None;

    for batch_result in reader {
        let batch = batch_result.map_err(|e| StorageError::Parquet(e.to_string()))?;
        if batch.num_rows() == 0 {
            continue;
        }

        if trimat.is_none() {
            let n_rows = u64_column(&batch, "n_rows")?.value(0) as usize;
            let n_cols = u64_column(&batch, "n_cols")?.value(0) as usize;
            trimat = Some(TriMat::new((n_rows, n_cols)));
        }

        let row_col = u64_column(&batch, "row")?;
        let col_col = u64_column(&batch, "col")?;
        let val_col = f64_column(&batch, "value")?;

        if let Some(tm) = &mut trimat {
            let (n_rows, n_cols) = tm.shape();
            for i in 0..row_col.len() {
                let (row, col) = (row_col.value(i) as usize, col_col.value(i) as usize);
                if row >= n_rows || col >= n_cols {
                    return Err(StorageError::Invalid(format!(
                        "entry ({}, {}) outside a {}x{} matrix",
                        row, col, n_rows, n_cols
                    )));
                }
                tm.add_triplet(row, col, val_col.value(i));
            }
        }
    }

    trimat
        .ok_or_else(|| StorageError::Invalid("No data in parquet file".to_string()))
        .map(|tm| tm.to_csr())
}
