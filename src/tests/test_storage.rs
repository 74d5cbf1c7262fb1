use std::path::Path;

use approx::assert_relative_eq;
use corrgraph_core::topk::{Neighbor, TopKRow};
use smartcore::linalg::basic::arrays::Array;
use sprs::TriMat;
use tempfile::TempDir;

use crate::config::JobConfig;
use crate::source::{DataSource, Manifest, ManifestEntry, ReadSpec, matrix_rows};
use crate::storage::parquet::*;
use crate::tests::init;
use crate::tests::test_helpers::{random_samples, to_matrix};
use crate::worker::DistancePatch;

fn write_two_datasets(path: &Path) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let beta = random_samples(1, 5, 6);
    let alpha = random_samples(2, 3, 6);
    // stored beta first so the default order has to sort
    write_source_file(
        path,
        &[("beta", &to_matrix(&beta)), ("alpha", &to_matrix(&alpha))],
        Some([2, 3].as_slice()),
    )
    .unwrap();
    (alpha, beta)
}

#[test]
fn test_source_file_inspect() {
    init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.parquet");
    write_two_datasets(&path);

    let datasets = inspect_source_file(&path).unwrap();
    assert_eq!(datasets.len(), 2);
    assert_eq!(datasets[0].0.name, "beta");
    assert_eq!(datasets[0].0.n_samples, 5);
    assert_eq!(datasets[0].1, 0);
    assert_eq!(datasets[1].0.name, "alpha");
    assert_eq!(datasets[1].0.n_samples, 3);
    assert_eq!(datasets[1].1, 5);
    assert_eq!(datasets[1].0.shape, vec![2, 3]);
    assert_eq!(datasets[1].0.feature_dim(), 6);
}

#[test]
fn test_source_file_default_shape_is_flat() {
    init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flat.parquet");
    write_source_file(&path, &[("only", &to_matrix(&random_samples(3, 4, 7)))], None).unwrap();

    let datasets = inspect_source_file(&path).unwrap();
    assert_eq!(datasets[0].0.shape, vec![7]);
}

#[test]
fn test_source_file_rejects_bad_shape() {
    init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.parquet");
    write_source_file(&path, &[("a", &to_matrix(&random_samples(3, 4, 6)))], Some([4, 2].as_slice()))
        .unwrap();
    assert!(inspect_source_file(&path).is_err());

    let mixed = write_source_file(
        dir.path().join("mixed.parquet"),
        &[
            ("a", &to_matrix(&random_samples(3, 4, 6))),
            ("b", &to_matrix(&random_samples(4, 4, 5))),
        ],
        None,
    );
    assert!(mixed.is_err());
}

#[test]
fn test_parquet_source_default_order_and_reads() {
    init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.parquet");
    let (alpha, beta) = write_two_datasets(&path);

    let source = ParquetSource::open(&Manifest::from_paths(&[&path])).unwrap();
    let catalog = source.catalog();
    let names: Vec<&str> = catalog.files[0]
        .datasets
        .iter()
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(source.total_samples(), 8);
    assert_eq!(source.feature_shape(), vec![2, 3]);

    // alpha is dataset 0 in catalog order, stored after beta
    let read = source
        .read(&ReadSpec {
            file: 0,
            dataset: 0,
            range: 1..3,
        })
        .unwrap();
    assert_eq!(read.shape(), (2, 6));
    assert_eq!(matrix_rows(&read), alpha[1..3].to_vec());

    let read = source
        .read(&ReadSpec {
            file: 0,
            dataset: 1,
            range: 0..5,
        })
        .unwrap();
    assert_eq!(matrix_rows(&read), beta);

    assert!(
        source
            .read(&ReadSpec {
                file: 0,
                dataset: 0,
                range: 2..4,
            })
            .is_err()
    );
}

#[test]
fn test_parquet_source_dataset_selection() {
    init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.parquet");
    write_two_datasets(&path);

    let manifest = Manifest::parse(&format!("File:{}\nDataset:beta\n", path.display())).unwrap();
    let source = ParquetSource::open(&manifest).unwrap();
    assert_eq!(source.catalog().files[0].datasets.len(), 1);
    assert_eq!(source.total_samples(), 5);

    let manifest = Manifest::parse(&format!("File:{}\nDataset:gamma\n", path.display())).unwrap();
    let err = ParquetSource::open(&manifest).unwrap_err();
    assert!(err.is_configuration(), "{}", err);
}

#[test]
fn test_parquet_source_missing_file() {
    init();
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::from_paths(&[dir.path().join("nope.parquet")]);
    let err = ParquetSource::open(&manifest).unwrap_err();
    assert!(err.is_configuration(), "{}", err);
}

#[test]
fn test_manifest_parsing() {
    init();
    let text = "\
File:/data/a.parquet
  Dataset: one
Dataset:two

File: /data/b.parquet
# comment lines are ignored
";
    let manifest = Manifest::parse(text).unwrap();
    assert_eq!(
        manifest.entries,
        vec![
            ManifestEntry {
                path: "/data/a.parquet".into(),
                datasets: Some(vec!["one".to_string(), "two".to_string()]),
            },
            ManifestEntry {
                path: "/data/b.parquet".into(),
                datasets: None,
            },
        ]
    );

    assert!(Manifest::parse("Dataset:orphan\nFile:/x.parquet\n").is_err());
}

#[test]
fn test_manifest_from_file() {
    init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("runs.manifest");
    std::fs::write(&path, "File:/data/a.parquet\n").unwrap();
    let manifest = Manifest::from_file(&path).unwrap();
    assert_eq!(manifest.entries.len(), 1);
    assert!(Manifest::from_file(dir.path().join("missing.manifest")).is_err());
}

#[test]
fn test_vector_round_trip() {
    init();
    let dir = TempDir::new().unwrap();
    let values = vec![0.25, -1.5, 3.0e-12, 7.0];
    save_vector(&values, dir.path(), MEAN_ALL).unwrap();

    let loaded = load_vector(dir.path().join(format!("{}.parquet", MEAN_ALL))).unwrap();
    assert_eq!(loaded, values);
    assert!(matches!(
        load_vector(dir.path().join("absent.parquet")),
        Err(crate::storage::StorageError::Missing(_))
    ));
}

#[test]
fn test_distance_patch_round_trip() {
    init();
    let dir = TempDir::new().unwrap();
    let patch = DistancePatch {
        batch: 2,
        global_start: 10,
        rows: vec![
            TopKRow::from_entries(vec![Neighbor::new(3, 0.9), Neighbor::new(15, 0.1)]),
            TopKRow::from_entries(vec![Neighbor::new(0, 0.4), Neighbor::new(10, -0.3)]),
        ],
    };

    let path = save_distance_patch(&patch, dir.path()).unwrap();
    assert_eq!(path, distance_patch_path(dir.path(), 2));
    assert!(path.ends_with("distances/distance_batch_2.parquet"));

    let loaded = load_distance_patch(&path).unwrap();
    assert_eq!(loaded, patch);
    assert_eq!(loaded.k(), 2);
}

#[test]
fn test_sparse_matrix_and_metadata() {
    init();
    let dir = TempDir::new().unwrap();
    let mut trimat = TriMat::new((4, 4));
    trimat.add_triplet(0, 1, 0.5);
    trimat.add_triplet(1, 0, 0.5);
    trimat.add_triplet(2, 3, -0.25);
    trimat.add_triplet(3, 0, 1.0);
    let matrix = trimat.to_csr();

    let config = JobConfig::new().with_batches(2, 1).with_neighbors(1);
    save_sparse_matrix(
        &matrix,
        dir.path(),
        CORRELATION_MATRIX,
        Some(config.config_typed()),
    )
    .unwrap();

    let loaded =
        load_sparse_matrix(dir.path().join(format!("{}.parquet", CORRELATION_MATRIX))).unwrap();
    assert_eq!(loaded.shape(), (4, 4));
    assert_eq!(loaded.nnz(), 4);
    assert_relative_eq!(*loaded.get(2, 3).unwrap(), -0.25);

    let metadata = load_metadata(dir.path(), CORRELATION_MATRIX).unwrap();
    assert_eq!(metadata.name_id, CORRELATION_MATRIX);
    assert_eq!((metadata.n_rows, metadata.n_cols), (4, 4));
    assert_eq!(metadata.neighbors(), Some(1));
    let info = &metadata.files["matrix"];
    assert_eq!(info.file_type, "sparse");
    assert_eq!(info.nnz, Some(4));
}

#[test]
fn test_sparse_matrix_rejects_out_of_range_entries() {
    use std::sync::Arc;

    use arrow::array::{Float64Array, RecordBatch, StringArray, UInt64Array};
    use arrow::datatypes::{DataType, Field, Schema};

    init();
    let dir = TempDir::new().unwrap();
    let schema = Arc::new(Schema::new(vec![
        Field::new("name_id", DataType::Utf8, false),
        Field::new("n_rows", DataType::UInt64, false),
        Field::new("n_cols", DataType::UInt64, false),
        Field::new("nnz", DataType::UInt64, false),
        Field::new("row", DataType::UInt64, false),
        Field::new("col", DataType::UInt64, false),
        Field::new("value", DataType::Float64, false),
    ]));
    // second entry points past a 2 x 2 matrix
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(vec![CORRELATION_MATRIX; 2])),
            Arc::new(UInt64Array::from(vec![2u64; 2])),
            Arc::new(UInt64Array::from(vec![2u64; 2])),
            Arc::new(UInt64Array::from(vec![2u64; 2])),
            Arc::new(UInt64Array::from(vec![0u64, 5])),
            Arc::new(UInt64Array::from(vec![1u64, 0])),
            Arc::new(Float64Array::from(vec![0.5, 0.25])),
        ],
    )
    .unwrap();
    let path = dir.path().join("damaged.parquet");
    write_record_batch(&path, schema, &batch, None).unwrap();

    assert!(matches!(
        load_sparse_matrix(&path),
        Err(crate::storage::StorageError::Invalid(_))
    ));
}
