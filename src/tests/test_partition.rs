use corrgraph_core::correlation::MaskMode;
use smartcore::linalg::basic::arrays::Array2;
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::config::JobConfig;
use crate::partition::{GlobalIndexMap, Partitioner};
use crate::source::{DataSource, MemorySource, ReadSpec};
use crate::tests::init;
use crate::tests::test_helpers::{random_samples, to_matrix};

/// Two files: [4, 0, 3] and [5] samples.
fn catalog_source() -> MemorySource {
    MemorySource::new()
        .with_dataset("a.parquet", "x", to_matrix(&random_samples(1, 4, 2)))
        .with_shaped_dataset("a.parquet", "empty", vec![2], no_samples(2))
        .with_dataset("a.parquet", "y", to_matrix(&random_samples(2, 3, 2)))
        .with_dataset("b.parquet", "z", to_matrix(&random_samples(3, 5, 2)))
}

fn no_samples(dim: usize) -> DenseMatrix<f64> {
    DenseMatrix::from_iterator(std::iter::empty(), 0, dim, 0)
}

fn read(file: usize, dataset: usize, range: std::ops::Range<usize>) -> ReadSpec {
    ReadSpec {
        file,
        dataset,
        range,
    }
}

#[test]
fn test_index_map_segments_skip_empty_datasets() {
    init();
    let source = catalog_source();
    let map = GlobalIndexMap::from_catalog(source.catalog());

    assert_eq!(map.total(), 12);
    let starts: Vec<(usize, usize, usize)> = map
        .segments()
        .iter()
        .map(|s| (s.start, s.file, s.dataset))
        .collect();
    assert_eq!(starts, vec![(0, 0, 0), (4, 0, 2), (7, 1, 0)]);
}

#[test]
fn test_locate() {
    init();
    let source = catalog_source();
    let map = GlobalIndexMap::from_catalog(source.catalog());

    assert_eq!(map.locate(0), Some((0, 0, 0)));
    assert_eq!(map.locate(3), Some((0, 0, 3)));
    assert_eq!(map.locate(4), Some((0, 2, 0)));
    assert_eq!(map.locate(6), Some((0, 2, 2)));
    assert_eq!(map.locate(7), Some((1, 0, 0)));
    assert_eq!(map.locate(11), Some((1, 0, 4)));
    assert_eq!(map.locate(12), None);

    // monotonic: walking the global index never moves backwards
    let mut last = (0, 0, 0);
    for g in 0..12 {
        let here = map.locate(g).unwrap();
        assert!(here >= last);
        last = here;
    }
}

#[test]
fn test_resolve_splits_at_dataset_boundaries() {
    init();
    let source = catalog_source();
    let map = GlobalIndexMap::from_catalog(source.catalog());

    assert_eq!(map.resolve(1..3), vec![read(0, 0, 1..3)]);
    assert_eq!(
        map.resolve(2..9),
        vec![read(0, 0, 2..4), read(0, 2, 0..3), read(1, 0, 0..2)]
    );
    assert_eq!(map.resolve(7..20), vec![read(1, 0, 0..5)]);
    assert!(map.resolve(5..5).is_empty());
    assert!(map.resolve(12..14).is_empty());

    let covered: usize = map.resolve(0..12).iter().map(|r| r.len()).sum();
    assert_eq!(covered, 12);
}

#[test]
fn test_plan_batches_cover_all_samples() {
    init();
    let source = catalog_source();
    let plan = Partitioner::new(JobConfig::new().with_batches(5, 2).with_neighbors(2))
        .plan(source.catalog())
        .unwrap();

    let sizes: Vec<usize> = plan.batches().iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![3, 3, 2, 2, 2]);
    assert_eq!(plan.max_batch_len(), 3);
    assert_eq!(plan.feature_dim(), 2);

    let mut next = 0;
    for batch in plan.batches() {
        assert_eq!(batch.range.start, next);
        next = batch.range.end;
        let read_total: usize = batch.reads.iter().map(|r| r.len()).sum();
        assert_eq!(read_total, batch.len());
    }
    assert_eq!(next, 12);

    // batch 1 = [3, 6) straddles datasets x and y
    assert_eq!(
        plan.batch(1).unwrap().reads,
        vec![read(0, 0, 3..4), read(0, 2, 0..2)]
    );
}

#[test]
fn test_bins_cover_every_other_batch() {
    init();
    let source = catalog_source();
    let plan = Partitioner::new(JobConfig::new().with_batches(5, 3).with_neighbors(2))
        .plan(source.catalog())
        .unwrap();

    for own in 0..5 {
        let bins = plan.bins(own);
        assert_eq!(bins.len(), 3);
        let scanned: Vec<usize> = bins.iter().flat_map(|b| b.batches.clone()).collect();
        let expected: Vec<usize> = (0..5).filter(|&b| b != own).collect();
        assert_eq!(scanned, expected);

        let mut columns: Vec<usize> = bins.iter().flat_map(|b| b.columns()).collect();
        assert_eq!(columns.len(), 12 - plan.batch(own).unwrap().len());
        columns.sort_unstable();
        columns.dedup();
        assert_eq!(columns.len(), 12 - plan.batch(own).unwrap().len());
        for bin in bins {
            let read_total: usize = bin.reads.iter().map(|r| r.len()).sum();
            assert_eq!(read_total, bin.n_columns());
        }
    }
}

#[test]
fn test_bin_reads_are_coalesced() {
    init();
    let source =
        MemorySource::new().with_dataset("a.parquet", "x", to_matrix(&random_samples(4, 12, 2)));
    let plan = Partitioner::new(JobConfig::new().with_batches(4, 1).with_neighbors(2))
        .plan(source.catalog())
        .unwrap();

    // batches 0, 1, 2 sit back to back in one dataset
    let bins = plan.bins(3);
    assert_eq!(bins.len(), 1);
    assert_eq!(bins[0].reads, vec![read(0, 0, 0..9)]);

    // around the owned batch the read has to split
    let bins = plan.bins(1);
    assert_eq!(bins[0].reads, vec![read(0, 0, 0..3), read(0, 0, 6..12)]);
}

#[test]
fn test_invalid_configurations() {
    init();
    let source = catalog_source();
    let catalog = source.catalog();
    let base = JobConfig::new().with_neighbors(2);

    let cases = vec![
        ("no batches", base.clone().with_batches(0, 1)),
        ("more batches than samples", base.clone().with_batches(13, 1)),
        ("no bins", base.clone().with_batches(2, 0)),
        ("k = 0", base.clone().with_batches(2, 1).with_neighbors(0)),
        (
            "k beyond upper-mask reach",
            base.clone().with_batches(2, 1).with_neighbors(7),
        ),
        (
            "k beyond self-mask reach",
            base.clone()
                .with_batches(1, 1)
                .with_neighbors(12)
                .with_mask(MaskMode::SelfOnly),
        ),
    ];
    for (name, config) in cases {
        let err = Partitioner::new(config).plan(catalog).unwrap_err();
        assert!(err.is_configuration(), "{}: {}", name, err);
    }

    // the boundary values are accepted
    assert!(
        Partitioner::new(base.clone().with_batches(2, 1).with_neighbors(6))
            .plan(catalog)
            .is_ok()
    );
    assert!(
        Partitioner::new(
            base.with_batches(1, 1)
                .with_neighbors(11)
                .with_mask(MaskMode::SelfOnly)
        )
        .plan(catalog)
        .is_ok()
    );
}

#[test]
fn test_empty_catalogs_rejected() {
    init();
    let config = JobConfig::new().with_batches(1, 1).with_neighbors(1);

    let err = Partitioner::new(config.clone())
        .plan(MemorySource::new().catalog())
        .unwrap_err();
    assert!(err.is_configuration());

    let only_empty =
        MemorySource::new().with_shaped_dataset("a.parquet", "x", vec![3], no_samples(3));
    let err = Partitioner::new(config)
        .plan(only_empty.catalog())
        .unwrap_err();
    assert!(err.is_configuration());
}
