//! # corrgraph
//!
//! Out-of-core k-nearest-neighbour graph over Pearson correlation.
//!
//! The `N × N` correlation grid of a dataset too large for memory is cut into
//! row batches. One aggregator unit and one worker per batch cooperate:
//!
//! 1. the aggregator partitions the catalog ([`partition`]) and broadcasts
//!    the plan,
//! 2. each worker correlates its batch with itself and reports per-sample
//!    statistics ([`worker`]),
//! 3. the aggregator concatenates and re-broadcasts the statistics
//!    ([`aggregator`]),
//! 4. each worker scans the other batches bin by bin, keeping a running
//!    top-k per sample, and persists a distance patch,
//! 5. the aggregator assembles the patches into a sparse adjacency matrix.
//!
//! Units talk through [`collective`] (in-process or TCP); samples come from a
//! [`source::DataSource`] (Parquet files or memory).
//!
//! ```ignore
//! use std::sync::Arc;
//! use corrgraph::{config::JobConfig, coordinator::run_local};
//! use corrgraph::source::Manifest;
//! use corrgraph::storage::parquet::ParquetSource;
//!
//! let manifest = Manifest::from_file("runs.manifest")?;
//! let source = Arc::new(ParquetSource::open(&manifest)?);
//! let config = JobConfig::new()
//!     .with_batches(4, 2)
//!     .with_neighbors(10)
//!     .with_output_dir("./out");
//! let graph = run_local(&config, source)?;
//! ```

pub mod aggregator;
pub mod collective;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod partition;
pub mod source;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod tests;
