//! Job configuration.
//!
//! `JobConfig` is assembled with the same `with_*` builder chain used across
//! the crate and travels inside the broadcast [`PartitionPlan`], so every unit
//! runs with the aggregator's values.
//!
//! [`PartitionPlan`]: crate::partition::PartitionPlan

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use corrgraph_core::correlation::MaskMode;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// Samples per read call when streaming a batch.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Row batches; must equal the number of worker units.
    pub(crate) batches_dim0: usize,
    /// Bins per worker along the column dimension.
    pub(crate) bins_dim1: usize,
    /// Neighbours kept per sample (K).
    pub(crate) neighbors: usize,
    pub(crate) chunk_size: usize,
    pub(crate) mask: MaskMode,
    pub(crate) output_dir: PathBuf,
}

impl Default for JobConfig {
    fn default() -> Self {
        debug!("Creating JobConfig with default parameters");
        Self {
            batches_dim0: 1,
            bins_dim1: 1,
            neighbors: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            mask: MaskMode::Upper,
            output_dir: PathBuf::from("corrgraph-output"),
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        info!("Initializing new JobConfig");
        Self::default()
    }

    /// Number of row batches (`dim0`) and bins per row (`dim1`).
    pub fn with_batches(mut self, dim0: usize, dim1: usize) -> Self {
        info!("Configuring batches: dim0={}, dim1={}", dim0, dim1);
        self.batches_dim0 = dim0;
        self.bins_dim1 = dim1;
        self
    }

    pub fn with_neighbors(mut self, k: usize) -> Self {
        info!("Configuring neighbours: k={}", k);
        self.neighbors = k;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        if chunk_size == 0 {
            warn!("chunk_size=0 is not usable, keeping {}", self.chunk_size);
            return self;
        }
        self.chunk_size = chunk_size;
        self
    }

    /// Diagonal-block convention, see [`MaskMode`].
    pub fn with_mask(mut self, mask: MaskMode) -> Self {
        info!("Configuring diagonal mask: {}", mask);
        self.mask = mask;
        self
    }

    /// Directory receiving statistics, patches and the final matrix.
    pub fn with_output_dir(mut self, path: impl AsRef<Path>) -> Self {
        let path_buf = path.as_ref().to_path_buf();
        info!("Writing artifacts to: {}", path_buf.display());
        self.output_dir = path_buf;
        self
    }

    pub fn batches_dim0(&self) -> usize {
        self.batches_dim0
    }

    pub fn bins_dim1(&self) -> usize {
        self.bins_dim1
    }

    pub fn neighbors(&self) -> usize {
        self.neighbors
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn mask(&self) -> MaskMode {
        self.mask
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// One aggregator plus one worker per row batch.
    pub fn check_topology(&self, n_units: usize) -> PipelineResult<()> {
        if n_units < 2 || self.batches_dim0 != n_units - 1 {
            return Err(PipelineError::Configuration(format!(
                "{} units cannot run {} batches: need exactly one worker per batch plus one aggregator",
                n_units, self.batches_dim0
            )));
        }
        Ok(())
    }

    pub fn config_typed(&self) -> HashMap<String, ConfigValue> {
        let mut config = HashMap::new();
        config.insert(
            "batches_dim0".to_string(),
            ConfigValue::Usize(self.batches_dim0),
        );
        config.insert("bins_dim1".to_string(), ConfigValue::Usize(self.bins_dim1));
        config.insert("neighbors".to_string(), ConfigValue::Usize(self.neighbors));
        config.insert(
            "chunk_size".to_string(),
            ConfigValue::Usize(self.chunk_size),
        );
        config.insert("mask".to_string(), ConfigValue::MaskMode(self.mask));
        config.insert(
            "output_dir".to_string(),
            ConfigValue::String(self.output_dir.display().to_string()),
        );
        config
    }
}

impl fmt::Display for JobConfig {
    /// Comma-separated `key=value` pairs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batches_dim0={}, \
             bins_dim1={}, \
             neighbors={}, \
             chunk_size={}, \
             mask={}, \
             output_dir={}",
            self.batches_dim0,
            self.bins_dim1,
            self.neighbors,
            self.chunk_size,
            self.mask,
            self.output_dir.display()
        )
    }
}

/// Configuration value that keeps its type through JSON metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    Usize(usize),
    String(String),
    MaskMode(MaskMode),
}

impl ConfigValue {
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ConfigValue::Usize(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_mask_mode(&self) -> Option<MaskMode> {
        match self {
            ConfigValue::MaskMode(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Usize(v) => write!(f, "{}", v),
            ConfigValue::String(v) => write!(f, "{}", v),
            ConfigValue::MaskMode(v) => write!(f, "{}", v),
        }
    }
}
