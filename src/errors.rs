//! Error taxonomy of the pipeline.
//!
//! Every failure is fatal for the job: nothing is retried and no partial
//! matrix is ever written.

use thiserror::Error;

use crate::collective::CollectiveError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad inputs or a topology that does not match the batch layout.
    /// Raised before any computation starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A worker could not load or contract its data.
    #[error("computation error: {0}")]
    Computation(String),

    /// The aggregator found a missing or malformed distance patch.
    #[error("assembly error: {0}")]
    Assembly(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),
}

impl PipelineError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, PipelineError::Configuration(_))
    }

    pub fn is_computation(&self) -> bool {
        matches!(self, PipelineError::Computation(_))
    }

    pub fn is_assembly(&self) -> bool {
        matches!(self, PipelineError::Assembly(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
