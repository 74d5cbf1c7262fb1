//! Unit roles and the stage loop.
//!
//! ```text
//!  rank 0 (aggregator)              ranks 1..P (workers, batch = rank - 1)
//!  -------------------              --------------------------------------
//!  partition, broadcast plan  --->  receive plan
//!  barrier                          barrier
//!                                   diagonal stage
//!  gather statistics          <---  send statistics
//!  save + broadcast stats     --->  receive stats
//!  barrier                          barrier
//!                                   off-diagonal stage, save patch
//!  barrier                          barrier
//!  assemble matrix
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use corrgraph_core::correlation::SampleStats;
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::aggregator::{AdjacencyMatrix, AggregatorState, GlobalStats};
use crate::collective::{AGGREGATOR_RANK, Collective, CollectiveError, launch_local};
use crate::config::JobConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::partition::{PartitionPlan, Partitioner};
use crate::source::DataSource;
use crate::worker::WorkerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Aggregator,
    Worker { batch: usize },
}

/// First message of every job: the plan, or why there is none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanMessage {
    Plan(PartitionPlan),
    Abort(String),
}

/// Statistics one worker reports after its diagonal stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub batch: usize,
    pub stats: SampleStats,
}

/// What a unit hands back when the job completes.
#[derive(Debug)]
pub enum UnitOutput {
    Matrix(AdjacencyMatrix),
    Patch { batch: usize, path: PathBuf },
}

#[derive(Debug)]
pub enum Unit {
    Aggregator(AggregatorState),
    Worker(WorkerState),
}

impl Unit {
    /// Rank 0 aggregates; rank `r > 0` owns batch `r - 1`.
    pub fn for_rank(rank: usize, plan: PartitionPlan) -> PipelineResult<Self> {
        if rank == AGGREGATOR_RANK {
            Ok(Unit::Aggregator(AggregatorState::new(plan)))
        } else {
            Ok(Unit::Worker(WorkerState::new(plan, rank - 1)?))
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Unit::Aggregator(_) => Role::Aggregator,
            Unit::Worker(w) => Role::Worker { batch: w.batch() },
        }
    }

    /// Diagonal stage; workers return their statistics report.
    pub fn diagonal(&mut self, source: &dyn DataSource) -> PipelineResult<Option<StatsReport>> {
        match self {
            Unit::Aggregator(_) => Ok(None),
            Unit::Worker(w) => {
                let stats = w.diagonal_stage(source)?;
                Ok(Some(StatsReport {
                    batch: w.batch(),
                    stats,
                }))
            }
        }
    }

    /// Aggregator only: turn the gathered reports (rank order) into the
    /// global statistics.
    pub fn combine_stats(
        &self,
        gathered: Vec<Option<StatsReport>>,
    ) -> PipelineResult<Option<GlobalStats>> {
        let Unit::Aggregator(agg) = self else {
            return Ok(None);
        };
        let mut reports = Vec::with_capacity(gathered.len().saturating_sub(1));
        for (rank, report) in gathered.into_iter().enumerate().skip(1) {
            match report {
                Some(r) if r.batch == rank - 1 => reports.push(r.stats),
                Some(r) => {
                    return Err(PipelineError::Computation(format!(
                        "rank {} reported batch {}",
                        rank, r.batch
                    )));
                }
                None => {
                    return Err(PipelineError::Computation(format!(
                        "rank {} sent no statistics",
                        rank
                    )));
                }
            }
        }
        agg.collect_stats(reports).map(Some)
    }

    /// Off-diagonal stage; workers persist their patch.
    pub fn off_diagonal(
        &mut self,
        source: &dyn DataSource,
        global: &GlobalStats,
    ) -> PipelineResult<Option<UnitOutput>> {
        match self {
            Unit::Aggregator(_) => Ok(None),
            Unit::Worker(w) => {
                let patch = w.off_diagonal_stage(source, global)?;
                let path = w.save_patch(&patch)?;
                Ok(Some(UnitOutput::Patch {
                    batch: w.batch(),
                    path,
                }))
            }
        }
    }

    pub fn assemble(&self) -> PipelineResult<Option<UnitOutput>> {
        match self {
            Unit::Aggregator(agg) => agg.assemble().map(|m| Some(UnitOutput::Matrix(m))),
            Unit::Worker(_) => Ok(None),
        }
    }
}

/// Receive (or build and broadcast) the partition plan.
fn exchange_plan<C: Collective>(
    comm: &mut C,
    config: &JobConfig,
    source: &dyn DataSource,
) -> PipelineResult<PartitionPlan> {
    if comm.rank() == AGGREGATOR_RANK {
        let planned = config
            .check_topology(comm.size())
            .and_then(|_| Partitioner::new(config.clone()).plan(source.catalog()));
        match planned {
            Ok(plan) => match comm.broadcast(Some(PlanMessage::Plan(plan)))? {
                PlanMessage::Plan(plan) => Ok(plan),
                PlanMessage::Abort(reason) => Err(PipelineError::Configuration(reason)),
            },
            Err(e) => {
                // best effort: peers may already be gone
                let _ = comm.broadcast(Some(PlanMessage::Abort(e.to_string())));
                Err(e)
            }
        }
    } else {
        match comm.broadcast::<PlanMessage>(None)? {
            PlanMessage::Plan(plan) => {
                plan.config().check_topology(comm.size())?;
                Ok(plan)
            }
            PlanMessage::Abort(reason) => Err(PipelineError::Configuration(reason)),
        }
    }
}

/// Run one unit of a job to completion over `comm`.
///
/// Only the aggregator's `config` is used; workers adopt the configuration
/// carried by the plan. Every unit must see the same catalog through its
/// `source`.
pub fn run_unit<C: Collective>(
    comm: &mut C,
    config: &JobConfig,
    source: &dyn DataSource,
) -> PipelineResult<UnitOutput> {
    let rank = comm.rank();
    let plan = exchange_plan(comm, config, source)?;
    let mut unit = Unit::for_rank(rank, plan)?;
    comm.barrier()?;

    let report = unit.diagonal(source)?;
    let gathered = comm.gather(report)?;
    let global = match gathered {
        Some(all) => comm.broadcast(unit.combine_stats(all)?)?,
        None => comm.broadcast(None)?,
    };
    comm.barrier()?;

    let patch = unit.off_diagonal(source, &global)?;
    comm.barrier()?;

    match (unit.assemble()?, patch) {
        (Some(output), _) | (None, Some(output)) => Ok(output),
        (None, None) => Err(PipelineError::Computation(format!(
            "unit {} produced no output",
            rank
        ))),
    }
}

/// Run a whole job in this process: one aggregator plus `batches_dim0`
/// workers, each on its own thread, connected by an in-process group.
///
/// When several units fail, the error that caused the failure is reported
/// rather than the disconnects it triggered in the other units.
pub fn run_local(config: &JobConfig, source: Arc<dyn DataSource>) -> PipelineResult<AdjacencyMatrix> {
    let start = Instant::now();
    let size = config.batches_dim0() + 1;
    info!("Launching {} local units", size);

    let results = launch_local(size, |mut comm| run_unit(&mut comm, config, source.as_ref()));

    let mut matrix = None;
    let mut first_error: Option<PipelineError> = None;
    for (rank, result) in results.into_iter().enumerate() {
        let outcome = result.map_err(PipelineError::from).and_then(|r| r);
        match outcome {
            Ok(UnitOutput::Matrix(m)) => matrix = Some(m),
            Ok(UnitOutput::Patch { .. }) => {}
            Err(e) => {
                error!("unit {} failed: {}", rank, e);
                let replace = match &first_error {
                    None => true,
                    Some(PipelineError::Collective(CollectiveError::Disconnected(_))) => {
                        !matches!(e, PipelineError::Collective(CollectiveError::Disconnected(_)))
                    }
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    let matrix = matrix.ok_or_else(|| {
        PipelineError::Computation("aggregator returned no matrix".to_string())
    })?;
    info!("Job finished in {:?}", start.elapsed());
    Ok(matrix)
}
