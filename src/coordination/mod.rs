//! Cross-process offset coordination.
//!
//! Every process converts a disjoint slice of the input and writes it into
//! the same output datasets. Before any data moves, the processes agree on
//! where each one's slice lands:
//!
//! 1. all-reduce the local record counts into the global total;
//! 2. all-reduce the local block counts (progress estimates only);
//! 3. gather the counts at the root, which turns them into an exclusive
//!    prefix sum;
//! 4. scatter the offsets back, one per process.
//!
//! The resulting [`OffsetWindow`]s are pairwise disjoint and cover
//! `[0, global_total)` in process order.
//!
//! The collectives are behind [`CoordinationGroup`]. [`SoloGroup`] is the
//! one-process group; [`LocalGroup`] runs N ranks as threads of one process
//! and checks that every rank issues the same collective in the same order.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Rank that gathers counts and computes offsets.
pub const ROOT: usize = 0;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by collective operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// Some rank aborted the group.
    #[error("coordination group aborted")]
    Aborted,

    /// Ranks entered different collectives in the same phase.
    #[error("collective mismatch: {0}")]
    ProtocolViolation(String),

    /// A sum does not fit in 64 bits.
    #[error("offset arithmetic overflowed")]
    Overflow,

    /// Bad root, rank, or value count.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// Group interface
// ------------------------------------------------------------------------------------------------

/// Fixed-size set of cooperating processes.
///
/// Every collective must be entered by all ranks, in the same order, or the
/// group deadlocks (or, for implementations that can tell, reports a
/// [`CoordError::ProtocolViolation`]).
pub trait CoordinationGroup: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sum of `value` over all ranks, returned on every rank.
    fn all_reduce_sum(&self, value: u64) -> Result<u64, CoordError>;

    /// Collects one value per rank at `root`, in rank order.
    ///
    /// Returns `Some` on the root and `None` elsewhere.
    fn gather(&self, value: u64, root: usize) -> Result<Option<Vec<u64>>, CoordError>;

    /// Distributes `values[rank]` from `root` to every rank.
    ///
    /// Only the root's `values` are read; they must hold `size()` entries.
    fn scatter(&self, values: Option<&[u64]>, root: usize) -> Result<u64, CoordError>;

    /// Blocks until every rank has arrived.
    fn barrier(&self) -> Result<(), CoordError>;

    /// Wakes every rank blocked in a collective with [`CoordError::Aborted`].
    ///
    /// Later collectives fail the same way.
    fn abort(&self);
}

/// The group of a single process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloGroup;

impl SoloGroup {
    fn check_root(root: usize) -> Result<(), CoordError> {
        if root != ROOT {
            return Err(CoordError::InvalidArgument(format!(
                "root {root} out of range for 1 rank"
            )));
        }
        Ok(())
    }
}

impl CoordinationGroup for SoloGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: u64) -> Result<u64, CoordError> {
        Ok(value)
    }

    fn gather(&self, value: u64, root: usize) -> Result<Option<Vec<u64>>, CoordError> {
        Self::check_root(root)?;
        Ok(Some(vec![value]))
    }

    fn scatter(&self, values: Option<&[u64]>, root: usize) -> Result<u64, CoordError> {
        Self::check_root(root)?;
        match values {
            Some([value]) => Ok(*value),
            _ => Err(CoordError::InvalidArgument(
                "scatter expects exactly 1 value".into(),
            )),
        }
    }

    fn barrier(&self) -> Result<(), CoordError> {
        Ok(())
    }

    fn abort(&self) {}
}

// ------------------------------------------------------------------------------------------------
// Thread-backed group
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    AllReduceSum,
    Gather { root: usize },
    Scatter { root: usize },
    Barrier,
}

#[derive(Debug, Clone)]
struct Contribution {
    op: Collective,
    values: Vec<u64>,
}

#[derive(Debug, Default)]
struct RoundState {
    /// Completed rounds.
    generation: u64,
    arrived: usize,
    pending: Vec<Option<Contribution>>,

    /// Contributions of the last completed round, in rank order.
    completed: Arc<Vec<Contribution>>,

    /// Set when the last round's ranks disagreed on the collective.
    violation: Option<String>,

    aborted: bool,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
}

/// One rank of a group whose members are threads of this process.
///
/// Built with [`LocalGroup::create`]; hand one member to each thread.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates the `size` members of a new group.
    pub fn create(size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(RoundState {
                pending: vec![None; size],
                ..RoundState::default()
            }),
            cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RoundState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_root(&self, root: usize) -> Result<(), CoordError> {
        if root >= self.shared.size {
            return Err(CoordError::InvalidArgument(format!(
                "root {root} out of range for {} ranks",
                self.shared.size
            )));
        }
        Ok(())
    }

    /// Deposits this rank's contribution and waits for the round to finish.
    ///
    /// Returns every rank's contribution in rank order.
    fn exchange(
        &self,
        op: Collective,
        values: Vec<u64>,
    ) -> Result<Arc<Vec<Contribution>>, CoordError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(CoordError::Aborted);
        }

        trace!(rank = self.rank, ?op, generation = state.generation, "entering collective");
        let generation = state.generation;
        state.pending[self.rank] = Some(Contribution { op, values });
        state.arrived += 1;

        if state.arrived == self.shared.size {
            let round: Vec<Contribution> =
                state.pending.iter_mut().filter_map(Option::take).collect();
            state.violation = round
                .iter()
                .enumerate()
                .find(|(_, c)| c.op != round[0].op)
                .map(|(rank, c)| {
                    format!(
                        "rank 0 entered {:?} but rank {rank} entered {:?}",
                        round[0].op, c.op
                    )
                });
            state.completed = Arc::new(round);
            state.arrived = 0;
            state.generation += 1;
            self.shared.cv.notify_all();
        } else {
            while state.generation == generation && !state.aborted {
                state = self
                    .shared
                    .cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.generation == generation {
                return Err(CoordError::Aborted);
            }
        }

        if let Some(violation) = &state.violation {
            warn!(rank = self.rank, %violation, "collective protocol violation");
            return Err(CoordError::ProtocolViolation(violation.clone()));
        }
        Ok(Arc::clone(&state.completed))
    }
}

impl CoordinationGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_reduce_sum(&self, value: u64) -> Result<u64, CoordError> {
        let round = self.exchange(Collective::AllReduceSum, vec![value])?;
        round
            .iter()
            .try_fold(0u64, |acc, c| acc.checked_add(c.values[0]))
            .ok_or(CoordError::Overflow)
    }

    fn gather(&self, value: u64, root: usize) -> Result<Option<Vec<u64>>, CoordError> {
        self.check_root(root)?;
        let round = self.exchange(Collective::Gather { root }, vec![value])?;
        if self.rank != root {
            return Ok(None);
        }
        Ok(Some(round.iter().map(|c| c.values[0]).collect()))
    }

    fn scatter(&self, values: Option<&[u64]>, root: usize) -> Result<u64, CoordError> {
        self.check_root(root)?;
        let mine = if self.rank == root {
            values.map(<[u64]>::to_vec).unwrap_or_default()
        } else {
            Vec::new()
        };
        let round = self.exchange(Collective::Scatter { root }, mine)?;
        round[root].values.get(self.rank).copied().ok_or_else(|| {
            CoordError::InvalidArgument(format!(
                "scatter root supplied {} values for {} ranks",
                round[root].values.len(),
                self.shared.size
            ))
        })
    }

    fn barrier(&self) -> Result<(), CoordError> {
        self.exchange(Collective::Barrier, Vec::new()).map(|_| ())
    }

    fn abort(&self) {
        let mut state = self.lock();
        if !state.aborted {
            warn!(rank = self.rank, "aborting coordination group");
            state.aborted = true;
        }
        self.shared.cv.notify_all();
    }
}

// ------------------------------------------------------------------------------------------------
// Offset protocol
// ------------------------------------------------------------------------------------------------

/// Contiguous range of rows `[offset, offset + len)` owned by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetWindow {
    pub offset: u64,
    pub len: u64,
}

impl OffsetWindow {
    /// Window covering `[0, len)`.
    pub fn full(len: u64) -> Self {
        Self { offset: 0, len }
    }

    /// One past the last row.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Whether `[offset, offset + rows)` lies inside the window.
    pub fn contains(&self, offset: u64, rows: u64) -> bool {
        offset >= self.offset
            && offset
                .checked_add(rows)
                .is_some_and(|end| end <= self.end())
    }
}

/// Outcome of [`coordinate`] on one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPlan {
    pub rank: usize,
    pub size: usize,
    pub local_offset: u64,
    pub local_count: u64,
    pub global_total: u64,
    pub global_block_total: u64,
}

impl OffsetPlan {
    /// The rows this process writes.
    pub fn window(&self) -> OffsetWindow {
        OffsetWindow {
            offset: self.local_offset,
            len: self.local_count,
        }
    }
}

/// `[c0, c1, c2, ...] -> [0, c0, c0 + c1, ...]`.
pub fn exclusive_prefix_sum(counts: &[u64]) -> Result<Vec<u64>, CoordError> {
    let mut offsets = Vec::with_capacity(counts.len());
    let mut acc = 0u64;
    for count in counts {
        offsets.push(acc);
        acc = acc.checked_add(*count).ok_or(CoordError::Overflow)?;
    }
    Ok(offsets)
}

/// Runs the offset protocol. Every rank must call it exactly once per run.
pub fn coordinate(
    group: &dyn CoordinationGroup,
    local_count: u64,
    local_blocks: u64,
) -> Result<OffsetPlan, CoordError> {
    let global_total = group.all_reduce_sum(local_count)?;
    let global_block_total = group.all_reduce_sum(local_blocks)?;

    let counts = group.gather(local_count, ROOT)?;
    let offsets = counts.as_deref().map(exclusive_prefix_sum).transpose();
    // The other ranks are already headed into the scatter.
    let offsets = match offsets {
        Ok(offsets) => offsets,
        Err(e) => {
            group.abort();
            return Err(e);
        }
    };
    let local_offset = group.scatter(offsets.as_deref(), ROOT)?;

    let plan = OffsetPlan {
        rank: group.rank(),
        size: group.size(),
        local_offset,
        local_count,
        global_total,
        global_block_total,
    };
    debug!(
        rank = plan.rank,
        local_offset, local_count, global_total, global_block_total, "offsets coordinated"
    );
    Ok(plan)
}

// ------------------------------------------------------------------------------------------------
// Execution context
// ------------------------------------------------------------------------------------------------

/// The coordination group a rank runs under, passed explicitly to every
/// component that needs it.
#[derive(Debug, Clone)]
pub struct ExecContext {
    group: Arc<dyn CoordinationGroup>,
}

impl ExecContext {
    pub fn new(group: Arc<dyn CoordinationGroup>) -> Self {
        Self { group }
    }

    /// Context of a standalone process.
    pub fn solo() -> Self {
        Self::new(Arc::new(SoloGroup))
    }

    pub fn group(&self) -> &Arc<dyn CoordinationGroup> {
        &self.group
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn is_root(&self) -> bool {
        self.rank() == ROOT
    }
}
