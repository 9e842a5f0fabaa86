//! Communication abstraction for distributed solvers.
//!
//! The solver talks to its peers through the `Communicator` trait:
//! collectives, and tagged pairwise exchanges that are posted non-blocking
//! so local computation can overlap the transfers. Implementations:
//! `SingleProcessComm` (no-op), `ThreadedComm` (in-process ranks over
//! shared mailboxes), `MpiComm` (via the mpi crate, feature `distributed`).

use std::sync::Arc;

use crate::error::{Result, SubdefError};

/// Message tags, one per communication phase. Distinct tags make
/// out-of-order phase completion impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Ghost-column index lists (setup).
    GhostCols,
    /// Ghost values and deflation-vector rows.
    GhostVals,
    /// Coarse-strip row lengths to the master.
    CoarseRowLen,
    /// Coarse-strip column ids to the master.
    CoarseCols,
    /// Coarse-strip values to the master.
    CoarseVals,
    /// Coarse right-hand-side / solution slabs through rank 0.
    CoarseRhs,
}

impl Phase {
    /// Wire tag for this phase.
    pub fn tag(self) -> i32 {
        match self {
            Phase::GhostCols => 1001,
            Phase::GhostVals => 2001,
            Phase::CoarseCols => 3001,
            Phase::CoarseVals => 3002,
            Phase::CoarseRhs => 4001,
            Phase::CoarseRowLen => 5001,
        }
    }
}

/// Inter-rank communication used by the deflation solver.
///
/// Pairwise exchanges post all receives, then all sends, run the `overlap`
/// closure while messages are in flight, and wait for completion before
/// returning. Collectives participate in program order on every rank.
/// Any transport failure is fatal and surfaced as `SubdefError::Transport`.
pub trait Communicator: Send + Sync {
    /// This rank's id.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Gather one value from every rank, in rank order.
    fn all_gather_usize(&self, value: usize) -> Result<Vec<usize>>;

    /// Concatenate one equal-length row per rank (row-major, rank order).
    fn all_gather_matrix(&self, row: &[usize]) -> Result<Vec<usize>>;

    /// Concatenate variable-length index slabs; `counts[p]` entries from rank p.
    fn all_gather_varied_usize(&self, local: &[usize], counts: &[usize]) -> Result<Vec<usize>>;

    /// Concatenate variable-length value slabs; `counts[p]` entries from rank p.
    fn all_gather_varied_f64(&self, local: &[f64], counts: &[usize]) -> Result<Vec<f64>>;

    /// Sum a scalar across all ranks.
    fn all_reduce_sum(&self, local: f64) -> Result<f64>;

    /// Tagged pairwise exchange of index slabs.
    ///
    /// `sends[i] = (to, data)`, `recvs[i] = (from, buffer)`; buffers must
    /// match the sender's slab length exactly. `overlap` runs while the
    /// messages are in flight.
    fn exchange_usize(
        &self,
        phase: Phase,
        sends: &[(usize, &[usize])],
        recvs: &mut [(usize, &mut [usize])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()>;

    /// Tagged pairwise exchange of value slabs; see `exchange_usize`.
    fn exchange_f64(
        &self,
        phase: Phase,
        sends: &[(usize, &[f64])],
        recvs: &mut [(usize, &mut [f64])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()>;

    /// Gather variable-length slabs on `root`: rank p's `local` lands at
    /// displacement `counts[0] + .. + counts[p-1]` of `out`. `out` is only
    /// written on the root and may be empty elsewhere.
    fn gather_slabs(
        &self,
        local: &[f64],
        counts: &[usize],
        root: usize,
        out: &mut [f64],
    ) -> Result<()>;

    /// Broadcast a buffer from `root` to every rank.
    fn broadcast_f64(&self, buf: &mut [f64], root: usize) -> Result<()>;

    /// Split off the sub-communicator of all ranks passing `member = true`.
    /// Members get the new communicator (ranked in ascending world order),
    /// non-members get `None`. Collective over the parent communicator.
    fn split(&self, member: bool) -> Result<Option<Arc<dyn Communicator>>>;
}

/// Copy self-addressed send slabs into the matching receive buffers.
///
/// Shared by the single-process path, where every exchange degenerates to
/// this, and useful as the semantic reference for the other backends.
fn copy_local<T: Copy>(
    rank: usize,
    sends: &[(usize, &[T])],
    recvs: &mut [(usize, &mut [T])],
) -> Result<()> {
    let mut used = vec![false; sends.len()];
    for (from, buf) in recvs.iter_mut() {
        if *from != rank {
            return Err(SubdefError::Transport(format!(
                "single process cannot receive from rank {from}"
            )));
        }
        let slot = sends
            .iter()
            .enumerate()
            .find(|(i, (to, data))| !used[*i] && *to == rank && data.len() == buf.len())
            .map(|(i, _)| i)
            .ok_or_else(|| {
                SubdefError::Transport("no matching local send for receive".into())
            })?;
        used[slot] = true;
        buf.copy_from_slice(sends[slot].1);
    }
    Ok(())
}

/// No-op communication backend for single-process runs.
///
/// All collectives pass through unchanged and pairwise exchanges reduce to
/// local copies; the solver's setup and solve paths are identical to the
/// multi-rank case.
pub struct SingleProcessComm;

impl Communicator for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_usize(&self, value: usize) -> Result<Vec<usize>> {
        Ok(vec![value])
    }

    fn all_gather_matrix(&self, row: &[usize]) -> Result<Vec<usize>> {
        Ok(row.to_vec())
    }

    fn all_gather_varied_usize(&self, local: &[usize], _counts: &[usize]) -> Result<Vec<usize>> {
        Ok(local.to_vec())
    }

    fn all_gather_varied_f64(&self, local: &[f64], _counts: &[usize]) -> Result<Vec<f64>> {
        Ok(local.to_vec())
    }

    fn all_reduce_sum(&self, local: f64) -> Result<f64> {
        Ok(local)
    }

    fn exchange_usize(
        &self,
        _phase: Phase,
        sends: &[(usize, &[usize])],
        recvs: &mut [(usize, &mut [usize])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()> {
        copy_local(0, sends, recvs)?;
        overlap();
        Ok(())
    }

    fn exchange_f64(
        &self,
        _phase: Phase,
        sends: &[(usize, &[f64])],
        recvs: &mut [(usize, &mut [f64])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()> {
        copy_local(0, sends, recvs)?;
        overlap();
        Ok(())
    }

    fn gather_slabs(
        &self,
        local: &[f64],
        _counts: &[usize],
        _root: usize,
        out: &mut [f64],
    ) -> Result<()> {
        out[..local.len()].copy_from_slice(local);
        Ok(())
    }

    fn broadcast_f64(&self, _buf: &mut [f64], _root: usize) -> Result<()> {
        Ok(())
    }

    fn split(&self, member: bool) -> Result<Option<Arc<dyn Communicator>>> {
        Ok(member.then(|| Arc::new(SingleProcessComm) as Arc<dyn Communicator>))
    }
}
