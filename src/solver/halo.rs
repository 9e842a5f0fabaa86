//! Ghost-value exchange plan.
//!
//! The assembler discovers which remote columns each rank needs; this
//! module keeps the resulting neighbour graph (both directions, ascending
//! rank order so pairing is deterministic) and drives the per-application
//! ghost exchange: receives are posted, staged send values go out, the
//! caller's local SpMV runs while the messages are in flight, and the wait
//! leaves `recv` values in exactly the order the compacted remote columns
//! expect.

use crate::error::Result;

use super::comm::{Communicator, Phase};

/// One direction of the exchange: neighbour ranks and slab boundaries.
#[derive(Debug, Clone, Default)]
pub(crate) struct Side {
    /// Neighbour ranks, ascending.
    pub nbr: Vec<usize>,
    /// Prefix sum over per-neighbour slab lengths; `ptr[i]..ptr[i+1]` is
    /// neighbour i's slab in the staging buffer.
    pub ptr: Vec<usize>,
}

impl Side {
    pub fn len(&self, i: usize) -> usize {
        self.ptr[i + 1] - self.ptr[i]
    }

    pub fn total(&self) -> usize {
        *self.ptr.last().unwrap_or(&0)
    }
}

/// Symmetric send/recv neighbour graph for one rank.
#[derive(Debug, Clone, Default)]
pub struct ExchangePlan {
    pub(crate) recv: Side,
    pub(crate) send: Side,
}

impl ExchangePlan {
    /// Build both sides from the gathered P x P communication matrix.
    ///
    /// `comm_matrix[p * size + q]` is the number of columns rank p needs
    /// from rank q: row `rank` lists the receive neighbours, column `rank`
    /// the send neighbours.
    pub(crate) fn from_comm_matrix(rank: usize, size: usize, comm_matrix: &[usize]) -> Self {
        let mut recv = Side {
            nbr: Vec::new(),
            ptr: vec![0],
        };
        let mut send = Side {
            nbr: Vec::new(),
            ptr: vec![0],
        };

        for q in 0..size {
            let nr = comm_matrix[rank * size + q];
            if nr != 0 {
                recv.nbr.push(q);
                recv.ptr.push(recv.ptr.last().unwrap() + nr);
            }
            let ns = comm_matrix[q * size + rank];
            if ns != 0 {
                send.nbr.push(q);
                send.ptr.push(send.ptr.last().unwrap() + ns);
            }
        }

        Self { recv, send }
    }

    /// Number of ghost values this rank receives.
    pub fn num_ghosts(&self) -> usize {
        self.recv.total()
    }

    /// Number of values this rank stages for its neighbours.
    pub fn num_staged(&self) -> usize {
        self.send.total()
    }

    /// Exchange ghost values. `send_val` must already hold the staged
    /// values in `gather_cols` order; `overlap` runs while the messages
    /// are in flight (the local SpMV goes there). On return `recv_val`
    /// holds the ghost values in compacted remote-column order.
    pub fn exchange_ghosts(
        &self,
        comm: &dyn Communicator,
        send_val: &[f64],
        recv_val: &mut [f64],
        overlap: &mut dyn FnMut(),
    ) -> Result<()> {
        debug_assert_eq!(send_val.len(), self.num_staged());
        debug_assert_eq!(recv_val.len(), self.num_ghosts());

        let sends = slabs(send_val, &self.send);
        let mut recvs = slabs_mut(recv_val, &self.recv);
        comm.exchange_f64(Phase::GhostVals, &sends, &mut recvs, overlap)
    }
}

/// Pair each neighbour with its shared-borrow slab of the staging buffer.
pub(crate) fn slabs<'a, T>(buf: &'a [T], side: &Side) -> Vec<(usize, &'a [T])> {
    side.nbr
        .iter()
        .enumerate()
        .map(|(i, &n)| (n, &buf[side.ptr[i]..side.ptr[i + 1]]))
        .collect()
}

/// Pair each neighbour with its mutable slab of the staging buffer.
pub(crate) fn slabs_mut<'a, T>(buf: &'a mut [T], side: &Side) -> Vec<(usize, &'a mut [T])> {
    let mut out = Vec::with_capacity(side.nbr.len());
    let mut rest = buf;
    let mut consumed = 0;
    for (i, &n) in side.nbr.iter().enumerate() {
        let (slab, tail) = std::mem::take(&mut rest).split_at_mut(side.ptr[i + 1] - consumed);
        debug_assert_eq!(slab.len(), side.len(i));
        consumed = side.ptr[i + 1];
        out.push((n, slab));
        rest = tail;
    }
    out
}
