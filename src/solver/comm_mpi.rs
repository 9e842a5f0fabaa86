//! MPI communication backend for the deflation solver.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Implements `Communicator` with `mpi::traits::*`: real collectives on
//! the world communicator, scoped non-blocking point-to-point transfers
//! for the pairwise exchanges.
//!
//! # Usage
//!
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::world();
//! ```
//!
//! # Sub-communicators
//!
//! `split` does not create an MPI communicator: the masters' group only
//! ever runs small all-gathers, so a split handle keeps the member list
//! and routes its collectives over tagged point-to-point messages on the
//! world communicator. This keeps the handle free of raw MPI state and
//! therefore `Send + Sync` without caveats.

use std::sync::Arc;

use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

use crate::error::{Result, SubdefError};

use super::comm::{Communicator, Phase};

/// Tag for the point-to-point realisation of sub-communicator collectives.
const TAG_COLLECTIVE: i32 = 9001;

/// Tag offset applied per split level.
const SPLIT_SHIFT: i32 = 1 << 16;

/// MPI-backed communicator handle.
///
/// The world handle holds no MPI state at all (the world communicator is
/// fetched per call); split handles additionally carry their member list.
pub struct MpiComm {
    /// World ranks of this communicator's members; `None` means the world.
    members: Option<Arc<Vec<usize>>>,
    /// Rank within this communicator.
    rank: usize,
    tag_shift: i32,
}

impl MpiComm {
    /// Wrap the world communicator. MPI must already be initialized.
    pub fn world() -> Self {
        let world = SimpleCommunicator::world();
        Self {
            members: None,
            rank: world.rank() as usize,
            tag_shift: 0,
        }
    }

    fn world_rank(&self, r: usize) -> usize {
        match &self.members {
            Some(m) => m[r],
            None => r,
        }
    }

    fn me(&self) -> usize {
        self.world_rank(self.rank)
    }

    /// All-gather fixed-size u64 slabs over point-to-point messages; used
    /// for every collective on a split handle.
    fn p2p_all_gather_u64(&self, data: &[u64], counts: &[usize]) -> Result<Vec<u64>> {
        let world = SimpleCommunicator::world();
        let tag = TAG_COLLECTIVE + self.tag_shift;
        let mut out = Vec::with_capacity(counts.iter().sum());
        mpi::request::scope(|scope| {
            let sends: Vec<_> = (0..self.size())
                .map(|r| {
                    world
                        .process_at_rank(self.world_rank(r) as i32)
                        .immediate_send_with_tag(scope, data, tag)
                })
                .collect();
            for r in 0..self.size() {
                let mut buf = vec![0u64; counts[r]];
                world
                    .process_at_rank(self.world_rank(r) as i32)
                    .receive_into_with_tag(&mut buf[..], tag);
                out.extend_from_slice(&buf);
            }
            for s in sends {
                s.wait_without_status();
            }
        });
        Ok(out)
    }

    fn p2p_all_gather_f64(&self, data: &[f64], counts: &[usize]) -> Result<Vec<f64>> {
        let world = SimpleCommunicator::world();
        let tag = TAG_COLLECTIVE + self.tag_shift;
        let mut out = Vec::with_capacity(counts.iter().sum());
        mpi::request::scope(|scope| {
            let sends: Vec<_> = (0..self.size())
                .map(|r| {
                    world
                        .process_at_rank(self.world_rank(r) as i32)
                        .immediate_send_with_tag(scope, data, tag)
                })
                .collect();
            for r in 0..self.size() {
                let mut buf = vec![0.0f64; counts[r]];
                world
                    .process_at_rank(self.world_rank(r) as i32)
                    .receive_into_with_tag(&mut buf[..], tag);
                out.extend_from_slice(&buf);
            }
            for s in sends {
                s.wait_without_status();
            }
        });
        Ok(out)
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        match &self.members {
            Some(m) => m.len(),
            None => SimpleCommunicator::world().size() as usize,
        }
    }

    fn all_gather_usize(&self, value: usize) -> Result<Vec<usize>> {
        match &self.members {
            None => {
                let world = SimpleCommunicator::world();
                let mut out = vec![0u64; self.size()];
                world.all_gather_into(&(value as u64), &mut out[..]);
                Ok(out.into_iter().map(|v| v as usize).collect())
            }
            Some(_) => {
                let counts = vec![1usize; self.size()];
                let out = self.p2p_all_gather_u64(&[value as u64], &counts)?;
                Ok(out.into_iter().map(|v| v as usize).collect())
            }
        }
    }

    fn all_gather_matrix(&self, row: &[usize]) -> Result<Vec<usize>> {
        let row_u64: Vec<u64> = row.iter().map(|&v| v as u64).collect();
        match &self.members {
            None => {
                let world = SimpleCommunicator::world();
                let mut out = vec![0u64; self.size() * row.len()];
                world.all_gather_into(&row_u64[..], &mut out[..]);
                Ok(out.into_iter().map(|v| v as usize).collect())
            }
            Some(_) => {
                let counts = vec![row.len(); self.size()];
                let out = self.p2p_all_gather_u64(&row_u64, &counts)?;
                Ok(out.into_iter().map(|v| v as usize).collect())
            }
        }
    }

    fn all_gather_varied_usize(&self, local: &[usize], counts: &[usize]) -> Result<Vec<usize>> {
        let local_u64: Vec<u64> = local.iter().map(|&v| v as u64).collect();
        let out = self.p2p_all_gather_u64(&local_u64, counts)?;
        Ok(out.into_iter().map(|v| v as usize).collect())
    }

    fn all_gather_varied_f64(&self, local: &[f64], counts: &[usize]) -> Result<Vec<f64>> {
        self.p2p_all_gather_f64(local, counts)
    }

    fn all_reduce_sum(&self, local: f64) -> Result<f64> {
        match &self.members {
            None => {
                let world = SimpleCommunicator::world();
                let mut global = 0.0f64;
                world.all_reduce_into(&local, &mut global, SystemOperation::sum());
                Ok(global)
            }
            Some(_) => {
                let counts = vec![1usize; self.size()];
                let all = self.p2p_all_gather_f64(&[local], &counts)?;
                // Fixed summation order keeps every member bit-identical.
                Ok(all.iter().sum())
            }
        }
    }

    fn exchange_usize(
        &self,
        phase: Phase,
        sends: &[(usize, &[usize])],
        recvs: &mut [(usize, &mut [usize])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()> {
        let world = SimpleCommunicator::world();
        let tag = phase.tag() + self.tag_shift;
        let send_u64: Vec<(usize, Vec<u64>)> = sends
            .iter()
            .map(|(to, data)| (*to, data.iter().map(|&v| v as u64).collect()))
            .collect();
        let mut recv_u64: Vec<Vec<u64>> = recvs.iter().map(|(_, b)| vec![0u64; b.len()]).collect();

        mpi::request::scope(|scope| {
            let rreq: Vec<_> = recvs
                .iter()
                .zip(recv_u64.iter_mut())
                .map(|((from, _), buf)| {
                    world
                        .process_at_rank(self.world_rank(*from) as i32)
                        .immediate_receive_into_with_tag(scope, &mut buf[..], tag)
                })
                .collect();
            let sreq: Vec<_> = send_u64
                .iter()
                .map(|(to, data)| {
                    world
                        .process_at_rank(self.world_rank(*to) as i32)
                        .immediate_send_with_tag(scope, &data[..], tag)
                })
                .collect();
            overlap();
            for r in rreq {
                r.wait_without_status();
            }
            for s in sreq {
                s.wait_without_status();
            }
        });

        for ((_, buf), got) in recvs.iter_mut().zip(recv_u64) {
            for (dst, v) in buf.iter_mut().zip(got) {
                *dst = v as usize;
            }
        }
        Ok(())
    }

    fn exchange_f64(
        &self,
        phase: Phase,
        sends: &[(usize, &[f64])],
        recvs: &mut [(usize, &mut [f64])],
        overlap: &mut dyn FnMut(),
    ) -> Result<()> {
        let world = SimpleCommunicator::world();
        let tag = phase.tag() + self.tag_shift;

        mpi::request::scope(|scope| {
            let rreq: Vec<_> = recvs
                .iter_mut()
                .map(|(from, buf)| {
                    world
                        .process_at_rank(self.world_rank(*from) as i32)
                        .immediate_receive_into_with_tag(scope, &mut buf[..], tag)
                })
                .collect();
            let sreq: Vec<_> = sends
                .iter()
                .map(|(to, data)| {
                    world
                        .process_at_rank(self.world_rank(*to) as i32)
                        .immediate_send_with_tag(scope, &data[..], tag)
                })
                .collect();
            overlap();
            for r in rreq {
                r.wait_without_status();
            }
            for s in sreq {
                s.wait_without_status();
            }
        });
        Ok(())
    }

    fn gather_slabs(
        &self,
        local: &[f64],
        counts: &[usize],
        root: usize,
        out: &mut [f64],
    ) -> Result<()> {
        if self.members.is_some() {
            // Split handles never gather slabs in the current call graph,
            // but keep the semantics available.
            let all = self.p2p_all_gather_f64(local, counts)?;
            if self.rank == root {
                out.copy_from_slice(&all);
            }
            return Ok(());
        }

        let world = SimpleCommunicator::world();
        let root_proc = world.process_at_rank(root as i32);
        if self.rank == root {
            let counts_c: Vec<Count> = counts.iter().map(|&c| c as Count).collect();
            let mut displs: Vec<Count> = Vec::with_capacity(counts.len());
            let mut offset: Count = 0;
            for &c in &counts_c {
                displs.push(offset);
                offset += c;
            }
            if out.len() != offset as usize {
                return Err(SubdefError::Transport(format!(
                    "gather buffer has length {}, expected {offset}",
                    out.len()
                )));
            }
            let mut partition = PartitionMut::new(out, counts_c, displs);
            root_proc.gather_varcount_into_root(local, &mut partition);
        } else {
            root_proc.gather_varcount_into(local);
        }
        Ok(())
    }

    fn broadcast_f64(&self, buf: &mut [f64], root: usize) -> Result<()> {
        if self.members.is_some() {
            let tag = TAG_COLLECTIVE + self.tag_shift;
            let world = SimpleCommunicator::world();
            if self.rank == root {
                mpi::request::scope(|scope| {
                    let sends: Vec<_> = (0..self.size())
                        .filter(|&r| r != root)
                        .map(|r| {
                            world
                                .process_at_rank(self.world_rank(r) as i32)
                                .immediate_send_with_tag(scope, &buf[..], tag)
                        })
                        .collect();
                    for s in sends {
                        s.wait_without_status();
                    }
                });
            } else {
                world
                    .process_at_rank(self.world_rank(root) as i32)
                    .receive_into_with_tag(buf, tag);
            }
            return Ok(());
        }

        let world = SimpleCommunicator::world();
        world.process_at_rank(root as i32).broadcast_into(buf);
        Ok(())
    }

    fn split(&self, member: bool) -> Result<Option<Arc<dyn Communicator>>> {
        let flags = self.all_gather_usize(member as usize)?;
        let members: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter(|(_, &f)| f != 0)
            .map(|(r, _)| self.world_rank(r))
            .collect();
        if !member {
            return Ok(None);
        }
        let me = self.me();
        let rank = members.iter().position(|&w| w == me).unwrap();
        Ok(Some(Arc::new(MpiComm {
            members: Some(Arc::new(members)),
            rank,
            tag_shift: self.tag_shift + SPLIT_SHIFT,
        })))
    }
}
