//! Coarse operator E = Zᵀ A Z: assembly, redistribution, solve.
//!
//! Each rank accumulates its `ndv x NZ` strip of E from the deflation
//! product, compacts it over the coarse columns of its neighbourhood (send
//! and receive directions are unioned so the graph of E stays symmetric
//! even when A is not), and ships it to its master. The masters factorise
//! E over their own sub-communicator; every coarse solve is routed through
//! rank 0 because the slaves are not members of that sub-communicator.

use std::cell::RefCell;
use std::sync::Arc;

use crate::error::Result;
use crate::sparse::CsrMatrix;

use super::comm::{Communicator, Phase};
use super::direct::{self, DenseLu};
use super::halo::{self, Side};
use super::partition::Partition;

/// Coarse-solve configuration.
#[derive(Debug, Clone)]
pub struct CoarseParams {
    /// Coarse unknowns per master; drives the master-count recommendation.
    pub dofs_per_master: usize,
}

impl Default for CoarseParams {
    fn default() -> Self {
        Self {
            dofs_per_master: direct::DEFAULT_DOFS_PER_MASTER,
        }
    }
}

/// Master/slave layout for P ranks and a coarse problem of size nz.
#[derive(Debug, Clone)]
pub(crate) struct MasterMap {
    pub nmasters: usize,
    /// `slaves[m]..slaves[m+1]` is the rank range served by master m.
    pub slaves: Vec<usize>,
    /// The master serving this rank.
    pub master: usize,
}

impl MasterMap {
    pub fn new(rank: usize, size: usize, nz: usize, prm: &CoarseParams) -> Self {
        let nmasters = direct::recommended_masters(nz, prm.dofs_per_master).min(size);
        let nslaves = size.div_ceil(nmasters);
        let slaves: Vec<usize> = (0..=nmasters).map(|m| (m * nslaves).min(size)).collect();
        Self {
            nmasters,
            slaves,
            master: rank / nslaves,
        }
    }
}

struct Scratch {
    /// Master's slab of the coarse right-hand side.
    cf: Vec<f64>,
    /// Master's slab of the coarse solution.
    cx: Vec<f64>,
}

/// Factorised coarse operator plus the routing needed to apply it.
pub(crate) struct CoarseSolver {
    map: MasterMap,
    /// Present on masters only.
    lu: Option<DenseLu>,
    scratch: RefCell<Scratch>,
}

/// Coarse columns visible to this rank: itself plus both directions of the
/// neighbour graph, so the assembled graph of E is symmetric.
fn neighbourhood(rank: usize, size: usize, comm_matrix: &[usize]) -> Vec<bool> {
    (0..size)
        .map(|q| {
            q == rank || comm_matrix[rank * size + q] != 0 || comm_matrix[q * size + rank] != 0
        })
        .collect()
}

/// This rank's compacted strip of E: per-row length (identical for every
/// local coarse row), column ids and values.
pub(crate) fn local_strip(
    part: &Partition,
    comm_matrix: &[usize],
    az: &CsrMatrix,
    z: &[Vec<f64>],
) -> (usize, Vec<usize>, Vec<f64>) {
    let rank = part.rank();
    let size = part.num_ranks();
    let nz = part.coarse_size();
    let ndv = z.len();
    let visible = neighbourhood(rank, size, comm_matrix);

    let row_len: usize = (0..size)
        .filter(|&q| visible[q])
        .map(|q| part.dv_size(q))
        .sum();

    // Dense accumulator, one row per local deflation vector.
    let mut erow = vec![0.0f64; ndv * nz];
    for i in 0..part.local_rows() {
        for (c, v) in az.row(i) {
            for (j, zj) in z.iter().enumerate() {
                erow[j * nz + c] += v * zj[i];
            }
        }
    }

    let mut ecol = Vec::with_capacity(ndv * row_len);
    let mut eval = Vec::with_capacity(ndv * row_len);
    for j in 0..ndv {
        for q in 0..size {
            if !visible[q] {
                continue;
            }
            for k in 0..part.dv_size(q) {
                let c = part.coarse_index(q, k);
                ecol.push(c);
                eval.push(erow[j * nz + c]);
            }
        }
    }

    (row_len, ecol, eval)
}

impl CoarseSolver {
    /// Assemble, redistribute and factorise E. Collective over `comm`.
    pub fn new(
        comm: &Arc<dyn Communicator>,
        part: &Partition,
        comm_matrix: &[usize],
        az: &CsrMatrix,
        z: &[Vec<f64>],
        prm: &CoarseParams,
    ) -> Result<Self> {
        let _span = tracing::debug_span!("assemble_coarse").entered();

        let rank = part.rank();
        let ndv = z.len();
        let nz = part.coarse_size();
        let map = MasterMap::new(rank, part.num_ranks(), nz, prm);
        let is_master = rank < map.nmasters;

        // Slab geometry on the master side.
        let slab_begin = if is_master {
            part.dv_start(map.slaves[rank])
        } else {
            0
        };
        let slab_rows = if is_master {
            part.dv_start(map.slaves[rank + 1]) - slab_begin
        } else {
            0
        };
        let slave_side = |per_slave: &dyn Fn(usize) -> usize| -> Side {
            let mut side = Side {
                nbr: Vec::new(),
                ptr: vec![0],
            };
            if is_master {
                for p in map.slaves[rank]..map.slaves[rank + 1] {
                    side.nbr.push(p);
                    side.ptr.push(side.ptr.last().unwrap() + per_slave(p));
                }
            }
            side
        };

        // Row lengths are known before any values exist, so the length
        // exchange can travel while the strip is being accumulated.
        let visible = neighbourhood(rank, part.num_ranks(), comm_matrix);
        let row_len: usize = (0..part.num_ranks())
            .filter(|&q| visible[q])
            .map(|q| part.dv_size(q))
            .sum();
        let row_lens = vec![row_len; ndv];

        let lens_side = slave_side(&|p| part.dv_size(p));
        let mut all_lens = vec![0usize; slab_rows];

        let mut ecol = Vec::new();
        let mut eval = Vec::new();
        {
            let sends = [(map.master, &row_lens[..])];
            let mut recvs = halo::slabs_mut(&mut all_lens, &lens_side);
            let mut build_strip = || {
                let (_, c, v) = local_strip(part, comm_matrix, az, z);
                ecol = c;
                eval = v;
            };
            comm.exchange_usize(Phase::CoarseRowLen, &sends, &mut recvs, &mut build_strip)?;
        }

        // Masters turn the received lengths into a CSR row pointer and
        // size the per-slave column/value slabs.
        let mut eptr = vec![0usize; slab_rows + 1];
        for (i, &len) in all_lens.iter().enumerate() {
            eptr[i + 1] = eptr[i] + len;
        }
        let nnz_side = slave_side(&|p| {
            let begin = part.dv_start(p) - slab_begin;
            let end = part.dv_start(p + 1) - slab_begin;
            eptr[end] - eptr[begin]
        });

        let mut all_cols = vec![0usize; eptr[slab_rows]];
        let mut all_vals = vec![0.0f64; eptr[slab_rows]];
        {
            let sends = [(map.master, &ecol[..])];
            let mut recvs = halo::slabs_mut(&mut all_cols, &nnz_side);
            comm.exchange_usize(Phase::CoarseCols, &sends, &mut recvs, &mut || {})?;
        }
        {
            let sends = [(map.master, &eval[..])];
            let mut recvs = halo::slabs_mut(&mut all_vals, &nnz_side);
            comm.exchange_f64(Phase::CoarseVals, &sends, &mut recvs, &mut || {})?;
        }

        let masters_comm = comm.split(is_master)?;
        let lu = match masters_comm {
            Some(sub) => Some(DenseLu::new(sub, nz, slab_begin, &eptr, &all_cols, &all_vals)?),
            None => None,
        };

        Ok(Self {
            map,
            lu,
            scratch: RefCell::new(Scratch {
                cf: vec![0.0; slab_rows],
                cx: vec![0.0; slab_rows],
            }),
        })
    }

    /// Solve E * y = f.
    ///
    /// `f` is this rank's `ndv` entries of the right-hand side; on return
    /// `x` holds the full NZ-length solution on every rank. `x` doubles as
    /// rank 0's assembly buffer. Collective over `comm`.
    pub fn solve(
        &self,
        comm: &dyn Communicator,
        part: &Partition,
        f: &[f64],
        x: &mut [f64],
    ) -> Result<()> {
        let _span = tracing::trace_span!("coarse_solve").entered();

        let rank = part.rank();
        debug_assert_eq!(f.len(), part.dv_size(rank));
        debug_assert_eq!(x.len(), part.coarse_size());

        comm.gather_slabs(f, part.dv_sizes(), 0, x)?;

        let mut scratch = self.scratch.borrow_mut();
        let Scratch { cf, cx } = &mut *scratch;

        let master_side = Side {
            nbr: (0..self.map.nmasters).collect(),
            ptr: (0..=self.map.nmasters)
                .map(|m| part.dv_start(self.map.slaves[m]))
                .collect(),
        };

        // Rank 0 scatters the masters' contiguous slabs of the gathered rhs.
        {
            let sends: Vec<(usize, &[f64])> = if rank == 0 {
                halo::slabs(x, &master_side)
            } else {
                Vec::new()
            };
            let mut recvs: Vec<(usize, &mut [f64])> = if self.lu.is_some() {
                vec![(0, &mut cf[..])]
            } else {
                Vec::new()
            };
            comm.exchange_f64(Phase::CoarseRhs, &sends, &mut recvs, &mut || {})?;
        }

        if let Some(lu) = &self.lu {
            lu.solve(cf, cx)?;
        }

        // Solution slabs travel back to rank 0 before the broadcast.
        {
            let sends: Vec<(usize, &[f64])> = if self.lu.is_some() {
                vec![(0, &cx[..])]
            } else {
                Vec::new()
            };
            let mut recvs: Vec<(usize, &mut [f64])> = if rank == 0 {
                halo::slabs_mut(x, &master_side)
            } else {
                Vec::new()
            };
            comm.exchange_f64(Phase::CoarseRhs, &sends, &mut recvs, &mut || {})?;
        }

        comm.broadcast_f64(x, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::assembly;
    use crate::solver::comm_threaded;
    use approx::assert_abs_diff_eq;

    #[test]
    fn master_map_layout() {
        let prm = CoarseParams { dofs_per_master: 1 };
        // 4 ranks, nz = 4: every rank becomes a master of itself.
        let map = MasterMap::new(2, 4, 4, &prm);
        assert_eq!(map.nmasters, 4);
        assert_eq!(map.slaves, vec![0, 1, 2, 3, 4]);
        assert_eq!(map.master, 2);

        // Default sizing: one master serves everyone at small nz.
        let map = MasterMap::new(3, 4, 4, &CoarseParams::default());
        assert_eq!(map.nmasters, 1);
        assert_eq!(map.slaves, vec![0, 4]);
        assert_eq!(map.master, 0);
    }

    #[test]
    fn master_map_uneven_ranges() {
        let prm = CoarseParams { dofs_per_master: 2 };
        // 5 ranks, nz = 5 -> 3 masters, 2 slaves each, last range short.
        let map = MasterMap::new(4, 5, 5, &prm);
        assert_eq!(map.nmasters, 3);
        assert_eq!(map.slaves, vec![0, 2, 4, 5]);
        assert_eq!(map.master, 2);
    }

    /// Tridiagonal strip builder shared with the assembly tests.
    fn tridiag_strip(part: &Partition) -> CsrMatrix {
        let n = part.global_rows();
        let begin = part.row_begin(part.rank());
        let mut triplets = Vec::new();
        for gi in begin..part.row_end(part.rank()) {
            let i = gi - begin;
            if gi > 0 {
                triplets.push((i, gi - 1, -1.0));
            }
            triplets.push((i, gi, 2.0));
            if gi + 1 < n {
                triplets.push((i, gi + 1, -1.0));
            }
        }
        CsrMatrix::from_entries(part.local_rows(), n, &triplets)
    }

    #[test]
    fn strip_graph_is_symmetric_for_asymmetric_matrix() {
        // Upper-bidiagonal coupling only: rank p references columns of
        // rank p+1 but never the other way round. The strips must still
        // come out with a symmetric coarse graph.
        let strips = comm_threaded::spawn(4, |comm| {
            let part = Partition::assemble(&comm, 2, 1).unwrap();
            let n = part.global_rows();
            let begin = part.row_begin(comm.rank());
            let mut triplets = Vec::new();
            for gi in begin..part.row_end(comm.rank()) {
                let i = gi - begin;
                triplets.push((i, gi, 2.0));
                if gi + 1 < n {
                    triplets.push((i, gi + 1, -1.0));
                }
            }
            let astrip = CsrMatrix::from_entries(2, n, &triplets);
            let z = vec![vec![1.0; 2]];
            let asm = assembly::assemble(&comm, &part, &astrip, &z).unwrap();
            let (_, cols, _) = local_strip(&part, &asm.comm_matrix, &asm.az, &z);
            (part.dv_start(comm.rank()), cols)
        });

        // Build the global pattern: each rank owns one coarse row.
        let nz = strips.len();
        let mut pattern = vec![vec![false; nz]; nz];
        for (row, cols) in &strips {
            for &c in cols {
                pattern[*row][c] = true;
            }
        }
        for i in 0..nz {
            for j in 0..nz {
                assert_eq!(pattern[i][j], pattern[j][i], "asymmetric at ({i}, {j})");
            }
        }
        // The bidiagonal coupling itself must be present.
        for i in 0..nz - 1 {
            assert!(pattern[i][i + 1]);
        }
    }

    #[test]
    fn coarse_solve_round_trip_multi_master() {
        // E for the tridiagonal with constant deflation vectors; verify
        // E^{-1} (E v) = v with every rank its own master.
        let results = comm_threaded::spawn(4, |comm| {
            use crate::solver::comm::Communicator;
            let part = Partition::assemble(&comm, 3, 1).unwrap();
            let astrip = tridiag_strip(&part);
            let z = vec![vec![1.0; 3]];
            let asm = assembly::assemble(&comm, &part, &astrip, &z).unwrap();

            let comm: Arc<dyn Communicator> = Arc::new(comm);
            let prm = CoarseParams { dofs_per_master: 1 };
            let coarse =
                CoarseSolver::new(&comm, &part, &asm.comm_matrix, &asm.az, &z, &prm).unwrap();

            // f = E * v for v = (1, 2, 3, 4), computed from the strip.
            let v = [1.0, 2.0, 3.0, 4.0];
            let (_, cols, vals) = local_strip(&part, &asm.comm_matrix, &asm.az, &z);
            let f: f64 = cols.iter().zip(&vals).map(|(&c, &e)| e * v[c]).sum();

            let mut x = vec![0.0; part.coarse_size()];
            coarse.solve(&*comm, &part, &[f], &mut x).unwrap();
            x
        });

        for x in results {
            for (k, &xk) in x.iter().enumerate() {
                assert_abs_diff_eq!(xk, (k + 1) as f64, epsilon = 1e-10);
            }
        }
    }
}
