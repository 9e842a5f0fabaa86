//! Direct solver for the coarse problem.
//!
//! Runs over the masters' sub-communicator. Every master holds a CSR strip
//! of the coarse matrix; construction all-gathers the strips so each
//! master factorises the full (small) matrix once with dense partial-pivot
//! LU, then serves solves for its own contiguous slab. Redundant
//! factorisation keeps the per-solve traffic to one slab all-gather.

use std::sync::Arc;

use faer::linalg::solvers::PartialPivLu;
use faer::prelude::*;

use crate::error::{Result, SubdefError};

use super::comm::Communicator;

/// Coarse unknowns one master handles comfortably; the master count
/// recommendation is derived from it.
pub const DEFAULT_DOFS_PER_MASTER: usize = 4096;

/// How many masters a coarse problem of size n wants, before clamping to
/// the number of ranks.
pub fn recommended_masters(n: usize, dofs_per_master: usize) -> usize {
    n.div_ceil(dofs_per_master.max(1)).max(1)
}

impl std::fmt::Debug for DenseLu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseLu").finish_non_exhaustive()
    }
}

/// Dense LU over the masters' sub-communicator.
pub struct DenseLu {
    comm: Arc<dyn Communicator>,
    /// Rows of the full problem held by each master, in sub-rank order.
    rows_per_master: Vec<usize>,
    /// First global coarse row of this master's slab.
    row_begin: usize,
    /// Rows in this master's slab.
    local_rows: usize,
    /// Full problem size.
    n: usize,
    lu: PartialPivLu<f64>,
}

impl DenseLu {
    /// Factorise the coarse matrix from per-master CSR strips.
    ///
    /// `ptr`/`col`/`val` describe this master's `local_rows x n` strip with
    /// global column ids. Collective over the masters' communicator.
    pub fn new(
        comm: Arc<dyn Communicator>,
        n: usize,
        row_begin: usize,
        ptr: &[usize],
        col: &[usize],
        val: &[f64],
    ) -> Result<Self> {
        let _span = tracing::debug_span!("factor_coarse", n).entered();

        let local_rows = ptr.len().saturating_sub(1);
        let rows_per_master = comm.all_gather_usize(local_rows)?;
        if rows_per_master.iter().sum::<usize>() != n {
            return Err(SubdefError::InvalidInput(format!(
                "coarse strips cover {} rows, expected {n}",
                rows_per_master.iter().sum::<usize>()
            )));
        }

        // Gather the strips so every master can factor the full matrix.
        let row_lens: Vec<usize> = (0..local_rows).map(|i| ptr[i + 1] - ptr[i]).collect();
        let all_lens = comm.all_gather_varied_usize(&row_lens, &rows_per_master)?;
        let nnz_per_master: Vec<usize> = {
            let mut out = Vec::with_capacity(rows_per_master.len());
            let mut offset = 0;
            for &rows in &rows_per_master {
                out.push(all_lens[offset..offset + rows].iter().sum());
                offset += rows;
            }
            out
        };
        let all_cols = comm.all_gather_varied_usize(col, &nnz_per_master)?;
        let all_vals = comm.all_gather_varied_f64(val, &nnz_per_master)?;

        let mut dense = Mat::<f64>::zeros(n, n);
        let mut idx = 0;
        for (row, &len) in all_lens.iter().enumerate() {
            for _ in 0..len {
                let c = all_cols[idx];
                if c >= n {
                    return Err(SubdefError::InvalidInput(format!(
                        "coarse column {c} out of range for size {n}"
                    )));
                }
                dense[(row, c)] += all_vals[idx];
                idx += 1;
            }
        }

        let lu = dense.partial_piv_lu();

        let solver = Self {
            comm,
            rows_per_master,
            row_begin,
            local_rows,
            n,
            lu,
        };

        // A singular coarse operator shows up as a non-finite probe solve.
        let probe = vec![1.0; solver.local_rows];
        let mut out = vec![0.0; solver.local_rows];
        solver.solve(&probe, &mut out).map_err(|_| {
            SubdefError::Factorization("coarse matrix factorization is singular".into())
        })?;

        Ok(solver)
    }

    /// Solve E * x = f for this master's slab.
    ///
    /// `f` holds the slab of the right-hand side owned by this master;
    /// `x` receives the matching slab of the solution. Collective over the
    /// masters' communicator.
    pub fn solve(&self, f: &[f64], x: &mut [f64]) -> Result<()> {
        debug_assert_eq!(f.len(), self.local_rows);
        debug_assert_eq!(x.len(), self.local_rows);

        let full = self.comm.all_gather_varied_f64(f, &self.rows_per_master)?;
        let rhs = Mat::<f64>::from_fn(self.n, 1, |i, _| full[i]);
        let solution = self.lu.solve(rhs);

        // Check the full solution so every master agrees on failure.
        for i in 0..self.n {
            if !solution[(i, 0)].is_finite() {
                return Err(SubdefError::Solve(
                    "coarse solve produced NaN/Inf".into(),
                ));
            }
        }
        for i in 0..self.local_rows {
            x[i] = solution[(self.row_begin + i, 0)];
        }
        Ok(())
    }

    /// Full problem size.
    pub fn size(&self) -> usize {
        self.n
    }
}
