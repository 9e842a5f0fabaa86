//! Smoothed-aggregation algebraic multigrid over the local block.
//!
//! Preconditions each subdomain's diagonal block: strength-filtered greedy
//! aggregation, damped-Jacobi-smoothed prolongation, Galerkin coarse
//! operators, V-cycle with damped-Jacobi smoothing and a dense LU at the
//! coarsest level. Setup runs on host CSR; the level operators are then
//! handed to the backend so the cycle uses only backend kernels.

use faer::linalg::solvers::PartialPivLu;
use faer::prelude::*;

use crate::error::Result;
use crate::sparse::CsrMatrix;

use super::backend::SolverBackend;
use super::Preconditioner;

/// AMG hierarchy configuration.
#[derive(Debug, Clone)]
pub struct AmgParams {
    /// Strength-of-connection threshold: (i, j) is strong when
    /// a_ij^2 > threshold^2 * |a_ii * a_jj|.
    pub strength_threshold: f64,
    /// Damping for the Jacobi smoother and the prolongation smoothing.
    pub jacobi_weight: f64,
    /// Stop coarsening below this size and factor directly.
    pub coarse_enough: usize,
    pub max_levels: usize,
    pub pre_sweeps: usize,
    pub post_sweeps: usize,
}

impl Default for AmgParams {
    fn default() -> Self {
        Self {
            strength_threshold: 0.08,
            jacobi_weight: 2.0 / 3.0,
            coarse_enough: 50,
            max_levels: 20,
            pre_sweeps: 1,
            post_sweeps: 1,
        }
    }
}

struct Level<B: SolverBackend> {
    a: B::Matrix,
    prolong: B::Matrix,
    restrict: B::Matrix,
    inv_diag: B::Vector,
    n: usize,
    nc: usize,
}

/// Algebraic multigrid preconditioner for one subdomain.
pub struct Amg<B: SolverBackend> {
    levels: Vec<Level<B>>,
    /// Finest matrix when the hierarchy is empty (problem small enough to
    /// factor directly).
    direct_top: Option<B::Matrix>,
    coarse_lu: PartialPivLu<f64>,
    coarse_n: usize,
    prm: AmgParams,
}

impl<B: SolverBackend> Amg<B> {
    pub fn new(backend: &B, a: CsrMatrix, prm: AmgParams) -> Result<Self> {
        let _span = tracing::debug_span!("amg_setup", n = a.nrows).entered();

        let mut levels = Vec::new();
        let mut current = a;

        while current.nrows > prm.coarse_enough && levels.len() < prm.max_levels {
            let (id, nagg) = aggregate(&current, prm.strength_threshold);
            if nagg >= current.nrows {
                break;
            }

            let p0 = tentative_prolongation(&id, current.nrows, nagg);
            let prolong = smooth_prolongation(&current, &p0, prm.jacobi_weight);
            let restrict = prolong.transpose();
            let coarse = restrict.multiply(&current.multiply(&prolong));
            let inv_diag = inverted_diagonal(&current);

            tracing::debug!(
                level = levels.len(),
                fine = current.nrows,
                coarse = nagg,
                "amg level"
            );

            let n = current.nrows;
            levels.push(Level {
                a: backend.copy_matrix(current),
                prolong: backend.copy_matrix(prolong),
                restrict: backend.copy_matrix(restrict),
                inv_diag: backend.copy_vector(&inv_diag),
                n,
                nc: nagg,
            });
            current = coarse;
        }

        let coarse_n = current.nrows;
        let mut dense = Mat::<f64>::zeros(coarse_n, coarse_n);
        for i in 0..coarse_n {
            for (c, v) in current.row(i) {
                dense[(i, c)] += v;
            }
        }
        let coarse_lu = dense.partial_piv_lu();

        let direct_top = if levels.is_empty() {
            Some(backend.copy_matrix(current))
        } else {
            None
        };

        Ok(Self {
            levels,
            direct_top,
            coarse_lu,
            coarse_n,
            prm,
        })
    }

    fn coarsest_solve(&self, backend: &B, rhs: &B::Vector, x: &mut B::Vector) {
        let mut host = vec![0.0; self.coarse_n];
        backend.copy_to_host(rhs, &mut host);
        let f = Mat::<f64>::from_fn(self.coarse_n, 1, |i, _| host[i]);
        let solution = self.coarse_lu.solve(f);
        for (i, h) in host.iter_mut().enumerate() {
            *h = solution[(i, 0)];
        }
        backend.copy_to_backend(&host, x);
    }

    fn vcycle(&self, backend: &B, l: usize, rhs: &B::Vector, x: &mut B::Vector) {
        let level = &self.levels[l];
        let w = self.prm.jacobi_weight;
        let mut r = backend.create_vector(level.n);

        // Pre-smooth from a zero start.
        backend.vmul(w, &level.inv_diag, rhs, 0.0, x);
        for _ in 1..self.prm.pre_sweeps {
            backend.residual(rhs, &level.a, x, &mut r);
            backend.vmul(w, &level.inv_diag, &r, 1.0, x);
        }

        backend.residual(rhs, &level.a, x, &mut r);
        let mut rc = backend.create_vector(level.nc);
        backend.spmv(1.0, &level.restrict, &r, 0.0, &mut rc);

        let mut ec = backend.create_vector(level.nc);
        if l + 1 < self.levels.len() {
            self.vcycle(backend, l + 1, &rc, &mut ec);
        } else {
            self.coarsest_solve(backend, &rc, &mut ec);
        }
        backend.spmv(1.0, &level.prolong, &ec, 1.0, x);

        for _ in 0..self.prm.post_sweeps {
            backend.residual(rhs, &level.a, x, &mut r);
            backend.vmul(w, &level.inv_diag, &r, 1.0, x);
        }
    }

    pub fn params(&self) -> &AmgParams {
        &self.prm
    }
}

impl<B: SolverBackend> Preconditioner<B> for Amg<B> {
    fn apply(&self, backend: &B, rhs: &B::Vector, x: &mut B::Vector) {
        if self.levels.is_empty() {
            self.coarsest_solve(backend, rhs, x);
        } else {
            self.vcycle(backend, 0, rhs, x);
        }
    }

    fn top_matrix(&self) -> &B::Matrix {
        match self.levels.first() {
            Some(level) => &level.a,
            None => self.direct_top.as_ref().expect("finest matrix present"),
        }
    }
}

/// Greedy aggregation over the strong-connection graph. Returns the
/// aggregate id per node and the number of aggregates. Nodes without
/// strong neighbours become singleton aggregates.
fn aggregate(a: &CsrMatrix, threshold: f64) -> (Vec<usize>, usize) {
    const UNDECIDED: usize = usize::MAX;
    let n = a.nrows;
    let diag = a.diagonal();
    let eps2 = threshold * threshold;

    let strong = |i: usize, c: usize, v: f64| -> bool {
        c != i && v * v > eps2 * (diag[i] * diag[c]).abs()
    };

    let mut id = vec![UNDECIDED; n];
    let mut nagg = 0;

    // Root pass: a node whose strong neighbourhood is untouched seeds a
    // new aggregate containing itself and those neighbours.
    for i in 0..n {
        if id[i] != UNDECIDED {
            continue;
        }
        let free = a.row(i).all(|(c, v)| !strong(i, c, v) || id[c] == UNDECIDED);
        if !free {
            continue;
        }
        id[i] = nagg;
        for (c, v) in a.row(i) {
            if strong(i, c, v) {
                id[c] = nagg;
            }
        }
        nagg += 1;
    }

    // Mop-up pass: join any strongly connected aggregate, else stay alone.
    for i in 0..n {
        if id[i] != UNDECIDED {
            continue;
        }
        let joined = a
            .row(i)
            .find(|&(c, v)| strong(i, c, v) && id[c] != UNDECIDED)
            .map(|(c, _)| id[c]);
        id[i] = match joined {
            Some(agg) => agg,
            None => {
                nagg += 1;
                nagg - 1
            }
        };
    }

    (id, nagg)
}

/// Piecewise-constant tentative prolongation from an aggregate assignment.
fn tentative_prolongation(id: &[usize], n: usize, nagg: usize) -> CsrMatrix {
    let triplets: Vec<(usize, usize, f64)> = (0..n).map(|i| (i, id[i], 1.0)).collect();
    CsrMatrix::from_entries(n, nagg, &triplets)
}

/// P = (I - w * D^{-1} A) * P0
fn smooth_prolongation(a: &CsrMatrix, p0: &CsrMatrix, w: f64) -> CsrMatrix {
    let inv_diag = inverted_diagonal(a);
    let mut scaled = a.clone();
    for i in 0..scaled.nrows {
        for idx in scaled.ptr[i]..scaled.ptr[i + 1] {
            scaled.val[idx] *= w * inv_diag[i];
        }
    }
    p0.add_scaled(-1.0, &scaled.multiply(p0))
}

fn inverted_diagonal(a: &CsrMatrix) -> Vec<f64> {
    a.diagonal()
        .iter()
        .map(|&d| if d.abs() > f64::MIN_POSITIVE { 1.0 / d } else { 0.0 })
        .collect()
}
