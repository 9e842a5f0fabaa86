//! Right-preconditioned BiCGSTAB over a matrix-free operator.
//!
//! Written against `LinearOperator` + `SolverBackend`, with every inner
//! product routed through a global reduction so the same loop runs
//! unchanged on one rank or many. Breakdowns are errors; running out of
//! iterations is not, the caller gets the reached residual and decides.

use std::sync::Arc;

use crate::error::{Result, SubdefError};

use super::backend::SolverBackend;
use super::comm::Communicator;
use super::{Convergence, LinearOperator, Preconditioner};

const BREAKDOWN: f64 = 1e-30;

/// Inner product functor: local backend inner product, global sum.
pub struct GlobalDot {
    comm: Arc<dyn Communicator>,
}

impl GlobalDot {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }

    pub fn dot<B: SolverBackend>(&self, backend: &B, x: &B::Vector, y: &B::Vector) -> Result<f64> {
        self.comm.all_reduce_sum(backend.inner_product(x, y))
    }
}

/// BiCGSTAB configuration.
#[derive(Debug, Clone)]
pub struct BiCgStabParams {
    pub max_iterations: usize,
    /// Relative residual tolerance.
    pub tolerance: f64,
}

impl Default for BiCgStabParams {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-8,
        }
    }
}

/// Iterative solver instance for systems with `n` local rows.
pub struct BiCgStab {
    n: usize,
    prm: BiCgStabParams,
    dot: GlobalDot,
}

impl BiCgStab {
    pub fn new(n: usize, prm: BiCgStabParams, dot: GlobalDot) -> Self {
        Self { n, prm, dot }
    }

    pub fn params(&self) -> &BiCgStabParams {
        &self.prm
    }

    /// Solve Op * x = rhs with preconditioner M, starting from the given x.
    pub fn solve<B, O, M>(
        &self,
        backend: &B,
        op: &O,
        prec: &M,
        rhs: &B::Vector,
        x: &mut B::Vector,
    ) -> Result<Convergence>
    where
        B: SolverBackend,
        O: LinearOperator<B>,
        M: Preconditioner<B>,
    {
        let _span = tracing::trace_span!("bicgstab", n = self.n).entered();

        let n = self.n;
        let mut r = backend.create_vector(n);
        op.residual(rhs, x, &mut r)?;

        let mut r_hat = backend.create_vector(n);
        backend.copy(&r, &mut r_hat);

        let mut p = backend.create_vector(n);
        let mut v = backend.create_vector(n);
        let mut s = backend.create_vector(n);
        let mut t = backend.create_vector(n);
        let mut p_hat = backend.create_vector(n);
        let mut s_hat = backend.create_vector(n);

        let b_norm = self.dot.dot(backend, rhs, rhs)?.sqrt();
        if b_norm < BREAKDOWN {
            return Ok(Convergence {
                iterations: 0,
                residual: 0.0,
            });
        }
        let abs_tol = self.prm.tolerance * b_norm;

        let mut r_norm = self.dot.dot(backend, &r, &r)?.sqrt();
        if r_norm < abs_tol {
            return Ok(Convergence {
                iterations: 0,
                residual: r_norm / b_norm,
            });
        }

        let mut rho: f64 = 1.0;
        let mut alpha: f64 = 1.0;
        let mut omega: f64 = 1.0;

        for iter in 0..self.prm.max_iterations {
            let rho_new = self.dot.dot(backend, &r_hat, &r)?;
            if rho_new.abs() < BREAKDOWN {
                return Err(SubdefError::Solve("BiCGSTAB breakdown: rho ~ 0".into()));
            }

            let beta = (rho_new / rho) * (alpha / omega);
            rho = rho_new;

            // p = r + beta * (p - omega * v)
            backend.axpby(-omega, &v, 1.0, &mut p);
            backend.axpby(1.0, &r, beta, &mut p);

            // Right-preconditioned: p_hat = M^{-1} p, v = Op * p_hat
            prec.apply(backend, &p, &mut p_hat);
            op.apply(1.0, &p_hat, 0.0, &mut v)?;

            let r_hat_dot_v = self.dot.dot(backend, &r_hat, &v)?;
            if r_hat_dot_v.abs() < BREAKDOWN {
                return Err(SubdefError::Solve(
                    "BiCGSTAB breakdown: r_hat.v ~ 0".into(),
                ));
            }
            alpha = rho / r_hat_dot_v;

            // s = r - alpha * v
            backend.copy(&r, &mut s);
            backend.axpby(-alpha, &v, 1.0, &mut s);

            let s_norm = self.dot.dot(backend, &s, &s)?.sqrt();
            if s_norm < abs_tol {
                backend.axpby(alpha, &p_hat, 1.0, x);
                tracing::debug!(iterations = iter + 1, "BiCGSTAB converged");
                return Ok(Convergence {
                    iterations: iter + 1,
                    residual: s_norm / b_norm,
                });
            }

            prec.apply(backend, &s, &mut s_hat);
            op.apply(1.0, &s_hat, 0.0, &mut t)?;

            let t_dot_s = self.dot.dot(backend, &t, &s)?;
            let t_dot_t = self.dot.dot(backend, &t, &t)?;
            if t_dot_t.abs() < BREAKDOWN {
                return Err(SubdefError::Solve("BiCGSTAB breakdown: ||t|| ~ 0".into()));
            }
            omega = t_dot_s / t_dot_t;

            // x = x + alpha * p_hat + omega * s_hat
            backend.axpbypcz(alpha, &p_hat, omega, &s_hat, 1.0, x);

            // r = s - omega * t
            backend.copy(&s, &mut r);
            backend.axpby(-omega, &t, 1.0, &mut r);

            r_norm = self.dot.dot(backend, &r, &r)?.sqrt();
            if r_norm.is_nan() || r_norm.is_infinite() {
                return Err(SubdefError::Solve(
                    "BiCGSTAB diverged: NaN/Inf in residual".into(),
                ));
            }
            if r_norm < abs_tol {
                tracing::debug!(iterations = iter + 1, "BiCGSTAB converged");
                return Ok(Convergence {
                    iterations: iter + 1,
                    residual: r_norm / b_norm,
                });
            }

            if omega.abs() < BREAKDOWN {
                return Err(SubdefError::Solve("BiCGSTAB breakdown: omega ~ 0".into()));
            }
        }

        // Out of iterations: not fatal, the caller sees how far we got.
        Ok(Convergence {
            iterations: self.prm.max_iterations,
            residual: r_norm / b_norm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::amg::{Amg, AmgParams};
    use crate::solver::backend::CpuBackend;
    use crate::solver::comm::SingleProcessComm;
    use crate::sparse::CsrMatrix;
    use approx::assert_abs_diff_eq;

    /// Plain (unprojected) operator over a host matrix, for solver tests.
    struct PlainOperator {
        a: CsrMatrix,
    }

    impl LinearOperator<CpuBackend> for PlainOperator {
        fn apply(&self, alpha: f64, x: &Vec<f64>, beta: f64, y: &mut Vec<f64>) -> Result<()> {
            CpuBackend::new().spmv(alpha, &self.a, x, beta, y);
            Ok(())
        }

        fn residual(&self, f: &Vec<f64>, x: &Vec<f64>, r: &mut Vec<f64>) -> Result<()> {
            CpuBackend::new().residual(f, &self.a, x, r);
            Ok(())
        }
    }

    fn tridiag(n: usize) -> CsrMatrix {
        let mut triplets = Vec::new();
        for i in 0..n {
            if i > 0 {
                triplets.push((i, i - 1, -1.0));
            }
            triplets.push((i, i, 2.0));
            if i + 1 < n {
                triplets.push((i, i + 1, -1.0));
            }
        }
        CsrMatrix::from_entries(n, n, &triplets)
    }

    #[test]
    fn solves_spd_system_with_amg() {
        let backend = CpuBackend::new();
        let n = 64;
        let a = tridiag(n);
        let op = PlainOperator { a: a.clone() };
        let amg = Amg::new(&backend, a.clone(), AmgParams::default()).unwrap();

        let comm: Arc<dyn Communicator> = Arc::new(SingleProcessComm);
        let solver = BiCgStab::new(
            n,
            BiCgStabParams {
                tolerance: 1e-12,
                ..BiCgStabParams::default()
            },
            GlobalDot::new(comm),
        );

        let rhs = vec![1.0; n];
        let mut x = vec![0.0; n];
        let conv = solver.solve(&backend, &op, &amg, &rhs, &mut x).unwrap();
        assert!(conv.iterations > 0);
        assert!(conv.residual <= 1e-12);

        let ax = a.spmv(&x);
        for i in 0..n {
            assert_abs_diff_eq!(ax[i], rhs[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn zero_rhs_returns_immediately() {
        let backend = CpuBackend::new();
        let a = tridiag(4);
        let op = PlainOperator { a: a.clone() };
        let amg = Amg::new(&backend, a, AmgParams::default()).unwrap();

        let comm: Arc<dyn Communicator> = Arc::new(SingleProcessComm);
        let solver = BiCgStab::new(4, BiCgStabParams::default(), GlobalDot::new(comm));

        let rhs = vec![0.0; 4];
        let mut x = vec![0.0; 4];
        let conv = solver.solve(&backend, &op, &amg, &rhs, &mut x).unwrap();
        assert_eq!(conv.iterations, 0);
    }

    #[test]
    fn exhausting_iterations_is_not_an_error() {
        let backend = CpuBackend::new();
        let n = 64;
        let a = tridiag(n);
        let op = PlainOperator { a: a.clone() };
        let amg = Amg::new(&backend, a, AmgParams::default()).unwrap();

        let comm: Arc<dyn Communicator> = Arc::new(SingleProcessComm);
        let solver = BiCgStab::new(
            n,
            BiCgStabParams {
                max_iterations: 1,
                tolerance: 1e-15,
            },
            GlobalDot::new(comm),
        );

        let rhs = vec![1.0; n];
        let mut x = vec![0.0; n];
        let conv = solver.solve(&backend, &op, &amg, &rhs, &mut x).unwrap();
        assert_eq!(conv.iterations, 1);
        assert!(conv.residual.is_finite());
    }
}
