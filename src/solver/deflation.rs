//! Distributed solver based on subdomain deflation.
//!
//! `SubdomainDeflation` owns one rank's share of the deflated system: the
//! AMG-preconditioned local block, the remote block with its ghost
//! exchange, the deflation product AZ, the factorised coarse operator and
//! the Krylov loop. The Krylov solver sees the projected operator through
//! the `LinearOperator` adapter; after convergence the post-correction
//! imposes the deflation constraint on the solution.
//!
//! Scratch buffers are reused across applications and live in `RefCell`
//! regions; instances are per-rank and must not be shared across threads.

use std::cell::RefCell;
use std::sync::Arc;

use crate::error::{Result, SubdefError};
use crate::sparse::CsrMatrix;

use super::amg::{Amg, AmgParams};
use super::assembly;
use super::backend::SolverBackend;
use super::bicgstab::{BiCgStab, BiCgStabParams, GlobalDot};
use super::coarse::{CoarseParams, CoarseSolver};
use super::comm::Communicator;
use super::halo::ExchangePlan;
use super::partition::Partition;
use super::{DeflationVectors, LinearOperator, Preconditioner};

/// Effective solver configuration.
#[derive(Debug, Clone, Default)]
pub struct DeflationParams {
    pub amg: AmgParams,
    pub solver: BiCgStabParams,
    pub coarse: CoarseParams,
}

/// Ghost-exchange staging buffers.
struct HaloBuffers<B: SolverBackend> {
    send_val: Vec<f64>,
    recv_val: Vec<f64>,
    /// Ghost values staged on the backend for the Arem product.
    dv: B::Vector,
}

/// Projection and post-correction workspace.
struct DeflBuffers<B: SolverBackend> {
    /// Local inner products against the deflation vectors.
    df: Vec<f64>,
    /// Full coarse solution.
    dx: Vec<f64>,
    /// Coarse solution staged on the backend for the AZ product.
    dd: B::Vector,
    /// A*x workspace for the post-correction.
    q: B::Vector,
}

impl<B: SolverBackend> std::fmt::Debug for SubdomainDeflation<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubdomainDeflation").finish_non_exhaustive()
    }
}

/// Distributed deflated solver for one rank's row strip.
pub struct SubdomainDeflation<B: SolverBackend> {
    comm: Arc<dyn Communicator>,
    backend: B,
    part: Partition,
    ndv: usize,
    amg: Amg<B>,
    arem: B::Matrix,
    az: B::Matrix,
    z: Vec<B::Vector>,
    gather: B::Gather,
    plan: ExchangePlan,
    coarse: CoarseSolver,
    krylov: BiCgStab,
    prm: DeflationParams,
    halo_buf: RefCell<HaloBuffers<B>>,
    defl_buf: RefCell<DeflBuffers<B>>,
}

impl<B: SolverBackend> SubdomainDeflation<B> {
    /// Set up the deflated solver from this rank's row strip.
    ///
    /// `astrip` uses global column ids; `def` supplies this rank's block
    /// of deflation vectors and is not called again after setup.
    /// Collective over `comm`.
    pub fn new(
        comm: Arc<dyn Communicator>,
        backend: B,
        astrip: &CsrMatrix,
        def: &dyn DeflationVectors,
        prm: DeflationParams,
    ) -> Result<Self> {
        let ndv = def.dim();
        let part = Partition::assemble(&*comm, astrip.nrows, ndv)?;
        let nrows = part.local_rows();

        // Copy the deflation vectors once; the stored copies are
        // authoritative from here on.
        let z_host: Vec<Vec<f64>> = (0..ndv)
            .map(|j| (0..nrows).map(|i| def.value(i, j)).collect())
            .collect();

        let asm = assembly::assemble(&*comm, &part, astrip, &z_host)?;

        let coarse =
            CoarseSolver::new(&comm, &part, &asm.comm_matrix, &asm.az, &z_host, &prm.coarse)?;

        let amg = Amg::new(&backend, asm.aloc, prm.amg.clone())?;

        let num_staged = asm.plan.num_staged();
        let num_ghosts = asm.plan.num_ghosts();
        let gather = backend.make_gather(&asm.gather_cols);
        let arem = backend.copy_matrix(asm.arem);
        let az = backend.copy_matrix(asm.az);
        let z: Vec<B::Vector> = z_host.iter().map(|zj| backend.copy_vector(zj)).collect();

        let krylov = BiCgStab::new(nrows, prm.solver.clone(), GlobalDot::new(comm.clone()));

        let halo_buf = RefCell::new(HaloBuffers {
            send_val: vec![0.0; num_staged],
            recv_val: vec![0.0; num_ghosts],
            dv: backend.create_vector(num_ghosts),
        });
        let defl_buf = RefCell::new(DeflBuffers {
            df: vec![0.0; ndv],
            dx: vec![0.0; part.coarse_size()],
            dd: backend.create_vector(part.coarse_size()),
            q: backend.create_vector(nrows),
        });

        Ok(Self {
            comm,
            backend,
            part,
            ndv,
            amg,
            arem,
            az,
            z,
            gather,
            plan: asm.plan,
            coarse,
            krylov,
            prm,
            halo_buf,
            defl_buf,
        })
    }

    /// Solve A x = rhs starting from the given x.
    ///
    /// Returns the Krylov iteration count and the reached relative
    /// residual; failure to converge within the iteration budget is not an
    /// error. The post-correction leaves the residual orthogonal to the
    /// deflation vectors.
    pub fn solve(&self, rhs: &B::Vector, x: &mut B::Vector) -> Result<(usize, f64)> {
        let conv = self.krylov.solve(&self.backend, self, &self.amg, rhs, x)?;
        self.postprocess(rhs, x)?;
        tracing::debug!(
            iterations = conv.iterations,
            residual = conv.residual,
            "deflated solve finished"
        );
        Ok((conv.iterations, conv.residual))
    }

    /// The effective parameters.
    pub fn get_params(&self) -> &DeflationParams {
        &self.prm
    }

    /// The partition this solver was built over.
    pub fn partition(&self) -> &Partition {
        &self.part
    }

    /// The backend instance the solver operates with.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Solve the coarse problem E y = f.
    ///
    /// `f` holds this rank's `ndv` entries of the right-hand side; `x`
    /// receives the full coarse solution. Collective over the solver's
    /// communicator.
    pub fn coarse_solve(&self, f: &[f64], x: &mut [f64]) -> Result<()> {
        if f.len() != self.ndv || x.len() != self.part.coarse_size() {
            return Err(SubdefError::InvalidInput(format!(
                "coarse solve buffers are {} and {}, expected {} and {}",
                f.len(),
                x.len(),
                self.ndv,
                self.part.coarse_size()
            )));
        }
        self.coarse.solve(&*self.comm, &self.part, f, x)
    }

    /// Apply the deflation projector: x -= A Z E^{-1} Zᵀ x.
    ///
    /// Afterwards x is orthogonal to every deflation vector.
    pub fn project(&self, x: &mut B::Vector) -> Result<()> {
        let _span = tracing::trace_span!("project").entered();

        let mut buf = self.defl_buf.borrow_mut();
        let DeflBuffers { df, dx, dd, .. } = &mut *buf;

        for (j, zj) in self.z.iter().enumerate() {
            df[j] = self.backend.inner_product(x, zj);
        }
        self.coarse.solve(&*self.comm, &self.part, df, dx)?;

        self.backend.copy_to_backend(dx, dd);
        self.backend.spmv(-1.0, &self.az, dd, 1.0, x);
        Ok(())
    }

    /// y = alpha * A * x + beta * y over the full distributed matrix.
    fn mul(&self, alpha: f64, x: &B::Vector, beta: f64, y: &mut B::Vector) -> Result<()> {
        let _span = tracing::trace_span!("spmv").entered();

        let mut buf = self.halo_buf.borrow_mut();
        let HaloBuffers {
            send_val,
            recv_val,
            dv,
        } = &mut *buf;

        self.backend.gather(&self.gather, x, send_val);

        let backend = &self.backend;
        let amg = &self.amg;
        let mut local = || backend.spmv(alpha, amg.top_matrix(), x, beta, y);
        self.plan
            .exchange_ghosts(&*self.comm, send_val, recv_val, &mut local)?;

        if !recv_val.is_empty() {
            backend.copy_to_backend(recv_val, dv);
            backend.spmv(alpha, &self.arem, dv, 1.0, y);
        }
        Ok(())
    }

    /// Projected residual: r = project(f - A x).
    fn residual_project(&self, f: &B::Vector, x: &B::Vector, r: &mut B::Vector) -> Result<()> {
        {
            let _span = tracing::trace_span!("residual").entered();

            let mut buf = self.halo_buf.borrow_mut();
            let HaloBuffers {
                send_val,
                recv_val,
                dv,
            } = &mut *buf;

            self.backend.gather(&self.gather, x, send_val);

            let backend = &self.backend;
            let amg = &self.amg;
            let mut local = || backend.residual(f, amg.top_matrix(), x, r);
            self.plan
                .exchange_ghosts(&*self.comm, send_val, recv_val, &mut local)?;

            if !recv_val.is_empty() {
                backend.copy_to_backend(recv_val, dv);
                backend.spmv(-1.0, &self.arem, dv, 1.0, r);
            }
        }
        self.project(r)
    }

    /// Impose the deflation constraint on a converged solution:
    /// x += Z E^{-1} Zᵀ (rhs - A x).
    fn postprocess(&self, rhs: &B::Vector, x: &mut B::Vector) -> Result<()> {
        let _span = tracing::trace_span!("postprocess").entered();

        let mut buf = self.defl_buf.borrow_mut();
        let DeflBuffers { df, dx, q, .. } = &mut *buf;

        // q = A x, without the projection.
        self.mul(1.0, x, 0.0, q)?;

        for (j, zj) in self.z.iter().enumerate() {
            df[j] =
                self.backend.inner_product(rhs, zj) - self.backend.inner_product(q, zj);
        }
        self.coarse.solve(&*self.comm, &self.part, df, dx)?;

        // x += Z * dx, two columns per fused update.
        let k0 = self.part.dv_start(self.part.rank());
        let mut j = 0;
        while j + 1 < self.ndv {
            self.backend.axpbypcz(
                dx[k0 + j],
                &self.z[j],
                dx[k0 + j + 1],
                &self.z[j + 1],
                1.0,
                x,
            );
            j += 2;
        }
        if j < self.ndv {
            self.backend.axpby(dx[k0 + j], &self.z[j], 1.0, x);
        }
        Ok(())
    }
}

impl<B: SolverBackend> LinearOperator<B> for SubdomainDeflation<B> {
    fn apply(&self, alpha: f64, x: &B::Vector, beta: f64, y: &mut B::Vector) -> Result<()> {
        self.mul(alpha, x, beta, y)?;
        self.project(y)
    }

    fn residual(&self, f: &B::Vector, x: &B::Vector, r: &mut B::Vector) -> Result<()> {
        self.residual_project(f, x, r)
    }
}
