//! Distributed solver for large sparse linear systems based on subdomain
//! deflation.
//!
//! The matrix is partitioned by contiguous row strips across cooperating
//! ranks. Each rank preconditions its local diagonal block with algebraic
//! multigrid; a global low-rank projector built from per-rank deflation
//! vectors removes the slowly-converging inter-subdomain modes, and a
//! small factorised coarse operator supplies the correction on every
//! application of the preconditioned operator.
//!
//! Ranks can be MPI processes (feature `distributed`), in-process threads
//! (`ThreadedComm`), or a single process (`SingleProcessComm`); the solver
//! is written against the `Communicator` trait and does not care which.

pub mod error;
pub mod solver;
pub mod sparse;

pub use crate::error::{Result, SubdefError};
pub use crate::solver::backend::{CpuBackend, SolverBackend};
pub use crate::solver::comm::{Communicator, SingleProcessComm};
pub use crate::solver::deflation::{DeflationParams, SubdomainDeflation};
pub use crate::solver::{ConstantDeflation, DeflationVectors};
