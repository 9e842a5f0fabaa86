//! Solver backend abstraction for the numeric kernels.
//!
//! Defines the `SolverBackend` trait for backend-agnostic solver code, and
//! `CpuBackend` which implements it over host vectors. Matrices are built
//! host-side as CSR during setup and handed to the backend once; after that
//! point the backend copies are authoritative.

use rayon::prelude::*;

use crate::sparse::CsrMatrix;

/// Row count above which the CPU SpMV switches to rayon.
const PAR_THRESHOLD: usize = 8192;

/// Abstract backend for the vector and matrix operations the solver needs.
///
/// All scalars are f64. Output arguments come last and are mutated in
/// place, so a GPU-style backend can map them onto device buffers.
pub trait SolverBackend {
    type Vector;
    type Matrix;
    type Gather;

    /// Create a zero-initialized vector of length n.
    fn create_vector(&self, n: usize) -> Self::Vector;

    /// Create a vector holding a copy of host data.
    fn copy_vector(&self, data: &[f64]) -> Self::Vector;

    /// Take ownership of a host CSR matrix.
    fn copy_matrix(&self, matrix: CsrMatrix) -> Self::Matrix;

    /// Build a gather handle for the given source indices.
    fn make_gather(&self, cols: &[usize]) -> Self::Gather;

    /// out[k] = x[cols[k]] for the handle's index list.
    fn gather(&self, handle: &Self::Gather, x: &Self::Vector, out: &mut [f64]);

    /// Overwrite a backend vector with host data (lengths must match).
    fn copy_to_backend(&self, data: &[f64], v: &mut Self::Vector);

    /// Read a backend vector back to host memory.
    fn copy_to_host(&self, v: &Self::Vector, out: &mut [f64]);

    /// dst = src
    fn copy(&self, src: &Self::Vector, dst: &mut Self::Vector);

    /// y = alpha * A * x + beta * y
    fn spmv(&self, alpha: f64, a: &Self::Matrix, x: &Self::Vector, beta: f64, y: &mut Self::Vector);

    /// r = f - A * x
    fn residual(&self, f: &Self::Vector, a: &Self::Matrix, x: &Self::Vector, r: &mut Self::Vector);

    /// Process-local inner product.
    fn inner_product(&self, x: &Self::Vector, y: &Self::Vector) -> f64;

    /// y = alpha * x + beta * y
    fn axpby(&self, alpha: f64, x: &Self::Vector, beta: f64, y: &mut Self::Vector);

    /// z = alpha * x + beta * y + gamma * z
    fn axpbypcz(
        &self,
        alpha: f64,
        x: &Self::Vector,
        beta: f64,
        y: &Self::Vector,
        gamma: f64,
        z: &mut Self::Vector,
    );

    /// Pointwise diagonal scaling: y = alpha * d .* x + beta * y
    fn vmul(&self, alpha: f64, d: &Self::Vector, x: &Self::Vector, beta: f64, y: &mut Self::Vector);
}

/// Gather handle for `CpuBackend`: the source index list.
pub struct GatherCols {
    cols: Vec<usize>,
}

/// Host-vector implementation of `SolverBackend`.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SolverBackend for CpuBackend {
    type Vector = Vec<f64>;
    type Matrix = CsrMatrix;
    type Gather = GatherCols;

    fn create_vector(&self, n: usize) -> Vec<f64> {
        vec![0.0; n]
    }

    fn copy_vector(&self, data: &[f64]) -> Vec<f64> {
        data.to_vec()
    }

    fn copy_matrix(&self, matrix: CsrMatrix) -> CsrMatrix {
        matrix
    }

    fn make_gather(&self, cols: &[usize]) -> GatherCols {
        GatherCols {
            cols: cols.to_vec(),
        }
    }

    fn gather(&self, handle: &GatherCols, x: &Vec<f64>, out: &mut [f64]) {
        debug_assert_eq!(handle.cols.len(), out.len());
        for (dst, &c) in out.iter_mut().zip(&handle.cols) {
            *dst = x[c];
        }
    }

    fn copy_to_backend(&self, data: &[f64], v: &mut Vec<f64>) {
        v.copy_from_slice(data);
    }

    fn copy_to_host(&self, v: &Vec<f64>, out: &mut [f64]) {
        out.copy_from_slice(v);
    }

    fn copy(&self, src: &Vec<f64>, dst: &mut Vec<f64>) {
        dst.copy_from_slice(src);
    }

    fn spmv(&self, alpha: f64, a: &CsrMatrix, x: &Vec<f64>, beta: f64, y: &mut Vec<f64>) {
        assert_eq!(x.len(), a.ncols, "spmv dimension mismatch");
        assert_eq!(y.len(), a.nrows, "spmv dimension mismatch");

        let row = |i: usize, yi: f64| -> f64 {
            let mut sum = 0.0;
            for idx in a.ptr[i]..a.ptr[i + 1] {
                sum += a.val[idx] * x[a.col[idx]];
            }
            if beta == 0.0 {
                alpha * sum
            } else {
                alpha * sum + beta * yi
            }
        };

        if a.nrows >= PAR_THRESHOLD {
            y.par_iter_mut()
                .enumerate()
                .for_each(|(i, yi)| *yi = row(i, *yi));
        } else {
            for (i, yi) in y.iter_mut().enumerate() {
                *yi = row(i, *yi);
            }
        }
    }

    fn residual(&self, f: &Vec<f64>, a: &CsrMatrix, x: &Vec<f64>, r: &mut Vec<f64>) {
        assert_eq!(r.len(), a.nrows, "residual dimension mismatch");
        for i in 0..a.nrows {
            let mut sum = f[i];
            for idx in a.ptr[i]..a.ptr[i + 1] {
                sum -= a.val[idx] * x[a.col[idx]];
            }
            r[i] = sum;
        }
    }

    fn inner_product(&self, x: &Vec<f64>, y: &Vec<f64>) -> f64 {
        debug_assert_eq!(x.len(), y.len());
        x.iter().zip(y).map(|(a, b)| a * b).sum()
    }

    fn axpby(&self, alpha: f64, x: &Vec<f64>, beta: f64, y: &mut Vec<f64>) {
        debug_assert_eq!(x.len(), y.len());
        if beta == 0.0 {
            for (yi, &xi) in y.iter_mut().zip(x) {
                *yi = alpha * xi;
            }
        } else {
            for (yi, &xi) in y.iter_mut().zip(x) {
                *yi = alpha * xi + beta * *yi;
            }
        }
    }

    fn axpbypcz(
        &self,
        alpha: f64,
        x: &Vec<f64>,
        beta: f64,
        y: &Vec<f64>,
        gamma: f64,
        z: &mut Vec<f64>,
    ) {
        debug_assert_eq!(x.len(), z.len());
        debug_assert_eq!(y.len(), z.len());
        for i in 0..z.len() {
            z[i] = alpha * x[i] + beta * y[i] + gamma * z[i];
        }
    }

    fn vmul(&self, alpha: f64, d: &Vec<f64>, x: &Vec<f64>, beta: f64, y: &mut Vec<f64>) {
        debug_assert_eq!(d.len(), y.len());
        debug_assert_eq!(x.len(), y.len());
        if beta == 0.0 {
            for i in 0..y.len() {
                y[i] = alpha * d[i] * x[i];
            }
        } else {
            for i in 0..y.len() {
                y[i] = alpha * d[i] * x[i] + beta * y[i];
            }
        }
    }
}
