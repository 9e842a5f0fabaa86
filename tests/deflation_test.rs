//! Multi-rank end-to-end tests for the subdomain-deflation solver.
//!
//! Each test runs several in-process ranks over `ThreadedComm` and checks
//! the distributed results against dense references assembled in the test
//! body.

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use subdef::solver::bicgstab::BiCgStabParams;
use subdef::solver::coarse::CoarseParams;
use subdef::solver::comm::Communicator;
use subdef::solver::comm_threaded;
use subdef::sparse::CsrMatrix;
use subdef::{ConstantDeflation, CpuBackend, DeflationParams, SubdomainDeflation};

/// Contiguous row split of `n` rows over `ranks` ranks.
fn row_range(n: usize, ranks: usize, rank: usize) -> (usize, usize) {
    let base = n / ranks;
    let extra = n % ranks;
    let begin = rank * base + rank.min(extra);
    (begin, begin + base + usize::from(rank < extra))
}

/// Rows `begin..end` of tridiag(-1, 2, -1) with global column ids.
fn tridiag_strip(n: usize, begin: usize, end: usize) -> CsrMatrix {
    let mut triplets = Vec::new();
    for gi in begin..end {
        let i = gi - begin;
        if gi > 0 {
            triplets.push((i, gi - 1, -1.0));
        }
        triplets.push((i, gi, 2.0));
        if gi + 1 < n {
            triplets.push((i, gi + 1, -1.0));
        }
    }
    CsrMatrix::from_entries(end - begin, n, &triplets)
}

/// Rows `begin..end` of the five-point Laplacian on an n x n grid.
fn laplacian_strip(n: usize, begin: usize, end: usize) -> CsrMatrix {
    let mut triplets = Vec::new();
    for gi in begin..end {
        let i = gi - begin;
        let (r, c) = (gi / n, gi % n);
        if r > 0 {
            triplets.push((i, gi - n, -1.0));
        }
        if c > 0 {
            triplets.push((i, gi - 1, -1.0));
        }
        triplets.push((i, gi, 4.0));
        if c + 1 < n {
            triplets.push((i, gi + 1, -1.0));
        }
        if r + 1 < n {
            triplets.push((i, gi + n, -1.0));
        }
    }
    CsrMatrix::from_entries(end - begin, n * n, &triplets)
}

/// Dense Gaussian elimination with partial pivoting, as the reference.
fn gauss_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
    let n = b.len();
    for k in 0..n {
        let pivot_row = (k..n)
            .max_by(|&i, &j| a[i][k].abs().partial_cmp(&a[j][k].abs()).unwrap())
            .unwrap();
        a.swap(k, pivot_row);
        b.swap(k, pivot_row);
        assert!(a[k][k].abs() > 1e-14, "singular reference system");
        for i in (k + 1)..n {
            let factor = a[i][k] / a[k][k];
            for j in k..n {
                a[i][j] -= factor * a[k][j];
            }
            b[i] -= factor * b[k];
        }
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= a[i][j] * x[j];
        }
        x[i] = sum / a[i][i];
    }
    x
}

/// Deterministic pseudo-random values for reproducible right-hand sides.
fn splitmix(seed: &mut u64) -> f64 {
    *seed = seed.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = *seed;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z = z ^ (z >> 31);
    (z >> 11) as f64 / (1u64 << 53) as f64 - 0.5
}

fn tight_params() -> DeflationParams {
    DeflationParams {
        solver: BiCgStabParams {
            tolerance: 1e-12,
            ..BiCgStabParams::default()
        },
        ..DeflationParams::default()
    }
}

#[test]
fn two_ranks_tridiagonal_converges_fast() {
    let n = 8;
    let results = comm_threaded::spawn(2, |comm| {
        let (begin, end) = row_range(n, 2, comm.rank());
        let astrip = tridiag_strip(n, begin, end);
        let solver = SubdomainDeflation::new(
            Arc::new(comm),
            CpuBackend::new(),
            &astrip,
            &ConstantDeflation::new(1),
            tight_params(),
        )
        .unwrap();

        let rhs = vec![1.0; end - begin];
        let mut x = vec![0.0; end - begin];
        let (iterations, residual) = solver.solve(&rhs, &mut x).unwrap();
        (iterations, residual, x)
    });

    // The constant mode is deflated and the local blocks are solved
    // exactly, so convergence takes a couple of iterations at most.
    for (iterations, residual, _) in &results {
        assert!(*iterations <= 4, "took {iterations} iterations");
        assert!(*residual <= 1e-10);
    }

    let dense = tridiag_strip(n, 0, n).to_dense();
    let reference = gauss_solve(dense, vec![1.0; n]);
    let x: Vec<f64> = results.iter().flat_map(|(_, _, x)| x.clone()).collect();
    for i in 0..n {
        assert_abs_diff_eq!(x[i], reference[i], epsilon = 1e-8);
    }
}

#[test]
fn four_ranks_laplacian_satisfies_deflation_constraint() {
    let grid = 8;
    let n = grid * grid;
    let results = comm_threaded::spawn(4, |comm| {
        let rank = comm.rank();
        let (begin, end) = row_range(n, 4, rank);
        let astrip = laplacian_strip(grid, begin, end);

        let mut seed = 42u64.wrapping_add(begin as u64);
        let rhs: Vec<f64> = (begin..end).map(|_| splitmix(&mut seed)).collect();

        let solver = SubdomainDeflation::new(
            Arc::new(comm),
            CpuBackend::new(),
            &astrip,
            &ConstantDeflation::new(1),
            tight_params(),
        )
        .unwrap();

        let mut x = vec![0.0; end - begin];
        let (_, residual) = solver.solve(&rhs, &mut x).unwrap();
        assert!(residual <= 1e-12);
        (rhs, x)
    });

    // The post-correction leaves the residual orthogonal to every
    // deflation vector: per rank, sum of (rhs - A x) over owned rows.
    let rhs: Vec<f64> = results.iter().flat_map(|(r, _)| r.clone()).collect();
    let x: Vec<f64> = results.iter().flat_map(|(_, x)| x.clone()).collect();
    let full = laplacian_strip(grid, 0, n);
    let ax = full.spmv(&x);
    for rank in 0..4 {
        let (begin, end) = row_range(n, 4, rank);
        let constraint: f64 = (begin..end).map(|i| rhs[i] - ax[i]).sum();
        assert_abs_diff_eq!(constraint, 0.0, epsilon = 1e-10);
    }

    // And the solution itself is right.
    let reference = gauss_solve(full.to_dense(), rhs);
    for i in 0..n {
        assert_abs_diff_eq!(x[i], reference[i], epsilon = 1e-7);
    }
}

#[test]
fn block_deflation_coarse_solve_round_trip() {
    // 4 ranks x 12 rows, three deflation vectors per rank: E is 12x12.
    // coarse_solve(E * v) must reproduce v.
    let ranks = 4;
    let rows = 12;
    let block = 3;
    let n = ranks * rows;
    let nz = ranks * block;

    // v and the dense E = Zᵀ A Z reference.
    let v: Vec<f64> = (0..nz).map(|k| 1.0 + k as f64 * 0.5).collect();
    let full = tridiag_strip(n, 0, n);
    let z_col = |k: usize| -> Vec<f64> {
        let (rank, j) = (k / block, k % block);
        (0..n)
            .map(|gi| {
                let owned = gi / rows == rank;
                if owned && (gi - rank * rows) % block == j {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    };
    let mut e_v = vec![0.0; nz];
    {
        // E v = Zᵀ A (Z v)
        let mut zv = vec![0.0; n];
        for k in 0..nz {
            for (gi, z) in z_col(k).iter().enumerate() {
                zv[gi] += z * v[k];
            }
        }
        let azv = full.spmv(&zv);
        for k in 0..nz {
            e_v[k] = z_col(k).iter().zip(&azv).map(|(z, y)| z * y).sum();
        }
    }

    let results = comm_threaded::spawn(ranks, |comm| {
        let rank = comm.rank();
        let (begin, end) = (rank * rows, (rank + 1) * rows);
        let astrip = tridiag_strip(n, begin, end);

        let mut prm = tight_params();
        // Force a multi-master hierarchy at this tiny coarse size.
        prm.coarse = CoarseParams { dofs_per_master: 4 };

        let solver = SubdomainDeflation::new(
            Arc::new(comm),
            CpuBackend::new(),
            &astrip,
            &ConstantDeflation::new(block),
            prm,
        )
        .unwrap();

        let f: Vec<f64> = (0..block).map(|j| e_v[rank * block + j]).collect();
        let mut out = vec![0.0; nz];
        solver.coarse_solve(&f, &mut out).unwrap();
        out
    });

    for out in results {
        for k in 0..nz {
            assert_abs_diff_eq!(out[k], v[k], epsilon = 1e-10);
        }
    }
}

#[test]
fn single_rank_matches_dense_reference() {
    let grid = 6;
    let n = grid * grid;
    let results = comm_threaded::spawn(1, |comm| {
        let astrip = laplacian_strip(grid, 0, n);
        let solver = SubdomainDeflation::new(
            Arc::new(comm),
            CpuBackend::new(),
            &astrip,
            &ConstantDeflation::new(2),
            tight_params(),
        )
        .unwrap();

        let mut seed = 7u64;
        let rhs: Vec<f64> = (0..n).map(|_| splitmix(&mut seed)).collect();
        let mut x = vec![0.0; n];
        solver.solve(&rhs, &mut x).unwrap();
        (rhs, x)
    });

    let (rhs, x) = &results[0];
    let reference = gauss_solve(laplacian_strip(grid, 0, n).to_dense(), rhs.clone());
    for i in 0..n {
        assert_abs_diff_eq!(x[i], reference[i], epsilon = 1e-8);
    }
}

#[test]
fn eight_ranks_asymmetric_graph_solves() {
    // Upper-bidiagonal coupling only: every rank references its successor
    // but never its predecessor. Assembly must not deadlock and the coarse
    // graph symmetrisation must keep E solvable.
    let ranks = 8;
    let rows = 2;
    let n = ranks * rows;

    let strip = |begin: usize, end: usize| -> CsrMatrix {
        let mut triplets = Vec::new();
        for gi in begin..end {
            let i = gi - begin;
            triplets.push((i, gi, 2.0));
            if gi + 1 < n {
                triplets.push((i, gi + 1, -1.0));
            }
        }
        CsrMatrix::from_entries(end - begin, n, &triplets)
    };

    let results = comm_threaded::spawn(ranks, |comm| {
        let rank = comm.rank();
        let (begin, end) = (rank * rows, (rank + 1) * rows);
        let solver = SubdomainDeflation::new(
            Arc::new(comm),
            CpuBackend::new(),
            &strip(begin, end),
            &ConstantDeflation::new(1),
            tight_params(),
        )
        .unwrap();

        let rhs = vec![1.0; rows];
        let mut x = vec![0.0; rows];
        let (_, residual) = solver.solve(&rhs, &mut x).unwrap();
        (residual, x)
    });

    let x: Vec<f64> = results.iter().flat_map(|(_, x)| x.clone()).collect();
    let reference = gauss_solve(strip(0, n).to_dense(), vec![1.0; n]);
    for i in 0..n {
        assert_abs_diff_eq!(x[i], reference[i], epsilon = 1e-6);
    }
}

#[test]
fn projection_annihilates_deflation_components_across_ranks() {
    let n = 12;
    let results = comm_threaded::spawn(3, |comm| {
        let (begin, end) = row_range(n, 3, comm.rank());
        let astrip = tridiag_strip(n, begin, end);
        let solver = SubdomainDeflation::new(
            Arc::new(comm),
            CpuBackend::new(),
            &astrip,
            &ConstantDeflation::new(1),
            tight_params(),
        )
        .unwrap();

        let mut x: Vec<f64> = (begin..end).map(|gi| (gi as f64 * 0.7).cos() + 1.5).collect();
        solver.project(&mut x).unwrap();
        let after_once: f64 = x.iter().sum();

        let before = x.clone();
        solver.project(&mut x).unwrap();
        let drift: f64 = x
            .iter()
            .zip(&before)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        (after_once, drift)
    });

    for (component, drift) in results {
        // Zᵀ x vanishes after one projection, and a second application is
        // a no-op.
        assert_abs_diff_eq!(component, 0.0, epsilon = 1e-10);
        assert!(drift <= 1e-10);
    }
}
