use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use subdef::solver::comm::Communicator;
use subdef::solver::comm_threaded;
use subdef::sparse::CsrMatrix;
use subdef::{ConstantDeflation, CpuBackend, DeflationParams, SubdomainDeflation};

/// Subdomain-deflation demo: 2D Poisson split into row strips, one
/// in-process rank per subdomain.
#[derive(Parser)]
#[command(name = "subdef", version)]
struct Cli {
    /// Grid points per side of the square Poisson problem
    #[arg(long, default_value_t = 64)]
    grid: usize,

    /// Number of in-process ranks (subdomains)
    #[arg(long, default_value_t = 4)]
    ranks: usize,

    /// Deflation vectors per rank (constant-per-component)
    #[arg(long, default_value_t = 1)]
    block_size: usize,

    /// Relative residual tolerance
    #[arg(long, default_value_t = 1e-8)]
    tol: f64,
}

/// Five-point Laplacian rows `row_begin..row_end` of an n x n grid, with
/// global column ids.
fn laplacian_strip(n: usize, row_begin: usize, row_end: usize) -> CsrMatrix {
    let mut triplets = Vec::new();
    for gi in row_begin..row_end {
        let i = gi - row_begin;
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
    CsrMatrix::from_entries(row_end - row_begin, n * n, &triplets)
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let unknowns = cli.grid * cli.grid;
    if cli.ranks == 0 || cli.ranks > unknowns {
        eprintln!("Error: need between 1 and {unknowns} ranks");
        std::process::exit(1);
    }

    let start = Instant::now();
    let results = comm_threaded::spawn(cli.ranks, |comm| {
        let rank = comm.rank();
        let base = unknowns / cli.ranks;
        let extra = unknowns % cli.ranks;
        let row_begin = rank * base + rank.min(extra);
        let row_end = row_begin + base + usize::from(rank < extra);

        let astrip = laplacian_strip(cli.grid, row_begin, row_end);
        let mut prm = DeflationParams::default();
        prm.solver.tolerance = cli.tol;

        let solver = SubdomainDeflation::new(
            Arc::new(comm),
            CpuBackend::new(),
            &astrip,
            &ConstantDeflation::new(cli.block_size),
            prm,
        )?;

        let rhs = vec![1.0; row_end - row_begin];
        let mut x = vec![0.0; row_end - row_begin];
        solver.solve(&rhs, &mut x)
    });
    let elapsed = start.elapsed();

    match &results[0] {
        Ok((iterations, residual)) => {
            println!(
                "{}x{} Poisson ({unknowns} unknowns) on {} ranks: \
                 {iterations} iterations, residual {residual:.3e}, {elapsed:.2?}",
                cli.grid, cli.grid, cli.ranks
            );
        }
        Err(e) => {
            eprintln!("Solve error: {e}");
            std::process::exit(1);
        }
    }
}
