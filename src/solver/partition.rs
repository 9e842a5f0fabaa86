//! Row-strip partition descriptor.
//!
//! Each rank owns a contiguous block of matrix rows and contributes a
//! fixed number of deflation vectors. The descriptor holds the prefix sums
//! of both and answers ownership queries; it is immutable after setup.

use crate::error::{Result, SubdefError};

use super::comm::Communicator;

/// Per-rank row ownership boundaries and deflation-vector counts.
#[derive(Debug, Clone)]
pub struct Partition {
    rank: usize,
    /// `domain[p]..domain[p+1]` is the row range owned by rank p.
    domain: Vec<usize>,
    /// Deflation vectors contributed by each rank.
    dv_size: Vec<usize>,
    /// Prefix sum of `dv_size`; `dv_start[P]` is the coarse problem size.
    dv_start: Vec<usize>,
}

impl Partition {
    /// Gather row counts and deflation-vector counts from every rank.
    pub fn assemble(comm: &dyn Communicator, nrows: usize, ndv: usize) -> Result<Self> {
        if ndv == 0 {
            return Err(SubdefError::InvalidInput(
                "each rank must contribute at least one deflation vector".into(),
            ));
        }

        let sizes = comm.all_gather_usize(nrows)?;
        let mut domain = vec![0usize; sizes.len() + 1];
        for (p, &n) in sizes.iter().enumerate() {
            domain[p + 1] = domain[p] + n;
        }
        if domain[sizes.len()] == 0 {
            return Err(SubdefError::InvalidInput("empty domain".into()));
        }

        let dv_size = comm.all_gather_usize(ndv)?;
        if dv_size.iter().any(|&s| s == 0) {
            return Err(SubdefError::InvalidInput(
                "each rank must contribute at least one deflation vector".into(),
            ));
        }
        let mut dv_start = vec![0usize; dv_size.len() + 1];
        for (p, &s) in dv_size.iter().enumerate() {
            dv_start[p + 1] = dv_start[p] + s;
        }

        Ok(Self {
            rank: comm.rank(),
            domain,
            dv_size,
            dv_start,
        })
    }

    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.domain.len() - 1
    }

    /// This rank's id.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Global number of rows.
    pub fn global_rows(&self) -> usize {
        self.domain[self.num_ranks()]
    }

    /// First global row owned by rank p.
    pub fn row_begin(&self, p: usize) -> usize {
        self.domain[p]
    }

    /// One past the last global row owned by rank p.
    pub fn row_end(&self, p: usize) -> usize {
        self.domain[p + 1]
    }

    /// Rows owned by this rank.
    pub fn local_rows(&self) -> usize {
        self.row_end(self.rank) - self.row_begin(self.rank)
    }

    /// Rank owning a global column.
    pub fn owner(&self, col: usize) -> usize {
        debug_assert!(col < self.global_rows(), "column {col} out of range");
        self.domain.partition_point(|&d| d <= col) - 1
    }

    /// Whether this rank owns a global column.
    pub fn owns(&self, col: usize) -> bool {
        self.row_begin(self.rank) <= col && col < self.row_end(self.rank)
    }

    /// Local index of a column owned by this rank.
    pub fn local(&self, col: usize) -> usize {
        debug_assert!(self.owns(col));
        col - self.row_begin(self.rank)
    }

    /// Deflation vectors contributed by rank p.
    pub fn dv_size(&self, p: usize) -> usize {
        self.dv_size[p]
    }

    /// First coarse index of rank p's deflation vectors.
    pub fn dv_start(&self, p: usize) -> usize {
        self.dv_start[p]
    }

    /// Coarse index of rank p's deflation vector j.
    pub fn coarse_index(&self, p: usize, j: usize) -> usize {
        debug_assert!(j < self.dv_size[p]);
        self.dv_start[p] + j
    }

    /// Total number of deflation vectors across all ranks.
    pub fn coarse_size(&self) -> usize {
        self.dv_start[self.num_ranks()]
    }

    /// Per-rank deflation-vector counts.
    pub fn dv_sizes(&self) -> &[usize] {
        &self.dv_size
    }
}
