//! Host-side sparse matrices in compressed sparse row form.
//!
//! Everything the setup assembles — the local strip of A, its local and
//! remote splits, the deflation product, the AMG transfer operators —
//! passes through `CsrMatrix` before the backend takes ownership. Values
//! are `f64` throughout, the solver's only scalar type, and the arrays
//! follow the `ptr`/`col`/`val` naming the rest of the setup code uses.

/// Compressed sparse row matrix.
///
/// `ptr[i]..ptr[i + 1]` indexes row i's entries in `col`/`val`;
/// `ptr[nrows]` is the stored entry count. Columns within a row are not
/// required to be sorted.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    pub nrows: usize,
    pub ncols: usize,
    pub ptr: Vec<usize>,
    pub col: Vec<usize>,
    pub val: Vec<f64>,
}

impl CsrMatrix {
    /// Matrix with no stored entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            ptr: vec![0; nrows + 1],
            col: Vec::new(),
            val: Vec::new(),
        }
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.val.len()
    }

    /// Assemble from (row, col, value) entries.
    ///
    /// Uses the count/prefix/scatter pattern the distributed setup leans
    /// on everywhere: one pass counts each row, the prefix sum sizes the
    /// arrays, a cursor pass drops every entry into place. Entries may
    /// arrive in any row order; within a row they keep their input order
    /// and duplicates are stored as given.
    pub fn from_entries(nrows: usize, ncols: usize, entries: &[(usize, usize, f64)]) -> Self {
        let mut ptr = vec![0usize; nrows + 1];
        for &(r, _, _) in entries {
            ptr[r + 1] += 1;
        }
        for i in 0..nrows {
            ptr[i + 1] += ptr[i];
        }

        let mut col = vec![0usize; entries.len()];
        let mut val = vec![0.0f64; entries.len()];
        let mut cursor = ptr.clone();
        for &(r, c, v) in entries {
            col[cursor[r]] = c;
            val[cursor[r]] = v;
            cursor[r] += 1;
        }

        Self {
            nrows,
            ncols,
            ptr,
            col,
            val,
        }
    }

    /// Entries of row i as (column, value) pairs.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.ptr[i]..self.ptr[i + 1];
        self.col[range.clone()]
            .iter()
            .zip(&self.val[range])
            .map(|(&c, &v)| (c, v))
    }

    /// Dense row-major copy for reference computations in tests.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.ncols]; self.nrows];
        for (i, out) in dense.iter_mut().enumerate() {
            for (c, v) in self.row(i) {
                out[c] += v;
            }
        }
        dense
    }

    /// y = A x
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.ncols, "spmv width mismatch");
        (0..self.nrows)
            .map(|i| self.row(i).map(|(c, v)| v * x[c]).sum::<f64>())
            .collect()
    }

    /// Transposed copy, built with the same count/prefix/scatter pattern
    /// as `from_entries`. Walking rows in order leaves every transposed
    /// row sorted by column.
    pub fn transpose(&self) -> CsrMatrix {
        let mut ptr = vec![0usize; self.ncols + 1];
        for &c in &self.col {
            ptr[c + 1] += 1;
        }
        for i in 0..self.ncols {
            ptr[i + 1] += ptr[i];
        }

        let mut col = vec![0usize; self.nnz()];
        let mut val = vec![0.0f64; self.nnz()];
        let mut cursor = ptr.clone();
        for i in 0..self.nrows {
            for (c, v) in self.row(i) {
                col[cursor[c]] = i;
                val[cursor[c]] = v;
                cursor[c] += 1;
            }
        }

        CsrMatrix {
            nrows: self.ncols,
            ncols: self.nrows,
            ptr,
            col,
            val,
        }
    }

    /// Sparse product C = A * B.
    ///
    /// Row-wise scatter/accumulate with the same marker discipline the
    /// deflation-product assembly uses: a position marker per result
    /// column turns repeated hits into in-place accumulation, a symbolic
    /// pass sizes the rows first.
    pub fn multiply(&self, other: &CsrMatrix) -> CsrMatrix {
        assert_eq!(self.ncols, other.nrows, "multiply width mismatch");
        let nrows = self.nrows;
        let ncols = other.ncols;

        let mut marker = vec![usize::MAX; ncols];
        let mut ptr = vec![0usize; nrows + 1];
        for i in 0..nrows {
            for (k, _) in self.row(i) {
                for (c, _) in other.row(k) {
                    if marker[c] != i {
                        marker[c] = i;
                        ptr[i + 1] += 1;
                    }
                }
            }
        }
        for i in 0..nrows {
            ptr[i + 1] += ptr[i];
        }

        let nnz = ptr[nrows];
        let mut col = vec![0usize; nnz];
        let mut val = vec![0.0f64; nnz];
        let mut position = vec![usize::MAX; ncols];

        for i in 0..nrows {
            let row_begin = ptr[i];
            let mut row_end = row_begin;
            for (k, v) in self.row(i) {
                for (c, w) in other.row(k) {
                    if position[c] == usize::MAX || position[c] < row_begin {
                        position[c] = row_end;
                        col[row_end] = c;
                        val[row_end] = v * w;
                        row_end += 1;
                    } else {
                        val[position[c]] += v * w;
                    }
                }
            }
            sort_row(&mut col[row_begin..row_end], &mut val[row_begin..row_end]);
        }

        CsrMatrix {
            nrows,
            ncols,
            ptr,
            col,
            val,
        }
    }

    /// Entrywise sum C = A + alpha * B, same marker discipline as
    /// `multiply`.
    pub fn add_scaled(&self, alpha: f64, other: &CsrMatrix) -> CsrMatrix {
        assert_eq!(self.nrows, other.nrows, "add shape mismatch");
        assert_eq!(self.ncols, other.ncols, "add shape mismatch");

        let nrows = self.nrows;
        let mut marker = vec![usize::MAX; self.ncols];
        let mut ptr = vec![0usize; nrows + 1];
        for i in 0..nrows {
            for (c, _) in self.row(i) {
                marker[c] = i;
                ptr[i + 1] += 1;
            }
            for (c, _) in other.row(i) {
                if marker[c] != i {
                    marker[c] = i;
                    ptr[i + 1] += 1;
                }
            }
        }
        for i in 0..nrows {
            ptr[i + 1] += ptr[i];
        }

        let nnz = ptr[nrows];
        let mut col = vec![0usize; nnz];
        let mut val = vec![0.0f64; nnz];
        let mut position = vec![usize::MAX; self.ncols];

        for i in 0..nrows {
            let row_begin = ptr[i];
            let mut row_end = row_begin;
            for (c, v) in self.row(i) {
                position[c] = row_end;
                col[row_end] = c;
                val[row_end] = v;
                row_end += 1;
            }
            for (c, v) in other.row(i) {
                if position[c] == usize::MAX || position[c] < row_begin {
                    position[c] = row_end;
                    col[row_end] = c;
                    val[row_end] = alpha * v;
                    row_end += 1;
                } else {
                    val[position[c]] += alpha * v;
                }
            }
            sort_row(&mut col[row_begin..row_end], &mut val[row_begin..row_end]);
        }

        CsrMatrix {
            nrows,
            ncols: self.ncols,
            ptr,
            col,
            val,
        }
    }

    /// Diagonal entries (zero where a row stores no diagonal).
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.nrows.min(self.ncols))
            .map(|i| {
                self.row(i)
                    .find(|&(c, _)| c == i)
                    .map_or(0.0, |(_, v)| v)
            })
            .collect()
    }
}

/// Sort one CSR row by column index, keeping values aligned.
fn sort_row(cols: &mut [usize], vals: &mut [f64]) {
    let mut order: Vec<usize> = (0..cols.len()).collect();
    order.sort_by_key(|&k| cols[k]);
    let sorted_cols: Vec<usize> = order.iter().map(|&k| cols[k]).collect();
    let sorted_vals: Vec<f64> = order.iter().map(|&k| vals[k]).collect();
    cols.copy_from_slice(&sorted_cols);
    vals.copy_from_slice(&sorted_vals);
}
