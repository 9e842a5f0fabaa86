//! Two-pass distributed assembly of the deflation operator.
//!
//! The first pass over the local strip classifies every non-zero as local
//! or remote, collects the distinct remote columns, and sizes the rows of
//! the deflation product AZ. The neighbour graph then comes out of one
//! all-gather of the per-pair column counts; the column-list exchange is
//! posted non-blocking and the second value pass runs while it is in
//! flight. Finally the deflation-vector rows behind the remote columns are
//! fetched and AZ is completed with the Arem contribution.

use std::collections::BTreeMap;

use crate::error::{Result, SubdefError};
use crate::sparse::CsrMatrix;

use super::comm::{Communicator, Phase};
use super::halo::{self, ExchangePlan, Side};
use super::partition::Partition;

/// Everything the setup produces on one rank.
pub(crate) struct Assembled {
    /// Local block: columns owned by this rank, in local numbering.
    pub aloc: CsrMatrix,
    /// Remote block: columns compacted to ascending global order.
    pub arem: CsrMatrix,
    /// Deflation product A*Z, `nrows x coarse_size`.
    pub az: CsrMatrix,
    /// Ghost exchange neighbour graph.
    pub plan: ExchangePlan,
    /// Local row indices to stage for the neighbours, in the order the
    /// receivers expect.
    pub gather_cols: Vec<usize>,
    /// Global ids behind the compacted remote columns.
    pub recv_cols: Vec<usize>,
    /// Gathered P x P per-pair column counts (kept for the coarse-operator
    /// graph symmetrisation).
    pub comm_matrix: Vec<usize>,
}

/// Run the two-pass assembly of Aloc, Arem and AZ.
///
/// `z[j]` is deflation vector j restricted to this rank's rows; the
/// partition must have been assembled over the same communicator.
pub(crate) fn assemble(
    comm: &dyn Communicator,
    part: &Partition,
    astrip: &CsrMatrix,
    z: &[Vec<f64>],
) -> Result<Assembled> {
    let _span = tracing::debug_span!("deflation_setup").entered();

    let rank = part.rank();
    let size = part.num_ranks();
    let nrows = part.local_rows();
    let ndv = z.len();
    let nz = part.coarse_size();
    let chunk_start = part.row_begin(rank);

    if astrip.nrows != nrows || astrip.ncols != part.global_rows() {
        return Err(SubdefError::InvalidInput(format!(
            "matrix strip is {}x{}, partition expects {}x{}",
            astrip.nrows,
            astrip.ncols,
            nrows,
            part.global_rows()
        )));
    }

    // First pass: count local/remote non-zeros, collect the remote column
    // set, and size the rows of AZ. The marker array is indexed by owner
    // rank here and by coarse column in the value passes; `ndv >= 1` on
    // every rank keeps it long enough for both.
    let mut loc_nnz = 0usize;
    let mut rem_nnz = 0usize;
    let mut rc: BTreeMap<usize, usize> = BTreeMap::new();
    let mut az_ptr = vec![0usize; nrows + 1];
    let mut marker = vec![-1isize; nz];

    {
        let _s = tracing::debug_span!("first_pass").entered();
        for i in 0..nrows {
            for (c, _) in astrip.row(i) {
                let d = part.owner(c);
                if d == rank {
                    loc_nnz += 1;
                } else {
                    rem_nnz += 1;
                    rc.insert(c, 0);
                }
                if marker[d] != i as isize {
                    marker[d] = i as isize;
                    az_ptr[i + 1] += part.dv_size(d);
                }
            }
        }
    }

    // Renumber the remote columns (ascending global order) and histogram
    // them by owner.
    let mut num_recv = vec![0usize; size];
    let mut recv_cols = Vec::with_capacity(rc.len());
    {
        let mut owner_cursor = 0usize;
        for (id, (&c, slot)) in rc.iter_mut().enumerate() {
            *slot = id;
            recv_cols.push(c);
            while c >= part.row_end(owner_cursor) {
                owner_cursor += 1;
            }
            num_recv[owner_cursor] += 1;
        }
    }

    let _s = tracing::debug_span!("exchange_pattern").entered();
    let comm_matrix = comm.all_gather_matrix(&num_recv)?;
    drop(_s);
    let plan = ExchangePlan::from_comm_matrix(rank, size, &comm_matrix);
    debug_assert_eq!(plan.num_ghosts(), rc.len());

    // Second pass fills the three matrices while the column lists travel.
    let mut aloc_ptr = Vec::with_capacity(nrows + 1);
    let mut aloc_col = Vec::with_capacity(loc_nnz);
    let mut aloc_val = Vec::with_capacity(loc_nnz);
    aloc_ptr.push(0);

    let mut arem_ptr = Vec::with_capacity(nrows + 1);
    let mut arem_col = Vec::with_capacity(rem_nnz);
    let mut arem_val = Vec::with_capacity(rem_nnz);
    arem_ptr.push(0);

    for i in 0..nrows {
        az_ptr[i + 1] += az_ptr[i];
    }
    let az_nnz = az_ptr[nrows];
    let mut az_col = vec![0usize; az_nnz];
    let mut az_val = vec![0.0f64; az_nnz];
    marker.fill(-1);

    let mut gather_cols = vec![0usize; plan.num_staged()];

    {
        let sends = halo::slabs(&recv_cols, &plan.recv);
        let mut recvs = halo::slabs_mut(&mut gather_cols, &plan.send);
        let dv_first = part.dv_start(rank);

        let mut second_pass = || {
            let _s = tracing::debug_span!("second_pass").entered();
            for i in 0..nrows {
                // az_ptr[i] is the row's write cursor until the final
                // rotation restores conventional CSR.
                let az_row_beg = az_ptr[i];
                let mut az_row_end = az_row_beg;

                for (c, v) in astrip.row(i) {
                    if part.owns(c) {
                        let lc = c - chunk_start;
                        aloc_col.push(lc);
                        aloc_val.push(v);

                        for (j, zj) in z.iter().enumerate() {
                            let k = dv_first + j;
                            if marker[k] < az_row_beg as isize {
                                marker[k] = az_row_end as isize;
                                az_col[az_row_end] = k;
                                az_val[az_row_end] = v * zj[lc];
                                az_row_end += 1;
                            } else {
                                az_val[marker[k] as usize] += v * zj[lc];
                            }
                        }
                    } else {
                        arem_col.push(rc[&c]);
                        arem_val.push(v);
                    }
                }

                az_ptr[i] = az_row_end;
                aloc_ptr.push(aloc_col.len());
                arem_ptr.push(arem_col.len());
            }
        };

        comm.exchange_usize(Phase::GhostCols, &sends, &mut recvs, &mut second_pass)?;
    }

    // The neighbours asked for global ids; shift to local row indices.
    for c in gather_cols.iter_mut() {
        if !part.owns(*c) {
            return Err(SubdefError::Transport(format!(
                "neighbour requested column {c} outside this rank's rows"
            )));
        }
        *c -= chunk_start;
    }

    // Fetch the deflation-vector rows behind the remote columns and finish
    // AZ with the Arem contribution.
    {
        let _s = tracing::debug_span!("deflation_product").entered();

        let nrecv = plan.recv.nbr.len();
        let mut zrecv_ptr = vec![0usize; nrecv + 1];
        let mut zcol_ptr = Vec::with_capacity(rc.len() + 1);
        zcol_ptr.push(0usize);
        for i in 0..nrecv {
            let dv = part.dv_size(plan.recv.nbr[i]);
            zrecv_ptr[i + 1] = zrecv_ptr[i] + dv * plan.recv.len(i);
            for _ in 0..plan.recv.len(i) {
                zcol_ptr.push(zcol_ptr.last().unwrap() + dv);
            }
        }

        let mut zrecv = vec![0.0f64; zrecv_ptr[nrecv]];
        let mut zsend = vec![0.0f64; gather_cols.len() * ndv];
        for (i, &lc) in gather_cols.iter().enumerate() {
            for (j, zj) in z.iter().enumerate() {
                zsend[i * ndv + j] = zj[lc];
            }
        }

        {
            let zsend_side = Side {
                nbr: plan.send.nbr.clone(),
                ptr: plan.send.ptr.iter().map(|&p| p * ndv).collect(),
            };
            let zrecv_side = Side {
                nbr: plan.recv.nbr.clone(),
                ptr: zrecv_ptr,
            };
            let sends = halo::slabs(&zsend, &zsend_side);
            let mut recvs = halo::slabs_mut(&mut zrecv, &zrecv_side);
            comm.exchange_f64(Phase::GhostVals, &sends, &mut recvs, &mut || {})?;
        }

        marker.fill(-1);
        for i in 0..nrows {
            let az_row_beg = az_ptr[i];
            let mut az_row_end = az_row_beg;

            for idx in arem_ptr[i]..arem_ptr[i + 1] {
                let c = arem_col[idx];
                let v = arem_val[idx];

                let nbr = plan.recv.ptr.partition_point(|&p| p <= c) - 1;
                let d = plan.recv.nbr[nbr];
                let zval = &zrecv[zcol_ptr[c]..zcol_ptr[c] + part.dv_size(d)];

                for (j, &zv) in zval.iter().enumerate() {
                    let k = part.dv_start(d) + j;
                    if marker[k] < az_row_beg as isize {
                        marker[k] = az_row_end as isize;
                        az_col[az_row_end] = k;
                        az_val[az_row_end] = v * zv;
                        az_row_end += 1;
                    } else {
                        az_val[marker[k] as usize] += v * zv;
                    }
                }
            }

            az_ptr[i] = az_row_end;
        }

        // Each entry now holds its row's end cursor; rotate back to the
        // conventional ptr[0] = 0 form.
        az_ptr.rotate_right(1);
        az_ptr[0] = 0;
    }

    Ok(Assembled {
        aloc: CsrMatrix {
            nrows,
            ncols: nrows,
            val: aloc_val,
            col: aloc_col,
            ptr: aloc_ptr,
        },
        arem: CsrMatrix {
            nrows,
            ncols: rc.len(),
            val: arem_val,
            col: arem_col,
            ptr: arem_ptr,
        },
        az: CsrMatrix {
            nrows,
            ncols: nz,
            val: az_val,
            col: az_col,
            ptr: az_ptr,
        },
        plan,
        gather_cols,
        recv_cols,
        comm_matrix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::comm_threaded;
    use approx::assert_abs_diff_eq;

    /// Global tridiagonal (-1, 2, -1) as per-rank strips with global columns.
    fn tridiag_strip(part: &Partition) -> CsrMatrix {
        let n = part.global_rows();
        let begin = part.row_begin(part.rank());
        let mut triplets = Vec::new();
        for gi in begin..part.row_end(part.rank()) {
            let i = gi - begin;
            if gi > 0 {
                triplets.push((i, gi - 1, -1.0));
            }
            triplets.push((i, gi, 2.0));
            if gi + 1 < n {
                triplets.push((i, gi + 1, -1.0));
            }
        }
        CsrMatrix::from_entries(part.local_rows(), n, &triplets)
    }

    /// Dense A*Z reference for one strip: az[i][dv_start(p) + j] =
    /// sum_c astrip[i][c] * z(c, j) over columns owned by p.
    fn dense_az(part: &Partition, astrip: &CsrMatrix, z_global: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let nz = part.coarse_size();
        let mut out = vec![vec![0.0; nz]; astrip.nrows];
        for i in 0..astrip.nrows {
            for (c, v) in astrip.row(i) {
                let p = part.owner(c);
                let lc = c - part.row_begin(p);
                for j in 0..part.dv_size(p) {
                    out[i][part.coarse_index(p, j)] += v * z_global[p][lc * part.dv_size(p) + j];
                }
            }
        }
        out
    }

    fn az_row_dense(az: &CsrMatrix, i: usize, nz: usize) -> Vec<f64> {
        let mut row = vec![0.0; nz];
        for (c, v) in az.row(i) {
            row[c] += v;
        }
        row
    }

    #[test]
    fn single_rank_has_no_remote_part() {
        let comm = SingleProcessComm;
        let part = Partition::assemble(&comm, 6, 1).unwrap();
        let astrip = tridiag_strip(&part);
        let z = vec![vec![1.0; 6]];
        let asm = assemble(&comm, &part, &astrip, &z).unwrap();

        assert_eq!(asm.arem.nnz(), 0);
        assert_eq!(asm.aloc.nnz(), astrip.nnz());
        assert!(asm.plan.recv.nbr.is_empty());
        assert!(asm.plan.send.nbr.is_empty());
        assert!(asm.gather_cols.is_empty());

        // AZ = A * 1 = row sums.
        for i in 0..6 {
            let expected: f64 = astrip.row(i).map(|(_, v)| v).sum();
            assert_abs_diff_eq!(az_row_dense(&asm.az, i, 1)[0], expected, epsilon = 1e-14);
        }
    }

    #[test]
    fn two_ranks_classify_every_nonzero() {
        let results = comm_threaded::spawn(2, |comm| {
            let part = Partition::assemble(&comm, 4, 1).unwrap();
            let astrip = tridiag_strip(&part);
            let z = vec![vec![1.0; 4]];
            let asm = assemble(&comm, &part, &astrip, &z).unwrap();
            (astrip.nnz(), asm.aloc.nnz(), asm.arem.nnz(), asm.recv_cols.clone(), asm.gather_cols.clone())
        });

        for (strip_nnz, loc, rem, _, _) in &results {
            assert_eq!(loc + rem, *strip_nnz);
        }
        // Rank 0 owns rows 0..4 and needs column 4; rank 1 needs column 3.
        assert_eq!(results[0].3, vec![4]);
        assert_eq!(results[1].3, vec![3]);
        // Rank 0 stages its local row 3 for rank 1; rank 1 stages row 4 (local 0).
        assert_eq!(results[0].4, vec![3]);
        assert_eq!(results[1].4, vec![0]);
    }

    #[test]
    fn deflation_product_matches_dense_reference() {
        // 3 ranks, 4 rows each, two deflation vectors per rank with
        // row-dependent values so the remote exchange is actually exercised.
        let results = comm_threaded::spawn(3, |comm| {
            let nrows = 4;
            let ndv = 2;
            let part = Partition::assemble(&comm, nrows, ndv).unwrap();
            let astrip = tridiag_strip(&part);
            let z: Vec<Vec<f64>> = (0..ndv)
                .map(|j| {
                    (0..nrows)
                        .map(|i| 1.0 + (j as f64) * 0.5 + (i as f64) * 0.25 + comm.rank() as f64)
                        .collect()
                })
                .collect();
            let asm = assemble(&comm, &part, &astrip, &z).unwrap();

            // Pack z row-major (row, j) for the dense reference.
            let packed: Vec<f64> = (0..nrows)
                .flat_map(|i| (0..ndv).map(move |j| (i, j)))
                .map(|(i, j)| z[j][i])
                .collect();
            (part, astrip, asm, packed)
        });

        let z_global: Vec<Vec<f64>> = results.iter().map(|r| r.3.clone()).collect();
        for (part, astrip, asm, _) in &results {
            let reference = dense_az(part, astrip, &z_global);
            for i in 0..astrip.nrows {
                let got = az_row_dense(&asm.az, i, part.coarse_size());
                for c in 0..part.coarse_size() {
                    assert_abs_diff_eq!(got[c], reference[i][c], epsilon = 1e-12);
                }
            }
            // Conventional CSR after the final rotation.
            assert_eq!(asm.az.ptr[0], 0);
            assert_eq!(*asm.az.ptr.last().unwrap(), asm.az.nnz());
        }
    }

    #[test]
    fn rows_without_local_or_remote_nonzeros() {
        // Rank 0 row 0 has no remote entries; rank 1 row 2 (global) has no
        // local entries; rank 0 row 1 is completely empty.
        let results = comm_threaded::spawn(2, |comm| {
            let part = Partition::assemble(&comm, 2, 1).unwrap();
            let triplets: Vec<(usize, usize, f64)> = if comm.rank() == 0 {
                vec![(0, 0, 2.0)]
            } else {
                vec![(0, 1, -1.0), (1, 3, 2.0)]
            };
            let astrip = CsrMatrix::from_entries(2, 4, &triplets);
            let z = vec![vec![1.0; 2]];
            let asm = assemble(&comm, &part, &astrip, &z).unwrap();
            asm
        });

        let r0 = &results[0];
        assert_eq!(r0.aloc.ptr, vec![0, 1, 1]);
        assert_eq!(r0.arem.ptr, vec![0, 0, 0]);
        assert_eq!(r0.az.ptr, vec![0, 1, 1]);

        let r1 = &results[1];
        // Global row 2 has only the remote entry at column 1.
        assert_eq!(r1.aloc.ptr, vec![0, 0, 1]);
        assert_eq!(r1.arem.ptr, vec![0, 1, 1]);
        assert_eq!(r1.recv_cols, vec![1]);
    }
}
