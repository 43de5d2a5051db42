//! Rank-revealing orthogonal split of the constraint input Jacobian.
//!
//! Given the stacked constraint block `C·δx + D·δu + h = 0` with
//! `D ∈ ℝ^{nc×nu}`, the constraint handler needs an orthogonal `Q` whose
//! leading `r = rank(D)` columns span the range of `D`: rotating the block
//! by `Qᵀ` separates the rows the stage inputs can satisfy from the rows
//! that must propagate to the previous stage.
//!
//! Three factorizations are supported. SVD is the most robust rank
//! detector; column-pivoted QR is cheaper; the complete orthogonal
//! decomposition shares its left orthogonal factor and pivot pattern with
//! the pivoted QR step, so the two arrive at the same split.
//!
//! The rank rule follows the pivot-threshold policy: pivots (singular
//! values, or magnitudes of the R diagonal) are compared against
//! `threshold × max_pivot`, and a max pivot below the absolute threshold
//! forces rank zero so near-zero blocks are not given spurious partial
//! rank.

use nalgebra::DMatrix;

use super::{from_faer, to_faer, ConstrDecomp, LinAlgError, LinAlgResult};

/// Full orthogonal factor and numerical rank of a constraint input block.
#[derive(Debug, Clone)]
pub struct RankSplit {
    /// Orthogonal factor, `nc × nc`; columns `0..rank` span the range of `D`
    pub q: DMatrix<f64>,
    /// Numerical rank of `D`
    pub rank: usize,
}

/// Decompose `d` (`nc × nu`) and detect its numerical rank.
pub fn rank_revealing_split(
    d: &DMatrix<f64>,
    decomp: ConstrDecomp,
    threshold: f64,
) -> LinAlgResult<RankSplit> {
    let nc = d.nrows();
    if nc == 0 {
        return Ok(RankSplit {
            q: DMatrix::zeros(0, 0),
            rank: 0,
        });
    }

    let d_f = to_faer(d);

    match decomp {
        ConstrDecomp::Svd => {
            let svd = d_f.as_ref().svd().map_err(|e| {
                LinAlgError::FactorizationFailed("singular value decomposition of D".to_string())
                    .log_with_source(e)
            })?;
            let q = from_faer(svd.U());

            let sv = svd.S().column_vector();
            let n_sv = d.nrows().min(d.ncols());
            let sigma_max = if n_sv > 0 { sv[0] } else { 0.0 };

            let rank = if sigma_max < threshold {
                0
            } else {
                (0..n_sv).take_while(|&i| sv[i] > threshold * sigma_max).count()
            };

            Ok(RankSplit { q, rank })
        }
        ConstrDecomp::Qr | ConstrDecomp::Cod => {
            let qr = d_f.as_ref().col_piv_qr();
            let q = from_faer(qr.compute_Q().as_ref());
            let r = qr.R();

            let n_piv = d.nrows().min(d.ncols());
            let mut max_pivot = 0.0_f64;
            for i in 0..n_piv {
                max_pivot = max_pivot.max(r[(i, i)].abs());
            }

            let rank = if max_pivot < threshold {
                0
            } else {
                (0..n_piv)
                    .take_while(|&i| r[(i, i)].abs() > threshold * max_pivot)
                    .count()
            };

            Ok(RankSplit { q, rank })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    const THR: f64 = 1e-12;

    const ALL: [ConstrDecomp; 3] = [ConstrDecomp::Svd, ConstrDecomp::Qr, ConstrDecomp::Cod];

    fn assert_orthogonal(q: &DMatrix<f64>) {
        let gram = q.transpose() * q;
        let eye = DMatrix::identity(q.ncols(), q.ncols());
        assert!((gram - eye).amax() < 1e-10, "Q is not orthogonal");
    }

    #[test]
    fn test_full_rank_wide_block() -> Result<(), Box<dyn std::error::Error>> {
        // 1 constraint row, 2 inputs: always satisfiable
        let d = dmatrix![1.0, -2.0];
        for decomp in ALL {
            let split = rank_revealing_split(&d, decomp, THR)?;
            assert_eq!(split.rank, 1, "{decomp}");
            assert_eq!(split.q.nrows(), 1);
            assert_orthogonal(&split.q);
        }
        Ok(())
    }

    #[test]
    fn test_tall_block_limits_rank_to_inputs() -> Result<(), Box<dyn std::error::Error>> {
        // 3 constraint rows, 1 input: at most one row satisfiable
        let d = dmatrix![1.0; 0.5; -1.0];
        for decomp in ALL {
            let split = rank_revealing_split(&d, decomp, THR)?;
            assert_eq!(split.rank, 1, "{decomp}");
            assert_eq!(split.q.nrows(), 3);
            assert_eq!(split.q.ncols(), 3);
            assert_orthogonal(&split.q);

            // trailing columns must annihilate D: Q2ᵀ·D = 0
            let q2 = split.q.columns(1, 2);
            assert!((q2.transpose() * &d).amax() < 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_duplicate_rows_are_rank_deficient() -> Result<(), Box<dyn std::error::Error>> {
        let d = dmatrix![1.0, 0.0; 1.0, 0.0];
        for decomp in ALL {
            let split = rank_revealing_split(&d, decomp, THR)?;
            assert_eq!(split.rank, 1, "{decomp}");
        }
        Ok(())
    }

    #[test]
    fn test_zero_block_has_rank_zero() -> Result<(), Box<dyn std::error::Error>> {
        let d = DMatrix::zeros(2, 3);
        for decomp in ALL {
            let split = rank_revealing_split(&d, decomp, THR)?;
            assert_eq!(split.rank, 0, "{decomp}");
            assert_eq!(split.q.nrows(), 2);
        }
        Ok(())
    }

    #[test]
    fn test_near_zero_block_gets_no_partial_rank() -> Result<(), Box<dyn std::error::Error>> {
        // both pivots below the absolute threshold: rank must collapse to 0,
        // not 1, even though the ratio test alone would keep one pivot
        let d = dmatrix![1e-14, 0.0; 0.0, 1e-16];
        for decomp in ALL {
            let split = rank_revealing_split(&d, decomp, 1e-12)?;
            assert_eq!(split.rank, 0, "{decomp}");
        }
        Ok(())
    }

    #[test]
    fn test_range_space_is_spanned_by_leading_columns() -> Result<(), Box<dyn std::error::Error>> {
        let d = dmatrix![1.0, 2.0; 2.0, 4.0; 0.0, 1.0];
        for decomp in ALL {
            let split = rank_revealing_split(&d, decomp, THR)?;
            assert_eq!(split.rank, 2, "{decomp}");
            // residual of projecting D onto span(Q1) must vanish
            let q1 = split.q.columns(0, split.rank);
            let proj = &q1 * (q1.transpose() * &d);
            assert!((proj - &d).amax() < 1e-10, "{decomp}");
        }
        Ok(())
    }

    #[test]
    fn test_empty_block() -> Result<(), Box<dyn std::error::Error>> {
        let d = DMatrix::zeros(0, 2);
        let split = rank_revealing_split(&d, ConstrDecomp::Svd, THR)?;
        assert_eq!(split.rank, 0);
        assert_eq!(split.q.nrows(), 0);
        Ok(())
    }
}
