use faer::{
    linalg::triangular_solve::solve_lower_triangular_in_place, Col, Mat, Par, Scale, Side,
};
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;

/// Lower Cholesky factor of a symmetric positive-definite matrix.
///
/// Returns `None` if the matrix is not numerically positive-definite or
/// contains non-finite values.
pub(crate) fn cholesky(mat: &Mat<f64>) -> Option<Mat<f64>> {
    if !mat_all_finite(mat) {
        return None;
    }
    let llt = mat.llt(Side::Lower).ok()?;
    let factor = llt.L().to_owned();
    let ok = (0..factor.nrows()).all(|i| {
        let val = factor[(i, i)];
        val.is_finite() && val > 0.
    });
    ok.then_some(factor)
}

/// `log(det(A))` given the lower Cholesky factor of `A`.
pub(crate) fn log_det_from_cholesky(factor: &Mat<f64>) -> f64 {
    2. * (0..factor.nrows())
        .map(|i| factor[(i, i)].ln())
        .sum::<f64>()
}

/// Squared norm of `L^{-1} diff`, the Mahalanobis distance of `diff`
/// under the covariance `L L^T`.
pub(crate) fn mahalanobis_sq(factor: &Mat<f64>, diff: &[f64]) -> f64 {
    let n = diff.len();
    assert!(factor.nrows() == n);
    let mut z = Mat::from_fn(n, 1, |i, _| diff[i]);
    solve_lower_triangular_in_place(factor.as_ref(), z.as_mut(), Par::Seq);
    z.as_ref().squared_norm_l2()
}

/// Write `center + scale * L z` into `out`, with `z` a standard normal draw.
pub(crate) fn correlated_gaussian<R: Rng + ?Sized>(
    rng: &mut R,
    factor: &Mat<f64>,
    scale: f64,
    center: &[f64],
    out: &mut [f64],
) {
    let n = center.len();
    assert!(out.len() == n);
    let z = Col::<f64>::from_fn(n, |_| rng.sample(StandardNormal));
    let draw = Scale(scale) * (factor * &z);
    izip!(out.iter_mut(), center.iter(), draw.iter()).for_each(|(out, center, draw)| {
        *out = center + draw;
    });
}

pub(crate) fn mat_all_finite(mat: &Mat<f64>) -> bool {
    let mut ok = true;
    faer::zip!(mat).for_each(|faer::unzip!(val)| ok &= val.is_finite());
    ok
}

pub(crate) fn is_symmetric(mat: &Mat<f64>, tol: f64) -> bool {
    let n = mat.nrows();
    mat.ncols() == n
        && (0..n).all(|i| {
            (0..i).all(|j| {
                let (a, b) = (mat[(i, j)], mat[(j, i)]);
                (a - b).abs() <= tol * a.abs().max(b.abs()).max(1.)
            })
        })
}

/// Build a dense matrix from a row-major slice.
pub(crate) fn mat_from_row_major(n: usize, values: &[f64]) -> Mat<f64> {
    assert!(values.len() == n * n);
    Mat::from_fn(n, n, |i, j| values[i * n + j])
}

/// `log(exp(a) - exp(b))` for `a >= b`.
#[inline]
pub(crate) fn logsubexp(a: f64, b: f64) -> f64 {
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a <= b {
        return f64::NEG_INFINITY;
    }
    a + (-(b - a).exp()).ln_1p()
}
