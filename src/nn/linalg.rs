//! Dense linear algebra for the invertible 1x1 convolution.
//!
//! Weight matrices have one row per channel and are only touched on the CPU
//! at init time or when inverting weights for sampling; nalgebra does the
//! decompositions. The log-determinant used in training stays on the burn
//! side so it is differentiable.

use burn::tensor::{backend::Backend, Tensor};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

/// Random orthogonal matrix: QR of a standard normal draw.
pub fn random_orthogonal<R: Rng>(n: usize, rng: &mut R) -> DMatrix<f64> {
    let draw = DMatrix::<f64>::from_fn(n, n, |_, _| rng.sample(StandardNormal));
    let qr = draw.qr();
    // Sign of R's diagonal folded into Q keeps the draw uniform over O(n)
    let signs = qr.r().diagonal().map(|d| if d < 0.0 { -1.0 } else { 1.0 });
    qr.q() * DMatrix::from_diagonal(&signs)
}

/// Factors of `A = P L U`
#[derive(Debug, Clone)]
pub struct LuFactors {
    pub p: DMatrix<f64>,
    /// Unit lower triangular
    pub l: DMatrix<f64>,
    pub u: DMatrix<f64>,
}

/// LU decomposition with partial pivoting, `A = P L U`.
pub fn lu_decompose(a: &DMatrix<f64>) -> LuFactors {
    let n = a.nrows();
    let lu = a.clone().lu();
    // nalgebra factors `P' A = L U`; undoing its row swaps on the identity gives P = P'^-1
    let mut p = DMatrix::identity(n, n);
    lu.p().inv_permute_rows(&mut p);
    LuFactors {
        p,
        l: lu.l(),
        u: lu.u(),
    }
}

/// Inverse, `None` when the matrix is singular.
pub fn invert(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    a.clone().try_inverse()
}

/// `ln |det A|`
pub fn log_abs_det(a: &DMatrix<f64>) -> f64 {
    a.determinant().abs().ln()
}

/// Differentiable `ln |det W|` for a square weight tensor.
///
/// Eliminates one row/column at a time through the Schur complement, so the
/// log-determinant stays in the autodiff graph. No pivoting: fine for the
/// well-conditioned, orthogonally initialised 1x1 conv weights.
pub fn log_abs_det_tensor<B: Backend>(w: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = w.dims();
    let device = w.device();
    let mut logdet = Tensor::<B, 1>::zeros([1], &device);
    let mut a = w;

    for k in 0..n {
        let size = n - k;
        let pivot = a.clone().slice([0..1, 0..1]);
        logdet = logdet + pivot.clone().abs().log().reshape([1]);
        if size == 1 {
            break;
        }
        let col = a.clone().slice([1..size, 0..1]);
        let row = a.clone().slice([0..1, 1..size]);
        let rest = a.slice([1..size, 1..size]);
        a = rest - col.matmul(row) / pivot;
    }
    logdet
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_random_orthogonal_is_orthogonal() {
        let mut rng = StdRng::seed_from_u64(7);
        let q = random_orthogonal(6, &mut rng);
        let eye = q.transpose() * &q;
        assert!((eye - DMatrix::<f64>::identity(6, 6)).abs().max() < 1e-9);
        assert!(log_abs_det(&q).abs() < 1e-9);
    }

    #[test]
    fn test_lu_reconstructs_matrix() {
        let a = DMatrix::from_row_slice(3, 3, &[0.0, 2.0, 1.0, 1.0, 1.0, 0.0, 3.0, 0.0, 4.0]);
        let lu = lu_decompose(&a);
        let rebuilt = &lu.p * &lu.l * &lu.u;
        assert!((rebuilt - &a).abs().max() < 1e-12);
        for i in 0..3 {
            assert_eq!(lu.l[(i, i)], 1.0);
            for j in (i + 1)..3 {
                assert_eq!(lu.l[(i, j)], 0.0);
                assert!(lu.u[(j, i)].abs() < 1e-12);
            }
        }
        // P is a permutation matrix
        assert!(lu.p.iter().all(|&v| v == 0.0 || v == 1.0));
        assert_eq!(lu.p.row_sum().iter().sum::<f64>(), 3.0);
    }

    #[test]
    fn test_invert_identity_product() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 7.0, 2.0, 6.0]);
        let inv = invert(&a).unwrap();
        assert!((&a * inv - DMatrix::<f64>::identity(2, 2)).abs().max() < 1e-12);
        assert!(invert(&DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0])).is_none());
    }

    #[test]
    fn test_tensor_logdet_matches_determinant() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 5;
        // Scale rows so the determinant is not trivially one
        let scaled = DMatrix::from_fn(n, n, {
            let q = random_orthogonal(n, &mut rng);
            move |i, j| q[(i, j)] * (1.0 + i as f64 * 0.5)
        });
        let expected = log_abs_det(&scaled);

        let device = Default::default();
        let data: Vec<f32> = scaled.transpose().iter().map(|v| *v as f32).collect();
        let w = Tensor::<NdArray, 1>::from_floats(data.as_slice(), &device).reshape([n, n]);
        let got = log_abs_det_tensor(w).into_scalar() as f64;
        assert!((got - expected).abs() < 1e-3, "got {got}, expected {expected}");
    }
}
