use crate::candle_linalg::{dense_cholesky, dense_inverse, dmatrix_to_tensor};
use crate::error::{Result, VgpError};
use candle_core::{DType, Device, Tensor};
use log::debug;
use nalgebra::DMatrix;

///
/// Static GP prior coupling the `t_dim` latent blocks. Built once;
/// its factor, inverse and log-determinant are shared read-only by
/// every forward pass and every KL evaluation.
///
/// Tensors are kept in `f64`; callers cast to their working dtype.
///
pub struct PriorKernel {
    k_tt: Tensor,
    kh_tt: Tensor,
    k_inv_tt: Tensor,
    log_det: f64,
    t_dim: usize,
}

impl PriorKernel {
    ///
    /// Squared-exponential kernel over `t_dim` evenly spaced phases
    /// `2k / t_dim`, k = 1..t_dim
    ///
    /// K(i,j) = exp(-(t_i - t_j)^2 / (2 ℓ^2)) + jitter * 1{i = j}
    ///
    /// * `t_dim` - number of phase points
    /// * `lengthscale` - ℓ
    /// * `jitter` - diagonal ridge
    ///
    pub fn periodic_phases(
        t_dim: usize,
        lengthscale: f64,
        jitter: f64,
        device: &Device,
    ) -> Result<Self> {
        if t_dim == 0 || !(lengthscale > 0.) {
            return Err(VgpError::shape(format!(
                "prior kernel needs t_dim > 0 and ℓ > 0, got {} and {}",
                t_dim, lengthscale
            )));
        }
        let phases: Vec<f64> = (1..=t_dim)
            .map(|k| 2. * k as f64 / t_dim as f64)
            .collect();
        let denom = 2. * lengthscale * lengthscale;

        let k = DMatrix::from_fn(t_dim, t_dim, |i, j| {
            let delta = phases[i] - phases[j];
            let ridge = if i == j { jitter } else { 0. };
            (-delta * delta / denom).exp() + ridge
        });

        Self::from_dense(&k, device)
    }

    /// Wrap an arbitrary symmetric positive definite matrix
    pub fn from_dense(k: &DMatrix<f64>, device: &Device) -> Result<Self> {
        if !k.is_square() || k.nrows() == 0 {
            return Err(VgpError::shape(format!(
                "prior kernel must be square, got {} x {}",
                k.nrows(),
                k.ncols()
            )));
        }
        if (k - k.transpose()).amax() > 1e-10 {
            return Err(VgpError::shape("prior kernel must be symmetric"));
        }

        let kh = dense_cholesky(k)?;
        let k_inv = dense_inverse(k)?;
        let log_det = 2. * kh.diagonal().iter().map(|x| x.ln()).sum::<f64>();

        debug!("prior kernel {} x {}, log det {:.4}", k.nrows(), k.ncols(), log_det);

        Ok(Self {
            k_tt: dmatrix_to_tensor(k, DType::F64, device)?,
            kh_tt: dmatrix_to_tensor(&kh, DType::F64, device)?,
            k_inv_tt: dmatrix_to_tensor(&k_inv, DType::F64, device)?,
            log_det,
            t_dim: k.nrows(),
        })
    }

    pub fn kernel(&self) -> &Tensor {
        &self.k_tt
    }

    /// lower Cholesky factor `Kh`, `Kh Khᵀ = K`
    pub fn cholesky(&self) -> &Tensor {
        &self.kh_tt
    }

    pub fn inverse(&self) -> &Tensor {
        &self.k_inv_tt
    }

    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    pub fn dim(&self) -> usize {
        self.t_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_linalg::tensor_to_dmatrix;

    #[test]
    fn prior_kernel_is_positive_definite() -> Result<()> {
        let prior = PriorKernel::periodic_phases(4, 2f64.sqrt(), 1e-4, &Device::Cpu)?;
        let k = tensor_to_dmatrix(prior.kernel())?;
        let kh = tensor_to_dmatrix(prior.cholesky())?;

        assert_eq!(prior.dim(), 4);
        approx::assert_abs_diff_eq!(k.clone(), k.transpose(), epsilon = 1e-7);
        approx::assert_abs_diff_eq!(&kh * kh.transpose(), k.clone(), epsilon = 1e-10);

        let eigen = k.clone().symmetric_eigen();
        assert!(eigen.eigenvalues.iter().all(|&x| x > 0.));

        let expected = k.determinant().ln();
        approx::assert_abs_diff_eq!(prior.log_det(), expected, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn prior_kernel_entries() -> Result<()> {
        let prior = PriorKernel::periodic_phases(2, 2f64.sqrt(), 1e-4, &Device::Cpu)?;
        let k = prior.kernel().to_vec2::<f64>()?;
        // phases 1 and 2, exp(-1/4)
        approx::assert_abs_diff_eq!(k[0][1], (-0.25f64).exp(), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(k[1][1], 1.0001, epsilon = 1e-12);

        let eye = prior.kernel().matmul(prior.inverse())?.to_vec2::<f64>()?;
        approx::assert_abs_diff_eq!(eye[0][0], 1., epsilon = 1e-8);
        approx::assert_abs_diff_eq!(eye[0][1], 0., epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn indefinite_prior_is_rejected() {
        let k = DMatrix::from_row_slice(2, 2, &[1., 2., 2., 1.]);
        assert!(matches!(
            PriorKernel::from_dense(&k, &Device::Cpu),
            Err(VgpError::SingularMatrix(_))
        ));
    }
}
