use crate::error::{Result, VgpError};
use candle_core::{Device, Tensor};

///
/// Automatic relevance determination kernel
///
/// K(i,j) = σ² exp(-0.5 * Σ_k w(k) (x(i,k) - y(j,k))^2)
///
/// `σ²` and `w` are fixed hyperparameters.
///
pub struct ArdKernel {
    sigma2: f64,
    w_k: Tensor,
    dim: usize,
}

impl ArdKernel {
    /// uniform weights `w(k) = 1/dim`
    pub fn uniform(dim: usize, sigma2: f64, device: &Device) -> Result<Self> {
        let w = vec![1. / dim as f32; dim];
        Self::new(&w, sigma2, device)
    }

    /// * `weights` - non-negative relevance weights, one per input dim
    /// * `sigma2` - positive signal variance
    pub fn new(weights: &[f32], sigma2: f64, device: &Device) -> Result<Self> {
        if weights.is_empty() || weights.iter().any(|&w| !(w >= 0.)) {
            return Err(VgpError::shape("ARD weights must be non-empty and non-negative"));
        }
        if !(sigma2 > 0.) {
            return Err(VgpError::shape(format!("σ² must be positive, got {}", sigma2)));
        }
        let dim = weights.len();
        Ok(Self {
            sigma2,
            w_k: Tensor::from_slice(weights, dim, device)?,
            dim,
        })
    }

    ///
    /// Kernel matrix between the rows of `x_nk` and `y_mk`
    ///
    /// * `x_nk` - `n x k`
    /// * `y_mk` - `m x k`
    ///
    /// Returns `n x m`
    ///
    pub fn forward(&self, x_nk: &Tensor, y_mk: &Tensor) -> Result<Tensor> {
        let (_, kx) = x_nk.dims2()?;
        let (_, ky) = y_mk.dims2()?;
        if kx != self.dim || ky != self.dim {
            return Err(VgpError::shape(format!(
                "ARD kernel over {} dims got inputs of width {} and {}",
                self.dim, kx, ky
            )));
        }

        let w_k = self.w_k.to_dtype(x_nk.dtype())?;
        let diff_nmk = x_nk.unsqueeze(1)?.broadcast_sub(&y_mk.unsqueeze(0)?)?;
        let dist_nm = diff_nmk.sqr()?.broadcast_mul(&w_k)?.sum(2)?;
        Ok(dist_nm.affine(-0.5, 0.)?.exp()?.affine(self.sigma2, 0.)?)
    }

    /// `K(i,i)` for every row of `x_nk`, without forming the matrix
    pub fn diag(&self, x_nk: &Tensor) -> Result<Tensor> {
        let (n, _) = x_nk.dims2()?;
        Ok(Tensor::ones(n, x_nk.dtype(), x_nk.device())?.affine(self.sigma2, 0.)?)
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}
