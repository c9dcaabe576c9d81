use crate::candle_ard_kernel::ArdKernel;
use crate::candle_linalg::inverse;
use crate::candle_noise::randn_like;
use crate::error::{Result, VgpError};
use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use rand::Rng;

/// Negative posterior variance tolerated as round-off, relative to σ²
pub const VARIANCE_TOLERANCE: f64 = 1e-3;

/// Posterior variance floor after the round-off check
pub const MIN_VARIANCE: f64 = 1e-6;

///
/// Output of the GP stage. `f()` is the sample in training and the
/// posterior mean in evaluation.
///
pub enum GpDraw {
    Sampled { f: Tensor, mean: Tensor, var: Tensor },
    Mean { mean: Tensor, var: Tensor },
}

impl GpDraw {
    pub fn f(&self) -> &Tensor {
        match self {
            GpDraw::Sampled { f, .. } => f,
            GpDraw::Mean { mean, .. } => mean,
        }
    }

    /// posterior mean `(b, f_out)`
    pub fn mean(&self) -> &Tensor {
        match self {
            GpDraw::Sampled { mean, .. } | GpDraw::Mean { mean, .. } => mean,
        }
    }

    /// pointwise posterior variance `(b, 1)`, shared by all outputs
    pub fn var(&self) -> &Tensor {
        match self {
            GpDraw::Sampled { var, .. } | GpDraw::Mean { var, .. } => var,
        }
    }

    /// `log var` broadcast to the width of the mean
    pub fn lnvar(&self) -> Result<Tensor> {
        Ok(self.var().log()?.broadcast_as(self.mean().shape())?.contiguous()?)
    }
}

///
/// Pseudo-inputs `s` `(m, f_in)` and pseudo-outputs `t` `(m, f_out)`,
/// registered once as trainable variables `pseudo.input` and
/// `pseudo.output`
///
pub struct PseudoPoints {
    s_mi: Tensor,
    t_mo: Tensor,
}

impl PseudoPoints {
    pub fn new(num_pseudo: usize, n_input: usize, n_output: usize, vs: VarBuilder) -> Result<Self> {
        if num_pseudo == 0 {
            return Err(VgpError::shape("need at least one pseudo point"));
        }
        let init = Init::Randn {
            mean: 0.,
            stdev: 1.,
        };
        let s_mi = vs.get_with_hints((num_pseudo, n_input), "pseudo.input", init)?;
        let t_mo = vs.get_with_hints((num_pseudo, n_output), "pseudo.output", init)?;
        Ok(Self { s_mi, t_mo })
    }

    pub fn inputs(&self) -> &Tensor {
        &self.s_mi
    }

    pub fn outputs(&self) -> &Tensor {
        &self.t_mo
    }

    pub fn len(&self) -> usize {
        self.s_mi.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

///
/// GP posterior at query points ξ given the pseudo data
///
/// A = K(ξ, s) K(s, s)⁻¹
/// mean = A t
/// var(i) = K(ξ_i, ξ_i) - Σ_j A(i,j) K(ξ_i, s_j)
///
pub struct GpReparam {
    kernel: ArdKernel,
    pseudo: PseudoPoints,
    jitter: f64,
}

impl GpReparam {
    pub fn new(kernel: ArdKernel, pseudo: PseudoPoints, jitter: f64) -> Result<Self> {
        if kernel.dim() != pseudo.inputs().dims()[1] {
            return Err(VgpError::shape(format!(
                "kernel over {} dims, pseudo inputs have {}",
                kernel.dim(),
                pseudo.inputs().dims()[1]
            )));
        }
        Ok(Self {
            kernel,
            pseudo,
            jitter,
        })
    }

    pub fn kernel(&self) -> &ArdKernel {
        &self.kernel
    }

    pub fn pseudo(&self) -> &PseudoPoints {
        &self.pseudo
    }

    /// posterior `(mean (b, f_out), var (b, 1))` at `xi_bi`
    pub fn posterior(&self, xi_bi: &Tensor) -> Result<(Tensor, Tensor)> {
        let s_mi = self.pseudo.inputs();
        let k_xs = self.kernel.forward(xi_bi, s_mi)?;
        let k_ss = self.kernel.forward(s_mi, s_mi)?;
        let k_ss_inv = inverse(&k_ss, self.jitter)?;

        let a_bm = k_xs.matmul(&k_ss_inv)?;
        let mean_bo = a_bm.matmul(self.pseudo.outputs())?;

        let explained = a_bm.mul(&k_xs)?.sum_keepdim(1)?;
        let prior_var = self.kernel.diag(xi_bi)?.unsqueeze(1)?;
        let var_b1 = self.guard_variance(&prior_var.sub(&explained)?)?;

        Ok((mean_bo, var_b1))
    }

    /// Reject clearly negative or non-finite variance, floor round-off
    fn guard_variance(&self, var_b1: &Tensor) -> Result<Tensor> {
        let tol = -VARIANCE_TOLERANCE * self.kernel.sigma2();
        let values: Vec<f64> = var_b1.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        if let Some(bad) = values.iter().find(|&&v| !v.is_finite() || v < tol) {
            return Err(VgpError::unstable(format!("GP posterior variance {:.3e}", bad)));
        }
        Ok(var_b1.maximum(MIN_VARIANCE)?)
    }

    ///
    /// * `xi_bi` - query points
    /// * `rng` - noise source
    /// * `train` - draw `f = mean + sqrt(var) ε`, else return the mean
    ///
    pub fn reparameterize<R>(&self, xi_bi: &Tensor, rng: &mut R, train: bool) -> Result<GpDraw>
    where
        R: Rng + ?Sized,
    {
        let (mean, var) = self.posterior(xi_bi)?;
        if !train {
            return Ok(GpDraw::Mean { mean, var });
        }
        let eps = randn_like(rng, &mean)?;
        let f = mean.add(&eps.broadcast_mul(&var.sqrt()?)?)?;
        Ok(GpDraw::Sampled { f, mean, var })
    }
}
