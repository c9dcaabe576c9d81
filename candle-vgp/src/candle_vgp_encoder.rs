use crate::candle_aux_layers::GaussianHeads;
use crate::candle_model_traits::GaussianEncoderT;
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// log-variance heads stay within this range
pub const LNVAR_RANGE: (f64, f64) = (-8., 8.);

///
/// q(ξ|x): observation to the auxiliary GP query point
///
pub struct XiEncoder {
    n_features: usize,
    n_xi: usize,
    heads: GaussianHeads,
}

impl XiEncoder {
    /// * `n_features` - x dim
    /// * `n_hidden` - hidden width
    /// * `n_xi` - ξ dim (GP input dim)
    pub fn new(n_features: usize, n_hidden: usize, n_xi: usize, vs: VarBuilder) -> Result<Self> {
        let heads = GaussianHeads::new(
            n_features,
            &[n_hidden],
            n_xi,
            n_xi,
            Some(LNVAR_RANGE),
            vs.pp("nn.enc.xi"),
        )?;
        Ok(Self {
            n_features,
            n_xi,
            heads,
        })
    }
}

impl GaussianEncoderT for XiEncoder {
    fn gaussian_params(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        self.heads.forward(x_nd)
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_xi
    }
}

///
/// q(z|f): GP feature to the structured latent; the second head is
/// the packed lower Cholesky factor coupling the latent blocks
///
pub struct LatentEncoder {
    n_gp_out: usize,
    n_latent: usize,
    heads: GaussianHeads,
}

impl LatentEncoder {
    /// * `n_gp_out` - f dim
    /// * `n_hidden` - hidden width
    /// * `n_latent` - z dim
    /// * `n_covh` - packed factor length
    pub fn new(
        n_gp_out: usize,
        n_hidden: usize,
        n_latent: usize,
        n_covh: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let heads = GaussianHeads::new(
            n_gp_out,
            &[n_hidden],
            n_latent,
            n_covh,
            None,
            vs.pp("nn.enc.z"),
        )?;
        Ok(Self {
            n_gp_out,
            n_latent,
            heads,
        })
    }
}

impl GaussianEncoderT for LatentEncoder {
    fn gaussian_params(&self, f_no: &Tensor) -> Result<(Tensor, Tensor)> {
        self.heads.forward(f_no)
    }

    fn dim_obs(&self) -> usize {
        self.n_gp_out
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

/// Smoothing distribution r(ξ, f | x, z), diagonal Gaussian in each block
pub struct SmoothingParams {
    pub xi_mean: Tensor,
    pub xi_lnvar: Tensor,
    pub f_mean: Tensor,
    pub f_lnvar: Tensor,
}

///
/// r(ξ, f | x, z): both heads are `n_xi + n_gp_out` wide and split
/// into the ξ block and the f block
///
pub struct SmoothingEncoder {
    n_features: usize,
    n_latent: usize,
    n_xi: usize,
    n_gp_out: usize,
    heads: GaussianHeads,
}

impl SmoothingEncoder {
    pub fn new(
        n_features: usize,
        n_latent: usize,
        n_hidden: usize,
        n_xi: usize,
        n_gp_out: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let heads = GaussianHeads::new(
            n_features + n_latent,
            &[n_hidden],
            n_xi + n_gp_out,
            n_xi + n_gp_out,
            Some(LNVAR_RANGE),
            vs.pp("nn.enc.r"),
        )?;
        Ok(Self {
            n_features,
            n_latent,
            n_xi,
            n_gp_out,
            heads,
        })
    }

    /// * `x_nd` - observed data
    /// * `z_nk` - latent sample
    pub fn forward(&self, x_nd: &Tensor, z_nk: &Tensor) -> Result<SmoothingParams> {
        let xz = Tensor::cat(&[x_nd, z_nk], 1)?;
        let (mean, lnvar) = self.heads.forward(&xz)?;
        Ok(SmoothingParams {
            xi_mean: mean.narrow(1, 0, self.n_xi)?,
            f_mean: mean.narrow(1, self.n_xi, self.n_gp_out)?,
            xi_lnvar: lnvar.narrow(1, 0, self.n_xi)?,
            f_lnvar: lnvar.narrow(1, self.n_xi, self.n_gp_out)?,
        })
    }

    pub fn dim_obs(&self) -> usize {
        self.n_features + self.n_latent
    }
}
