use crate::error::Result;
use candle_core::Tensor;

pub trait GaussianEncoderT {
    /// An encoder that spits out the two parameter blocks of a
    /// Gaussian (mean, log-variance or packed covariance factor)
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    ///
    /// # Returns `(mean_nk, second_nk)`
    fn gaussian_params(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// Reconstruction of the observed data
pub struct DecodedX {
    /// per-feature mean (Gaussian) or Bernoulli probability
    pub mean: Tensor,
    /// per-feature log-variance
    pub lnvar: Tensor,
}

pub trait DecoderModuleT {
    /// A decoder that spits out raw `(mean or logits, log-variance)`
    fn forward(&self, z_nk: &Tensor) -> Result<(Tensor, Tensor)>;

    /// A decoder that spits out reconstruction and negative
    /// log-likelihood averaged over the batch
    /// * `z_nk` - latent states
    /// * `x_nd` - observed data to validate with
    /// * `dist` - likelihood family
    fn forward_with_nll(
        &self,
        z_nk: &Tensor,
        x_nd: &Tensor,
        dist: crate::candle_vgp_decoder::ReconDist,
    ) -> Result<(DecodedX, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}
