use crate::candle_aux_layers::GaussianHeads;
use crate::candle_loss_functions::{bernoulli_nll_with_logits, gaussian_nll};
use crate::candle_model_traits::{DecodedX, DecoderModuleT};
use crate::candle_vgp_encoder::LNVAR_RANGE;
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::ops::sigmoid;
use candle_nn::VarBuilder;

/// Likelihood family of the observed data
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ReconDist {
    /// diagonal Gaussian with learned log-variance
    Gauss,
    /// Bernoulli with logits in the mean head
    Bce,
}

///
/// p(x|z): `ReLU(Linear(z))` then (mean or logits, log-variance)
///
pub struct VgpDecoder {
    n_features: usize,
    n_latent: usize,
    heads: GaussianHeads,
}

impl VgpDecoder {
    /// * `n_latent` - z dim
    /// * `n_hidden` - hidden width
    /// * `n_features` - x dim
    pub fn new(n_latent: usize, n_hidden: usize, n_features: usize, vs: VarBuilder) -> Result<Self> {
        let heads = GaussianHeads::new(
            n_latent,
            &[n_hidden],
            n_features,
            n_features,
            Some(LNVAR_RANGE),
            vs.pp("nn.dec"),
        )?;
        Ok(Self {
            n_features,
            n_latent,
            heads,
        })
    }

    /// mean on the data scale, `sigmoid` of the logits for `Bce`
    pub fn mean_from_raw(raw_nd: &Tensor, dist: ReconDist) -> Result<Tensor> {
        match dist {
            ReconDist::Gauss => Ok(raw_nd.clone()),
            ReconDist::Bce => Ok(sigmoid(raw_nd)?),
        }
    }
}

impl DecoderModuleT for VgpDecoder {
    fn forward(&self, z_nk: &Tensor) -> Result<(Tensor, Tensor)> {
        self.heads.forward(z_nk)
    }

    fn forward_with_nll(
        &self,
        z_nk: &Tensor,
        x_nd: &Tensor,
        dist: ReconDist,
    ) -> Result<(DecodedX, Tensor)> {
        let (raw_nd, lnvar_nd) = self.forward(z_nk)?;

        let nll = match dist {
            ReconDist::Gauss => gaussian_nll(x_nd, &raw_nd, &lnvar_nd)?,
            ReconDist::Bce => bernoulli_nll_with_logits(x_nd, &raw_nd)?,
        };

        let mean = Self::mean_from_raw(&raw_nd, dist)?;
        Ok((
            DecodedX {
                mean,
                lnvar: lnvar_nd,
            },
            nll,
        ))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn bce_mean_is_probability() -> Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dec = VgpDecoder::new(40, 32, 16, vs)?;

        let z = Tensor::randn(0f32, 3., (5, 40), &Device::Cpu)?;
        let x = Tensor::zeros((5, 16), DType::F32, &Device::Cpu)?;
        let (recon, nll) = dec.forward_with_nll(&z, &x, ReconDist::Bce)?;

        assert_eq!(recon.mean.dims(), &[5, 16]);
        let probs = recon.mean.flatten_all()?.to_vec1::<f32>()?;
        assert!(probs.iter().all(|&p| (0. ..=1.).contains(&p)));
        assert!(nll.to_scalar::<f32>()? >= 0.);
        Ok(())
    }
}
