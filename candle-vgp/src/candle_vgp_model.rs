use crate::candle_ard_kernel::ArdKernel;
use crate::candle_gp_reparameterize::{GpDraw, GpReparam, PseudoPoints};
use crate::candle_linalg::vech;
use crate::candle_loss_functions::*;
use crate::candle_model_traits::{DecoderModuleT, GaussianEncoderT};
use crate::candle_noise::randn;
use crate::candle_prior_kernel::PriorKernel;
use crate::candle_reparameterize::{reparameterize_lt, reparameterize_nm};
use crate::candle_vgp_config::VgpConfig;
use crate::candle_vgp_decoder::{ReconDist, VgpDecoder};
use crate::candle_vgp_encoder::{LatentEncoder, SmoothingEncoder, XiEncoder};
use crate::error::{Result, VgpError};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use log::info;
use rand::Rng;

///
/// Everything one pass of the model produces. Losses are scalars
/// averaged over the batch.
///
pub struct VgpOutput {
    /// `kl_block + kl_diag`
    pub kld_loss: Tensor,
    /// `recon_nll - xi_q_nll + xi_r_nll`
    pub nll_loss: Tensor,
    pub kl_block: Tensor,
    pub kl_diag: Tensor,
    pub recon_nll: Tensor,
    pub xi_q_nll: Tensor,
    pub xi_r_nll: Tensor,
    pub z_mean: Tensor,
    pub z_covh: Tensor,
    pub x_mean: Tensor,
    pub x_lnvar: Tensor,
}

impl VgpOutput {
    /// objective to minimize
    pub fn loss(&self) -> Result<Tensor> {
        Ok(self.kld_loss.add(&self.nll_loss)?)
    }

    /// `-(kld + nll)` as a plain number
    pub fn elbo(&self) -> Result<f32> {
        let loss = self.loss()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        Ok(-loss)
    }
}

///
/// Variational Gaussian process latent model
///
/// x → q(ξ|x) → ξ → GP(ξ; s, t) → f → q(z|f) → z → p(x|z)
///
/// with the smoothing network r(ξ, f | x, z) closing the loop for
/// the auxiliary terms of the bound.
///
pub struct VgpModel {
    config: VgpConfig,
    prior: PriorKernel,
    xi_encoder: XiEncoder,
    gp: GpReparam,
    z_encoder: LatentEncoder,
    r_encoder: SmoothingEncoder,
    decoder: VgpDecoder,
}

impl VgpModel {
    /// Will create these variables:
    ///
    /// * `pseudo.input`, `pseudo.output`
    /// * `nn.enc.xi.*`, `nn.enc.z.*`, `nn.enc.r.*`
    /// * `nn.dec.*`
    ///
    /// # Arguments
    /// * `config` - validated dimensions and hyperparameters
    /// * `vs` - variable builder
    pub fn new(config: &VgpConfig, vs: VarBuilder) -> Result<Self> {
        config.validate()?;
        let device = vs.device().clone();

        let prior = PriorKernel::periodic_phases(
            config.t_dim,
            config.prior_lengthscale,
            config.prior_jitter,
            &device,
        )?;

        let kernel = ArdKernel::uniform(config.f_in, config.sigma2, &device)?;
        let pseudo = PseudoPoints::new(config.num_pseudo, config.f_in, config.f_out, vs.clone())?;
        let gp = GpReparam::new(kernel, pseudo, config.gp_jitter)?;

        let xi_encoder = XiEncoder::new(config.x_dim, config.h_dim, config.f_in, vs.clone())?;
        let z_encoder = LatentEncoder::new(
            config.f_out,
            config.h_dim,
            config.z_dim(),
            config.covh_dim(),
            vs.clone(),
        )?;
        let r_encoder = SmoothingEncoder::new(
            config.x_dim,
            config.z_dim(),
            config.h_dim,
            config.f_in,
            config.f_out,
            vs.clone(),
        )?;
        let decoder = VgpDecoder::new(config.z_dim(), config.h_dim, config.x_dim, vs)?;

        let chain = [
            ("q(ξ|x)", xi_encoder.dim_obs(), config.x_dim, xi_encoder.dim_latent(), config.f_in),
            ("GP", gp.kernel().dim(), config.f_in, z_encoder.dim_obs(), config.f_out),
            ("q(z|f)", z_encoder.dim_latent(), config.z_dim(), decoder.dim_latent(), config.z_dim()),
            ("p(x|z)", decoder.dim_obs(), config.x_dim, r_encoder.dim_obs(), config.x_dim + config.z_dim()),
        ];
        if let Some((name, ..)) = chain
            .iter()
            .find(|(_, a, b, c, d)| a != b || c != d)
        {
            return Err(VgpError::shape(format!("{} does not fit its neighbours", name)));
        }

        info!(
            "VGP model: x {} -> ξ {} -> f {} -> z {} ({} blocks of {}), {} pseudo points",
            config.x_dim,
            config.f_in,
            config.f_out,
            config.z_dim(),
            config.t_dim,
            config.d2h_dim(),
            config.num_pseudo
        );

        Ok(Self {
            config: config.clone(),
            prior,
            xi_encoder,
            gp,
            z_encoder,
            r_encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &VgpConfig {
        &self.config
    }

    pub fn prior(&self) -> &PriorKernel {
        &self.prior
    }

    fn check_input(&self, x_nd: &Tensor) -> Result<()> {
        match x_nd.dims() {
            &[n, d] if n > 0 && d == self.config.x_dim => Ok(()),
            dims => Err(VgpError::shape(format!(
                "expected (batch, {}) input, got {:?}",
                self.config.x_dim, dims
            ))),
        }
    }

    /// ξ, the GP draw and the block latent parameters for a batch
    fn encode<R>(&self, x_nd: &Tensor, rng: &mut R, train: bool) -> Result<Encoded>
    where
        R: Rng + ?Sized,
    {
        self.check_input(x_nd)?;
        let (xi_mean, xi_lnvar) = self.xi_encoder.gaussian_params(x_nd)?;
        let xi = reparameterize_nm(&xi_mean, &xi_lnvar, rng, train)?;
        let gp_draw = self.gp.reparameterize(&xi, rng, train)?;
        let (z_mean, z_covh) = self.z_encoder.gaussian_params(gp_draw.f())?;
        let z = reparameterize_lt(&z_mean, &z_covh, self.config.t_dim, rng, train)?;
        Ok(Encoded {
            xi_mean,
            xi_lnvar,
            xi,
            gp_draw,
            z_mean,
            z_covh,
            z,
        })
    }

    ///
    /// Full pass with every term of the bound
    ///
    /// * `x_nd` - batch of observations `(b, x_dim)`
    /// * `dist` - likelihood of x
    /// * `rng` - noise for every stochastic stage
    /// * `train` - sample (true) or propagate means (false)
    ///
    pub fn forward_t<R>(&self, x_nd: &Tensor, dist: ReconDist, rng: &mut R, train: bool) -> Result<VgpOutput>
    where
        R: Rng + ?Sized,
    {
        let enc = self.encode(x_nd, rng, train)?;
        let r = self.r_encoder.forward(x_nd, &enc.z)?;

        let kl_block = block_gaussian_kl(&enc.z_mean, &enc.z_covh, &self.prior)?;
        let kl_diag = diag_gaussian_kl(
            enc.gp_draw.mean(),
            &enc.gp_draw.lnvar()?,
            &r.f_mean,
            &r.f_lnvar,
        )?;
        let kld_loss = kl_block.add(&kl_diag)?;
        ensure_finite(&kld_loss, "KL divergence")?;

        let (recon, recon_nll) = self.decoder.forward_with_nll(&enc.z, x_nd, dist)?;
        let xi_q_nll = gaussian_nll(&enc.xi, &enc.xi_mean, &enc.xi_lnvar)?;
        let xi_r_nll = gaussian_nll(&enc.xi, &r.xi_mean, &r.xi_lnvar)?;
        let nll_loss = recon_nll.sub(&xi_q_nll)?.add(&xi_r_nll)?;
        ensure_finite(&nll_loss, "negative log-likelihood")?;

        Ok(VgpOutput {
            kld_loss,
            nll_loss,
            kl_block,
            kl_diag,
            recon_nll,
            xi_q_nll,
            xi_r_nll,
            z_mean: enc.z_mean,
            z_covh: enc.z_covh,
            x_mean: recon.mean,
            x_lnvar: recon.lnvar,
        })
    }

    /// latent `z` `(b, z_dim)` for a batch of observations
    pub fn sample_z<R>(&self, x_nd: &Tensor, rng: &mut R, train: bool) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        Ok(self.encode(x_nd, rng, train)?.z)
    }

    /// `num_draws` latent draws from the prior N(vech(I) per block, K ⊗ I)
    pub fn sample_prior_z<R>(&self, num_draws: usize, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let device = self.device();
        let (t_dim, d2h_dim) = (self.config.t_dim, self.config.d2h_dim());
        let m0 = vech(&Tensor::eye(self.config.d_dim(), DType::F32, &device)?)?.reshape((1, 1, d2h_dim))?;
        let kh_tt = self.prior.cholesky().to_dtype(DType::F32)?;
        let eps = randn(rng, (num_draws, t_dim, d2h_dim), DType::F32, &device)?;
        let z = kh_tt.broadcast_matmul(&eps)?.broadcast_add(&m0)?;
        Ok(z.reshape((num_draws, self.config.z_dim()))?)
    }

    ///
    /// Decode `num_draws` prior latents and average
    ///
    /// Returns per-feature `(mean, variance)`, each of width `x_dim`.
    /// The variance is `exp` of the averaged log-variance for
    /// `Gauss` and `p (1 - p)` of the averaged probability for `Bce`.
    ///
    pub fn sample_x<R>(&self, dist: ReconDist, num_draws: usize, rng: &mut R) -> Result<(Tensor, Tensor)>
    where
        R: Rng + ?Sized,
    {
        if num_draws == 0 {
            return Err(VgpError::shape("need at least one draw"));
        }
        let z = self.sample_prior_z(num_draws, rng)?;
        let (raw, lnvar) = self.decoder.forward(&z)?;
        let mean = VgpDecoder::mean_from_raw(&raw, dist)?.mean(0)?;
        let var = match dist {
            ReconDist::Gauss => lnvar.mean(0)?.exp()?,
            ReconDist::Bce => mean.mul(&(mean.neg()? + 1.)?)?,
        };
        Ok((mean, var))
    }

    pub fn device(&self) -> Device {
        self.gp.pseudo().inputs().device().clone()
    }
}

struct Encoded {
    xi_mean: Tensor,
    xi_lnvar: Tensor,
    xi: Tensor,
    gp_draw: GpDraw,
    z_mean: Tensor,
    z_covh: Tensor,
    z: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_model(varmap: &VarMap) -> Result<VgpModel> {
        let vs = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        VgpModel::new(&VgpConfig::new(16, 32, 4), vs)
    }

    fn value(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn single_example_gauss_is_finite() -> Result<()> {
        let varmap = VarMap::new();
        let model = small_model(&varmap)?;
        let mut rng = StdRng::seed_from_u64(42);
        let x = Tensor::randn(0f32, 1., (1, 16), &Device::Cpu)?;

        let out = model.forward_t(&x, ReconDist::Gauss, &mut rng, true)?;
        assert!(value(&out.kld_loss).is_finite());
        assert!(value(&out.nll_loss).is_finite());
        assert_eq!(out.z_mean.dims(), &[1, 40]);
        assert_eq!(out.z_covh.dims(), &[1, 10]);
        assert_eq!(out.x_mean.dims(), &[1, 16]);
        assert_eq!(out.x_lnvar.dims(), &[1, 16]);
        Ok(())
    }

    #[test]
    fn zero_batch_bce_has_non_negative_terms() -> Result<()> {
        let varmap = VarMap::new();
        let model = small_model(&varmap)?;
        let mut rng = StdRng::seed_from_u64(0);
        let x = Tensor::zeros((4, 16), DType::F32, &Device::Cpu)?;

        let out = model.forward_t(&x, ReconDist::Bce, &mut rng, true)?;
        assert!(value(&out.kl_block) >= 0.);
        assert!(value(&out.kl_diag) >= 0.);
        assert!(value(&out.kld_loss) >= 0.);
        assert!(value(&out.recon_nll) >= 0.);
        assert!(out.elbo()?.is_finite());
        Ok(())
    }

    #[test]
    fn evaluation_pass_is_deterministic() -> Result<()> {
        let varmap = VarMap::new();
        let model = small_model(&varmap)?;
        let x = Tensor::randn(0f32, 1., (3, 16), &Device::Cpu)?;

        let a = model.forward_t(&x, ReconDist::Gauss, &mut StdRng::seed_from_u64(1), false)?;
        let b = model.forward_t(&x, ReconDist::Gauss, &mut StdRng::seed_from_u64(2), false)?;
        assert_eq!(value(&a.kl_block), value(&b.kl_block));
        assert_eq!(
            a.x_mean.flatten_all()?.to_vec1::<f32>()?,
            b.x_mean.flatten_all()?.to_vec1::<f32>()?
        );

        let za = model.sample_z(&x, &mut StdRng::seed_from_u64(3), false)?;
        let zb = model.sample_z(&x, &mut StdRng::seed_from_u64(4), false)?;
        assert_eq!(za.flatten_all()?.to_vec1::<f32>()?, zb.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn wrong_input_width_is_a_shape_error() -> Result<()> {
        let varmap = VarMap::new();
        let model = small_model(&varmap)?;
        let x = Tensor::zeros((2, 15), DType::F32, &Device::Cpu)?;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            model.forward_t(&x, ReconDist::Gauss, &mut rng, true),
            Err(VgpError::Shape(_))
        ));
        assert!(matches!(
            VgpModel::new(
                &VgpConfig::new(15, 8, 4),
                VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)
            ),
            Err(VgpError::Shape(_))
        ));
        Ok(())
    }

    #[test]
    fn sample_x_widths() -> Result<()> {
        let varmap = VarMap::new();
        let model = small_model(&varmap)?;
        let mut rng = StdRng::seed_from_u64(9);

        let z = model.sample_prior_z(5, &mut rng)?;
        assert_eq!(z.dims(), &[5, 40]);

        let (mean, var) = model.sample_x(ReconDist::Gauss, 100, &mut rng)?;
        assert_eq!(mean.dims(), &[16]);
        assert!(var.to_vec1::<f32>()?.iter().all(|&v| v > 0.));

        let (mean, var) = model.sample_x(ReconDist::Bce, 10, &mut rng)?;
        assert!(mean.to_vec1::<f32>()?.iter().all(|&p| (0. ..=1.).contains(&p)));
        assert!(var.to_vec1::<f32>()?.iter().all(|&v| (0. ..=0.25).contains(&v)));
        Ok(())
    }
}
