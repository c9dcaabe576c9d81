use crate::candle_data_loader::DataLoader;
use crate::candle_inference::TrainConfig;
use crate::candle_vgp_decoder::ReconDist;
use crate::candle_vgp_model::VgpModel;

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Per-epoch averages over the minibatches that went through
#[derive(Default, Debug, Clone)]
pub struct TrainTrace {
    pub elbo: Vec<f32>,
    pub kld: Vec<f32>,
    pub nll: Vec<f32>,
    /// minibatches dropped for numeric trouble
    pub skipped: Vec<usize>,
}

pub struct VgpInference<'a> {
    pub model: &'a VgpModel,
    pub variable_map: &'a VarMap,
}

impl<'a> VgpInference<'a> {
    pub fn build(model: &'a VgpModel, variable_map: &'a VarMap) -> Self {
        Self {
            model,
            variable_map,
        }
    }

    /// Train the model by minimizing `kld + nll` with AdamW
    ///
    /// Minibatches failing with a singular matrix or a non-finite
    /// loss are skipped with a warning; any other error stops
    /// training.
    ///
    /// * `data` - data loader should have `minibatch_data`
    /// * `dist` - likelihood of the observed data
    /// * `train_config` - training configuration
    pub fn train<DataL>(
        &mut self,
        data: &mut DataL,
        dist: ReconDist,
        train_config: &TrainConfig,
    ) -> anyhow::Result<TrainTrace>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;
        let mut rng = StdRng::seed_from_u64(train_config.seed);
        let mut adam = AdamW::new_lr(self.variable_map.all_vars(), train_config.learning_rate.into())?;

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut trace = TrainTrace::default();

        for epoch in 0..train_config.num_epochs {
            data.shuffle_minibatch(train_config.batch_size, &mut rng)?;

            let mut kld_tot = 0f32;
            let mut nll_tot = 0f32;
            let mut ntot = 0_usize;
            let mut nskip = 0_usize;

            for b in 0..data.num_minibatch() {
                let mb = data.minibatch_data(b, device)?;

                let out = match self.model.forward_t(&mb.input, dist, &mut rng, true) {
                    Ok(out) => out,
                    Err(err) if err.is_recoverable() => {
                        warn!("[{}] skipping minibatch #{}: {}", epoch + 1, b, err);
                        nskip += 1;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };

                adam.backward_step(&out.loss()?)?;

                kld_tot += out.kld_loss.to_scalar::<f32>()?;
                nll_tot += out.nll_loss.to_scalar::<f32>()?;
                ntot += 1;
            }

            if ntot == 0 {
                return Err(anyhow::anyhow!(
                    "every minibatch failed in epoch {}",
                    epoch + 1
                ));
            }

            let denom = ntot as f32;
            trace.kld.push(kld_tot / denom);
            trace.nll.push(nll_tot / denom);
            trace.elbo.push(-(kld_tot + nll_tot) / denom);
            trace.skipped.push(nskip);

            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}] elbo: {:.4}, kl: {:.4}, nll: {:.4}",
                    epoch + 1,
                    -(kld_tot + nll_tot) / denom,
                    kld_tot / denom,
                    nll_tot / denom
                );
            }
        }

        pb.finish_and_clear();
        Ok(trace)
    }

    /// ELBO of the full data set in evaluation mode
    pub fn evaluate<DataL>(&self, data: &DataL, dist: ReconDist, device: &Device) -> anyhow::Result<f32>
    where
        DataL: DataLoader,
    {
        let x = data.full_data(device)?;
        let mut rng = StdRng::seed_from_u64(0);
        let out = self.model.forward_t(&x, dist, &mut rng, false)?;
        Ok(out.elbo()?)
    }
}
