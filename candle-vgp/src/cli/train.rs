use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use log::info;
use matrix_util::common_io::{mkdir, write_lines};
use matrix_util::traits::IoOps;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{output_path, select_device};
use crate::candle_data_loader::{DataLoader, InMemoryData};
use crate::candle_inference::TrainConfig;
use crate::candle_vgp_config::VgpConfig;
use crate::candle_vgp_decoder::ReconDist;
use crate::candle_vgp_inference::VgpInference;
use crate::candle_vgp_model::VgpModel;
use crate::periodic_data::simulate_periodic_process;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(short, long, help = "Delimited data file, one record per line (simulate if absent)")]
    pub data: Option<String>,

    #[arg(long, default_value = "\t")]
    pub delim: String,

    #[arg(long, default_value = "100", help = "Experiments to simulate without --data")]
    pub num_experiments: usize,

    #[arg(long, default_value = "8", help = "Time points to simulate without --data")]
    pub num_times: usize,

    #[arg(long, default_value = "2", help = "Coordinates to simulate without --data")]
    pub num_dims: usize,

    #[arg(short, long, default_value = "4", help = "Number of latent blocks")]
    pub t_dim: usize,

    #[arg(long, default_value = "400")]
    pub h_dim: usize,

    #[arg(long, default_value = "20")]
    pub f_in: usize,

    #[arg(long, default_value = "100")]
    pub f_out: usize,

    #[arg(long, default_value = "16")]
    pub num_pseudo: usize,

    #[arg(long, value_enum, default_value = "gauss")]
    pub dist: ReconDist,

    #[arg(long, default_value = "20")]
    pub epochs: usize,

    #[arg(long, default_value = "10")]
    pub batch_size: usize,

    #[arg(long, default_value = "0.001")]
    pub lr: f32,

    #[arg(long, default_value = "100", help = "Prior draws averaged by sample_x")]
    pub num_draws: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(
        short,
        long,
        help = "Output prefix (creates {out}.elbo.tsv, {out}.z.tsv.gz, {out}.x_mean.tsv, {out}.x_var.tsv, {out}.safetensors)"
    )]
    pub out: String,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

fn load_data(args: &TrainArgs, rng: &mut StdRng) -> Result<Tensor> {
    let x = match args.data.as_ref() {
        Some(file) => {
            info!("Loading data from {}", file);
            Tensor::read_file_delim(file, args.delim.as_str(), None)?
        }
        None => {
            info!(
                "Simulating {} experiments of {} time points x {} dims",
                args.num_experiments, args.num_times, args.num_dims
            );
            simulate_periodic_process(args.num_experiments, args.num_times, args.num_dims, rng)?
                .to_tensor(&Device::Cpu)?
        }
    };
    info!("  data shape: {:?}", x.dims());
    Ok(x)
}

pub fn run(args: &TrainArgs) -> Result<()> {
    let device = select_device(args.gpu);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let x = load_data(args, &mut rng)?;
    let (_, x_dim) = x.dims2()?;

    let config = VgpConfig::new(x_dim, args.h_dim, args.t_dim)
        .with_gp_dims(args.f_in, args.f_out)
        .with_num_pseudo(args.num_pseudo);

    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = VgpModel::new(&config, vs)?;

    let mut data = InMemoryData::new(&x)?;

    let train_config = TrainConfig {
        learning_rate: args.lr,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: true,
        seed: args.seed,
    };

    let mut vgp = VgpInference::build(&model, &varmap);
    let trace = vgp.train(&mut data, args.dist, &train_config)?;

    let nskip: usize = trace.skipped.iter().sum();
    if nskip > 0 {
        info!("{} minibatches skipped over {} epochs", nskip, args.epochs);
    }

    mkdir(&args.out)?;

    let elbo_file = output_path(&args.out, "elbo.tsv");
    write_lines(&trace.elbo, &elbo_file)?;
    info!("Saved ELBO trace to {}", elbo_file);

    if let Ok(elbo) = vgp.evaluate(&data, args.dist, &device) {
        info!("Final ELBO (evaluation mode): {:.4}", elbo);
    }

    let x_full = data.full_data(&device)?;
    let z = model.sample_z(&x_full, &mut rng, false)?;
    let z_file = output_path(&args.out, "z.tsv.gz");
    z.to_device(&Device::Cpu)?.to_tsv(&z_file)?;
    info!("Saved latent states {:?} to {}", z.dims(), z_file);

    let (x_mean, x_var) = model.sample_x(args.dist, args.num_draws, &mut rng)?;
    let mean_file = output_path(&args.out, "x_mean.tsv");
    let var_file = output_path(&args.out, "x_var.tsv");
    x_mean.to_device(&Device::Cpu)?.to_tsv(&mean_file)?;
    x_var.to_device(&Device::Cpu)?.to_tsv(&var_file)?;
    info!("Saved sample_x mean and variance to {} and {}", mean_file, var_file);

    let ckpt_file = output_path(&args.out, "safetensors");
    varmap.save(&ckpt_file)?;
    info!("Saved model parameters to {}", ckpt_file);

    Ok(())
}
