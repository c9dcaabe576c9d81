use anyhow::Result;
use clap::Args;
use log::info;
use matrix_util::common_io::{mkdir, write_lines};
use matrix_util::traits::IoOps;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::output_path;
use crate::periodic_data::simulate_periodic_process;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(long, default_value = "100", help = "Number of independent experiments (rows)")]
    pub num_experiments: usize,

    #[arg(long, default_value = "8", help = "Time points per experiment")]
    pub num_times: usize,

    #[arg(long, default_value = "2", help = "Coordinates per time point")]
    pub num_dims: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(short, long, help = "Output prefix (creates {out}.data.tsv.gz, {out}.times.tsv)")]
    pub out: String,
}

pub fn run(args: &SimulateArgs) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let sim = simulate_periodic_process(args.num_experiments, args.num_times, args.num_dims, &mut rng)?;

    mkdir(&args.out)?;

    let data_file = output_path(&args.out, "data.tsv.gz");
    sim.to_tensor(&candle_core::Device::Cpu)?.to_tsv(&data_file)?;
    info!("Saved {} x {} data to {}", sim.data.nrows(), sim.data.ncols(), data_file);

    let times_file = output_path(&args.out, "times.tsv");
    write_lines(&sim.times, &times_file)?;
    info!("Saved {} time points to {}", sim.times.len(), times_file);
    Ok(())
}
