pub mod simulate;
pub mod train;

use candle_core::Device;
use clap::{Parser, Subcommand};
use log::info;

pub use simulate::SimulateArgs;
pub use train::TrainArgs;

#[derive(Parser)]
#[command(name = "candle-vgp")]
#[command(about = "Variational Gaussian process latent model on periodic data")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a synthetic periodic process data set
    Simulate(SimulateArgs),
    /// Fit the model to delimited data or a fresh simulation
    Train(TrainArgs),
}

/// GPU if asked for and available, CPU otherwise
pub fn select_device(gpu: bool) -> Device {
    let device = if gpu {
        #[cfg(target_os = "macos")]
        { Device::new_metal(0).unwrap_or(Device::Cpu) }
        #[cfg(target_os = "linux")]
        { Device::new_cuda(0).unwrap_or(Device::Cpu) }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        { Device::Cpu }
    } else {
        Device::Cpu
    };
    info!("Using device: {:?}", device);
    device
}

/// `{prefix}.{suffix}` as a string path
pub fn output_path(prefix: &str, suffix: &str) -> String {
    format!("{}.{}", prefix, suffix)
}
