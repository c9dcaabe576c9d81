use anyhow::Result;
use candle_vgp::cli::{simulate, train, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Simulate(args) => {
            simulate::run(args)?;
        }
        Commands::Train(args) => {
            train::run(args)?;
        }
    }

    Ok(())
}
