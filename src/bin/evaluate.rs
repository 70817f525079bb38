/// Evaluate the latest checkpoint of a model on a dataset split
use ckpt_eval::cli::Cli;
use clap::Parser;

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    cli.run()?;

    Ok(())
}
