mod cli;
mod commands;
mod shared;

use anyhow::Result;
use clap::Parser;
use tokio::runtime::Runtime;

use cli::Cli;
use commands::run;
use curve_indexer_core::config::load_config;
use curve_indexer_core::logging::init_logging;

fn main() -> Result<()> {
    let Cli {
        config: config_path,
        command,
    } = Cli::parse();
    let config = load_config(&config_path)?;
    config.validate()?;
    init_logging(&config.logging)?;

    let rt = Runtime::new()?;
    rt.block_on(async move { run(&config, command).await })
}
