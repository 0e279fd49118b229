use anyhow::Result;
use curve_indexer_core::config::AppConfig;

use crate::cli::Commands;

pub mod listen;
pub mod quote;
pub mod state;
pub mod utils;

/// 根据子命令执行对应逻辑。
pub async fn run(config: &AppConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Listen { replay } => listen::listen(config, replay).await,
        Commands::Quote {
            asset,
            side,
            amount,
            slippage_bps,
        } => quote::quote(config, asset, side, amount, slippage_bps).await,
        Commands::DumpAsset { asset, trades } => state::dump_asset(config, asset, trades).await,
    }
}
