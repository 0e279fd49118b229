use clap::{Parser, Subcommand};
use curve_indexer_core::types::TradeSide;
use solana_sdk::pubkey::Pubkey;
use std::path::PathBuf;

/// CLI 入口参数定义。
#[derive(Parser, Debug)]
#[command(author, version, about = "联合曲线索引器 CLI", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config/default.yaml"
    )]
    pub config: PathBuf,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 支持的子命令。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 订阅链上日志并对账；指定 --replay 时改为回放录制的日志批次
    Listen {
        #[arg(long, value_name = "FILE")]
        replay: Option<PathBuf>,
    },
    /// 按当前物化储备报价
    Quote {
        #[arg(long, value_name = "ASSET")]
        asset: Pubkey,
        /// buy 或 sell
        #[arg(long)]
        side: TradeSide,
        /// 买入为含手续费的输入货币数量，卖出为资产数量
        #[arg(long)]
        amount: u64,
        #[arg(long, default_value_t = 100u16)]
        slippage_bps: u16,
    },
    /// 打印资产状态与最近成交
    DumpAsset {
        #[arg(long, value_name = "ASSET")]
        asset: Pubkey,
        #[arg(long, default_value_t = 10usize)]
        trades: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_quote_command() {
        let asset = Pubkey::new_unique();
        let cli = Cli::try_parse_from([
            "curve-indexer",
            "quote",
            "--asset",
            &asset.to_string(),
            "--side",
            "sell",
            "--amount",
            "1000",
        ])
        .expect("参数解析失败");
        match cli.command {
            Commands::Quote {
                asset: parsed,
                side,
                amount,
                slippage_bps,
            } => {
                assert_eq!(parsed, asset);
                assert_eq!(side, TradeSide::Sell);
                assert_eq!(amount, 1000);
                assert_eq!(slippage_bps, 100);
            }
            other => panic!("解析到错误的子命令: {:?}", other),
        }
    }
}
