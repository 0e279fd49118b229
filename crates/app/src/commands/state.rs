use anyhow::Result;
use curve_indexer_core::config::AppConfig;
use solana_sdk::pubkey::Pubkey;

use super::utils::asset_report;
use crate::shared::SharedObjects;

/// 打印资产状态与最近成交（YAML）。
pub async fn dump_asset(config: &AppConfig, asset: Pubkey, trades: usize) -> Result<()> {
    let shared = SharedObjects::open(config).await?;
    let record = shared.repository.get_asset(&asset).await?;
    match record {
        Some(record) => {
            let recent = shared.repository.trades_for(&asset, trades).await?;
            let report = asset_report(&record, &recent, &config.protocol);
            println!("{}", serde_yaml::to_string(&report)?);
        }
        None => {
            log::warn!("未找到资产状态，输入: {}", asset);
        }
    }
    shared.close().await;
    Ok(())
}
