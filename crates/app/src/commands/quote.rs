use anyhow::Result;
use curve_indexer_core::config::AppConfig;
use curve_indexer_core::quote::QuoteService;
use curve_indexer_core::types::TradeSide;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;

use crate::shared::SharedObjects;

/// 打印报价结果（JSON）。
pub async fn quote(
    config: &AppConfig,
    asset: Pubkey,
    side: TradeSide,
    amount: u64,
    slippage_bps: u16,
) -> Result<()> {
    let shared = SharedObjects::open(config).await?;
    let service = QuoteService::new(shared.repository.clone(), config.protocol.clone());
    let result = service.quote(&asset, side, amount, slippage_bps).await;
    shared.close().await;
    let quote = result?;
    let output = json!({
        "asset": asset.to_string(),
        "side": side.as_str(),
        "amount": amount.to_string(),
        "slippage_bps": slippage_bps,
        "expected_amount": quote.expected_amount.to_string(),
        "minimum_acceptable_amount": quote.minimum_acceptable_amount.to_string(),
        "fee_amount": quote.fee_amount.to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
