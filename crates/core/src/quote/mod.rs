//! 基于物化储备的报价服务。

use std::sync::Arc;

use serde::Serialize;
use solana_sdk::pubkey::Pubkey;

use crate::config::ProtocolConfig;
use crate::curve::math::{apply_slippage, simulate_buy, simulate_sell, CurveError};
use crate::state::{AssetRepository, StoreError};
use crate::types::{AssetRecord, TradeSide};

/// 报价结果；买入时数量为资产单位，卖出时为扣费后的输入货币单位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub expected_amount: u64,
    pub minimum_acceptable_amount: u64,
    pub fee_amount: u64,
}

/// 报价错误。
#[derive(thiserror::Error, Debug)]
pub enum QuoteError {
    #[error("资产不存在: {0}")]
    AssetNotFound(Pubkey),
    #[error("资产已毕业，曲线停止交易: {0}")]
    AssetGraduated(Pubkey),
    #[error("曲线计算失败: {0}")]
    Curve(#[from] CurveError),
    #[error("成交数量为 0")]
    ZeroOutput,
    #[error("流动性不足: 需要 {requested}, 可用 {available}")]
    InsufficientLiquidity { requested: u64, available: u64 },
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
}

pub struct QuoteService {
    repository: Arc<dyn AssetRepository>,
    protocol: ProtocolConfig,
}

impl QuoteService {
    pub fn new(repository: Arc<dyn AssetRepository>, protocol: ProtocolConfig) -> Self {
        Self {
            repository,
            protocol,
        }
    }

    pub async fn quote(
        &self,
        asset: &Pubkey,
        side: TradeSide,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<Quote, QuoteError> {
        match side {
            TradeSide::Buy => self.get_buy_quote(asset, amount, slippage_bps).await,
            TradeSide::Sell => self.get_sell_quote(asset, amount, slippage_bps).await,
        }
    }

    /// 付出 `input_amount` 输入货币（含手续费）可得的资产数量。
    pub async fn get_buy_quote(
        &self,
        asset: &Pubkey,
        input_amount: u64,
        slippage_bps: u16,
    ) -> Result<Quote, QuoteError> {
        let record = self.tradable(asset).await?;
        let outcome = simulate_buy(
            record.virtual_input_reserve,
            record.virtual_output_reserve,
            input_amount,
            self.protocol.fee_bps,
        )?;
        if outcome.output_amount == 0 {
            return Err(QuoteError::ZeroOutput);
        }
        let available = self
            .protocol
            .initial_real_output_reserve
            .saturating_sub(record.total_output_supply);
        if outcome.output_amount > available {
            return Err(QuoteError::InsufficientLiquidity {
                requested: outcome.output_amount,
                available,
            });
        }
        Ok(Quote {
            expected_amount: outcome.output_amount,
            minimum_acceptable_amount: apply_slippage(outcome.output_amount, slippage_bps)?,
            fee_amount: outcome.fee,
        })
    }

    /// 卖出 `output_amount` 资产可取回的输入货币（已扣手续费）。
    pub async fn get_sell_quote(
        &self,
        asset: &Pubkey,
        output_amount: u64,
        slippage_bps: u16,
    ) -> Result<Quote, QuoteError> {
        let record = self.tradable(asset).await?;
        let outcome = simulate_sell(
            record.virtual_input_reserve,
            record.virtual_output_reserve,
            output_amount,
            self.protocol.fee_bps,
        )?;
        if outcome.gross_input > record.real_input_balance {
            return Err(QuoteError::InsufficientLiquidity {
                requested: outcome.gross_input,
                available: record.real_input_balance,
            });
        }
        let net = outcome.gross_input.saturating_sub(outcome.fee);
        if net == 0 {
            return Err(QuoteError::ZeroOutput);
        }
        Ok(Quote {
            expected_amount: net,
            minimum_acceptable_amount: apply_slippage(net, slippage_bps)?,
            fee_amount: outcome.fee,
        })
    }

    async fn tradable(&self, asset: &Pubkey) -> Result<AssetRecord, QuoteError> {
        let record = self
            .repository
            .get_asset(asset)
            .await?
            .ok_or(QuoteError::AssetNotFound(*asset))?;
        if record.graduated {
            return Err(QuoteError::AssetGraduated(*asset));
        }
        Ok(record)
    }
}
