use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use crate::curve::event::{AssetCreated, TradeSettled};
use crate::serde_utils::{pubkey_string, u64_string};

/// 交易方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn from_is_buy(is_buy: bool) -> Self {
        if is_buy {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("未知交易方向: {}", other)),
        }
    }
}

/// 资产生命周期状态，未入库的资产即为 Unknown。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Active,
    Graduated,
}

/// 本地物化的资产视图。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    #[serde(with = "pubkey_string")]
    pub address: Pubkey,
    pub name: String,
    pub symbol: String,
    pub uri: String,
    #[serde(with = "pubkey_string")]
    pub creator: Pubkey,
    pub created_at: i64,
    #[serde(with = "u64_string")]
    pub virtual_input_reserve: u64,
    #[serde(with = "u64_string")]
    pub virtual_output_reserve: u64,
    #[serde(with = "u64_string")]
    pub real_input_balance: u64,
    #[serde(with = "u64_string")]
    pub total_output_supply: u64,
    pub graduated: bool,
    #[serde(default)]
    pub graduated_at: Option<i64>,
    #[serde(default)]
    pub last_settled_at: Option<i64>,
    #[serde(default)]
    pub trade_count: u64,
}

impl AssetRecord {
    /// 由创建事件构造，初始虚拟储备取协议常量。
    pub fn from_created(
        event: &AssetCreated,
        initial_virtual_input: u64,
        initial_virtual_output: u64,
    ) -> Self {
        Self {
            address: event.address,
            name: event.name.clone(),
            symbol: event.symbol.clone(),
            uri: event.uri.clone(),
            creator: event.creator,
            created_at: event.created_at,
            virtual_input_reserve: initial_virtual_input,
            virtual_output_reserve: initial_virtual_output,
            real_input_balance: 0,
            total_output_supply: 0,
            graduated: false,
            graduated_at: None,
            last_settled_at: None,
            trade_count: 0,
        }
    }

    pub fn status(&self) -> AssetStatus {
        if self.graduated {
            AssetStatus::Graduated
        } else {
            AssetStatus::Active
        }
    }
}

/// 交易幂等键：交易签名加事件在交易内的序号。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TradeKey {
    pub signature: String,
    pub event_index: u32,
}

impl fmt::Display for TradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.signature, self.event_index)
    }
}

/// 一笔已结算交易，写入后不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub signature: String,
    pub event_index: u32,
    pub slot: u64,
    #[serde(with = "pubkey_string")]
    pub asset: Pubkey,
    #[serde(with = "pubkey_string")]
    pub trader: Pubkey,
    pub side: TradeSide,
    #[serde(with = "u64_string")]
    pub input_amount: u64,
    #[serde(with = "u64_string")]
    pub output_amount: u64,
    #[serde(with = "u64_string")]
    pub fee_amount: u64,
    /// 仅用于展示的成交价，输入币种 / 资产单位。
    pub price: f64,
    pub settled_at: i64,
    #[serde(with = "u64_string")]
    pub virtual_input_after: u64,
    #[serde(with = "u64_string")]
    pub virtual_output_after: u64,
}

impl TradeRecord {
    pub fn from_settled(
        event: &TradeSettled,
        signature: &str,
        event_index: u32,
        slot: u64,
    ) -> Self {
        let price = if event.output_amount == 0 {
            0.0
        } else {
            event.input_amount as f64 / event.output_amount as f64
        };
        Self {
            signature: signature.to_string(),
            event_index,
            slot,
            asset: event.address,
            trader: event.trader,
            side: TradeSide::from_is_buy(event.is_buy),
            input_amount: event.input_amount,
            output_amount: event.output_amount,
            fee_amount: event.fee_amount,
            price,
            settled_at: event.settled_at,
            virtual_input_after: event.virtual_input_after,
            virtual_output_after: event.virtual_output_after,
        }
    }

    pub fn key(&self) -> TradeKey {
        TradeKey {
            signature: self.signature.clone(),
            event_index: self.event_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_side_parse() {
        assert_eq!("BUY".parse::<TradeSide>(), Ok(TradeSide::Buy));
        assert_eq!("sell".parse::<TradeSide>(), Ok(TradeSide::Sell));
        assert!("hold".parse::<TradeSide>().is_err());
    }

    #[test]
    fn test_trade_record_price() {
        let event = TradeSettled {
            address: Pubkey::new_unique(),
            trader: Pubkey::new_unique(),
            is_buy: false,
            input_amount: 500,
            output_amount: 1_000,
            fee_amount: 5,
            settled_at: 10,
            virtual_input_after: 1,
            virtual_output_after: 1,
        };
        let record = TradeRecord::from_settled(&event, "sig", 2, 99);
        assert_eq!(record.side, TradeSide::Sell);
        assert!((record.price - 0.5).abs() < f64::EPSILON);
        assert_eq!(record.key().to_string(), "sig#2");
    }
}
