use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::RwLock;

use super::{graduate_record, AssetRepository, GraduateOutcome, SettleFn, SettleOutcome, StoreError};
use crate::types::{AssetRecord, TradeKey, TradeRecord};

#[derive(Debug, Default)]
struct Tables {
    assets: HashMap<Pubkey, AssetRecord>,
    trades: HashMap<Pubkey, Vec<TradeRecord>>,
    trade_keys: HashSet<TradeKey>,
    cursor: Option<String>,
}

/// 内存实现，一次写锁即一个事务。
#[derive(Debug, Default, Clone)]
pub struct InMemoryAssetRepository {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryAssetRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetRepository for InMemoryAssetRepository {
    async fn insert_asset(&self, asset: AssetRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.assets.contains_key(&asset.address) {
            return Err(StoreError::DuplicateAsset(asset.address));
        }
        guard.assets.insert(asset.address, asset);
        Ok(())
    }

    async fn get_asset(&self, address: &Pubkey) -> Result<Option<AssetRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.assets.get(address).cloned())
    }

    async fn list_assets(&self) -> Result<Vec<AssetRecord>, StoreError> {
        let guard = self.inner.read().await;
        let mut assets: Vec<_> = guard.assets.values().cloned().collect();
        assets.sort_by_key(|asset| asset.created_at);
        Ok(assets)
    }

    async fn settle_trade(
        &self,
        trade: TradeRecord,
        apply: SettleFn,
    ) -> Result<SettleOutcome, StoreError> {
        let mut guard = self.inner.write().await;
        let key = trade.key();
        if guard.trade_keys.contains(&key) {
            return Ok(SettleOutcome::Duplicate);
        }
        let Some(current) = guard.assets.get(&trade.asset) else {
            return Ok(SettleOutcome::AssetMissing);
        };
        let next = match apply(current) {
            Ok(next) => next,
            Err(reason) => return Ok(SettleOutcome::Rejected(reason)),
        };
        guard.assets.insert(next.address, next.clone());
        guard.trade_keys.insert(key);
        guard.trades.entry(trade.asset).or_default().push(trade);
        Ok(SettleOutcome::Applied(next))
    }

    async fn mark_graduated(
        &self,
        address: &Pubkey,
        total_input_raised: u64,
        graduated_at: i64,
    ) -> Result<GraduateOutcome, StoreError> {
        let mut guard = self.inner.write().await;
        let Some(current) = guard.assets.get(address) else {
            return Ok(GraduateOutcome::AssetMissing);
        };
        match graduate_record(current, total_input_raised, graduated_at) {
            Some(next) => {
                guard.assets.insert(*address, next.clone());
                Ok(GraduateOutcome::Graduated(next))
            }
            None => Ok(GraduateOutcome::AlreadyGraduated),
        }
    }

    async fn trades_for(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .trades
            .get(address)
            .map(|trades| trades.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn load_cursor(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.cursor.clone())
    }

    async fn save_cursor(&self, signature: &str) -> Result<(), StoreError> {
        self.inner.write().await.cursor = Some(signature.to_string());
        Ok(())
    }
}
