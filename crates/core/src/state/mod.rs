pub mod repository;
pub mod sqlite;

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;

use crate::types::{AssetRecord, TradeRecord};

pub use repository::InMemoryAssetRepository;
pub use sqlite::SqliteAssetRepository;

/// 结算时在同一事务内执行的资产更新闭包，返回 `Err` 表示拒绝本次变更。
pub type SettleFn = Box<dyn FnOnce(&AssetRecord) -> Result<AssetRecord, String> + Send>;

/// 单笔交易结算结果。
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    /// 交易已写入，附带更新后的资产。
    Applied(AssetRecord),
    /// 幂等键已存在，未做任何修改。
    Duplicate,
    /// 资产尚未创建。
    AssetMissing,
    /// 更新闭包拒绝了变更，事务已回滚。
    Rejected(String),
}

/// 毕业标记结果。
#[derive(Debug, Clone, PartialEq)]
pub enum GraduateOutcome {
    Graduated(AssetRecord),
    AlreadyGraduated,
    AssetMissing,
}

/// 物化存储错误。
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("资产已存在: {0}")]
    DuplicateAsset(Pubkey),
    #[error("数据无效: {0}")]
    Invalid(String),
    #[error("存储错误: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// 资产与交易的物化存储接口，仅由对账器写入。
#[async_trait]
pub trait AssetRepository: Send + Sync {
    /// 地址已存在时返回 [`StoreError::DuplicateAsset`]，不覆盖原记录。
    async fn insert_asset(&self, asset: AssetRecord) -> Result<(), StoreError>;

    async fn get_asset(&self, address: &Pubkey) -> Result<Option<AssetRecord>, StoreError>;

    async fn list_assets(&self) -> Result<Vec<AssetRecord>, StoreError>;

    /// 在一个事务内完成：幂等键检查、读取资产、执行 `apply`、写回资产并追加交易。
    async fn settle_trade(
        &self,
        trade: TradeRecord,
        apply: SettleFn,
    ) -> Result<SettleOutcome, StoreError>;

    async fn mark_graduated(
        &self,
        address: &Pubkey,
        total_input_raised: u64,
        graduated_at: i64,
    ) -> Result<GraduateOutcome, StoreError>;

    /// 返回最近 `limit` 笔交易，新的在前。
    async fn trades_for(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError>;

    async fn load_cursor(&self) -> Result<Option<String>, StoreError>;

    async fn save_cursor(&self, signature: &str) -> Result<(), StoreError>;
}

/// 毕业标记的公共判定：尚未收到链上毕业事件时才写入。
pub(crate) fn graduate_record(
    asset: &AssetRecord,
    total_input_raised: u64,
    graduated_at: i64,
) -> Option<AssetRecord> {
    if asset.graduated && asset.graduated_at.is_some() {
        return None;
    }
    let mut next = asset.clone();
    next.graduated = true;
    next.graduated_at = Some(graduated_at);
    next.real_input_balance = total_input_raised;
    Some(next)
}
