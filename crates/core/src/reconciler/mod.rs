//! 事件溯源的状态机：把解码后的链上事件幂等地应用到物化存储。

pub mod orphan;
pub mod settle;
pub mod stats;

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::Mutex;
use tokio::time::Instant;

use self::orphan::{OrphanBuffer, OrphanEntry};
use self::settle::{settle_asset, SettleRules};
use self::stats::{bump, ReconcileStats};
use crate::config::{ProtocolConfig, ReconcilerConfig};
use crate::curve::event::{AssetCreated, AssetGraduated, LedgerEvent, TradeSettled};
use crate::state::{AssetRepository, GraduateOutcome, SettleOutcome, StoreError};
use crate::types::{AssetRecord, TradeRecord};

const LOG_TARGET: &str = "curve_indexer::reconciler";

/// 事件在账本中的位置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub signature: String,
    pub slot: u64,
    pub event_index: u32,
    /// 所属批次的序号，由监听器填写。
    pub batch: Option<u64>,
}

/// 孤儿事件占住所属批次：进入缓冲时 `hold`，回放或丢弃后 `release`。
#[async_trait]
pub trait OrphanHold: Send + Sync {
    async fn hold(&self, batch: u64);

    /// `applied` 为 false 表示事件被丢弃，或回放时写入失败。
    async fn release(&self, batch: u64, applied: bool);
}

/// 单个事件的应用结果，重复投递均为空操作而非错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    DuplicateAsset,
    TradeApplied,
    DuplicateTrade,
    Graduated,
    AlreadyGraduated,
    /// 资产尚未创建，事件已进入孤儿缓冲。
    Deferred,
}

/// 对账错误，均只影响当前事件。
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("数据完整性告警 {asset}: {reason}")]
    OrderingViolation { asset: Pubkey, reason: String },
    #[error("孤儿事件已丢弃 {asset} ({signature}#{event_index}): {cause}")]
    OrphanEvent {
        asset: Pubkey,
        signature: String,
        event_index: u32,
        cause: &'static str,
    },
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    fn orphan(entry: &OrphanEntry, cause: &'static str) -> Self {
        ReconcileError::OrphanEvent {
            asset: entry.event.asset(),
            signature: entry.context.signature.clone(),
            event_index: entry.context.event_index,
            cause,
        }
    }
}

/// 同一交易内的应用顺序：创建、成交、毕业。链上毕业事件先于触发它的成交事件输出。
fn apply_rank(event: &LedgerEvent) -> u8 {
    match event {
        LedgerEvent::AssetCreated(_) => 0,
        LedgerEvent::TradeSettled(_) => 1,
        LedgerEvent::AssetGraduated(_) => 2,
    }
}

pub struct Reconciler {
    repository: Arc<dyn AssetRepository>,
    protocol: ProtocolConfig,
    config: ReconcilerConfig,
    orphans: Mutex<OrphanBuffer>,
    orphan_hold: OnceCell<Arc<dyn OrphanHold>>,
    stats: ReconcileStats,
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn AssetRepository>,
        protocol: ProtocolConfig,
        config: ReconcilerConfig,
    ) -> Self {
        let orphans = OrphanBuffer::new(config.orphan_capacity, config.orphan_window());
        Self {
            repository,
            protocol,
            config,
            orphans: Mutex::new(orphans),
            orphan_hold: OnceCell::new(),
            stats: ReconcileStats::default(),
        }
    }

    /// 只能设置一次，重复设置会被忽略。
    pub fn attach_orphan_hold(&self, hold: Arc<dyn OrphanHold>) {
        if self.orphan_hold.set(hold).is_err() {
            log::warn!(target: LOG_TARGET, "孤儿占位回调已设置，忽略重复设置");
        }
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    pub fn repository(&self) -> &Arc<dyn AssetRepository> {
        &self.repository
    }

    pub async fn pending_orphans(&self) -> usize {
        self.orphans.lock().await.len()
    }

    /// 应用一笔交易中属于同一资产的全部事件，按创建、成交（序号）、毕业排序。
    pub async fn apply_transaction(
        &self,
        signature: &str,
        slot: u64,
        batch: Option<u64>,
        mut events: Vec<(u32, LedgerEvent)>,
    ) -> Vec<Result<ApplyOutcome, ReconcileError>> {
        events.sort_by_key(|(index, event)| (apply_rank(event), *index));
        let mut results = Vec::with_capacity(events.len());
        for (event_index, event) in events {
            let context = EventContext {
                signature: signature.to_string(),
                slot,
                event_index,
                batch,
            };
            results.push(self.apply(context, event).await);
        }
        results
    }

    pub async fn apply(
        &self,
        context: EventContext,
        event: LedgerEvent,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let result = match event {
            LedgerEvent::AssetCreated(created) => self.apply_created(&created).await,
            LedgerEvent::TradeSettled(trade) => self.apply_trade(context, trade).await,
            LedgerEvent::AssetGraduated(graduated) => {
                self.apply_graduated(context, graduated).await
            }
        };
        if let Err(ReconcileError::Store(err)) = &result {
            bump(&self.stats.store_errors);
            log::error!(target: LOG_TARGET, "事件写入失败: {}", err);
        }
        result
    }

    async fn apply_created(&self, event: &AssetCreated) -> Result<ApplyOutcome, ReconcileError> {
        let record = AssetRecord::from_created(
            event,
            self.protocol.initial_virtual_input_reserve,
            self.protocol.initial_virtual_output_reserve,
        );
        match self.repository.insert_asset(record).await {
            Ok(()) => {
                bump(&self.stats.assets_created);
                log::info!(
                    target: LOG_TARGET,
                    "新资产 {} ({}) creator={}",
                    event.address,
                    event.symbol,
                    event.creator
                );
                self.replay_orphans(&event.address).await;
                Ok(ApplyOutcome::Created)
            }
            Err(StoreError::DuplicateAsset(address)) => {
                bump(&self.stats.duplicate_assets);
                log::debug!(target: LOG_TARGET, "资产 {} 已存在，忽略重复创建", address);
                Ok(ApplyOutcome::DuplicateAsset)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn apply_trade(
        &self,
        context: EventContext,
        event: TradeSettled,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let record = TradeRecord::from_settled(
            &event,
            &context.signature,
            context.event_index,
            context.slot,
        );
        let rules = SettleRules {
            reserve_tolerance: self.config.reserve_tolerance,
            graduation_threshold: self.protocol.graduation_threshold,
        };
        let settled = event.clone();
        let outcome = self
            .repository
            .settle_trade(
                record,
                Box::new(move |current: &AssetRecord| settle_asset(current, &settled, &rules)),
            )
            .await?;
        match outcome {
            SettleOutcome::Applied(asset) => {
                bump(&self.stats.trades_applied);
                log::debug!(
                    target: LOG_TARGET,
                    "成交已应用 {}#{} asset={} supply={} real={}",
                    context.signature,
                    context.event_index,
                    asset.address,
                    asset.total_output_supply,
                    asset.real_input_balance
                );
                Ok(ApplyOutcome::TradeApplied)
            }
            SettleOutcome::Duplicate => {
                bump(&self.stats.duplicate_trades);
                log::debug!(
                    target: LOG_TARGET,
                    "重复成交 {}#{}，已忽略",
                    context.signature,
                    context.event_index
                );
                Ok(ApplyOutcome::DuplicateTrade)
            }
            SettleOutcome::AssetMissing => {
                self.defer(context, LedgerEvent::TradeSettled(event)).await;
                Ok(ApplyOutcome::Deferred)
            }
            SettleOutcome::Rejected(reason) => {
                bump(&self.stats.ordering_violations);
                log::warn!(
                    target: LOG_TARGET,
                    "数据完整性告警: 成交 {}#{} asset={} 未应用: {}",
                    context.signature,
                    context.event_index,
                    event.address,
                    reason
                );
                Err(ReconcileError::OrderingViolation {
                    asset: event.address,
                    reason,
                })
            }
        }
    }

    async fn apply_graduated(
        &self,
        context: EventContext,
        event: AssetGraduated,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let outcome = self
            .repository
            .mark_graduated(&event.address, event.total_input_raised, event.graduated_at)
            .await?;
        match outcome {
            GraduateOutcome::Graduated(asset) => {
                bump(&self.stats.graduations);
                log::info!(
                    target: LOG_TARGET,
                    "资产 {} 已毕业，募集 {}",
                    asset.address,
                    asset.real_input_balance
                );
                Ok(ApplyOutcome::Graduated)
            }
            GraduateOutcome::AlreadyGraduated => {
                bump(&self.stats.already_graduated);
                log::debug!(target: LOG_TARGET, "资产 {} 已处于毕业状态", event.address);
                Ok(ApplyOutcome::AlreadyGraduated)
            }
            GraduateOutcome::AssetMissing => {
                self.defer(context, LedgerEvent::AssetGraduated(event)).await;
                Ok(ApplyOutcome::Deferred)
            }
        }
    }

    async fn defer(&self, context: EventContext, event: LedgerEvent) {
        let asset = event.asset();
        self.hold_batch(&context).await;
        let entry = OrphanEntry {
            context,
            event,
            buffered_at: Instant::now(),
        };
        let evicted = self.orphans.lock().await.push(entry);
        bump(&self.stats.orphans_buffered);
        log::debug!(target: LOG_TARGET, "资产 {} 尚未创建，事件进入等待缓冲", asset);
        if let Some(evicted) = evicted {
            bump(&self.stats.orphans_dropped);
            log::warn!(
                target: LOG_TARGET,
                "{}",
                ReconcileError::orphan(&evicted, "缓冲已满")
            );
            self.release_batch(&evicted.context, false).await;
        }
    }

    async fn hold_batch(&self, context: &EventContext) {
        if let (Some(batch), Some(hold)) = (context.batch, self.orphan_hold.get()) {
            hold.hold(batch).await;
        }
    }

    async fn release_batch(&self, context: &EventContext, applied: bool) {
        if let (Some(batch), Some(hold)) = (context.batch, self.orphan_hold.get()) {
            hold.release(batch, applied).await;
        }
    }

    async fn replay_orphans(&self, asset: &Pubkey) {
        let pending = self.orphans.lock().await.take_for(asset);
        if pending.is_empty() {
            return;
        }
        log::info!(
            target: LOG_TARGET,
            "资产 {} 创建后回放 {} 条等待事件",
            asset,
            pending.len()
        );
        for entry in pending {
            bump(&self.stats.orphans_replayed);
            let context = entry.context.clone();
            let result = match entry.event {
                LedgerEvent::TradeSettled(trade) => self.apply_trade(entry.context, trade).await,
                LedgerEvent::AssetGraduated(graduated) => {
                    self.apply_graduated(entry.context, graduated).await
                }
                LedgerEvent::AssetCreated(_) => Ok(ApplyOutcome::DuplicateAsset),
            };
            let applied = match result {
                Ok(_) => true,
                Err(ReconcileError::Store(err)) => {
                    bump(&self.stats.store_errors);
                    log::error!(target: LOG_TARGET, "回放等待事件写入失败: {}", err);
                    false
                }
                Err(err) => {
                    log::warn!(target: LOG_TARGET, "回放等待事件失败: {}", err);
                    true
                }
            };
            self.release_batch(&context, applied).await;
        }
    }

    /// 丢弃等待超过窗口期的孤儿事件，返回丢弃数量。
    pub async fn sweep_orphans(&self) -> usize {
        let expired = self.orphans.lock().await.expire(Instant::now());
        for entry in &expired {
            bump(&self.stats.orphans_dropped);
            log::warn!(
                target: LOG_TARGET,
                "{}",
                ReconcileError::orphan(entry, "等待超时")
            );
            self.release_batch(&entry.context, false).await;
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::curve::math::{simulate_buy, PLATFORM_FEE_BPS};
    use crate::state::InMemoryAssetRepository;

    struct Harness {
        repo: Arc<InMemoryAssetRepository>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let repo = Arc::new(InMemoryAssetRepository::new());
        let reconciler = Reconciler::new(
            repo.clone(),
            ProtocolConfig::default(),
            ReconcilerConfig::default(),
        );
        Harness { repo, reconciler }
    }

    fn ctx(signature: &str, event_index: u32) -> EventContext {
        EventContext {
            signature: signature.into(),
            slot: 1,
            event_index,
            batch: None,
        }
    }

    fn created(address: Pubkey) -> LedgerEvent {
        LedgerEvent::AssetCreated(AssetCreated {
            address,
            creator: Pubkey::new_unique(),
            name: "Frog".into(),
            symbol: "FROG".into(),
            uri: String::new(),
            created_at: 1,
        })
    }

    fn buy(address: Pubkey, vin: u64, vout: u64, gross: u64, settled_at: i64) -> TradeSettled {
        let outcome = simulate_buy(vin, vout, gross, PLATFORM_FEE_BPS).expect("模拟买入失败");
        TradeSettled {
            address,
            trader: Pubkey::new_unique(),
            is_buy: true,
            input_amount: gross,
            output_amount: outcome.output_amount,
            fee_amount: outcome.fee,
            settled_at,
            virtual_input_after: outcome.virtual_input_after,
            virtual_output_after: outcome.virtual_output_after,
        }
    }

    fn first_buy(address: Pubkey) -> TradeSettled {
        let protocol = ProtocolConfig::default();
        buy(
            address,
            protocol.initial_virtual_input_reserve,
            protocol.initial_virtual_output_reserve,
            1_000_000_000,
            10,
        )
    }

    async fn stored(h: &Harness, address: &Pubkey) -> AssetRecord {
        h.repo
            .get_asset(address)
            .await
            .expect("读取失败")
            .expect("资产应存在")
    }

    #[tokio::test]
    async fn test_redelivered_trade_applies_once() {
        let h = harness();
        let address = Pubkey::new_unique();
        h.reconciler.apply(ctx("c", 0), created(address)).await.expect("创建失败");
        let trade = LedgerEvent::TradeSettled(first_buy(address));

        let first = h.reconciler.apply(ctx("t", 0), trade.clone()).await;
        assert_eq!(first.expect("首次应用失败"), ApplyOutcome::TradeApplied);
        let after_once = stored(&h, &address).await;

        let second = h.reconciler.apply(ctx("t", 0), trade).await;
        assert_eq!(second.expect("重复应用失败"), ApplyOutcome::DuplicateTrade);
        assert_eq!(stored(&h, &address).await, after_once);
        assert_eq!(h.repo.trades_for(&address, 10).await.expect("读取失败").len(), 1);
        assert_eq!(h.reconciler.stats().snapshot().duplicate_trades, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_noop() {
        let h = harness();
        let address = Pubkey::new_unique();
        let outcome = h.reconciler.apply(ctx("c", 0), created(address)).await;
        assert_eq!(outcome.expect("创建失败"), ApplyOutcome::Created);
        let again = h.reconciler.apply(ctx("c", 0), created(address)).await;
        assert_eq!(again.expect("重复创建失败"), ApplyOutcome::DuplicateAsset);
    }

    #[tokio::test]
    async fn test_orphan_trade_replayed_on_create() {
        let h = harness();
        let address = Pubkey::new_unique();
        let trade = first_buy(address);
        let deferred = h
            .reconciler
            .apply(ctx("t", 0), LedgerEvent::TradeSettled(trade.clone()))
            .await;
        assert_eq!(deferred.expect("缓冲失败"), ApplyOutcome::Deferred);
        assert_eq!(h.reconciler.pending_orphans().await, 1);

        h.reconciler.apply(ctx("c", 0), created(address)).await.expect("创建失败");
        assert_eq!(h.reconciler.pending_orphans().await, 0);
        let asset = stored(&h, &address).await;
        assert_eq!(asset.total_output_supply, trade.output_amount);
        assert_eq!(asset.virtual_input_reserve, trade.virtual_input_after);
        assert_eq!(h.reconciler.stats().snapshot().orphans_replayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_dropped_after_window() {
        let h = harness();
        let address = Pubkey::new_unique();
        h.reconciler
            .apply(ctx("t", 0), LedgerEvent::TradeSettled(first_buy(address)))
            .await
            .expect("缓冲失败");
        assert_eq!(h.reconciler.sweep_orphans().await, 0);
        tokio::time::advance(Duration::from_millis(
            ReconcilerConfig::default().orphan_window_ms + 1,
        ))
        .await;
        assert_eq!(h.reconciler.sweep_orphans().await, 1);
        assert_eq!(h.reconciler.stats().snapshot().orphans_dropped, 1);

        h.reconciler.apply(ctx("c", 0), created(address)).await.expect("创建失败");
        assert_eq!(stored(&h, &address).await.trade_count, 0);
    }

    #[derive(Default)]
    struct RecordingHold {
        calls: std::sync::Mutex<Vec<(&'static str, u64, bool)>>,
    }

    #[async_trait]
    impl OrphanHold for RecordingHold {
        async fn hold(&self, batch: u64) {
            self.calls.lock().expect("锁失败").push(("hold", batch, true));
        }

        async fn release(&self, batch: u64, applied: bool) {
            self.calls.lock().expect("锁失败").push(("release", batch, applied));
        }
    }

    fn batch_ctx(signature: &str, batch: u64) -> EventContext {
        EventContext {
            batch: Some(batch),
            ..ctx(signature, 0)
        }
    }

    #[tokio::test]
    async fn test_orphan_holds_batch_until_replayed() {
        let h = harness();
        let hold = Arc::new(RecordingHold::default());
        h.reconciler.attach_orphan_hold(hold.clone());
        let address = Pubkey::new_unique();
        h.reconciler
            .apply(batch_ctx("t", 7), LedgerEvent::TradeSettled(first_buy(address)))
            .await
            .expect("缓冲失败");
        assert_eq!(*hold.calls.lock().expect("锁失败"), vec![("hold", 7, true)]);

        h.reconciler
            .apply(batch_ctx("c", 8), created(address))
            .await
            .expect("创建失败");
        assert_eq!(
            *hold.calls.lock().expect("锁失败"),
            vec![("hold", 7, true), ("release", 7, true)]
        );
        assert_eq!(stored(&h, &address).await.trade_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_orphan_releases_batch_as_unapplied() {
        let h = harness();
        let hold = Arc::new(RecordingHold::default());
        h.reconciler.attach_orphan_hold(hold.clone());
        let address = Pubkey::new_unique();
        h.reconciler
            .apply(batch_ctx("t", 3), LedgerEvent::TradeSettled(first_buy(address)))
            .await
            .expect("缓冲失败");
        tokio::time::advance(Duration::from_millis(
            ReconcilerConfig::default().orphan_window_ms + 1,
        ))
        .await;
        assert_eq!(h.reconciler.sweep_orphans().await, 1);
        assert_eq!(
            *hold.calls.lock().expect("锁失败"),
            vec![("hold", 3, true), ("release", 3, false)]
        );
    }

    #[tokio::test]
    async fn test_evicted_orphan_releases_batch_as_unapplied() {
        let repo = Arc::new(InMemoryAssetRepository::new());
        let config = ReconcilerConfig {
            orphan_capacity: 1,
            ..ReconcilerConfig::default()
        };
        let reconciler = Reconciler::new(repo, ProtocolConfig::default(), config);
        let hold = Arc::new(RecordingHold::default());
        reconciler.attach_orphan_hold(hold.clone());
        for batch in [1, 2] {
            reconciler
                .apply(
                    batch_ctx(&format!("t{}", batch), batch),
                    LedgerEvent::TradeSettled(first_buy(Pubkey::new_unique())),
                )
                .await
                .expect("缓冲失败");
        }
        assert_eq!(reconciler.pending_orphans().await, 1);
        assert_eq!(
            *hold.calls.lock().expect("锁失败"),
            vec![("hold", 1, true), ("hold", 2, true), ("release", 1, false)]
        );
    }

    #[tokio::test]
    async fn test_inconsistent_trade_is_skipped() {
        let h = harness();
        let address = Pubkey::new_unique();
        h.reconciler.apply(ctx("c", 0), created(address)).await.expect("创建失败");
        let mut trade = first_buy(address);
        trade.virtual_input_after += 1_000;
        let result = h
            .reconciler
            .apply(ctx("t", 0), LedgerEvent::TradeSettled(trade))
            .await;
        assert!(matches!(result, Err(ReconcileError::OrderingViolation { .. })));
        let asset = stored(&h, &address).await;
        assert_eq!(asset.trade_count, 0);
        assert!(h.repo.trades_for(&address, 10).await.expect("读取失败").is_empty());
        assert_eq!(h.reconciler.stats().snapshot().ordering_violations, 1);
    }

    #[tokio::test]
    async fn test_graduation_in_same_transaction_is_ordered() {
        let h = harness();
        let address = Pubkey::new_unique();
        h.reconciler.apply(ctx("c", 0), created(address)).await.expect("创建失败");

        let protocol = ProtocolConfig::default();
        let mut vin = protocol.initial_virtual_input_reserve;
        let mut vout = protocol.initial_virtual_output_reserve;
        for n in 0..85 {
            let trade = buy(address, vin, vout, 1_000_000_000, n + 1);
            vin = trade.virtual_input_after;
            vout = trade.virtual_output_after;
            h.reconciler
                .apply(ctx(&format!("t{}", n), 0), LedgerEvent::TradeSettled(trade))
                .await
                .expect("买入失败");
        }
        assert!(!stored(&h, &address).await.graduated);

        // 链上先输出毕业事件，再输出触发它的成交
        let last = buy(address, vin, vout, 1_000_000_000, 100);
        let raised = stored(&h, &address).await.real_input_balance + 990_000_000;
        let graduated = LedgerEvent::AssetGraduated(AssetGraduated {
            address,
            total_input_raised: raised,
            graduated_at: 100,
        });
        let results = h
            .reconciler
            .apply_transaction(
                "final",
                5,
                None,
                vec![(0, graduated.clone()), (1, LedgerEvent::TradeSettled(last))],
            )
            .await;
        let outcomes: Vec<_> = results
            .into_iter()
            .map(|r| r.expect("应用失败"))
            .collect();
        assert_eq!(outcomes, vec![ApplyOutcome::TradeApplied, ApplyOutcome::Graduated]);

        let asset = stored(&h, &address).await;
        assert!(asset.graduated);
        assert_eq!(asset.graduated_at, Some(100));
        assert_eq!(asset.real_input_balance, raised);

        let again = h.reconciler.apply(ctx("final", 0), graduated).await;
        assert_eq!(again.expect("重复毕业失败"), ApplyOutcome::AlreadyGraduated);
        assert!(stored(&h, &address).await.graduated);
    }

    #[tokio::test]
    async fn test_trade_after_graduation_recorded_without_reverting() {
        let h = harness();
        let address = Pubkey::new_unique();
        h.reconciler.apply(ctx("c", 0), created(address)).await.expect("创建失败");
        h.reconciler
            .apply(
                ctx("g", 0),
                LedgerEvent::AssetGraduated(AssetGraduated {
                    address,
                    total_input_raised: 85_000_000_000,
                    graduated_at: 5,
                }),
            )
            .await
            .expect("毕业失败");
        let outcome = h
            .reconciler
            .apply(ctx("t", 0), LedgerEvent::TradeSettled(first_buy(address)))
            .await;
        assert_eq!(outcome.expect("成交失败"), ApplyOutcome::TradeApplied);
        let asset = stored(&h, &address).await;
        assert!(asset.graduated);
        assert_eq!(asset.trade_count, 1);
    }
}
