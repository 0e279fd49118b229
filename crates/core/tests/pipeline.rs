use std::sync::Arc;

use curve_indexer_core::config::{MonitoringConfig, ProtocolConfig, ReconcilerConfig, WatcherConfig};
use curve_indexer_core::curve::event::{AssetCreated, AssetGraduated, LedgerEvent, TradeSettled};
use curve_indexer_core::curve::math::simulate_buy;
use curve_indexer_core::event::{BatchOrigin, EventListener, LogBatch, MockEventSource};
use curve_indexer_core::quote::{QuoteError, QuoteService};
use curve_indexer_core::reconciler::Reconciler;
use curve_indexer_core::state::{AssetRepository, InMemoryAssetRepository, SqliteAssetRepository};
use curve_indexer_core::types::TradeSide;
use curve_indexer_core::watcher::{LedgerWatcher, LedgerWatcherConfig};
use solana_sdk::pubkey::Pubkey;

struct Chain {
    program_id: Pubkey,
    protocol: ProtocolConfig,
    batches: Vec<LogBatch>,
    vin: u64,
    vout: u64,
    real: u64,
    clock: i64,
}

impl Chain {
    fn new() -> Self {
        let protocol = ProtocolConfig::default();
        Self {
            program_id: Pubkey::new_unique(),
            vin: protocol.initial_virtual_input_reserve,
            vout: protocol.initial_virtual_output_reserve,
            protocol,
            batches: Vec::new(),
            real: 0,
            clock: 0,
        }
    }

    fn push(&mut self, events: &[LedgerEvent]) {
        let mut logs = vec![format!("Program {} invoke [1]", self.program_id)];
        for event in events {
            let data = event.to_program_data().expect("编码失败");
            logs.push(format!("Program data: {}", data));
        }
        logs.push(format!("Program {} success", self.program_id));
        self.batches.push(LogBatch {
            signature: format!("sig-{}", self.batches.len()),
            slot: self.batches.len() as u64,
            logs,
            failed: false,
            origin: BatchOrigin::Live,
        });
    }

    fn created(&self, address: Pubkey) -> LedgerEvent {
        LedgerEvent::AssetCreated(AssetCreated {
            address,
            creator: Pubkey::new_unique(),
            name: "Pipeline".into(),
            symbol: "PIPE".into(),
            uri: "ipfs://pipe".into(),
            created_at: self.clock,
        })
    }

    fn buy(&mut self, address: Pubkey, gross: u64) -> LedgerEvent {
        let outcome = simulate_buy(self.vin, self.vout, gross, self.protocol.fee_bps)
            .expect("模拟买入失败");
        self.vin = outcome.virtual_input_after;
        self.vout = outcome.virtual_output_after;
        self.real += outcome.curve_input;
        self.clock += 1;
        LedgerEvent::TradeSettled(TradeSettled {
            address,
            trader: Pubkey::new_unique(),
            is_buy: true,
            input_amount: gross,
            output_amount: outcome.output_amount,
            fee_amount: outcome.fee,
            settled_at: self.clock,
            virtual_input_after: outcome.virtual_input_after,
            virtual_output_after: outcome.virtual_output_after,
        })
    }
}

async fn run_pipeline(
    repository: Arc<dyn AssetRepository>,
    chain: &Chain,
    batches: Vec<LogBatch>,
) -> Arc<Reconciler> {
    let reconciler = Arc::new(Reconciler::new(
        repository,
        chain.protocol.clone(),
        ReconcilerConfig::default(),
    ));
    let watcher_config = LedgerWatcherConfig::new(
        chain.program_id,
        &WatcherConfig::default(),
        &MonitoringConfig::default(),
        1_000,
    );
    let source = Arc::new(MockEventSource::new(batches));
    let watcher = LedgerWatcher::new(reconciler.clone(), source, watcher_config);
    watcher.start().await.expect("监听启动失败");
    watcher.wait().await;
    reconciler
}

#[tokio::test]
async fn redelivered_batches_are_applied_once() {
    let repo = Arc::new(InMemoryAssetRepository::new());
    let mut chain = Chain::new();
    let asset = Pubkey::new_unique();
    chain.push(&[chain.created(asset)]);
    for _ in 0..5 {
        let trade = chain.buy(asset, 500_000_000);
        chain.push(&[trade]);
    }

    let mut delivered = chain.batches.clone();
    delivered.extend(chain.batches.iter().cloned().map(|mut batch| {
        batch.origin = BatchOrigin::Backfill;
        batch
    }));
    run_pipeline(repo.clone(), &chain, delivered).await;

    let record = repo.get_asset(&asset).await.expect("读取失败").expect("资产应存在");
    assert_eq!(record.trade_count, 5);
    assert_eq!(record.real_input_balance, chain.real);
    assert_eq!(record.virtual_input_reserve, chain.vin);
    assert_eq!(repo.trades_for(&asset, 100).await.expect("读取失败").len(), 5);
    assert_eq!(
        repo.load_cursor().await.expect("读取游标失败").as_deref(),
        Some("sig-5")
    );
}

#[tokio::test]
async fn trade_before_create_is_replayed() {
    let repo = Arc::new(InMemoryAssetRepository::new());
    let mut chain = Chain::new();
    let asset = Pubkey::new_unique();
    let create = chain.created(asset);
    let trade = chain.buy(asset, 1_000_000_000);
    chain.push(&[trade]);
    chain.push(&[create]);

    run_pipeline(repo.clone(), &chain, chain.batches.clone()).await;

    let record = repo.get_asset(&asset).await.expect("读取失败").expect("资产应存在");
    assert_eq!(record.trade_count, 1);
    assert_eq!(record.real_input_balance, 990_000_000);
}

#[tokio::test]
async fn graduation_is_monotonic_and_blocks_quotes() {
    let repo = Arc::new(InMemoryAssetRepository::new());
    let mut chain = Chain::new();
    let asset = Pubkey::new_unique();
    chain.push(&[chain.created(asset)]);
    while chain.real + 990_000_000 < chain.protocol.graduation_threshold {
        let trade = chain.buy(asset, 1_000_000_000);
        chain.push(&[trade]);
    }
    let last = chain.buy(asset, 1_000_000_000);
    let graduated = LedgerEvent::AssetGraduated(AssetGraduated {
        address: asset,
        total_input_raised: chain.real,
        graduated_at: chain.clock,
    });
    // 链上先输出毕业事件
    chain.push(&[graduated.clone(), last]);
    chain.push(&[graduated]);

    run_pipeline(repo.clone(), &chain, chain.batches.clone()).await;

    let record = repo.get_asset(&asset).await.expect("读取失败").expect("资产应存在");
    assert!(record.graduated);
    assert_eq!(record.graduated_at, Some(chain.clock));
    assert_eq!(record.real_input_balance, chain.real);

    let quotes = QuoteService::new(repo.clone(), chain.protocol.clone());
    assert!(matches!(
        quotes.quote(&asset, TradeSide::Buy, 1_000_000, 100).await,
        Err(QuoteError::AssetGraduated(_))
    ));
}

#[tokio::test]
async fn sqlite_backend_runs_the_same_pipeline() {
    let repo = Arc::new(
        SqliteAssetRepository::in_memory()
            .await
            .expect("打开内存 SQLite 失败"),
    );
    let mut chain = Chain::new();
    let assets: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
    for asset in &assets {
        chain.push(&[chain.created(*asset)]);
    }
    // 同一曲线参数只对第一个资产连续成交
    for _ in 0..3 {
        let trade = chain.buy(assets[0], 2_000_000_000);
        chain.push(&[trade]);
    }

    run_pipeline(repo.clone(), &chain, chain.batches.clone()).await;

    assert_eq!(repo.list_assets().await.expect("读取失败").len(), 3);
    let first = repo.get_asset(&assets[0]).await.expect("读取失败").expect("资产应存在");
    assert_eq!(first.trade_count, 3);
    assert_eq!(first.virtual_output_reserve, chain.vout);
    let quote = QuoteService::new(repo.clone(), chain.protocol.clone())
        .quote(&assets[1], TradeSide::Buy, 1_000_000_000, 100)
        .await
        .expect("报价失败");
    assert!(quote.expected_amount > 0);
    assert_eq!(
        repo.load_cursor().await.expect("读取游标失败").as_deref(),
        Some("sig-5")
    );
}

#[tokio::test]
async fn parked_trade_survives_restart_through_backfill() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let url = format!("sqlite://{}", dir.path().join("indexer.db").display());
    let mut chain = Chain::new();
    let asset = Pubkey::new_unique();
    chain.push(&[chain.created(Pubkey::new_unique())]);
    let create = chain.created(asset);
    let trade = chain.buy(asset, 1_000_000_000);
    chain.push(&[trade]);
    chain.push(&[create]);

    // 资产创建前进程退出，成交仍在等待缓冲中
    let first = Arc::new(
        SqliteAssetRepository::connect(&url, 2)
            .await
            .expect("打开 SQLite 失败"),
    );
    let reconciler = run_pipeline(first.clone(), &chain, chain.batches[..2].to_vec()).await;
    assert_eq!(reconciler.pending_orphans().await, 1);
    let cursor = first.load_cursor().await.expect("读取游标失败");
    assert_eq!(cursor.as_deref(), Some("sig-0"));
    first.close().await;

    // 重启后从游标之后补齐，实时流在创建前重复投递了同一笔成交
    let second = Arc::new(
        SqliteAssetRepository::connect(&url, 2)
            .await
            .expect("重新打开 SQLite 失败"),
    );
    let backfilled = |index: usize| {
        let mut batch = chain.batches[index].clone();
        batch.origin = BatchOrigin::Backfill;
        batch
    };
    let resumed = vec![backfilled(1), chain.batches[1].clone(), backfilled(2)];
    let reconciler = run_pipeline(second.clone(), &chain, resumed).await;

    assert_eq!(reconciler.pending_orphans().await, 0);
    let record = second.get_asset(&asset).await.expect("读取失败").expect("资产应存在");
    assert_eq!(record.trade_count, 1);
    assert_eq!(record.real_input_balance, chain.real);
    assert_eq!(second.trades_for(&asset, 10).await.expect("读取失败").len(), 1);
    assert_eq!(
        second.load_cursor().await.expect("读取游标失败").as_deref(),
        Some("sig-2")
    );
}
