use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use curve_indexer_core::config::AppConfig;
use curve_indexer_core::event::source::{
    LedgerRpc, RpcLedgerClient, SolanaEventSource, SolanaEventSourceConfig,
};
use curve_indexer_core::event::{EventListener, EventSource, MockEventSource};
use curve_indexer_core::reconciler::Reconciler;
use curve_indexer_core::watcher::{LedgerWatcher, LedgerWatcherConfig};

use crate::shared::SharedObjects;

/// 启动监听流程；`replay` 为录制的日志批次文件时走同一条处理链路后退出。
pub async fn listen(config: &AppConfig, replay: Option<PathBuf>) -> Result<()> {
    let shared = SharedObjects::open(config).await?;
    let reconciler = Arc::new(Reconciler::new(
        shared.repository.clone(),
        config.protocol.clone(),
        config.reconciler.clone(),
    ));
    let watcher_config = LedgerWatcherConfig::new(
        config.network.program_pubkey()?,
        &config.watcher,
        &config.monitoring,
        config.reconciler.orphan_sweep_ms,
    );

    match replay {
        Some(path) => {
            let source = Arc::new(MockEventSource::from_replay_file(&path)?);
            log::info!(
                "回放文件 {} 共 {} 个批次",
                path.display(),
                source.remaining().await
            );
            let watcher = LedgerWatcher::new(reconciler, source, watcher_config);
            watcher.start().await?;
            watcher.wait().await;
        }
        None => {
            let source = build_live_source(config, &shared).await?;
            let watcher = LedgerWatcher::new(reconciler, source, watcher_config);
            watcher.start().await?;
            log::info!("实时监听已启动，按 Ctrl+C 结束...");
            tokio::signal::ctrl_c()
                .await
                .map_err(|err| anyhow!(format!("等待 Ctrl+C 失败: {}", err)))?;
            watcher.stop().await?;
        }
    }

    let assets = shared.repository.list_assets().await?;
    let graduated = assets.iter().filter(|asset| asset.graduated).count();
    log::info!(
        "监听结束，资产 {} 个，其中已毕业 {} 个，游标 {:?}",
        assets.len(),
        graduated,
        shared.repository.load_cursor().await?
    );
    shared.close().await;
    Ok(())
}

async fn build_live_source(
    config: &AppConfig,
    shared: &SharedObjects,
) -> Result<Arc<dyn EventSource>> {
    let source_config = SolanaEventSourceConfig::from_app_config(config)?;
    let rpc: Arc<dyn LedgerRpc> = Arc::new(RpcLedgerClient::new(
        &config.network.http_endpoint,
        source_config.commitment,
    ));
    let cursor = shared.repository.load_cursor().await?;
    match cursor.as_deref() {
        Some(signature) => log::info!("从游标 {} 开始补齐", signature),
        None => log::info!(
            "没有持久化游标，回溯最近 {} 笔交易",
            source_config.initial_backfill_limit
        ),
    }
    let source = SolanaEventSource::connect(source_config, rpc, cursor).await?;
    Ok(source as Arc<dyn EventSource>)
}
