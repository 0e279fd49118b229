//! 账本监听：从事件源读取日志批次，解码后按资产分区交给对账器。

pub mod checkpoint;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant, MissedTickBehavior};

use self::checkpoint::CheckpointTracker;
use crate::config::{MonitoringConfig, WatcherConfig};
use crate::curve::event::{LedgerEvent, SCHEMA_V1};
use crate::event::logs::decode_logs;
use crate::event::queue::{PartitionedQueue, QueueError};
use crate::event::{BatchOrigin, EventListener, EventListenerError, EventSource, LogBatch};
use crate::reconciler::{ReconcileError, Reconciler};

const LOG_TARGET: &str = "curve_indexer::watcher";
const STORE_RETRY_LIMIT: u32 = 3;
const STORE_RETRY_BASE: Duration = Duration::from_millis(200);

/// 一笔交易中属于同一资产的事件。
#[derive(Debug, Clone)]
struct WorkItem {
    seq: u64,
    signature: String,
    slot: u64,
    events: Vec<(u32, LedgerEvent)>,
}

/// 监听器运行参数。
#[derive(Debug, Clone)]
pub struct LedgerWatcherConfig {
    pub program_id: Pubkey,
    pub worker_count: usize,
    pub queue_depth: usize,
    pub orphan_sweep_interval: Duration,
    pub retry_interval: Duration,
    pub batch_delay_warn_ms: u64,
    pub stats_batch_interval: u64,
}

impl LedgerWatcherConfig {
    pub fn new(
        program_id: Pubkey,
        watcher: &WatcherConfig,
        monitoring: &MonitoringConfig,
        orphan_sweep_ms: u64,
    ) -> Self {
        Self {
            program_id,
            worker_count: watcher.worker_count.max(1),
            queue_depth: watcher.queue_depth.max(1),
            orphan_sweep_interval: Duration::from_millis(orphan_sweep_ms.max(1)),
            retry_interval: Duration::from_secs(watcher.retry_secs.max(1)),
            batch_delay_warn_ms: monitoring.batch_delay_warn_ms,
            stats_batch_interval: monitoring.stats_batch_interval,
        }
    }
}

#[derive(Debug, Default)]
pub struct WatcherStats {
    pub batches_received: AtomicU64,
    pub failed_transactions: AtomicU64,
    pub malformed_events: AtomicU64,
    pub groups_dispatched: AtomicU64,
    pub store_retries: AtomicU64,
    pub groups_abandoned: AtomicU64,
    pub source_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WatcherStatsSnapshot {
    pub batches_received: u64,
    pub failed_transactions: u64,
    pub malformed_events: u64,
    pub groups_dispatched: u64,
    pub store_retries: u64,
    pub groups_abandoned: u64,
    pub source_errors: u64,
}

impl WatcherStats {
    pub fn snapshot(&self) -> WatcherStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        WatcherStatsSnapshot {
            batches_received: load(&self.batches_received),
            failed_transactions: load(&self.failed_transactions),
            malformed_events: load(&self.malformed_events),
            groups_dispatched: load(&self.groups_dispatched),
            store_retries: load(&self.store_retries),
            groups_abandoned: load(&self.groups_abandoned),
            source_errors: load(&self.source_errors),
        }
    }
}

/// 单一读取循环 + 按资产分区的工作者池。
pub struct LedgerWatcher {
    reconciler: Arc<Reconciler>,
    source: Arc<dyn EventSource>,
    config: LedgerWatcherConfig,
    program_id: String,
    checkpoint: Arc<CheckpointTracker>,
    stats: WatcherStats,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerWatcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        source: Arc<dyn EventSource>,
        config: LedgerWatcherConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let checkpoint = Arc::new(CheckpointTracker::new(reconciler.repository().clone()));
        reconciler.attach_orphan_hold(checkpoint.clone());
        Arc::new(Self {
            program_id: config.program_id.to_string(),
            reconciler,
            source,
            config,
            checkpoint,
            stats: WatcherStats::default(),
            running: AtomicBool::new(false),
            shutdown,
            reader_handle: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
            sweep_handle: Mutex::new(None),
        })
    }

    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn checkpoint(&self) -> &CheckpointTracker {
        &self.checkpoint
    }

    /// 等待事件源结束并处理完全部在途事件，用于回放模式。
    pub async fn wait(&self) {
        if let Some(handle) = self.reader_handle.lock().await.take() {
            if let Err(err) = handle.await {
                log::warn!(target: LOG_TARGET, "读取任务结束异常: {}", err);
            }
        }
        let workers: Vec<_> = self.worker_handles.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(err) = handle.await {
                log::warn!(target: LOG_TARGET, "工作者任务结束异常: {}", err);
            }
        }
        self.shutdown.send_replace(true);
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            if let Err(err) = handle.await {
                log::warn!(target: LOG_TARGET, "孤儿清理任务结束异常: {}", err);
            }
        }
        self.source.close().await;
        self.running.store(false, Ordering::SeqCst);
        self.log_stats("监听结束");
    }

    fn log_stats(&self, label: &str) {
        let watcher = self.stats.snapshot();
        let reconcile = self.reconciler.stats().snapshot();
        log::info!(
            target: LOG_TARGET,
            "{}: 批次 {} (失败交易 {}, 坏事件 {}), 资产 +{}, 成交 +{} (重复 {}), 毕业 {}, 完整性告警 {}, 孤儿 缓冲 {} / 回放 {} / 丢弃 {}, 存储错误 {}",
            label,
            watcher.batches_received,
            watcher.failed_transactions,
            watcher.malformed_events,
            reconcile.assets_created,
            reconcile.trades_applied,
            reconcile.duplicate_trades,
            reconcile.graduations,
            reconcile.ordering_violations,
            reconcile.orphans_buffered,
            reconcile.orphans_replayed,
            reconcile.orphans_dropped,
            reconcile.store_errors
        );
    }

    async fn read_loop(
        self: Arc<Self>,
        queue: PartitionedQueue<WorkItem>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_arrival: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = self.source.next_batch() => next,
            };
            match next {
                Ok(Some(batch)) => {
                    self.observe_arrival(&mut last_arrival, &batch);
                    if let Err(err) = self.route_batch(&queue, batch).await {
                        log::error!(target: LOG_TARGET, "分发批次失败，停止读取: {}", err);
                        break;
                    }
                }
                Ok(None) => {
                    log::info!(target: LOG_TARGET, "事件源已结束");
                    break;
                }
                Err(err) => {
                    self.stats.source_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!(target: LOG_TARGET, "事件源异常: {}，尝试恢复", err);
                    if let Err(retry_err) = self.source.handle_disconnect().await {
                        log::error!(target: LOG_TARGET, "事件源恢复失败: {}", retry_err);
                    }
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = sleep(self.config.retry_interval) => {}
                    }
                }
            }
        }
        log::info!(
            target: LOG_TARGET,
            "读取循环退出，已分发 {} 组，背压等待 {} 次",
            queue.dispatched(),
            queue.backpressure_waits()
        );
    }

    fn observe_arrival(&self, last_arrival: &mut Option<Instant>, batch: &LogBatch) {
        let now = Instant::now();
        let count = self.stats.batches_received.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(previous) = last_arrival.replace(now) {
            let interval_ms = now.duration_since(previous).as_millis() as u64;
            if self.config.batch_delay_warn_ms > 0 && interval_ms > self.config.batch_delay_warn_ms
            {
                log::warn!(
                    target: LOG_TARGET,
                    "距上一批次已 {} ms 未收到日志，当前 {} slot={}",
                    interval_ms,
                    batch.signature,
                    batch.slot
                );
            }
        }
        if self.config.stats_batch_interval > 0 && count % self.config.stats_batch_interval == 0 {
            self.log_stats("监听统计");
        }
    }

    async fn route_batch(
        &self,
        queue: &PartitionedQueue<WorkItem>,
        batch: LogBatch,
    ) -> Result<(), QueueError> {
        let persist = batch.origin != BatchOrigin::Replay;
        if batch.failed {
            self.stats.failed_transactions.fetch_add(1, Ordering::Relaxed);
            log::debug!(target: LOG_TARGET, "跳过执行失败的交易 {}", batch.signature);
            self.checkpoint.register(&batch.signature, 0, persist).await;
            return Ok(());
        }

        let decoded = decode_logs(&batch.logs, &self.program_id, &SCHEMA_V1);
        for (index, err) in &decoded.errors {
            self.stats.malformed_events.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                target: LOG_TARGET,
                "跳过无法解码的事件 {}#{}: {}",
                batch.signature,
                index,
                err
            );
        }

        let mut groups: Vec<(Pubkey, Vec<(u32, LedgerEvent)>)> = Vec::new();
        for (index, event) in decoded.events {
            let asset = event.asset();
            match groups.iter_mut().find(|(key, _)| *key == asset) {
                Some((_, events)) => events.push((index, event)),
                None => groups.push((asset, vec![(index, event)])),
            }
        }

        let seq = self
            .checkpoint
            .register(&batch.signature, groups.len(), persist)
            .await;
        for (asset, events) in groups {
            let item = WorkItem {
                seq,
                signature: batch.signature.clone(),
                slot: batch.slot,
                events,
            };
            queue.dispatch(&asset, item).await?;
            self.stats.groups_dispatched.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn worker_loop(
        self: Arc<Self>,
        partition: usize,
        mut receiver: mpsc::Receiver<WorkItem>,
    ) {
        while let Some(item) = receiver.recv().await {
            self.process(item).await;
        }
        log::debug!(target: LOG_TARGET, "工作者 {} 已处理完在途事件", partition);
    }

    /// 存储错误时整组重试，已写入的事件会作为重复投递被忽略。
    async fn process(&self, item: WorkItem) {
        let mut attempt = 0;
        let applied = loop {
            let results = self
                .reconciler
                .apply_transaction(
                    &item.signature,
                    item.slot,
                    Some(item.seq),
                    item.events.clone(),
                )
                .await;
            let store_failed = results
                .iter()
                .any(|result| matches!(result, Err(ReconcileError::Store(_))));
            if !store_failed {
                break true;
            }
            if attempt >= STORE_RETRY_LIMIT {
                self.stats.groups_abandoned.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    target: LOG_TARGET,
                    "交易 {} 写入重试 {} 次仍失败，放弃该组事件",
                    item.signature,
                    attempt
                );
                break false;
            }
            attempt += 1;
            self.stats.store_retries.fetch_add(1, Ordering::Relaxed);
            sleep(STORE_RETRY_BASE * 2u32.pow(attempt - 1)).await;
        };
        self.checkpoint.complete(item.seq, applied).await;
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.orphan_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let dropped = self.reconciler.sweep_orphans().await;
                    if dropped > 0 {
                        log::warn!(target: LOG_TARGET, "本轮丢弃 {} 条超时孤儿事件", dropped);
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }
}

#[async_trait]
impl EventListener for Arc<LedgerWatcher> {
    async fn start(&self) -> Result<(), EventListenerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!(target: LOG_TARGET, "监听器已在运行，忽略重复启动");
            return Ok(());
        }
        self.shutdown.send_replace(false);
        let (queue, receivers) =
            PartitionedQueue::new(self.config.worker_count, self.config.queue_depth)?;

        let mut workers = self.worker_handles.lock().await;
        for (partition, receiver) in receivers.into_iter().enumerate() {
            let worker = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                worker.worker_loop(partition, receiver).await;
            }));
        }
        drop(workers);

        let reader = Arc::clone(self);
        let reader_shutdown = self.shutdown.subscribe();
        *self.reader_handle.lock().await = Some(tokio::spawn(async move {
            reader.read_loop(queue, reader_shutdown).await;
        }));

        let sweeper = Arc::clone(self);
        let sweep_shutdown = self.shutdown.subscribe();
        *self.sweep_handle.lock().await = Some(tokio::spawn(async move {
            sweeper.sweep_loop(sweep_shutdown).await;
        }));

        log::info!(
            target: LOG_TARGET,
            "监听已启动: program={}, workers={}, queue_depth={}",
            self.program_id,
            self.config.worker_count,
            self.config.queue_depth
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), EventListenerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        self.wait().await;
        Ok(())
    }
}
