use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use super::rpc::{backfill_gap, BackfillParams, LedgerRpc, RetryPolicy};
use crate::config::{AppConfig, AppConfigError};
use crate::event::{BatchOrigin, EventListenerError, EventSource, LogBatch};

const LOG_TARGET: &str = "curve_indexer::event::solana";

/// Solana 日志订阅事件源配置。
#[derive(Debug, Clone)]
pub struct SolanaEventSourceConfig {
    /// WebSocket 端点地址。
    pub ws_endpoint: String,
    /// 订阅的曲线程序。
    pub program_id: Pubkey,
    pub commitment: CommitmentConfig,
    /// 重连初始等待时长，每次失败翻倍。
    pub retry_interval: Duration,
    /// 重连等待上限。
    pub max_retry_interval: Duration,
    /// 内部队列容量。
    pub channel_capacity: usize,
    /// 补齐时单页签名数。
    pub signature_page_size: usize,
    /// 无游标启动时回溯的签名数，0 表示只跟随实时日志。
    pub initial_backfill_limit: usize,
    pub fetch_retry: RetryPolicy,
}

impl SolanaEventSourceConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, AppConfigError> {
        let watcher = &config.watcher;
        let commitment = CommitmentConfig::from_str(&config.network.commitment).map_err(|err| {
            AppConfigError::Invalid(format!(
                "commitment 无效 {}: {}",
                config.network.commitment, err
            ))
        })?;
        Ok(Self {
            ws_endpoint: config.network.ws_endpoint.clone(),
            program_id: config.network.program_pubkey()?,
            commitment,
            retry_interval: Duration::from_secs(watcher.retry_secs.max(1)),
            max_retry_interval: Duration::from_secs(
                watcher.max_retry_secs.max(watcher.retry_secs.max(1)),
            ),
            channel_capacity: watcher.channel_capacity,
            signature_page_size: watcher.signature_page_size,
            initial_backfill_limit: watcher.initial_backfill_limit,
            fetch_retry: RetryPolicy {
                timeout: Duration::from_millis(watcher.fetch_timeout_ms),
                max_retries: watcher.fetch_max_retries,
                base_delay: Duration::from_secs(watcher.retry_secs.max(1)),
                max_delay: Duration::from_secs(watcher.max_retry_secs.max(1)),
            },
        })
    }

    fn backfill_params(&self) -> BackfillParams {
        BackfillParams {
            program: self.program_id,
            page_size: self.signature_page_size,
            initial_limit: self.initial_backfill_limit,
            retry: self.fetch_retry.clone(),
        }
    }
}

/// `logsSubscribe` 实时订阅 + `getSignaturesForAddress` 缺口补齐的事件源。
pub struct SolanaEventSource {
    inner: Arc<Inner>,
    receiver: Mutex<mpsc::Receiver<LogBatch>>,
    ws_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SolanaEventSource {
    /// 启动订阅任务；`cursor` 为上次持久化的签名，首次连接会从它开始补齐。
    pub async fn connect(
        config: SolanaEventSourceConfig,
        rpc: Arc<dyn LedgerRpc>,
        cursor: Option<String>,
    ) -> Result<Arc<Self>, EventListenerError> {
        if config.ws_endpoint.is_empty() {
            return Err(EventListenerError::ConnectionLost("ws_endpoint 为空".into()));
        }
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let inner = Arc::new(Inner {
            config,
            rpc,
            sender,
            shutdown: AtomicBool::new(false),
            last_signature: Mutex::new(cursor),
            live_batches: AtomicU64::new(0),
            skipped_duplicates: AtomicU64::new(0),
            ws_reconnects: AtomicU64::new(0),
        });
        let source = Arc::new(Self {
            inner,
            receiver: Mutex::new(receiver),
            ws_handle: Mutex::new(None),
        });
        source.spawn_ws_loop().await;
        Ok(source)
    }

    async fn spawn_ws_loop(self: &Arc<Self>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner.run_ws_loop().await;
        });
        *self.ws_handle.lock().await = Some(handle);
    }

    pub fn reconnects(&self) -> u64 {
        self.inner.ws_reconnects.load(Ordering::SeqCst).saturating_sub(1)
    }
}

#[async_trait::async_trait]
impl EventSource for SolanaEventSource {
    async fn next_batch(&self) -> Result<Option<LogBatch>, EventListenerError> {
        let mut guard = self.receiver.lock().await;
        match guard.recv().await {
            Some(batch) => Ok(Some(batch)),
            None if self.inner.shutdown.load(Ordering::SeqCst) => Ok(None),
            None => Err(EventListenerError::ConnectionLost("订阅任务已退出".into())),
        }
    }

    async fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ws_handle.lock().await.take() {
            handle.abort();
        }
        log::info!(target: LOG_TARGET, "日志订阅已关闭");
    }
}

impl Drop for SolanaEventSource {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }
}

struct Inner {
    config: SolanaEventSourceConfig,
    rpc: Arc<dyn LedgerRpc>,
    sender: mpsc::Sender<LogBatch>,
    shutdown: AtomicBool,
    /// 最近一笔已投递的签名，重连后从这里补齐。
    last_signature: Mutex<Option<String>>,
    live_batches: AtomicU64,
    skipped_duplicates: AtomicU64,
    ws_reconnects: AtomicU64,
}

impl Inner {
    async fn run_ws_loop(self: Arc<Self>) {
        let base_retry = self.config.retry_interval;
        let max_retry = self.config.max_retry_interval.max(base_retry);
        let mut current_retry = base_retry;

        while !self.shutdown.load(Ordering::SeqCst) {
            let attempt = self.ws_reconnects.fetch_add(1, Ordering::SeqCst);
            if attempt > 0 {
                log::info!(target: LOG_TARGET, "尝试重连 WebSocket，第 {} 次", attempt);
            }
            let connected = match self.stream_once().await {
                Ok(()) => true,
                Err(err) => {
                    log::error!(target: LOG_TARGET, "日志订阅中断: {}", err);
                    false
                }
            };

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let wait = if connected { base_retry } else { current_retry };
            log::info!(
                target: LOG_TARGET,
                "WebSocket 已断开，{} 秒后重试",
                wait.as_secs().max(1)
            );
            sleep(wait).await;
            current_retry = if connected {
                base_retry
            } else {
                current_retry.saturating_mul(2).min(max_retry)
            };
        }
    }

    /// 一次完整的连接周期：先订阅，再补齐缺口，最后消费实时流。
    /// 订阅成功并进入实时流后断开返回 `Ok`，用于重置退避。
    async fn stream_once(&self) -> Result<(), EventListenerError> {
        let client = PubsubClient::new(&self.config.ws_endpoint)
            .await
            .map_err(|err| EventListenerError::ConnectionLost(err.to_string()))?;
        let (mut stream, unsubscribe) = client
            .logs_subscribe(
                RpcTransactionLogsFilter::Mentions(vec![self.config.program_id.to_string()]),
                RpcTransactionLogsConfig {
                    commitment: Some(self.config.commitment),
                },
            )
            .await
            .map_err(|err| EventListenerError::ConnectionLost(err.to_string()))?;
        log::info!(
            target: LOG_TARGET,
            "日志订阅成功: {} program={}",
            self.config.ws_endpoint,
            self.config.program_id
        );

        let until = self.last_signature.lock().await.clone();
        let report = backfill_gap(
            self.rpc.as_ref(),
            &self.config.backfill_params(),
            until.as_deref(),
            &self.sender,
        )
        .await?;
        if let Some(last) = report.last_signature {
            *self.last_signature.lock().await = Some(last);
        }
        let backfilled: HashSet<String> = report.delivered;

        while let Some(response) = stream.next().await {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let value = response.value;
            if backfilled.contains(&value.signature) {
                self.skipped_duplicates.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let batch = LogBatch {
                signature: value.signature,
                slot: response.context.slot,
                logs: value.logs,
                failed: value.err.is_some(),
                origin: BatchOrigin::Live,
            };
            self.publish(batch).await?;
        }
        drop(stream);
        unsubscribe().await;
        Ok(())
    }

    async fn publish(&self, batch: LogBatch) -> Result<(), EventListenerError> {
        let signature = batch.signature.clone();
        self.sender
            .send(batch)
            .await
            .map_err(|err| EventListenerError::Internal(err.to_string()))?;
        *self.last_signature.lock().await = Some(signature);
        let count = self.live_batches.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 1_000 == 0 {
            log::info!(
                target: LOG_TARGET,
                "实时日志: 累计 {} 批, 补齐重复跳过 {} 批, 重连 {} 次",
                count,
                self.skipped_duplicates.load(Ordering::Relaxed),
                self.ws_reconnects.load(Ordering::SeqCst).saturating_sub(1)
            );
        }
        Ok(())
    }
}
