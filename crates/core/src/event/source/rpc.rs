use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::UiTransactionEncoding;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::event::{BatchOrigin, EventListenerError, LogBatch};

const LOG_TARGET: &str = "curve_indexer::event::rpc";

/// 签名列表中的一项。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    pub failed: bool,
}

/// 补齐缺口所需的 HTTP RPC 能力。
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// 按时间倒序返回早于 `before`、晚于 `until`（均不含）的签名，至多 `limit` 条。
    async fn signatures(
        &self,
        program: &Pubkey,
        before: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, EventListenerError>;

    /// 拉取交易日志，交易不存在时返回 `None`。
    async fn transaction_logs(
        &self,
        signature: &str,
    ) -> Result<Option<LogBatch>, EventListenerError>;
}

/// 基于 solana-client 非阻塞 RpcClient 的实现。
pub struct RpcLedgerClient {
    client: RpcClient,
    commitment: CommitmentConfig,
}

impl RpcLedgerClient {
    pub fn new(endpoint: &str, commitment: CommitmentConfig) -> Self {
        Self {
            client: RpcClient::new_with_commitment(endpoint.to_string(), commitment),
            commitment,
        }
    }
}

fn parse_signature(raw: &str) -> Result<Signature, EventListenerError> {
    Signature::from_str(raw)
        .map_err(|err| EventListenerError::Internal(format!("非法签名 {}: {}", raw, err)))
}

#[async_trait]
impl LedgerRpc for RpcLedgerClient {
    async fn signatures(
        &self,
        program: &Pubkey,
        before: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>, EventListenerError> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before: before.map(parse_signature).transpose()?,
            until: until.map(parse_signature).transpose()?,
            limit: Some(limit),
            commitment: Some(self.commitment),
        };
        let statuses = self
            .client
            .get_signatures_for_address_with_config(program, config)
            .await
            .map_err(|err| EventListenerError::Rpc(err.to_string()))?;
        Ok(statuses
            .into_iter()
            .map(|status| SignatureInfo {
                signature: status.signature,
                slot: status.slot,
                failed: status.err.is_some(),
            })
            .collect())
    }

    async fn transaction_logs(
        &self,
        signature: &str,
    ) -> Result<Option<LogBatch>, EventListenerError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .client
            .get_transaction_with_config(&parse_signature(signature)?, config)
            .await
            .map_err(|err| EventListenerError::Rpc(err.to_string()))?;
        let Some(meta) = tx.transaction.meta else {
            return Ok(None);
        };
        let logs = match meta.log_messages {
            OptionSerializer::Some(logs) => logs,
            _ => Vec::new(),
        };
        Ok(Some(LogBatch {
            signature: signature.to_string(),
            slot: tx.slot,
            logs,
            failed: meta.err.is_some(),
            origin: BatchOrigin::Backfill,
        }))
    }
}

/// 单笔交易拉取的超时与重试策略。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// 拉取交易日志；每次尝试受超时约束，失败按指数退避重试，超过次数后放弃并返回 `None`。
pub async fn fetch_with_retry(
    rpc: &dyn LedgerRpc,
    signature: &str,
    policy: &RetryPolicy,
) -> Option<LogBatch> {
    let attempts = policy.max_retries.saturating_add(1);
    let mut delay = policy.base_delay;
    for attempt in 1..=attempts {
        match timeout(policy.timeout, rpc.transaction_logs(signature)).await {
            Ok(Ok(Some(batch))) => return Some(batch),
            Ok(Ok(None)) => {
                log::warn!(target: LOG_TARGET, "交易 {} 尚不可见 (第 {} 次)", signature, attempt)
            }
            Ok(Err(err)) => {
                log::warn!(
                    target: LOG_TARGET,
                    "拉取交易 {} 失败 (第 {} 次): {}",
                    signature,
                    attempt,
                    err
                )
            }
            Err(_) => log::warn!(
                target: LOG_TARGET,
                "拉取交易 {} 超时 {} ms (第 {} 次)",
                signature,
                policy.timeout.as_millis(),
                attempt
            ),
        }
        if attempt < attempts {
            sleep(delay).await;
            delay = delay.saturating_mul(2).min(policy.max_delay);
        }
    }
    log::error!(
        target: LOG_TARGET,
        "交易 {} 连续 {} 次拉取失败，已跳过",
        signature,
        attempts
    );
    None
}

/// 收集 `until` 之后的全部签名，按时间正序返回；`cap` 限制总条数（保留最新的部分）。
pub async fn collect_gap(
    rpc: &dyn LedgerRpc,
    program: &Pubkey,
    until: Option<&str>,
    page_size: usize,
    cap: Option<usize>,
) -> Result<Vec<SignatureInfo>, EventListenerError> {
    let page_size = page_size.max(1);
    let mut before: Option<String> = None;
    let mut collected = Vec::new();
    loop {
        let page = rpc
            .signatures(program, before.as_deref(), until, page_size)
            .await?;
        let fetched = page.len();
        before = page.last().map(|info| info.signature.clone());
        collected.extend(page);
        if let Some(cap) = cap {
            if collected.len() >= cap {
                collected.truncate(cap);
                break;
            }
        }
        if fetched < page_size || before.is_none() {
            break;
        }
    }
    collected.reverse();
    Ok(collected)
}

/// 补齐参数。
#[derive(Debug, Clone)]
pub struct BackfillParams {
    pub program: Pubkey,
    pub page_size: usize,
    /// 没有游标时最多回溯的签名数，0 表示不回溯。
    pub initial_limit: usize,
    pub retry: RetryPolicy,
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub delivered: HashSet<String>,
    pub last_signature: Option<String>,
    pub failed_skipped: u64,
    pub fetch_skipped: u64,
}

/// 补齐 `until` 之后错过的交易并按时间正序投递。
pub async fn backfill_gap(
    rpc: &dyn LedgerRpc,
    params: &BackfillParams,
    until: Option<&str>,
    sender: &mpsc::Sender<LogBatch>,
) -> Result<BackfillReport, EventListenerError> {
    let mut report = BackfillReport::default();
    let cap = match until {
        Some(_) => None,
        None if params.initial_limit == 0 => return Ok(report),
        None => Some(params.initial_limit),
    };
    let gap = collect_gap(rpc, &params.program, until, params.page_size, cap).await?;
    if gap.is_empty() {
        return Ok(report);
    }
    log::info!(
        target: LOG_TARGET,
        "开始补齐缺口: {} 笔交易, 起点 {}",
        gap.len(),
        until.unwrap_or("<最新>")
    );
    for info in gap {
        report.last_signature = Some(info.signature.clone());
        if info.failed {
            report.failed_skipped += 1;
            continue;
        }
        match fetch_with_retry(rpc, &info.signature, &params.retry).await {
            Some(mut batch) => {
                batch.origin = BatchOrigin::Backfill;
                if batch.slot == 0 {
                    batch.slot = info.slot;
                }
                sender
                    .send(batch)
                    .await
                    .map_err(|err| EventListenerError::Internal(err.to_string()))?;
                report.delivered.insert(info.signature);
            }
            None => report.fetch_skipped += 1,
        }
    }
    log::info!(
        target: LOG_TARGET,
        "缺口补齐完成: 投递 {} 笔, 跳过失败交易 {} 笔, 拉取失败 {} 笔",
        report.delivered.len(),
        report.failed_skipped,
        report.fetch_skipped
    );
    Ok(report)
}
