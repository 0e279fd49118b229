use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::reconciler::OrphanHold;
use crate::state::AssetRepository;

const LOG_TARGET: &str = "curve_indexer::watcher::checkpoint";

#[derive(Debug)]
struct Pending {
    signature: String,
    remaining: usize,
    persist: bool,
}

#[derive(Debug, Default)]
struct CheckpointState {
    next_seq: u64,
    pending: BTreeMap<u64, Pending>,
    last_saved: Option<String>,
    /// 有批次放弃写入后游标不再推进，重启时从该处重新补齐。
    halted_at: Option<u64>,
}

/// 低水位游标：只有某批次及其之前的所有批次都处理完，游标才前进到该批次签名。
pub struct CheckpointTracker {
    repository: Arc<dyn AssetRepository>,
    state: Mutex<CheckpointState>,
}

impl CheckpointTracker {
    pub fn new(repository: Arc<dyn AssetRepository>) -> Self {
        Self {
            repository,
            state: Mutex::new(CheckpointState::default()),
        }
    }

    /// 登记一个批次，`groups` 为需要等待的分组数；为 0 时立即视为完成。
    /// `persist` 为 false 的批次（回放文件）只占位，不写入游标。
    pub async fn register(&self, signature: &str, groups: usize, persist: bool) -> u64 {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(
            seq,
            Pending {
                signature: signature.to_string(),
                remaining: groups,
                persist,
            },
        );
        if groups == 0 {
            self.advance(&mut state).await;
        }
        seq
    }

    /// 标记批次中的一个分组处理结束；`applied` 为 false 表示该分组放弃写入。
    pub async fn complete(&self, seq: u64, applied: bool) {
        let mut state = self.state.lock().await;
        if !applied && state.halted_at.is_none() {
            state.halted_at = Some(seq);
            log::error!(
                target: LOG_TARGET,
                "批次 #{} 存在未写入的事件，游标停止推进 (当前 {:?})",
                seq,
                state.last_saved
            );
        }
        if let Some(pending) = state.pending.get_mut(&seq) {
            pending.remaining = pending.remaining.saturating_sub(1);
        }
        self.advance(&mut state).await;
    }

    async fn advance(&self, state: &mut CheckpointState) {
        let mut candidate = None;
        while let Some(entry) = state.pending.first_entry() {
            if entry.get().remaining > 0 {
                break;
            }
            let seq = *entry.key();
            let done = entry.remove();
            let halted = state.halted_at.map_or(false, |halt| seq >= halt);
            if done.persist && !halted {
                candidate = Some(done.signature);
            }
        }
        let Some(signature) = candidate else {
            return;
        };
        match self.repository.save_cursor(&signature).await {
            Ok(()) => {
                log::debug!(target: LOG_TARGET, "游标推进到 {}", signature);
                state.last_saved = Some(signature);
            }
            Err(err) => {
                log::warn!(target: LOG_TARGET, "保存游标 {} 失败: {}", signature, err);
            }
        }
    }

    pub async fn last_saved(&self) -> Option<String> {
        self.state.lock().await.last_saved.clone()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

/// 孤儿事件为所属批次多记一个未完成单位，回放或丢弃后再完成。
#[async_trait]
impl OrphanHold for CheckpointTracker {
    async fn hold(&self, batch: u64) {
        let mut state = self.state.lock().await;
        match state.pending.get_mut(&batch) {
            Some(pending) => pending.remaining += 1,
            None => log::warn!(target: LOG_TARGET, "批次 #{} 已完成，无法保留游标", batch),
        }
    }

    async fn release(&self, batch: u64, applied: bool) {
        self.complete(batch, applied).await;
    }
}
