pub mod logs;
pub mod queue;
pub mod source;

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use self::queue::QueueError;
use crate::state::StoreError;

/// 日志批次来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrigin {
    #[default]
    Live,
    Backfill,
    Replay,
}

/// 一笔交易的完整日志，对应订阅推送的 `(signature, logs, err)`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatch {
    pub signature: String,
    #[serde(default)]
    pub slot: u64,
    pub logs: Vec<String>,
    /// 链上执行失败的交易不产生任何结算。
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub origin: BatchOrigin,
}

/// 事件监听器统一接口。
#[async_trait]
pub trait EventListener: Send + Sync {
    /// 启动监听流程，内部处理重连与回放。
    async fn start(&self) -> Result<(), EventListenerError>;

    /// 停止读取并等待在途事件处理完毕。
    async fn stop(&self) -> Result<(), EventListenerError>;
}

/// 日志批次来源抽象，封装链上订阅或文件回放。
#[async_trait]
pub trait EventSource: Send + Sync {
    /// 返回 `Ok(None)` 表示事件源已结束，不会再有新批次。
    async fn next_batch(&self) -> Result<Option<LogBatch>, EventListenerError>;

    /// 读取出错后调用，缺省为立即恢复。
    async fn handle_disconnect(&self) -> Result<(), EventListenerError> {
        Ok(())
    }

    /// 停止后台订阅任务并释放连接。
    async fn close(&self) {}
}

/// 监听器相关错误。
#[derive(thiserror::Error, Debug)]
pub enum EventListenerError {
    #[error("连接断开: {0}")]
    ConnectionLost(String),
    #[error("RPC 请求失败: {0}")]
    Rpc(String),
    #[error("内部错误: {0}")]
    Internal(String),
    #[error("队列错误: {0}")]
    Queue(String),
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("回放文件无效: {0}")]
    Replay(String),
}

impl From<QueueError> for EventListenerError {
    fn from(err: QueueError) -> Self {
        EventListenerError::Queue(err.to_string())
    }
}

impl From<StoreError> for EventListenerError {
    fn from(err: StoreError) -> Self {
        EventListenerError::Storage(err.to_string())
    }
}

/// 内存事件源，用于测试与回放录制文件，取空即结束。
#[derive(Debug, Default)]
pub struct MockEventSource {
    batches: Mutex<VecDeque<LogBatch>>,
}

impl MockEventSource {
    pub fn new(batches: Vec<LogBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }

    /// 读取 JSON 数组格式的录制批次，来源统一标记为回放。
    pub fn from_replay_json(raw: &str) -> Result<Self, EventListenerError> {
        let mut batches: Vec<LogBatch> =
            serde_json::from_str(raw).map_err(|err| EventListenerError::Replay(err.to_string()))?;
        for batch in &mut batches {
            batch.origin = BatchOrigin::Replay;
        }
        Ok(Self::new(batches))
    }

    pub fn from_replay_file<P: AsRef<Path>>(path: P) -> Result<Self, EventListenerError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            EventListenerError::Replay(format!("{}: {}", path.as_ref().display(), err))
        })?;
        Self::from_replay_json(&raw)
    }

    pub async fn push_batches(&self, batches: Vec<LogBatch>) {
        let mut guard = self.batches.lock().await;
        guard.extend(batches);
    }

    pub async fn remaining(&self) -> usize {
        self.batches.lock().await.len()
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn next_batch(&self) -> Result<Option<LogBatch>, EventListenerError> {
        let mut guard = self.batches.lock().await;
        Ok(guard.pop_front())
    }
}
