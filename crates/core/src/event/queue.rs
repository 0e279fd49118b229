use std::sync::atomic::{AtomicU64, Ordering};

use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc::{self, error::TrySendError};

const LOG_TARGET: &str = "curve_indexer::event::queue";

/// 队列错误定义。
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("队列已关闭")]
    Closed,
    #[error("分区数必须大于 0")]
    NoPartitions,
}

/// 按资产地址分区的有界分发器：同一资产始终落在同一分区，分区满时发送方等待。
#[derive(Debug)]
pub struct PartitionedQueue<T> {
    senders: Vec<mpsc::Sender<T>>,
    dispatched: AtomicU64,
    backpressure_waits: AtomicU64,
}

impl<T: Send> PartitionedQueue<T> {
    /// 创建 `partitions` 个容量为 `depth` 的分区，返回发送端与各分区的接收端。
    pub fn new(
        partitions: usize,
        depth: usize,
    ) -> Result<(Self, Vec<mpsc::Receiver<T>>), QueueError> {
        if partitions == 0 {
            return Err(QueueError::NoPartitions);
        }
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions)
            .map(|_| mpsc::channel(depth.max(1)))
            .unzip();
        Ok((
            Self {
                senders,
                dispatched: AtomicU64::new(0),
                backpressure_waits: AtomicU64::new(0),
            },
            receivers,
        ))
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    pub fn partition_for(&self, key: &Pubkey) -> usize {
        let bytes = key.to_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        (u64::from_le_bytes(head) % self.senders.len() as u64) as usize
    }

    /// 投递到 `key` 所在分区；分区已满时记录背压并等待空位，不丢弃。
    pub async fn dispatch(&self, key: &Pubkey, item: T) -> Result<(), QueueError> {
        let partition = self.partition_for(key);
        let sender = &self.senders[partition];
        match sender.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                let waits = self.backpressure_waits.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    target: LOG_TARGET,
                    "分区 {} 已满，暂停读取等待处理 (累计背压 {} 次)",
                    partition,
                    waits
                );
                sender.send(item).await.map_err(|_| QueueError::Closed)?;
            }
            Err(TrySendError::Closed(_)) => return Err(QueueError::Closed),
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn backpressure_waits(&self) -> u64 {
        self.backpressure_waits.load(Ordering::Relaxed)
    }
}
