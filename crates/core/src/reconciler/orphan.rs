use std::collections::VecDeque;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;
use tokio::time::Instant;

use super::EventContext;
use crate::curve::event::LedgerEvent;

/// 等待资产创建的事件。
#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub context: EventContext,
    pub event: LedgerEvent,
    pub buffered_at: Instant,
}

/// 按到达顺序保存孤儿事件的有界缓冲。
#[derive(Debug)]
pub struct OrphanBuffer {
    entries: VecDeque<OrphanEntry>,
    capacity: usize,
    window: Duration,
}

impl OrphanBuffer {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            window,
        }
    }

    /// 缓冲已满时挤出最早的一条并返回。
    pub fn push(&mut self, entry: OrphanEntry) -> Option<OrphanEntry> {
        if self.capacity == 0 {
            return Some(entry);
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// 取出某资产的全部待处理事件，保持到达顺序。
    pub fn take_for(&mut self, asset: &Pubkey) -> Vec<OrphanEntry> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.event.asset() == *asset {
                taken.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        taken
    }

    /// 移除等待超过窗口的事件。
    pub fn expire(&mut self, now: Instant) -> Vec<OrphanEntry> {
        let mut expired = Vec::new();
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.buffered_at) < self.window {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                expired.push(entry);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
