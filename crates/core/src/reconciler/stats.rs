use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// 对账器计数器，所有跳过与空操作路径都在这里留痕。
#[derive(Debug, Default)]
pub struct ReconcileStats {
    pub assets_created: AtomicU64,
    pub duplicate_assets: AtomicU64,
    pub trades_applied: AtomicU64,
    pub duplicate_trades: AtomicU64,
    pub graduations: AtomicU64,
    pub already_graduated: AtomicU64,
    pub ordering_violations: AtomicU64,
    pub orphans_buffered: AtomicU64,
    pub orphans_replayed: AtomicU64,
    pub orphans_dropped: AtomicU64,
    pub store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReconcileStatsSnapshot {
    pub assets_created: u64,
    pub duplicate_assets: u64,
    pub trades_applied: u64,
    pub duplicate_trades: u64,
    pub graduations: u64,
    pub already_graduated: u64,
    pub ordering_violations: u64,
    pub orphans_buffered: u64,
    pub orphans_replayed: u64,
    pub orphans_dropped: u64,
    pub store_errors: u64,
}

pub(crate) fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

impl ReconcileStats {
    pub fn snapshot(&self) -> ReconcileStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ReconcileStatsSnapshot {
            assets_created: load(&self.assets_created),
            duplicate_assets: load(&self.duplicate_assets),
            trades_applied: load(&self.trades_applied),
            duplicate_trades: load(&self.duplicate_trades),
            graduations: load(&self.graduations),
            already_graduated: load(&self.already_graduated),
            ordering_violations: load(&self.ordering_violations),
            orphans_buffered: load(&self.orphans_buffered),
            orphans_replayed: load(&self.orphans_replayed),
            orphans_dropped: load(&self.orphans_dropped),
            store_errors: load(&self.store_errors),
        }
    }
}
