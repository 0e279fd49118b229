//! 联合曲线索引器核心库：曲线定价、链上事件解码、事件溯源对账、账本监听与报价。

pub mod config;
pub mod curve;
pub mod event;
pub mod logging;
pub mod quote;
pub mod reconciler;
pub mod serde_utils;
pub mod state;
pub mod types;
pub mod watcher;
