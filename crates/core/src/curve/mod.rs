//! 联合曲线定价与链上事件编解码。

pub mod event;
pub mod layout;
pub mod math;

pub use event::{DecodeError, EventKind, EventSchema, LedgerEvent, SCHEMA_V1};
pub use math::{CurveError, TradeOutcome};
