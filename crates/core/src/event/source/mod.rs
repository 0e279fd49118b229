pub mod rpc;
pub mod solana;

pub use rpc::{LedgerRpc, RpcLedgerClient, SignatureInfo};
pub use solana::{SolanaEventSource, SolanaEventSourceConfig};
