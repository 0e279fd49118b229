use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

use super::layout::{ByteReader, ByteWriter};
use crate::serde_utils::pubkey_string;

pub const DISCRIMINATOR_LEN: usize = 8;

/// 8 字节事件判别符。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Discriminator(pub [u8; DISCRIMINATOR_LEN]);

impl Discriminator {
    /// 按 `sha256("event:<name>")` 前 8 字节派生。
    pub fn for_event(name: &str) -> Self {
        let digest = Sha256::digest(format!("event:{}", name).as_bytes());
        let mut bytes = [0u8; DISCRIMINATOR_LEN];
        bytes.copy_from_slice(&digest[..DISCRIMINATOR_LEN]);
        Self(bytes)
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 事件解码错误，均可跳过，不应中断后续日志的处理。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("未知事件判别符: {0}")]
    UnknownEvent(Discriminator),
    #[error("事件负载格式错误: {0}")]
    MalformedEvent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCreated {
    #[serde(with = "pubkey_string")]
    pub address: Pubkey,
    #[serde(with = "pubkey_string")]
    pub creator: Pubkey,
    pub name: String,
    pub symbol: String,
    pub uri: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSettled {
    #[serde(with = "pubkey_string")]
    pub address: Pubkey,
    #[serde(with = "pubkey_string")]
    pub trader: Pubkey,
    pub is_buy: bool,
    /// 输入币种一侧的毛额：买入含手续费，卖出为扣费前的总产出。
    pub input_amount: u64,
    pub output_amount: u64,
    pub fee_amount: u64,
    pub settled_at: i64,
    pub virtual_input_after: u64,
    pub virtual_output_after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetGraduated {
    #[serde(with = "pubkey_string")]
    pub address: Pubkey,
    pub total_input_raised: u64,
    pub graduated_at: i64,
}

/// 曲线程序发出的领域事件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    AssetCreated(AssetCreated),
    TradeSettled(TradeSettled),
    AssetGraduated(AssetGraduated),
}

impl LedgerEvent {
    pub fn asset(&self) -> Pubkey {
        match self {
            LedgerEvent::AssetCreated(event) => event.address,
            LedgerEvent::TradeSettled(event) => event.address,
            LedgerEvent::AssetGraduated(event) => event.address,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::AssetCreated(_) => EventKind::AssetCreated,
            LedgerEvent::TradeSettled(_) => EventKind::TradeSettled,
            LedgerEvent::AssetGraduated(_) => EventKind::AssetGraduated,
        }
    }

    /// 编码为 `判别符 + 负载`，与链上 `Program data` 的原始字节一致。
    pub fn encode(&self) -> Option<Vec<u8>> {
        self.encode_with(&SCHEMA_V1)
    }

    /// 按指定版本编码；该版本未登记此事件类型时返回 `None`。
    pub fn encode_with(&self, schema: &EventSchema) -> Option<Vec<u8>> {
        let disc = schema.discriminator(self.kind())?;
        let writer = ByteWriter::new().bytes(&disc.0);
        let writer = match self {
            LedgerEvent::AssetCreated(event) => writer
                .pubkey(&event.address)
                .pubkey(&event.creator)
                .string(&event.name)
                .string(&event.symbol)
                .string(&event.uri)
                .i64(event.created_at),
            LedgerEvent::TradeSettled(event) => writer
                .pubkey(&event.address)
                .pubkey(&event.trader)
                .bool(event.is_buy)
                .u64(event.input_amount)
                .u64(event.output_amount)
                .u64(event.fee_amount)
                .i64(event.settled_at)
                .u64(event.virtual_input_after)
                .u64(event.virtual_output_after),
            LedgerEvent::AssetGraduated(event) => writer
                .pubkey(&event.address)
                .u64(event.total_input_raised)
                .i64(event.graduated_at),
        };
        Some(writer.into_inner())
    }

    /// 编码为日志行中的 base64 文本。
    pub fn to_program_data(&self) -> Option<String> {
        self.encode().map(|bytes| BASE64.encode(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AssetCreated,
    TradeSettled,
    AssetGraduated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AssetCreated => "asset_created",
            EventKind::TradeSettled => "trade_settled",
            EventKind::AssetGraduated => "asset_graduated",
        }
    }
}

/// 带版本的判别符到事件类型映射表。
pub struct EventSchema {
    version: u16,
    by_discriminator: HashMap<Discriminator, EventKind>,
    by_kind: HashMap<EventKind, Discriminator>,
}

impl EventSchema {
    pub fn new(version: u16, entries: &[(EventKind, &str)]) -> Self {
        let mut by_discriminator = HashMap::with_capacity(entries.len());
        let mut by_kind = HashMap::with_capacity(entries.len());
        for (kind, ledger_name) in entries {
            let disc = Discriminator::for_event(ledger_name);
            by_discriminator.insert(disc, *kind);
            by_kind.insert(*kind, disc);
        }
        Self {
            version,
            by_discriminator,
            by_kind,
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn kind_of(&self, disc: &Discriminator) -> Option<EventKind> {
        self.by_discriminator.get(disc).copied()
    }

    pub fn discriminator(&self, kind: EventKind) -> Option<Discriminator> {
        self.by_kind.get(&kind).copied()
    }

    /// 按判别符解析负载。
    pub fn decode(&self, disc: &Discriminator, payload: &[u8]) -> Result<LedgerEvent, DecodeError> {
        let kind = self
            .kind_of(disc)
            .ok_or(DecodeError::UnknownEvent(*disc))?;
        let mut reader = ByteReader::new(payload);
        let event = match kind {
            EventKind::AssetCreated => LedgerEvent::AssetCreated(AssetCreated {
                address: reader.read_pubkey("mint")?,
                creator: reader.read_pubkey("creator")?,
                name: reader.read_string("name")?,
                symbol: reader.read_string("symbol")?,
                uri: reader.read_string("uri")?,
                created_at: reader.read_i64("timestamp")?,
            }),
            EventKind::TradeSettled => LedgerEvent::TradeSettled(TradeSettled {
                address: reader.read_pubkey("mint")?,
                trader: reader.read_pubkey("trader")?,
                is_buy: reader.read_bool("is_buy")?,
                input_amount: reader.read_u64("sol_amount")?,
                output_amount: reader.read_u64("token_amount")?,
                fee_amount: reader.read_u64("fee")?,
                settled_at: reader.read_i64("timestamp")?,
                virtual_input_after: reader.read_u64("virtual_sol_reserve")?,
                virtual_output_after: reader.read_u64("virtual_token_reserve")?,
            }),
            EventKind::AssetGraduated => LedgerEvent::AssetGraduated(AssetGraduated {
                address: reader.read_pubkey("mint")?,
                total_input_raised: reader.read_u64("sol_raised")?,
                graduated_at: reader.read_i64("timestamp")?,
            }),
        };
        reader.finish()?;
        Ok(event)
    }

    /// 解析带 8 字节判别符前缀的完整事件字节。
    pub fn decode_bytes(&self, data: &[u8]) -> Result<LedgerEvent, DecodeError> {
        if data.len() < DISCRIMINATOR_LEN {
            return Err(DecodeError::MalformedEvent(format!(
                "负载长度 {} 小于判别符长度",
                data.len()
            )));
        }
        let mut disc = [0u8; DISCRIMINATOR_LEN];
        disc.copy_from_slice(&data[..DISCRIMINATOR_LEN]);
        self.decode(&Discriminator(disc), &data[DISCRIMINATOR_LEN..])
    }

    /// 解析 `Program data:` 之后的 base64 文本。
    pub fn decode_program_data(&self, encoded: &str) -> Result<LedgerEvent, DecodeError> {
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|err| DecodeError::MalformedEvent(format!("base64 解码失败: {}", err)))?;
        self.decode_bytes(&data)
    }
}

/// 当前曲线程序使用的事件表。
pub static SCHEMA_V1: Lazy<EventSchema> = Lazy::new(|| {
    EventSchema::new(
        1,
        &[
            (EventKind::AssetCreated, "TokenCreated"),
            (EventKind::TradeSettled, "TradeExecuted"),
            (EventKind::AssetGraduated, "TokenGraduated"),
        ],
    )
});

/// 使用当前事件表解码。
pub fn decode(disc: &Discriminator, payload: &[u8]) -> Result<LedgerEvent, DecodeError> {
    SCHEMA_V1.decode(disc, payload)
}

pub fn decode_program_data(encoded: &str) -> Result<LedgerEvent, DecodeError> {
    SCHEMA_V1.decode_program_data(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> LedgerEvent {
        LedgerEvent::TradeSettled(TradeSettled {
            address: Pubkey::new_unique(),
            trader: Pubkey::new_unique(),
            is_buy: true,
            input_amount: 1_010_101_010,
            output_amount: 34_612_903_225_807,
            fee_amount: 10_101_010,
            settled_at: 1_700_000_000,
            virtual_input_after: 31_000_000_000,
            virtual_output_after: 1_038_387_096_774_193,
        })
    }

    #[test]
    fn test_discriminators_are_distinct() {
        let created = SCHEMA_V1.discriminator(EventKind::AssetCreated).expect("未登记");
        let traded = SCHEMA_V1.discriminator(EventKind::TradeSettled).expect("未登记");
        let graduated = SCHEMA_V1.discriminator(EventKind::AssetGraduated).expect("未登记");
        assert_ne!(created, traded);
        assert_ne!(traded, graduated);
        assert_ne!(created, graduated);
        assert_eq!(created, Discriminator::for_event("TokenCreated"));
        assert_eq!(SCHEMA_V1.version(), 1);
    }

    #[test]
    fn test_decode_trade_program_data() {
        let event = sample_trade();
        let encoded = event.to_program_data().expect("编码失败");
        let decoded = decode_program_data(&encoded).expect("trade 解析失败");
        assert_eq!(decoded, event);
        assert_eq!(decoded.kind(), EventKind::TradeSettled);
    }

    #[test]
    fn test_decode_created_with_strings() {
        let event = LedgerEvent::AssetCreated(AssetCreated {
            address: Pubkey::new_unique(),
            creator: Pubkey::new_unique(),
            name: "Frog Coin".into(),
            symbol: "FROG".into(),
            uri: "https://example.invalid/frog.json".into(),
            created_at: 1_700_000_000,
        });
        let bytes = event.encode().expect("编码失败");
        let decoded = SCHEMA_V1.decode_bytes(&bytes).expect("created 解析失败");
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_unknown_discriminator() {
        let disc = Discriminator::for_event("SomethingElse");
        let err = decode(&disc, &[]).expect_err("应当失败");
        assert_eq!(err, DecodeError::UnknownEvent(disc));
    }

    #[test]
    fn test_unregistered_kind_has_no_discriminator() {
        let partial = EventSchema::new(2, &[(EventKind::TradeSettled, "TradeExecuted")]);
        assert!(partial.discriminator(EventKind::AssetGraduated).is_none());
        assert!(partial.discriminator(EventKind::TradeSettled).is_some());
        let graduated = LedgerEvent::AssetGraduated(AssetGraduated {
            address: Pubkey::new_unique(),
            total_input_raised: 1,
            graduated_at: 1,
        });
        assert!(graduated.encode_with(&partial).is_none());

        let mut zeroed = vec![0u8; DISCRIMINATOR_LEN];
        zeroed.extend_from_slice(&[0u8; 48]);
        assert_eq!(
            partial.decode_bytes(&zeroed),
            Err(DecodeError::UnknownEvent(Discriminator([0u8; DISCRIMINATOR_LEN])))
        );
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let bytes = sample_trade().encode().expect("编码失败");
        for cut in [0, 7, 8, 40, bytes.len() - 1] {
            let result = SCHEMA_V1.decode_bytes(&bytes[..cut]);
            assert!(
                matches!(result, Err(DecodeError::MalformedEvent(_))),
                "截断到 {} 字节应报格式错误",
                cut
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut bytes = sample_trade().encode().expect("编码失败");
        bytes.push(0);
        assert!(matches!(
            SCHEMA_V1.decode_bytes(&bytes),
            Err(DecodeError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        assert!(matches!(
            decode_program_data("###"),
            Err(DecodeError::MalformedEvent(_))
        ));
    }
}
