use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use solana_sdk::pubkey::Pubkey;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;

use super::{graduate_record, AssetRepository, GraduateOutcome, SettleFn, SettleOutcome, StoreError};
use crate::types::{AssetRecord, TradeRecord, TradeSide};

const LOG_TARGET: &str = "curve_indexer::state::sqlite";

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS assets (
        address TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        symbol TEXT NOT NULL,
        uri TEXT NOT NULL,
        creator TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        virtual_input_reserve TEXT NOT NULL,
        virtual_output_reserve TEXT NOT NULL,
        real_input_balance TEXT NOT NULL,
        total_output_supply TEXT NOT NULL,
        graduated INTEGER NOT NULL DEFAULT 0,
        graduated_at INTEGER,
        last_settled_at INTEGER,
        trade_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        signature TEXT NOT NULL,
        event_index INTEGER NOT NULL,
        slot INTEGER NOT NULL,
        asset TEXT NOT NULL,
        trader TEXT NOT NULL,
        side TEXT NOT NULL,
        input_amount TEXT NOT NULL,
        output_amount TEXT NOT NULL,
        fee_amount TEXT NOT NULL,
        price REAL NOT NULL,
        settled_at INTEGER NOT NULL,
        virtual_input_after TEXT NOT NULL,
        virtual_output_after TEXT NOT NULL,
        UNIQUE (signature, event_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_trades_asset ON trades(asset, id)",
    r#"
    CREATE TABLE IF NOT EXISTS ingest_cursor (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        signature TEXT NOT NULL
    )
    "#,
];

const SELECT_ASSET: &str = "SELECT address, name, symbol, uri, creator, created_at, \
     virtual_input_reserve, virtual_output_reserve, real_input_balance, total_output_supply, \
     graduated, graduated_at, last_settled_at, trade_count FROM assets";

const UPDATE_ASSET: &str = "UPDATE assets SET virtual_input_reserve = ?, \
     virtual_output_reserve = ?, real_input_balance = ?, total_output_supply = ?, \
     graduated = ?, graduated_at = ?, last_settled_at = ?, trade_count = ? WHERE address = ?";

/// 基于 sqlx SQLite 的物化存储，金额以十进制文本保存以保持 u64 精确。
#[derive(Debug, Clone)]
pub struct SqliteAssetRepository {
    pool: SqlitePool,
}

impl SqliteAssetRepository {
    /// 连接数据库（WAL 模式，不存在则创建），并初始化表结构。
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        info!(target: LOG_TARGET, "打开 SQLite 存储: {}", url);
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// 内存数据库，仅单连接可见同一份数据。
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        debug!(target: LOG_TARGET, "表结构就绪");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_u64(row: &SqliteRow, column: &str) -> Result<u64, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse::<u64>()
        .map_err(|err| StoreError::Invalid(format!("{} 非法金额 {}: {}", column, raw, err)))
}

fn parse_pubkey(row: &SqliteRow, column: &str) -> Result<Pubkey, StoreError> {
    let raw: String = row.try_get(column)?;
    Pubkey::from_str(&raw)
        .map_err(|err| StoreError::Invalid(format!("{} 非法地址 {}: {}", column, raw, err)))
}

fn to_i64(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invalid(format!("{} 超出 INTEGER 范围", column)))
}

fn asset_from_row(row: &SqliteRow) -> Result<AssetRecord, StoreError> {
    let trade_count: i64 = row.try_get("trade_count")?;
    Ok(AssetRecord {
        address: parse_pubkey(row, "address")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        uri: row.try_get("uri")?,
        creator: parse_pubkey(row, "creator")?,
        created_at: row.try_get("created_at")?,
        virtual_input_reserve: parse_u64(row, "virtual_input_reserve")?,
        virtual_output_reserve: parse_u64(row, "virtual_output_reserve")?,
        real_input_balance: parse_u64(row, "real_input_balance")?,
        total_output_supply: parse_u64(row, "total_output_supply")?,
        graduated: row.try_get("graduated")?,
        graduated_at: row.try_get("graduated_at")?,
        last_settled_at: row.try_get("last_settled_at")?,
        trade_count: u64::try_from(trade_count)
            .map_err(|_| StoreError::Invalid("trade_count 为负".into()))?,
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord, StoreError> {
    let side: String = row.try_get("side")?;
    let event_index: i64 = row.try_get("event_index")?;
    let slot: i64 = row.try_get("slot")?;
    Ok(TradeRecord {
        signature: row.try_get("signature")?,
        event_index: u32::try_from(event_index)
            .map_err(|_| StoreError::Invalid(format!("event_index 越界: {}", event_index)))?,
        slot: u64::try_from(slot)
            .map_err(|_| StoreError::Invalid(format!("slot 越界: {}", slot)))?,
        asset: parse_pubkey(row, "asset")?,
        trader: parse_pubkey(row, "trader")?,
        side: TradeSide::from_str(&side).map_err(StoreError::Invalid)?,
        input_amount: parse_u64(row, "input_amount")?,
        output_amount: parse_u64(row, "output_amount")?,
        fee_amount: parse_u64(row, "fee_amount")?,
        price: row.try_get("price")?,
        settled_at: row.try_get("settled_at")?,
        virtual_input_after: parse_u64(row, "virtual_input_after")?,
        virtual_output_after: parse_u64(row, "virtual_output_after")?,
    })
}

#[async_trait]
impl AssetRepository for SqliteAssetRepository {
    async fn insert_asset(&self, asset: AssetRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO assets
                (address, name, symbol, uri, creator, created_at,
                 virtual_input_reserve, virtual_output_reserve, real_input_balance,
                 total_output_supply, graduated, graduated_at, last_settled_at, trade_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(address) DO NOTHING
            "#,
        )
        .bind(asset.address.to_string())
        .bind(&asset.name)
        .bind(&asset.symbol)
        .bind(&asset.uri)
        .bind(asset.creator.to_string())
        .bind(asset.created_at)
        .bind(asset.virtual_input_reserve.to_string())
        .bind(asset.virtual_output_reserve.to_string())
        .bind(asset.real_input_balance.to_string())
        .bind(asset.total_output_supply.to_string())
        .bind(asset.graduated)
        .bind(asset.graduated_at)
        .bind(asset.last_settled_at)
        .bind(to_i64(asset.trade_count, "trade_count")?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateAsset(asset.address));
        }
        Ok(())
    }

    async fn get_asset(&self, address: &Pubkey) -> Result<Option<AssetRecord>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE address = ?", SELECT_ASSET))
            .bind(address.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    async fn list_assets(&self) -> Result<Vec<AssetRecord>, StoreError> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at", SELECT_ASSET))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(asset_from_row).collect()
    }

    async fn settle_trade(
        &self,
        trade: TradeRecord,
        apply: SettleFn,
    ) -> Result<SettleOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // 先插入交易行：唯一约束即幂等检查，同时拿到写锁
        let inserted = sqlx::query(
            r#"
            INSERT INTO trades
                (signature, event_index, slot, asset, trader, side, input_amount,
                 output_amount, fee_amount, price, settled_at, virtual_input_after,
                 virtual_output_after)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(signature, event_index) DO NOTHING
            "#,
        )
        .bind(&trade.signature)
        .bind(i64::from(trade.event_index))
        .bind(to_i64(trade.slot, "slot")?)
        .bind(trade.asset.to_string())
        .bind(trade.trader.to_string())
        .bind(trade.side.as_str())
        .bind(trade.input_amount.to_string())
        .bind(trade.output_amount.to_string())
        .bind(trade.fee_amount.to_string())
        .bind(trade.price)
        .bind(trade.settled_at)
        .bind(trade.virtual_input_after.to_string())
        .bind(trade.virtual_output_after.to_string())
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(SettleOutcome::Duplicate);
        }

        let row = sqlx::query(&format!("{} WHERE address = ?", SELECT_ASSET))
            .bind(trade.asset.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(SettleOutcome::AssetMissing);
        };
        let current = asset_from_row(&row)?;

        let next = match apply(&current) {
            Ok(next) => next,
            Err(reason) => {
                tx.rollback().await?;
                return Ok(SettleOutcome::Rejected(reason));
            }
        };

        sqlx::query(UPDATE_ASSET)
            .bind(next.virtual_input_reserve.to_string())
            .bind(next.virtual_output_reserve.to_string())
            .bind(next.real_input_balance.to_string())
            .bind(next.total_output_supply.to_string())
            .bind(next.graduated)
            .bind(next.graduated_at)
            .bind(next.last_settled_at)
            .bind(to_i64(next.trade_count, "trade_count")?)
            .bind(next.address.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(SettleOutcome::Applied(next))
    }

    async fn mark_graduated(
        &self,
        address: &Pubkey,
        total_input_raised: u64,
        graduated_at: i64,
    ) -> Result<GraduateOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        // 空更新先取得写锁，再读取当前行
        sqlx::query("UPDATE assets SET address = address WHERE address = ?")
            .bind(address.to_string())
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(&format!("{} WHERE address = ?", SELECT_ASSET))
            .bind(address.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(GraduateOutcome::AssetMissing);
        };
        let current = asset_from_row(&row)?;
        let Some(next) = graduate_record(&current, total_input_raised, graduated_at) else {
            tx.rollback().await?;
            return Ok(GraduateOutcome::AlreadyGraduated);
        };
        sqlx::query(UPDATE_ASSET)
            .bind(next.virtual_input_reserve.to_string())
            .bind(next.virtual_output_reserve.to_string())
            .bind(next.real_input_balance.to_string())
            .bind(next.total_output_supply.to_string())
            .bind(next.graduated)
            .bind(next.graduated_at)
            .bind(next.last_settled_at)
            .bind(to_i64(next.trade_count, "trade_count")?)
            .bind(next.address.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(GraduateOutcome::Graduated(next))
    }

    async fn trades_for(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT signature, event_index, slot, asset, trader, side, input_amount,
                   output_amount, fee_amount, price, settled_at, virtual_input_after,
                   virtual_output_after
            FROM trades WHERE asset = ? ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(address.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn load_cursor(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT signature FROM ingest_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<String, _>("signature"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn save_cursor(&self, signature: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ingest_cursor (id, signature) VALUES (1, ?) \
             ON CONFLICT(id) DO UPDATE SET signature = excluded.signature",
        )
        .bind(signature)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
