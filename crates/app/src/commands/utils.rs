use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use curve_indexer_core::config::ProtocolConfig;
use curve_indexer_core::curve::math::{market_cap, spot_price};
use curve_indexer_core::types::{AssetRecord, TradeRecord};
use serde_json::json;

/// 从 `sqlite://path?opts` 形式的连接串中取出文件路径，内存库返回 `None`。
pub fn sqlite_file_path(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

/// 确保 SQLite 文件所在目录存在。
pub fn ensure_sqlite_parent(url: &str) -> Result<()> {
    let Some(path) = sqlite_file_path(url) else {
        return Ok(());
    };
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|err| anyhow!("创建数据目录 {} 失败: {}", parent.display(), err))?;
        }
    }
    Ok(())
}

/// 资产状态报告，价格与市值仅供展示。
pub fn asset_report(
    record: &AssetRecord,
    trades: &[TradeRecord],
    protocol: &ProtocolConfig,
) -> serde_json::Value {
    let price = spot_price(record.virtual_input_reserve, record.virtual_output_reserve).ok();
    let cap = market_cap(
        record.virtual_input_reserve,
        record.virtual_output_reserve,
        record.total_output_supply,
    )
    .ok();
    let progress = if protocol.graduation_threshold == 0 {
        1.0
    } else {
        (record.real_input_balance as f64 / protocol.graduation_threshold as f64).min(1.0)
    };
    json!({
        "asset": record,
        "status": record.status(),
        "spot_price": price,
        "market_cap": cap,
        "graduation_progress": progress,
        "recent_trades": trades,
    })
}
