use std::sync::Arc;

use anyhow::Result;
use curve_indexer_core::config::{AppConfig, StorageBackend};
use curve_indexer_core::state::{AssetRepository, InMemoryAssetRepository, SqliteAssetRepository};

use crate::commands::utils::ensure_sqlite_parent;

/// 运行时共享对象，供监听、报价与状态查询命令复用。
#[derive(Clone)]
pub struct SharedObjects {
    pub repository: Arc<dyn AssetRepository>,
    sqlite: Option<Arc<SqliteAssetRepository>>,
}

impl SharedObjects {
    /// 按配置打开存储后端，失败即终止启动。
    pub async fn open(config: &AppConfig) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Memory => {
                log::warn!("使用内存存储，进程退出后状态不会保留");
                let repository: Arc<dyn AssetRepository> = Arc::new(InMemoryAssetRepository::new());
                Ok(Self {
                    repository,
                    sqlite: None,
                })
            }
            StorageBackend::Sqlite => {
                ensure_sqlite_parent(&config.storage.sqlite_url)?;
                let sqlite = Arc::new(
                    SqliteAssetRepository::connect(
                        &config.storage.sqlite_url,
                        config.storage.max_connections,
                    )
                    .await?,
                );
                let repository: Arc<dyn AssetRepository> = sqlite.clone();
                Ok(Self {
                    repository,
                    sqlite: Some(sqlite),
                })
            }
        }
    }

    pub async fn close(&self) {
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }
}
