use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;

use crate::curve::math::{
    BPS_DENOMINATOR, GRADUATION_THRESHOLD, INITIAL_REAL_OUTPUT_RESERVE,
    INITIAL_VIRTUAL_INPUT_RESERVE, INITIAL_VIRTUAL_OUTPUT_RESERVE, PLATFORM_FEE_BPS,
};

/// 应用配置，由入口显式加载后逐层传入各组件。
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// 链路相关配置：RPC 节点与被跟踪的程序地址。
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub http_endpoint: String,
    pub ws_endpoint: String,
    pub program_id: String,
    #[serde(default = "default_commitment")]
    pub commitment: String,
}

impl NetworkConfig {
    pub fn program_pubkey(&self) -> Result<Pubkey, AppConfigError> {
        Pubkey::from_str(self.program_id.trim())
            .map_err(|err| AppConfigError::Invalid(format!("program_id 无效: {}", err)))
    }
}

/// 协议常量，需与链上程序保持一致。
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u16,
    #[serde(default = "default_graduation_threshold")]
    pub graduation_threshold: u64,
    #[serde(default = "default_initial_virtual_input")]
    pub initial_virtual_input_reserve: u64,
    #[serde(default = "default_initial_virtual_output")]
    pub initial_virtual_output_reserve: u64,
    #[serde(default = "default_initial_real_output")]
    pub initial_real_output_reserve: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            fee_bps: default_fee_bps(),
            graduation_threshold: default_graduation_threshold(),
            initial_virtual_input_reserve: default_initial_virtual_input(),
            initial_virtual_output_reserve: default_initial_virtual_output(),
            initial_real_output_reserve: default_initial_real_output(),
        }
    }
}

/// 状态同步器配置：一致性容差与孤儿事件缓冲窗口。
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// 储备校验允许的最大偏差（基础单位）。
    #[serde(default = "default_reserve_tolerance")]
    pub reserve_tolerance: u64,
    #[serde(default = "default_orphan_window_ms")]
    pub orphan_window_ms: u64,
    #[serde(default = "default_orphan_capacity")]
    pub orphan_capacity: usize,
    #[serde(default = "default_orphan_sweep_ms")]
    pub orphan_sweep_ms: u64,
}

impl ReconcilerConfig {
    pub fn orphan_window(&self) -> Duration {
        Duration::from_millis(self.orphan_window_ms)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reserve_tolerance: default_reserve_tolerance(),
            orphan_window_ms: default_orphan_window_ms(),
            orphan_capacity: default_orphan_capacity(),
            orphan_sweep_ms: default_orphan_sweep_ms(),
        }
    }
}

/// 监听器配置：重连退避、交易拉取与工作线程。
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
    #[serde(default = "default_max_retry_secs")]
    pub max_retry_secs: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_fetch_max_retries")]
    pub fetch_max_retries: u32,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// 无游标启动时回放的最近签名数，0 表示只跟随实时日志。
    #[serde(default)]
    pub initial_backfill_limit: usize,
    #[serde(default = "default_signature_page_size")]
    pub signature_page_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            retry_secs: default_retry_secs(),
            max_retry_secs: default_max_retry_secs(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            fetch_max_retries: default_fetch_max_retries(),
            worker_count: default_worker_count(),
            queue_depth: default_queue_depth(),
            initial_backfill_limit: 0,
            signature_page_size: default_signature_page_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// 存储后端选择。
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_url")]
    pub sqlite_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_url: default_sqlite_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// 日志配置。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub config_file: Option<String>,
    pub level: String,
    #[serde(default = "default_log_directory")]
    pub directory: String,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

/// 监控相关配置。
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_warn_delay_ms")]
    pub batch_delay_warn_ms: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_batch_interval: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            batch_delay_warn_ms: default_warn_delay_ms(),
            stats_batch_interval: default_stats_interval(),
        }
    }
}

fn default_commitment() -> String {
    "confirmed".into()
}

const fn default_fee_bps() -> u16 {
    PLATFORM_FEE_BPS
}

const fn default_graduation_threshold() -> u64 {
    GRADUATION_THRESHOLD
}

const fn default_initial_virtual_input() -> u64 {
    INITIAL_VIRTUAL_INPUT_RESERVE
}

const fn default_initial_virtual_output() -> u64 {
    INITIAL_VIRTUAL_OUTPUT_RESERVE
}

const fn default_initial_real_output() -> u64 {
    INITIAL_REAL_OUTPUT_RESERVE
}

const fn default_reserve_tolerance() -> u64 {
    1
}

const fn default_orphan_window_ms() -> u64 {
    30_000
}

const fn default_orphan_capacity() -> usize {
    10_000
}

const fn default_orphan_sweep_ms() -> u64 {
    1_000
}

const fn default_retry_secs() -> u64 {
    1
}

const fn default_max_retry_secs() -> u64 {
    60
}

const fn default_fetch_timeout_ms() -> u64 {
    10_000
}

const fn default_fetch_max_retries() -> u32 {
    5
}

const fn default_worker_count() -> usize {
    4
}

const fn default_queue_depth() -> usize {
    256
}

const fn default_signature_page_size() -> usize {
    1_000
}

const fn default_channel_capacity() -> usize {
    1_024
}

fn default_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_sqlite_url() -> String {
    "sqlite://data/curve_indexer.db".into()
}

const fn default_max_connections() -> u32 {
    4
}

fn default_log_directory() -> String {
    "logs".into()
}

const fn default_max_size_mb() -> u64 {
    64
}

const fn default_retention_hours() -> u64 {
    72
}

const fn default_warn_delay_ms() -> u64 {
    60_000
}

const fn default_stats_interval() -> u64 {
    100
}

impl AppConfig {
    /// 启动前校验配置，任何错误都应直接终止进程。
    pub fn validate(&self) -> Result<(), AppConfigError> {
        self.network.program_pubkey()?;
        if self.protocol.fee_bps > BPS_DENOMINATOR {
            return Err(AppConfigError::Invalid(format!(
                "fee_bps 超出范围: {}",
                self.protocol.fee_bps
            )));
        }
        if self.protocol.initial_virtual_input_reserve == 0
            || self.protocol.initial_virtual_output_reserve == 0
        {
            return Err(AppConfigError::Invalid("初始虚拟储备不能为 0".into()));
        }
        if self.watcher.worker_count == 0 || self.watcher.queue_depth == 0 {
            return Err(AppConfigError::Invalid(
                "worker_count 与 queue_depth 必须大于 0".into(),
            ));
        }
        if self.watcher.channel_capacity == 0 || self.watcher.signature_page_size == 0 {
            return Err(AppConfigError::Invalid(
                "channel_capacity 与 signature_page_size 必须大于 0".into(),
            ));
        }
        Ok(())
    }
}

/// 从配置文件加载应用配置，支持 YAML/JSON/TOML。
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path_ref = path.as_ref();
    let mut builder = Config::builder();

    builder = match path_ref.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => {
            builder.add_source(File::from(path_ref).format(FileFormat::Yaml))
        }
        Some("json") => builder.add_source(File::from(path_ref).format(FileFormat::Json)),
        Some("toml") | Some("conf") => {
            builder.add_source(File::from(path_ref).format(FileFormat::Toml))
        }
        _ => builder.add_source(File::from(path_ref)),
    };

    builder.build()?.try_deserialize()
}

/// 从字符串加载配置，便于测试与内嵌默认值。
pub fn load_config_str(raw: &str, format: FileFormat) -> Result<AppConfig, ConfigError> {
    Config::builder()
        .add_source(File::from_str(raw, format))
        .build()?
        .try_deserialize()
}

/// 配置相关错误定义。
#[derive(thiserror::Error, Debug)]
pub enum AppConfigError {
    #[error("配置无效: {0}")]
    Invalid(String),
}
