//! tracing 日志初始化：终端输出，加上按级别分流的 info.log / error.log。

mod rotate;

use std::fs;
use std::path::Path;

use chrono::Local;
use log::LevelFilter;
use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_log::LogTracer;
use tracing_subscriber::filter::{filter_fn, EnvFilter, LevelFilter as TracingLevelFilter};
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

use self::rotate::{RollLimits, RollingFile};
use crate::config::LoggingConfig;

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// 初始化全局日志，重复调用直接返回。
pub fn init_logging(config: &LoggingConfig) -> Result<(), LogInitError> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder().with_max_level(LevelFilter::Trace).init() {
        if !err.to_string().contains("already") {
            return Err(LogInitError::Bridge(err.to_string()));
        }
    }

    let directive = resolve_directive(config)?;
    let env_filter = EnvFilter::try_new(&directive)
        .or_else(|_| EnvFilter::try_new(config.level.trim()))
        .map_err(|err| LogInitError::InvalidFilter(format!("{}: {}", directive, err)))?;

    let limits = RollLimits::from_config(config.max_size_mb, config.retention_hours);
    let log_dir = Path::new(&config.directory);
    let info_file = RollingFile::open(log_dir.join("info.log"), limits)
        .map_err(|err| LogInitError::Io(format!("打开 info.log 失败: {}", err)))?;
    let error_file = RollingFile::open(log_dir.join("error.log"), limits)
        .map_err(|err| LogInitError::Io(format!("打开 error.log 失败: {}", err)))?;

    let format = fmt::format()
        .with_timer(LocalTimer)
        .with_level(true)
        .with_target(true)
        .with_thread_names(true);

    let console = fmt::layer()
        .event_format(format.clone())
        .with_writer(std::io::stdout)
        .with_ansi(true);
    let info = fmt::layer()
        .event_format(format.clone())
        .with_ansi(false)
        .with_writer(info_file)
        .with_filter(filter_fn(|metadata| {
            let level = *metadata.level();
            level >= Level::INFO && level <= Level::WARN
        }));
    let errors = fmt::layer()
        .event_format(format)
        .with_ansi(false)
        .with_writer(error_file)
        .with_filter(TracingLevelFilter::ERROR);

    let subscriber = Registry::default()
        .with(env_filter)
        .with(console)
        .with(info)
        .with(errors);

    match tracing::subscriber::set_global_default(subscriber) {
        Ok(()) => {
            let _ = INITIALIZED.set(());
            Ok(())
        }
        Err(err) if err.to_string().contains("already") => {
            let _ = INITIALIZED.set(());
            Ok(())
        }
        Err(err) => Err(LogInitError::Init(err.to_string())),
    }
}

/// 过滤规则：优先读取 `config_file` 中的非注释行（逗号拼接），否则使用 `level`。
fn resolve_directive(config: &LoggingConfig) -> Result<String, LogInitError> {
    let Some(path) = config.config_file.as_deref() else {
        return Ok(config.level.trim().to_string());
    };
    let path = Path::new(path);
    if !path.exists() {
        return Ok(config.level.trim().to_string());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| LogInitError::ConfigFile(format!("{}: {}", path.display(), err)))?;
    let directives: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    if directives.is_empty() {
        Ok(config.level.trim().to_string())
    } else {
        Ok(directives.join(","))
    }
}

#[derive(Clone)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// 日志初始化相关错误。
#[derive(thiserror::Error, Debug)]
pub enum LogInitError {
    #[error("log 桥接初始化失败: {0}")]
    Bridge(String),
    #[error("日志过滤规则无效: {0}")]
    InvalidFilter(String),
    #[error("日志过滤文件读取失败: {0}")]
    ConfigFile(String),
    #[error("日志系统初始化失败: {0}")]
    Init(String),
    #[error("日志文件操作失败: {0}")]
    Io(String),
}
