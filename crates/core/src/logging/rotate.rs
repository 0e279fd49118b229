use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing_subscriber::fmt::writer::MakeWriter;

/// 按大小或时长切分的日志文件，切分后的文件名带 unix 秒后缀。
#[derive(Clone)]
pub(crate) struct RollingFile {
    shared: Arc<Shared>,
}

struct Shared {
    path: PathBuf,
    prefix: String,
    limits: RollLimits,
    current: Mutex<Segment>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RollLimits {
    /// `None` 表示不按大小切分。
    pub max_bytes: Option<u64>,
    /// `None` 表示不按时长切分，也不清理旧文件。
    pub retention: Option<Duration>,
}

impl RollLimits {
    pub(crate) fn from_config(max_size_mb: u64, retention_hours: u64) -> Self {
        Self {
            max_bytes: (max_size_mb > 0).then(|| max_size_mb.saturating_mul(1024 * 1024)),
            retention: (retention_hours > 0)
                .then(|| Duration::from_secs(retention_hours.saturating_mul(3600))),
        }
    }
}

struct Segment {
    file: File,
    opened_at: SystemTime,
    written: u64,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RollingFile {
    pub(crate) fn open(path: PathBuf, limits: RollLimits) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let metadata = file.metadata()?;
        let segment = Segment {
            opened_at: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            written: metadata.len(),
            file,
        };
        let prefix = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("curve_indexer.log")
            .to_string();
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                prefix,
                limits,
                current: Mutex::new(segment),
            }),
        })
    }
}

impl Shared {
    fn segment(&self) -> MutexGuard<'_, Segment> {
        // 锁中毒后沿用内部状态继续写入
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn needs_roll(&self, segment: &Segment, incoming: usize) -> bool {
        let too_big = self
            .limits
            .max_bytes
            .map_or(false, |max| segment.written.saturating_add(incoming as u64) > max);
        let too_old = self.limits.retention.map_or(false, |retention| {
            segment.opened_at.elapsed().unwrap_or_default() >= retention
        });
        too_big || too_old
    }

    fn roll(&self, segment: &mut Segment) -> io::Result<()> {
        segment.file.flush()?;
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let rolled = self.path.with_file_name(format!("{}.{}", self.prefix, suffix));
        if self.path.exists() {
            fs::rename(&self.path, rolled)?;
        }
        segment.file = open_append(&self.path)?;
        segment.written = 0;
        segment.opened_at = SystemTime::now();
        self.prune()
    }

    fn prune(&self) -> io::Result<()> {
        let (Some(retention), Some(dir)) = (self.limits.retention, self.path.parent()) else {
            return Ok(());
        };
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(UNIX_EPOCH);
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == self.path || !path.is_file() {
                continue;
            }
            let rolled_sibling = path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with(&format!("{}.", self.prefix)));
            if !rolled_sibling {
                continue;
            }
            let modified = entry.metadata()?.modified().unwrap_or(UNIX_EPOCH);
            if modified < cutoff {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }
}

pub(crate) struct RollingHandle {
    shared: Arc<Shared>,
}

impl<'a> MakeWriter<'a> for RollingFile {
    type Writer = RollingHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RollingHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Write for RollingHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut segment = self.shared.segment();
        if self.shared.needs_roll(&segment, buf.len()) {
            self.shared.roll(&mut segment)?;
        }
        let written = segment.file.write(buf)?;
        segment.written = segment.written.saturating_add(written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.segment().file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolls_when_size_exceeded() {
        let dir = tempfile::tempdir().expect("创建临时目录失败");
        let path = dir.path().join("info.log");
        let limits = RollLimits {
            max_bytes: Some(16),
            retention: None,
        };
        let writer = RollingFile::open(path.clone(), limits).expect("打开日志文件失败");
        let mut handle = writer.make_writer();
        handle.write_all(b"0123456789").expect("写入失败");
        handle.write_all(b"abcdefghij").expect("写入失败");
        handle.flush().expect("刷新失败");

        assert_eq!(fs::read_to_string(&path).expect("读取失败"), "abcdefghij");
        let rolled = fs::read_dir(dir.path())
            .expect("读取目录失败")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path() != path)
            .count();
        assert_eq!(rolled, 1);
    }

    #[test]
    fn test_zero_limits_disable_rolling() {
        let limits = RollLimits::from_config(0, 0);
        assert!(limits.max_bytes.is_none());
        assert!(limits.retention.is_none());
        let limits = RollLimits::from_config(1, 2);
        assert_eq!(limits.max_bytes, Some(1024 * 1024));
        assert_eq!(limits.retention, Some(Duration::from_secs(7200)));
    }
}
