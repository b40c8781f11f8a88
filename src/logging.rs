//! 日志初始化
//!
//! 控制台 + 可选的文件输出。文件按启动时间命名，超过单文件上限后追加序号滚动：
//! `chibi-upload.2024-01-01-120000.log`、`chibi-upload.2024-01-01-120000_1.log` ...

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_PREFIX: &str = "chibi-upload.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIMER_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RollingState {
    log_dir: PathBuf,
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    started: String,
    /// 0 为基础文件，之后每次滚动加 1
    index: u32,
    file: File,
    written: u64,
    max_file_size: u64,
}

impl RollingState {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let started = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = open_log_file(&log_file_path(&log_dir, &started, 0))?;
        Ok(Self {
            log_dir,
            started,
            index: 0,
            file,
            written: 0,
            max_file_size,
        })
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超长日志不停生成新文件
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            self.index += 1;
            self.file = open_log_file(&log_file_path(&self.log_dir, &self.started, self.index))?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

fn log_file_path(log_dir: &Path, started: &str, index: u32) -> PathBuf {
    let name = if index == 0 {
        format!("{}{}{}", LOG_FILE_PREFIX, started, LOG_FILE_SUFFIX)
    } else {
        format!("{}{}_{}{}", LOG_FILE_PREFIX, started, index, LOG_FILE_SUFFIX)
    };
    log_dir.join(name)
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct RollingLogFile {
    state: Arc<Mutex<RollingState>>,
}

impl RollingLogFile {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            state: Arc::new(Mutex::new(RollingState::open(log_dir, max_file_size)?)),
        })
    }

    /// 当前正在写入的文件
    pub fn current_path(&self) -> PathBuf {
        let state = self.state.lock();
        log_file_path(&state.log_dir, &state.started, state.index)
    }
}

impl Write for RollingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

/// 日志守卫，需保持存活到进程结束，否则后台写入线程会退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// RUST_LOG 优先于配置中的级别；文件输出初始化失败时回退到仅控制台
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        match fs::create_dir_all(&config.log_dir)
            .and_then(|_| RollingLogFile::new(config.log_dir.clone(), config.max_file_size))
        {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!(
                    "初始化日志文件失败: {:?}, 错误: {}，仅输出到控制台",
                    config.log_dir, e
                );
                None
            }
        }
    } else {
        None
    };

    let Some(writer) = writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let current = writer.current_path();
    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 文件={:?}, 级别={}, 保留 {} 天",
        current, config.level, config.retention_days
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 优先按文件名中的日期判断，解析失败时退回修改时间
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX)
        {
            continue;
        }

        let expired = match date_of(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => modified_before(&entry, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志: {:?}", path);
            }
            Err(e) => warn!("删除过期日志失败: {:?}, 错误: {}", path, e),
        }
    }

    removed
}

/// chibi-upload.YYYY-MM-DD-HHMMSS[_N].log -> YYYY-MM-DD
fn date_of(file_name: &str) -> Option<chrono::NaiveDate> {
    let stem = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn modified_before(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
        return false;
    };
    let modified: chrono::DateTime<chrono::Utc> = modified.into();
    chrono::Utc::now().signed_duration_since(modified) > retention
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_date_from_file_name() {
        assert_eq!(
            date_of("chibi-upload.2024-03-05-101112.log"),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        assert_eq!(
            date_of("chibi-upload.2024-03-05-101112_3.log"),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        assert_eq!(date_of("other.2024-03-05.log"), None);
        assert_eq!(date_of("chibi-upload.x.log"), None);
    }

    #[test]
    fn test_rolling_writer_rotates_by_size() {
        let dir = TempDir::new().unwrap();
        let mut writer = RollingLogFile::new(dir.path().to_path_buf(), 16).unwrap();
        let first = writer.current_path();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.flush().unwrap();

        let second = writer.current_path();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.log"));
        assert_eq!(fs::read(&first).unwrap().len(), 10);
        assert_eq!(fs::read(&second).unwrap().len(), 10);
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("chibi-upload.2000-01-01-000000.log");
        let today = dir.path().join(format!(
            "chibi-upload.{}.log",
            Local::now().format("%Y-%m-%d-%H%M%S")
        ));
        let unrelated = dir.path().join("notes.2000-01-01.log");
        for path in [&old, &today, &unrelated] {
            fs::write(path, "x").unwrap();
        }

        assert_eq!(cleanup_old_logs(dir.path(), 7), 1);
        assert!(!old.exists());
        assert!(today.exists());
        assert!(unrelated.exists());
    }
}
