// 配置管理模块

use crate::extension::ExtensionFilter;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 覆盖配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "CHIBI_CONFIG";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 接收端配置
    #[serde(default)]
    pub receiver: ReceiverConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18888
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 接收端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// 合并完成后的文件目录
    #[serde(default = "default_destination_dir")]
    pub destination_dir: PathBuf,
    /// 分片临时目录（每个会话一个子目录）
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// 单文件大小上限（字节，默认 2GB）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 单个分片大小上限（字节，默认 16MB）
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// 允许的扩展名（为空表示全部允许）
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// 禁止的扩展名
    #[serde(default)]
    pub blocked_extensions: Vec<String>,
    /// 输出分片级诊断日志
    #[serde(default)]
    pub debug: bool,
    /// 未完成会话的过期时间（秒，0 表示不清理）
    #[serde(default = "default_stale_session_ttl_secs")]
    pub stale_session_ttl_secs: u64,
    /// 过期会话扫描间隔（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 完成文件的访问路径前缀
    #[serde(default = "default_public_path")]
    pub public_path: String,
}

fn default_destination_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("data/chunks")
}

fn default_max_file_size() -> u64 {
    2 * 1024 * 1024 * 1024 // 2GB
}

fn default_max_chunk_size() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_stale_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_public_path() -> String {
    "/files".to_string()
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            destination_dir: default_destination_dir(),
            temp_dir: default_temp_dir(),
            max_file_size: default_max_file_size(),
            max_chunk_size: default_max_chunk_size(),
            allowed_extensions: Vec::new(),
            blocked_extensions: Vec::new(),
            debug: false,
            stale_session_ttl_secs: default_stale_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            public_path: default_public_path(),
        }
    }
}

impl ReceiverConfig {
    /// 校验大小限制和访问路径
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::UploadError;

        if self.max_chunk_size == 0 {
            return Err(UploadError::Config("max_chunk_size 必须大于 0".to_string()));
        }
        if self.max_file_size == 0 {
            return Err(UploadError::Config("max_file_size 必须大于 0".to_string()));
        }
        if self.max_chunk_size > self.max_file_size {
            return Err(UploadError::Config(format!(
                "max_chunk_size ({}) 不能大于 max_file_size ({})",
                self.max_chunk_size, self.max_file_size
            )));
        }
        // 完成目录会被静态路由公开，分片目录不能放在里面
        if self.temp_dir.starts_with(&self.destination_dir) {
            return Err(UploadError::Config(format!(
                "temp_dir ({:?}) 不能位于 destination_dir ({:?}) 之内",
                self.temp_dir, self.destination_dir
            )));
        }
        if !self.public_path.starts_with('/') || self.public_path.len() < 2 {
            return Err(UploadError::Config(format!(
                "public_path 必须以 / 开头且不能为根路径: {:?}",
                self.public_path
            )));
        }
        Ok(())
    }

    pub fn extension_filter(&self) -> ExtensionFilter {
        ExtensionFilter::new(
            self.allowed_extensions.clone(),
            self.blocked_extensions.clone(),
        )
    }

    /// 去掉末尾斜杠的访问路径前缀
    pub fn public_prefix(&self) -> &str {
        self.public_path.trim_end_matches('/')
    }

    pub fn stale_session_ttl(&self) -> Option<Duration> {
        (self.stale_session_ttl_secs > 0).then(|| Duration::from_secs(self.stale_session_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl AppConfig {
    /// 配置文件路径（环境变量优先）
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .receiver
            .validate()
            .context("配置文件中的接收端配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.receiver
            .validate()
            .context("保存配置失败：接收端配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件存在但解析失败时不覆盖，避免丢失用户修改
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }
}
