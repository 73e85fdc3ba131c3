//! 插件宿主配置
//!
//! 配置来源优先级：默认值 < YAML 配置文件 < `PLUGIN_HOST_*` 环境变量。
//! 配置文件不存在时使用默认值。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::plugin::installer::{FetchLimits, SourcePolicy, VerifyLimits};
use crate::resilience::RetryConfig;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "PLUGIN_HOST_";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("环境变量 {name} 的值无效: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 宿主配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub paths: PathsConfig,
    pub fetch: FetchConfig,
    pub retry: RetryConfig,
    pub verify: VerifyLimits,
    pub source_policy: SourcePolicy,
    pub logging: LoggingConfig,
}

/// 目录配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// 正式插件目录，每个插件一个子目录
    pub live_dir: PathBuf,
    /// 暂存目录，每个操作一个子目录
    pub staging_dir: PathBuf,
    /// 注册表数据库
    pub database_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            live_dir: base.join("plugins"),
            staging_dir: base.join("staging"),
            database_path: base.join("registry.db"),
        }
    }
}

impl PathsConfig {
    /// 以某个根目录为基准的目录布局
    pub fn under(base: &Path) -> Self {
        Self {
            live_dir: base.join("plugins"),
            staging_dir: base.join("staging"),
            database_path: base.join("registry.db"),
        }
    }
}

/// 默认根目录: ~/.plugin-host
fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".plugin-host")
}

/// 下载配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// 插件包最大字节数
    pub max_archive_bytes: u64,
    /// 下载总时长上限（秒）
    pub download_timeout_secs: u64,
    /// 内联缓存阈值
    pub inline_threshold_bytes: u64,
    /// User-Agent
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let limits = FetchLimits::default();
        Self {
            max_archive_bytes: limits.max_bytes,
            download_timeout_secs: limits.timeout.as_secs(),
            inline_threshold_bytes: limits.inline_threshold,
            user_agent: format!("plugin-host/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetchConfig {
    pub fn limits(&self) -> FetchLimits {
        FetchLimits {
            max_bytes: self.max_archive_bytes,
            timeout: Duration::from_secs(self.download_timeout_secs),
            inline_threshold: self.inline_threshold_bytes,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或 EnvFilter 表达式
    pub level: String,
    /// 是否输出颜色
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: false,
        }
    }
}

impl HostConfig {
    /// 加载配置文件并应用环境变量
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("配置文件不存在，使用默认配置: {}", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 解析 YAML 配置
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// 应用 `PLUGIN_HOST_*` 覆盖
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            let name = format!("{}{}", ENV_PREFIX, key);
            lookup(&name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (name, v))
        };

        if let Some((_, v)) = get("LIVE_DIR") {
            self.paths.live_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("STAGING_DIR") {
            self.paths.staging_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("DATABASE_PATH") {
            self.paths.database_path = PathBuf::from(v);
        }
        if let Some((name, v)) = get("MAX_ARCHIVE_BYTES") {
            self.fetch.max_archive_bytes = parse_env(name, v)?;
        }
        if let Some((name, v)) = get("DOWNLOAD_TIMEOUT_SECS") {
            self.fetch.download_timeout_secs = parse_env(name, v)?;
        }
        if let Some((name, v)) = get("MAX_RETRIES") {
            self.retry.max_retries = parse_env(name, v)?;
        }
        if let Some((name, v)) = get("ALLOW_FILE_SOURCES") {
            self.source_policy.allow_file_sources = parse_env(name, v)?;
        }
        if let Some((_, v)) = get("LOG_LEVEL") {
            self.logging.level = v;
        }

        Ok(())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.max_archive_bytes == 0 {
            return Err(ConfigError::Invalid("max_archive_bytes 不能为 0".to_string()));
        }
        if self.fetch.download_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "download_timeout_secs 不能为 0".to_string(),
            ));
        }
        if self.verify.max_extracted_bytes == 0 || self.verify.max_entries == 0 {
            return Err(ConfigError::Invalid("解压限制不能为 0".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "base_delay_ms 不能大于 max_delay_ms".to_string(),
            ));
        }
        if self.paths.live_dir == self.paths.staging_dir {
            return Err(ConfigError::Invalid(
                "live_dir 与 staging_dir 不能相同".to_string(),
            ));
        }
        if let Some(pattern) = self.source_policy.invalid_pattern() {
            return Err(ConfigError::Invalid(format!("无效的来源规则: {:?}", pattern)));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: String, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}
