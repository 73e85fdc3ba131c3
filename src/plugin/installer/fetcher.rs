//! 插件包下载器
//!
//! 从来源地址把插件包取到操作专属的暂存目录：
//! - 总时长与总字节数都有上限，超出即中止并返回 `LimitExceeded`
//! - 小于内联阈值的包先缓存在内存，超过阈值后转为流式写入临时文件
//! - 连接失败和 5xx 按指数退避重试，4xx 视为永久拒绝
//! - 只写入调用方提供的暂存目录

use futures::StreamExt;
use reqwest::{redirect, Client};
use std::error::Error as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::policy::SourcePolicy;
use super::types::FetchError;
use crate::logger::sanitize_url;
use crate::resilience::{Retrier, RetryConfig};

/// 下载产物在暂存目录中的文件名
const ARCHIVE_FILE_NAME: &str = "package.download";

/// 最多跟随的重定向次数
const MAX_REDIRECTS: usize = 10;

/// 下载限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    /// 最大字节数
    pub max_bytes: u64,
    /// 总时长上限（含重试）
    pub timeout: Duration,
    /// 内联阈值，超过后改为写入临时文件
    pub inline_threshold: u64,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024,
            timeout: Duration::from_secs(300),
            inline_threshold: 256 * 1024,
        }
    }
}

/// 已下载的插件包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    /// 暂存目录中的文件路径
    pub path: PathBuf,
    /// 字节数
    pub size_bytes: u64,
}

/// 下载进度回调: (已下载字节, 总字节)
pub type FetchProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// 插件包下载器
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: Client,
    retrier: Retrier,
}

impl ArchiveFetcher {
    /// 创建下载器
    ///
    /// 每个重定向目标都要重新通过来源策略
    pub fn new(
        user_agent: &str,
        retry: RetryConfig,
        policy: SourcePolicy,
    ) -> Result<Self, FetchError> {
        let redirect_policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(format!("重定向次数超过 {}", MAX_REDIRECTS));
            }
            match policy.check(attempt.url().as_str()) {
                Ok(_) => attempt.follow(),
                Err(reason) => {
                    tracing::warn!("[FETCH] 拒绝重定向: {}", reason);
                    attempt.error(reason)
                }
            }
        });

        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .redirect(redirect_policy)
            .build()
            .map_err(|e| FetchError::Network(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            retrier: Retrier::new(retry),
        })
    }

    /// 下载插件包到暂存目录
    ///
    /// 取消或超时时中止传输并删除已写入的部分
    pub async fn fetch(
        &self,
        source: &Url,
        limits: &FetchLimits,
        scratch_dir: &Path,
        cancel: &CancellationToken,
        on_progress: FetchProgress<'_>,
    ) -> Result<FetchedArchive, FetchError> {
        fs::create_dir_all(scratch_dir).await?;
        let dest = scratch_dir.join(ARCHIVE_FILE_NAME);

        tracing::info!("[FETCH] 开始下载: {}", sanitize_url(source.as_str()));

        let transfer = async {
            match source.scheme() {
                "http" | "https" => {
                    self.retrier
                        .execute(|_| self.fetch_http(source, limits, &dest, on_progress))
                        .await
                }
                "file" => self.fetch_file(source, limits, &dest, on_progress).await,
                other => Err(FetchError::UnsupportedScheme(other.to_string())),
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            outcome = tokio::time::timeout(limits.timeout, transfer) => match outcome {
                Ok(result) => result,
                Err(_) => Err(FetchError::LimitExceeded(format!(
                    "下载超时 ({}s)",
                    limits.timeout.as_secs()
                ))),
            },
        };

        match result {
            Ok(size_bytes) => {
                tracing::info!("[FETCH] 下载完成: {} bytes", size_bytes);
                Ok(FetchedArchive {
                    path: dest,
                    size_bytes,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&dest).await;
                tracing::warn!("[FETCH] 下载失败: {}", e);
                Err(e)
            }
        }
    }

    async fn fetch_http(
        &self,
        url: &Url,
        limits: &FetchLimits,
        dest: &Path,
        on_progress: FetchProgress<'_>,
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::ServerError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::SourceRejected(format!("HTTP {}", status)));
        }

        let total = response.content_length();
        if let Some(len) = total {
            if len > limits.max_bytes {
                return Err(FetchError::LimitExceeded(format!(
                    "包大小 {} bytes 超过上限 {} bytes",
                    len, limits.max_bytes
                )));
            }
        }

        let mut spool = Spool::new(dest.to_path_buf(), limits.inline_threshold);
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Network(format!("读取数据失败: {}", e)))?;
            downloaded += chunk.len() as u64;
            if downloaded > limits.max_bytes {
                return Err(FetchError::LimitExceeded(format!(
                    "已下载 {} bytes，超过上限 {} bytes",
                    downloaded, limits.max_bytes
                )));
            }
            spool.write(&chunk).await?;
            on_progress(downloaded, total);
        }

        spool.finish().await?;
        Ok(downloaded)
    }

    async fn fetch_file(
        &self,
        url: &Url,
        limits: &FetchLimits,
        dest: &Path,
        on_progress: FetchProgress<'_>,
    ) -> Result<u64, FetchError> {
        let path = url
            .to_file_path()
            .map_err(|_| FetchError::SourceRejected(format!("无效的文件路径: {}", url)))?;

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::SourceRejected(format!(
                    "文件不存在: {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !metadata.is_file() {
            return Err(FetchError::SourceRejected(format!(
                "不是普通文件: {}",
                path.display()
            )));
        }
        if metadata.len() > limits.max_bytes {
            return Err(FetchError::LimitExceeded(format!(
                "包大小 {} bytes 超过上限 {} bytes",
                metadata.len(),
                limits.max_bytes
            )));
        }

        let copied = fs::copy(&path, dest).await?;
        on_progress(copied, Some(metadata.len()));
        Ok(copied)
    }
}

fn classify_request_error(err: reqwest::Error) -> FetchError {
    if err.is_redirect() {
        let reason = err
            .source()
            .map(|cause| cause.to_string())
            .unwrap_or_else(|| err.to_string());
        FetchError::SourceRejected(format!("重定向被拒绝: {}", reason))
    } else if err.is_builder() {
        FetchError::SourceRejected(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

/// 先写内存、超过阈值后落盘的写入器
struct Spool {
    path: PathBuf,
    threshold: u64,
    buffer: Vec<u8>,
    file: Option<File>,
}

impl Spool {
    fn new(path: PathBuf, threshold: u64) -> Self {
        Self {
            path,
            threshold,
            buffer: Vec::new(),
            file: None,
        }
    }

    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            return file.write_all(chunk).await;
        }

        if (self.buffer.len() + chunk.len()) as u64 > self.threshold {
            let mut file = File::create(&self.path).await?;
            file.write_all(&self.buffer).await?;
            file.write_all(chunk).await?;
            self.buffer = Vec::new();
            self.file = Some(file);
        } else {
            self.buffer.extend_from_slice(chunk);
        }
        Ok(())
    }

    async fn finish(self) -> std::io::Result<()> {
        match self.file {
            Some(mut file) => {
                file.flush().await?;
                file.sync_all().await
            }
            None => fs::write(&self.path, &self.buffer).await,
        }
    }
}
