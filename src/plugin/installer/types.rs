//! 插件安装器类型定义
//!
//! 定义下载、验证、安装各层的错误类型，以及进度回调和操作上下文

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::plugin::registry::RegistryError;
use crate::plugin::PluginState;
use crate::resilience::Transient;

/// 下载错误
#[derive(Error, Debug)]
pub enum FetchError {
    /// 超出大小或时间限制
    #[error("超出下载限制: {0}")]
    LimitExceeded(String),

    /// 来源拒绝（4xx、文件不存在等），不重试
    #[error("来源拒绝请求: {0}")]
    SourceRejected(String),

    /// 服务端错误（5xx），可重试
    #[error("服务端错误: HTTP {0}")]
    ServerError(u16),

    /// 网络错误（连接失败、连接重置等），可重试
    #[error("网络错误: {0}")]
    Network(String),

    /// 不支持的来源协议
    #[error("不支持的来源协议: {0}")]
    UnsupportedScheme(String),

    /// 被调用方取消
    #[error("下载已取消")]
    Cancelled,

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::ServerError(_))
    }
}

/// 包验证错误
#[derive(Error, Debug)]
pub enum VerifyError {
    /// 压缩包损坏或格式不支持
    #[error("包已损坏: {0}")]
    Corrupt(String),

    /// 条目路径会逃逸出暂存目录
    #[error("不安全的路径: {0}")]
    UnsafePath(String),

    /// 校验和不匹配
    #[error("校验和不匹配: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// 清单无效
    #[error("清单无效: {0}")]
    InvalidManifest(String),

    /// 清单 id 与请求的 id 不一致
    #[error("插件 ID 不匹配: 期望 {expected}, 实际 {actual}")]
    IdMismatch { expected: String, actual: String },

    /// 解压后内容超出限制
    #[error("包内容超出限制: {0}")]
    TooLarge(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 安装错误
#[derive(Error, Debug)]
pub enum InstallError {
    /// 同一插件已有操作在进行
    #[error("插件 {0} 正在进行其他操作")]
    OperationInProgress(String),

    /// 记录不处于操作所需的状态
    #[error("状态冲突: 插件 {id} 当前状态为 {actual}")]
    StateConflict { id: String, actual: PluginState },

    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,

    /// 来源未通过信任策略
    #[error("不受信任的来源: {0}")]
    UntrustedSource(String),

    /// 卸载只删除了部分文件，可重试
    #[error("部分卸载: 插件 {id} 删除未完成: {reason}")]
    PartialUninstall { id: String, reason: String },

    /// 更新的目标版本与已安装版本相同
    #[error("插件 {id} 已是版本 {version}")]
    AlreadyAtVersion { id: String, version: String },

    /// 插件 ID 格式无效
    #[error("无效的插件 ID: {0}")]
    InvalidId(String),

    /// 下载失败
    #[error("下载失败: {0}")]
    Fetch(#[from] FetchError),

    /// 包验证失败
    #[error("包验证失败: {0}")]
    Verify(#[from] VerifyError),

    /// 注册表错误
    #[error("注册表错误: {0}")]
    Registry(#[source] RegistryError),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegistryError> for InstallError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::StateConflict { id, actual, .. } => {
                InstallError::StateConflict { id, actual }
            }
            other => InstallError::Registry(other),
        }
    }
}

impl InstallError {
    /// 下载或验证阶段的失败：由协调器转为 Failed 记录返回，而不是错误
    pub(crate) fn is_artifact_failure(&self) -> bool {
        matches!(self, InstallError::Fetch(_) | InstallError::Verify(_))
    }
}

/// 操作阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStage {
    /// 下载中
    Fetching,
    /// 验证中
    Verifying,
    /// 提升中
    Promoting,
    /// 提交中
    Committing,
    /// 删除中
    Removing,
    /// 完成
    Complete,
    /// 失败
    Failed,
}

impl std::fmt::Display for InstallStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallStage::Fetching => write!(f, "fetching"),
            InstallStage::Verifying => write!(f, "verifying"),
            InstallStage::Promoting => write!(f, "promoting"),
            InstallStage::Committing => write!(f, "committing"),
            InstallStage::Removing => write!(f, "removing"),
            InstallStage::Complete => write!(f, "complete"),
            InstallStage::Failed => write!(f, "failed"),
        }
    }
}

/// 操作进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallProgress {
    /// 插件 ID
    pub plugin_id: String,
    /// 当前阶段
    pub stage: InstallStage,
    /// 进度百分比 (0-100)
    pub percent: u8,
    /// 状态消息
    pub message: String,
}

impl InstallProgress {
    /// 创建新的进度实例
    pub fn new(
        plugin_id: impl Into<String>,
        stage: InstallStage,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            stage,
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// 进度回调 trait
pub trait ProgressCallback: Send + Sync {
    /// 进度更新回调
    fn on_progress(&self, progress: InstallProgress);
}

/// 空进度回调实现
pub struct NoopProgressCallback;

impl ProgressCallback for NoopProgressCallback {
    fn on_progress(&self, _progress: InstallProgress) {}
}

/// 函数进度回调实现
///
/// 将闭包包装为 ProgressCallback
pub struct FnProgressCallback<F>
where
    F: Fn(InstallProgress) + Send + Sync,
{
    callback: F,
}

impl<F> FnProgressCallback<F>
where
    F: Fn(InstallProgress) + Send + Sync,
{
    /// 创建新的函数回调
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressCallback for FnProgressCallback<F>
where
    F: Fn(InstallProgress) + Send + Sync,
{
    fn on_progress(&self, progress: InstallProgress) {
        (self.callback)(progress);
    }
}

/// 单次操作的上下文：取消令牌和进度回调
#[derive(Clone)]
pub struct OperationContext {
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressCallback>,
}

impl OperationContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub(crate) fn report(
        &self,
        plugin_id: &str,
        stage: InstallStage,
        percent: u8,
        message: impl Into<String>,
    ) {
        self.progress
            .on_progress(InstallProgress::new(plugin_id, stage, percent, message));
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// 卸载选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UninstallOptions {
    /// 卸载成功后删除注册表记录（否则保留 Absent 记录用于审计）
    pub purge: bool,
}
