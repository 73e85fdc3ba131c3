//! 插件安装器模块
//!
//! 提供插件生命周期操作：
//! - 从 http(s) 或本地文件来源下载插件包
//! - 插件包验证与解压
//! - 安装、更新、卸载的协调与提交
//! - 启动恢复
//! - 进度回调与取消

mod checksum;
mod coordinator;
mod fetcher;
mod policy;
mod types;
mod verifier;

pub use checksum::{hash_tree, TreeDigest, MANIFEST_FILE};
pub use coordinator::{InstallCoordinator, RecoveryReport};
pub use fetcher::{ArchiveFetcher, FetchLimits, FetchedArchive};
pub use policy::SourcePolicy;
pub use types::{
    FetchError, FnProgressCallback, InstallError, InstallProgress, InstallStage,
    NoopProgressCallback, OperationContext, ProgressCallback, UninstallOptions, VerifyError,
};
pub use verifier::{PackageFormat, PackageVerifier, VerifiedPackage, VerifyLimits};
