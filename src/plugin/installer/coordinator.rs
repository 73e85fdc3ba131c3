//! 安装协调器
//!
//! 编排 下载 → 验证 → 暂存 → 提升 → 提交 的完整流程：
//! - 每个插件 id 同时只允许一个操作，冲突时立即返回 `OperationInProgress`
//! - 所有注册表写入都经过 compare_and_transition
//! - 下载或验证失败时记录进入 Failed 并作为结果返回，正式目录不受影响
//! - 提升前写入提升记录，启动时据此把中断的操作收敛到稳定状态
//! - 操作在独立任务中执行并持有插件锁，调用方放弃等待后仍会走完

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

use super::checksum;
use super::fetcher::{ArchiveFetcher, FetchLimits};
use super::policy::SourcePolicy;
use super::types::{
    FetchError, InstallError, InstallStage, OperationContext, UninstallOptions,
};
use super::verifier::{PackageVerifier, VerifiedPackage};
use crate::config::HostConfig;
use crate::logger::{sanitize_log_message, sanitize_url};
use crate::plugin::registry::{PluginRegistry, RecordListing};
use crate::plugin::{PendingPromotion, PluginManifest, PluginRecord, PluginState};

/// 操作中断时写入 lastError 的说明
const INTERRUPTED: &str = "操作被中断，已在启动时回滚";

/// 删除插件正式目录
pub(crate) type TreeRemover = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;

/// 安装类操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Install,
    Update,
}

impl OperationKind {
    fn transient(self) -> PluginState {
        match self {
            OperationKind::Install => PluginState::Installing,
            OperationKind::Update => PluginState::Updating,
        }
    }

    fn accepts(self, state: PluginState) -> bool {
        match self {
            OperationKind::Install => matches!(state, PluginState::Absent | PluginState::Failed),
            OperationKind::Update => matches!(state, PluginState::Installed | PluginState::Failed),
        }
    }

    fn label(self) -> &'static str {
        match self {
            OperationKind::Install => "安装",
            OperationKind::Update => "更新",
        }
    }
}

/// 插件操作锁，离开作用域时释放
struct OperationGuard {
    in_flight: Arc<DashMap<String, ()>>,
    plugin_id: String,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.plugin_id);
    }
}

/// 启动恢复结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 补完提交的插件
    pub committed: Vec<String>,
    /// 回滚到上次提交状态的插件
    pub rolled_back: Vec<String>,
    /// 无法恢复、标记为 Failed 的插件
    pub failed: Vec<String>,
    /// 补完卸载的插件
    pub uninstalled: Vec<String>,
    /// 清理的残留目录数
    pub swept: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.committed.is_empty()
            && self.rolled_back.is_empty()
            && self.failed.is_empty()
            && self.uninstalled.is_empty()
    }
}

/// 安装协调器
pub struct InstallCoordinator {
    inner: Arc<Coordinator>,
    recovery: RecoveryReport,
}

/// 操作任务共享的状态
struct Coordinator {
    registry: PluginRegistry,
    fetcher: ArchiveFetcher,
    verifier: PackageVerifier,
    policy: SourcePolicy,
    fetch_limits: FetchLimits,
    live_dir: PathBuf,
    staging_dir: PathBuf,
    in_flight: Arc<DashMap<String, ()>>,
    remove_live: TreeRemover,
}

impl InstallCoordinator {
    /// 打开协调器
    ///
    /// 创建目录、打开注册表，并在接受任何操作前执行一次启动恢复
    pub fn open(config: &HostConfig) -> Result<Self, InstallError> {
        Self::open_with(config, Arc::new(remove_tree))
    }

    /// 使用自定义的目录删除函数打开
    #[cfg(test)]
    pub(crate) fn open_with_remover(
        config: &HostConfig,
        remover: TreeRemover,
    ) -> Result<Self, InstallError> {
        Self::open_with(config, remover)
    }

    fn open_with(config: &HostConfig, remove_live: TreeRemover) -> Result<Self, InstallError> {
        let paths = &config.paths;
        fs::create_dir_all(&paths.live_dir)?;
        fs::create_dir_all(&paths.staging_dir)?;
        if let Some(parent) = paths.database_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let registry = PluginRegistry::open(&paths.database_path)?;
        let fetcher = ArchiveFetcher::new(
            &config.fetch.user_agent,
            config.retry.clone(),
            config.source_policy.clone(),
        )?;

        let inner = Coordinator {
            registry,
            fetcher,
            verifier: PackageVerifier::new(config.verify),
            policy: config.source_policy.clone(),
            fetch_limits: config.fetch.limits(),
            live_dir: paths.live_dir.clone(),
            staging_dir: paths.staging_dir.clone(),
            in_flight: Arc::new(DashMap::new()),
            remove_live,
        };

        let recovery = inner.recover()?;
        tracing::info!(
            "[COORDINATOR] 已就绪: live={}, staging={}",
            inner.live_dir.display(),
            inner.staging_dir.display()
        );
        Ok(Self {
            inner: Arc::new(inner),
            recovery,
        })
    }

    /// 启动恢复结果
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// 插件正式目录
    pub fn live_path(&self, plugin_id: &str) -> PathBuf {
        self.inner.live_path(plugin_id)
    }

    /// 获取插件记录，不等待插件锁
    pub fn get(&self, plugin_id: &str) -> Result<PluginRecord, InstallError> {
        Ok(self.inner.registry.get(plugin_id)?)
    }

    /// 列出全部记录，不等待插件锁
    pub fn list(&self) -> RecordListing {
        self.inner.registry.list()
    }

    /// 按状态列出记录
    pub fn list_by_state(&self, state: PluginState) -> RecordListing {
        self.inner.registry.list_by_state(state)
    }

    /// 安装插件
    pub async fn install(&self, plugin_id: &str, source: &str) -> Result<PluginRecord, InstallError> {
        self.install_with(plugin_id, source, &OperationContext::default())
            .await
    }

    /// 安装插件（带取消令牌和进度回调）
    pub async fn install_with(
        &self,
        plugin_id: &str,
        source: &str,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        self.run(OperationKind::Install, plugin_id, source, ctx).await
    }

    /// 更新插件
    pub async fn update(&self, plugin_id: &str, source: &str) -> Result<PluginRecord, InstallError> {
        self.update_with(plugin_id, source, &OperationContext::default())
            .await
    }

    /// 更新插件（带取消令牌和进度回调）
    pub async fn update_with(
        &self,
        plugin_id: &str,
        source: &str,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        self.run(OperationKind::Update, plugin_id, source, ctx).await
    }

    /// 卸载插件，保留 Absent 记录
    pub async fn uninstall(&self, plugin_id: &str) -> Result<PluginRecord, InstallError> {
        self.uninstall_with(plugin_id, UninstallOptions::default(), &OperationContext::default())
            .await
    }

    /// 卸载插件
    ///
    /// 对 Absent 插件是空操作。删除中途失败时记录停留在 Uninstalling，
    /// 返回 `PartialUninstall`，重试会继续清理剩余文件。
    pub async fn uninstall_with(
        &self,
        plugin_id: &str,
        options: UninstallOptions,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        ensure_valid_id(plugin_id)?;
        let guard = self.inner.acquire(plugin_id)?;

        let inner = self.inner.clone();
        let plugin_id = plugin_id.to_string();
        let ctx = ctx.clone();
        detach(async move {
            let _guard = guard;
            let result = inner.uninstall(&plugin_id, options, &ctx).await;
            match &result {
                Ok(_) => ctx.report(&plugin_id, InstallStage::Complete, 100, "完成"),
                Err(e) => ctx.report(&plugin_id, InstallStage::Failed, 100, e.to_string()),
            }
            result
        })
        .await
    }

    async fn run(
        &self,
        kind: OperationKind,
        plugin_id: &str,
        source: &str,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        ensure_valid_id(plugin_id)?;
        let url = self
            .inner
            .policy
            .check(source)
            .map_err(InstallError::UntrustedSource)?;
        let guard = self.inner.acquire(plugin_id)?;

        let inner = self.inner.clone();
        let plugin_id = plugin_id.to_string();
        let source = source.to_string();
        let ctx = ctx.clone();
        detach(async move {
            let _guard = guard;
            inner.run(kind, &plugin_id, &url, &source, &ctx).await
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn prepare(
        &self,
        plugin_id: &str,
        url: &Url,
        scratch: &Path,
        ctx: &OperationContext,
    ) -> Result<VerifiedPackage, InstallError> {
        self.inner.prepare(plugin_id, url, scratch, ctx).await
    }

    #[cfg(test)]
    pub(crate) async fn promote(
        &self,
        plugin_id: &str,
        operation_id: &str,
        package: &VerifiedPackage,
        shown_source: &str,
    ) -> Result<PendingPromotion, InstallError> {
        self.inner
            .promote(plugin_id, operation_id, package, shown_source)
            .await
    }
}

/// 在独立任务中执行持有插件锁的操作
///
/// 调用方丢弃等待中的 future 时任务继续执行，记录仍会收敛到稳定状态
async fn detach<F>(operation: F) -> Result<PluginRecord, InstallError>
where
    F: Future<Output = Result<PluginRecord, InstallError>> + Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|e| InstallError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

impl Coordinator {
    fn live_path(&self, plugin_id: &str) -> PathBuf {
        self.live_dir.join(plugin_id)
    }

    async fn uninstall(
        &self,
        plugin_id: &str,
        options: UninstallOptions,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        let current = self.registry.get(plugin_id)?;
        let record = match current.state {
            PluginState::Absent => current,
            PluginState::Installed => {
                self.registry.compare_and_transition(
                    plugin_id,
                    PluginState::Installed,
                    PluginState::Uninstalling,
                    |_| {},
                )?;
                self.finish_uninstall(plugin_id, PluginState::Uninstalling, ctx)
                    .await?
            }
            PluginState::Uninstalling | PluginState::Failed => {
                self.finish_uninstall(plugin_id, current.state, ctx).await?
            }
            PluginState::Installing | PluginState::Updating => {
                return Err(InstallError::StateConflict {
                    id: plugin_id.to_string(),
                    actual: current.state,
                });
            }
        };

        if options.purge && self.registry.purge(plugin_id)? {
            tracing::info!("[COORDINATOR] 已清除插件记录: {}", plugin_id);
        }
        Ok(record)
    }

    async fn finish_uninstall(
        &self,
        plugin_id: &str,
        from: PluginState,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        ctx.report(plugin_id, InstallStage::Removing, 0, "删除插件目录");
        let live = self.live_path(plugin_id);
        let remover = self.remove_live.clone();
        let removal = run_blocking(move || remover(&live).map_err(InstallError::from)).await;

        if let Err(e) = removal {
            tracing::warn!("[COORDINATOR] 卸载未完成 {}: {}", plugin_id, e);
            return Err(InstallError::PartialUninstall {
                id: plugin_id.to_string(),
                reason: e.to_string(),
            });
        }

        let record = self.registry.compare_and_transition(
            plugin_id,
            from,
            PluginState::Absent,
            PluginRecord::clear_installation,
        )?;
        tracing::info!("[COORDINATOR] 卸载完成: {}", plugin_id);
        Ok(record)
    }

    async fn run(
        &self,
        kind: OperationKind,
        plugin_id: &str,
        url: &Url,
        source: &str,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        let prior = self.registry.get(plugin_id)?;
        if !kind.accepts(prior.state) {
            return Err(InstallError::StateConflict {
                id: plugin_id.to_string(),
                actual: prior.state,
            });
        }

        let target = kind.transient();
        let shown_source = sanitize_url(source);
        self.registry
            .compare_and_transition(plugin_id, prior.state, target, |r| {
                r.source = Some(shown_source.clone());
            })?;
        tracing::info!(
            "[COORDINATOR] 开始{}: {} <- {}",
            kind.label(),
            plugin_id,
            shown_source
        );

        let operation_id = uuid::Uuid::new_v4().to_string();
        let scratch = self
            .staging_dir
            .join(format!("{}-{}", plugin_id, operation_id));

        let outcome = self
            .stage_and_commit(kind, plugin_id, url, &shown_source, &prior, &operation_id, &scratch, ctx)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("[COORDINATOR] 清理暂存目录失败 {}: {}", scratch.display(), e);
            }
        }

        match outcome {
            Ok(record) => {
                ctx.report(plugin_id, InstallStage::Complete, 100, "完成");
                tracing::info!(
                    "[COORDINATOR] {}完成: {} v{}",
                    kind.label(),
                    plugin_id,
                    record.installed_version.as_deref().unwrap_or("-")
                );
                Ok(record)
            }
            Err(e) => {
                ctx.report(plugin_id, InstallStage::Failed, 100, e.to_string());
                self.settle_failure(plugin_id, target, &prior, e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage_and_commit(
        &self,
        kind: OperationKind,
        plugin_id: &str,
        url: &Url,
        shown_source: &str,
        prior: &PluginRecord,
        operation_id: &str,
        scratch: &Path,
        ctx: &OperationContext,
    ) -> Result<PluginRecord, InstallError> {
        let package = self.prepare(plugin_id, url, scratch, ctx).await?;

        if kind == OperationKind::Update
            && prior.installed_version.as_deref() == Some(package.manifest.version.as_str())
        {
            return Err(InstallError::AlreadyAtVersion {
                id: plugin_id.to_string(),
                version: package.manifest.version,
            });
        }
        if ctx.cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        ctx.report(plugin_id, InstallStage::Promoting, 80, "替换插件目录");
        let pending = self
            .promote(plugin_id, operation_id, &package, shown_source)
            .await?;

        ctx.report(plugin_id, InstallStage::Committing, 90, "写入注册表");
        self.commit(&pending, kind.transient())
    }

    /// 下载并验证到暂存目录
    async fn prepare(
        &self,
        plugin_id: &str,
        url: &Url,
        scratch: &Path,
        ctx: &OperationContext,
    ) -> Result<VerifiedPackage, InstallError> {
        ctx.report(plugin_id, InstallStage::Fetching, 0, "下载插件包");
        let on_progress = |downloaded: u64, total: Option<u64>| {
            let percent = total
                .filter(|t| *t > 0)
                .map(|t| (downloaded.min(t) * 40 / t) as u8)
                .unwrap_or(0);
            ctx.report(
                plugin_id,
                InstallStage::Fetching,
                percent,
                format!("已下载 {} bytes", downloaded),
            );
        };

        let archive = self
            .fetcher
            .fetch(url, &self.fetch_limits, scratch, &ctx.cancel, &on_progress)
            .await
            .map_err(|e| match e {
                FetchError::Cancelled => InstallError::Cancelled,
                other => InstallError::Fetch(other),
            })?;

        ctx.report(plugin_id, InstallStage::Verifying, 50, "验证插件包");
        let verifier = self.verifier;
        let archive_path = archive.path.clone();
        let staging = scratch.to_path_buf();
        let expected_id = plugin_id.to_string();
        let package = run_blocking(move || {
            verifier
                .verify(&archive_path, &staging, Some(&expected_id))
                .map_err(InstallError::from)
        })
        .await?;

        if ctx.cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        Ok(package)
    }

    /// 写入提升记录并把暂存目录换入正式位置
    ///
    /// 返回后正式目录已是新内容，注册表尚未提交
    async fn promote(
        &self,
        plugin_id: &str,
        operation_id: &str,
        package: &VerifiedPackage,
        shown_source: &str,
    ) -> Result<PendingPromotion, InstallError> {
        let live = self.live_path(plugin_id);
        let backup = self
            .live_dir
            .join(format!(".{}.backup-{}", plugin_id, operation_id));
        let incoming = self
            .live_dir
            .join(format!(".{}.incoming-{}", plugin_id, operation_id));

        let description = Some(package.manifest.description.clone()).filter(|d| !d.is_empty());
        let pending = PendingPromotion {
            plugin_id: plugin_id.to_string(),
            operation_id: operation_id.to_string(),
            version: package.manifest.version.clone(),
            checksum: package.checksum.clone(),
            source: shown_source.to_string(),
            description,
            author: package.manifest.author.clone(),
            size_bytes: package.size_bytes,
            backup_path: live.exists().then_some(backup),
            created_at: Utc::now(),
        };
        self.registry.begin_promotion(&pending)?;

        let staged = package.root.clone();
        let backup = pending.backup_path.clone();
        let swapped = run_blocking(move || {
            swap_in(&staged, &live, backup.as_deref(), &incoming).map_err(InstallError::from)
        })
        .await;

        if let Err(e) = swapped {
            if let Err(abandon_err) = self.registry.abandon_promotion(plugin_id) {
                tracing::error!("[COORDINATOR] 放弃提升记录失败 {}: {}", plugin_id, abandon_err);
            }
            return Err(e);
        }
        Ok(pending)
    }

    /// 提交注册表并删除旧目录备份；提交失败时回滚文件
    fn commit(
        &self,
        pending: &PendingPromotion,
        expected: PluginState,
    ) -> Result<PluginRecord, InstallError> {
        let committed = self
            .registry
            .commit_promotion(&pending.plugin_id, expected, |r| apply_promotion(r, pending));

        match committed {
            Ok(record) => {
                if let Some(backup) = &pending.backup_path {
                    if let Err(e) = remove_tree(backup) {
                        tracing::warn!("[COORDINATOR] 删除旧版本备份失败 {}: {}", backup.display(), e);
                    }
                }
                Ok(record)
            }
            Err(e) => {
                tracing::error!("[COORDINATOR] 提交失败，回滚 {}: {}", pending.plugin_id, e);
                self.restore_backup(pending);
                if let Err(abandon_err) = self.registry.abandon_promotion(&pending.plugin_id) {
                    tracing::error!(
                        "[COORDINATOR] 放弃提升记录失败 {}: {}",
                        pending.plugin_id,
                        abandon_err
                    );
                }
                Err(e.into())
            }
        }
    }

    /// 把失败的操作收敛到稳定状态
    fn settle_failure(
        &self,
        plugin_id: &str,
        target: PluginState,
        prior: &PluginRecord,
        error: InstallError,
    ) -> Result<PluginRecord, InstallError> {
        // 版本未变化：记录原样还原
        if let InstallError::AlreadyAtVersion { .. } = error {
            if let Err(e) = self.registry.revert(target, prior) {
                tracing::error!("[COORDINATOR] 恢复记录失败 {}: {}", plugin_id, e);
            }
            return Err(error);
        }

        let reason = sanitize_log_message(&error.to_string());
        tracing::warn!("[COORDINATOR] 操作失败 {}: {}", plugin_id, reason);

        let failed =
            self.registry
                .compare_and_transition(plugin_id, target, PluginState::Failed, |r| {
                    r.last_error = Some(reason.clone());
                });

        match failed {
            Ok(record) if error.is_artifact_failure() => Ok(record),
            Ok(_) => Err(error),
            Err(e) => {
                tracing::error!("[COORDINATOR] 无法标记失败状态 {}: {}", plugin_id, e);
                Err(error)
            }
        }
    }

    fn restore_backup(&self, pending: &PendingPromotion) {
        let live = self.live_path(&pending.plugin_id);
        if let Err(e) = remove_tree(&live) {
            tracing::error!("[COORDINATOR] 删除新目录失败 {}: {}", live.display(), e);
            return;
        }
        if let Some(backup) = pending.backup_path.as_ref().filter(|b| b.exists()) {
            if let Err(e) = fs::rename(backup, &live) {
                tracing::error!("[COORDINATOR] 恢复旧目录失败 {}: {}", backup.display(), e);
            }
        }
    }

    fn acquire(&self, plugin_id: &str) -> Result<OperationGuard, InstallError> {
        match self.in_flight.entry(plugin_id.to_string()) {
            Entry::Occupied(_) => Err(InstallError::OperationInProgress(plugin_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(OperationGuard {
                    in_flight: self.in_flight.clone(),
                    plugin_id: plugin_id.to_string(),
                })
            }
        }
    }

    /// 启动恢复
    ///
    /// 1. 逐条处理提升记录：正式目录已是新内容则补完提交，否则恢复备份
    /// 2. 处理仍处于瞬态的记录
    /// 3. 清理暂存目录和孤立的备份目录
    fn recover(&self) -> Result<RecoveryReport, InstallError> {
        let mut report = RecoveryReport::default();

        for pending in self.registry.pending_promotions()? {
            self.recover_promotion(&pending, &mut report)?;
        }
        for record in self.registry.transient_records()? {
            self.recover_transient(&record, &mut report)?;
        }
        report.swept = self.sweep();

        if report.is_clean() {
            tracing::debug!("[RECOVERY] 无需恢复，清理残留目录 {} 个", report.swept);
        } else {
            tracing::info!("[RECOVERY] 恢复完成: {:?}", report);
        }
        Ok(report)
    }

    fn recover_promotion(
        &self,
        pending: &PendingPromotion,
        report: &mut RecoveryReport,
    ) -> Result<(), InstallError> {
        let plugin_id = pending.plugin_id.as_str();
        let record = self.registry.get(plugin_id)?;
        let live = self.live_path(plugin_id);

        // 有旧版本时，备份目录不存在说明换入尚未开始
        let swap_started = pending.backup_path.as_ref().map_or(true, |b| b.exists());
        let promoted = swap_started
            && tree_checksum(&live)
                .as_deref()
                .is_some_and(|c| checksum::checksums_match(&pending.checksum, c))
            && manifest_version(&live).as_deref() == Some(pending.version.as_str());

        if promoted && matches!(record.state, PluginState::Installing | PluginState::Updating) {
            self.commit(pending, record.state)?;
            tracing::info!("[RECOVERY] 补完提交: {} v{}", plugin_id, pending.version);
            report.committed.push(plugin_id.to_string());
            return Ok(());
        }

        if !promoted {
            if let Some(backup) = pending.backup_path.as_ref().filter(|b| b.exists()) {
                remove_tree(&live)?;
                fs::rename(backup, &live)?;
                tracing::info!("[RECOVERY] 已恢复旧版本目录: {}", plugin_id);
            }
        }
        self.registry.abandon_promotion(plugin_id)?;
        Ok(())
    }

    fn recover_transient(
        &self,
        record: &PluginRecord,
        report: &mut RecoveryReport,
    ) -> Result<(), InstallError> {
        let plugin_id = record.id.as_str();
        let live = self.live_path(plugin_id);

        match record.state {
            PluginState::Uninstalling => match (self.remove_live)(&live) {
                Ok(()) => {
                    self.registry.compare_and_transition(
                        plugin_id,
                        PluginState::Uninstalling,
                        PluginState::Absent,
                        PluginRecord::clear_installation,
                    )?;
                    tracing::info!("[RECOVERY] 补完卸载: {}", plugin_id);
                    report.uninstalled.push(plugin_id.to_string());
                }
                Err(e) => {
                    tracing::warn!("[RECOVERY] 补完卸载失败 {}: {}", plugin_id, e);
                }
            },
            PluginState::Installing | PluginState::Updating => {
                let intact = tree_checksum(&live)
                    .as_deref()
                    .is_some_and(|c| checksum::checksums_match(&record.checksum, c));

                if record.state == PluginState::Updating && intact {
                    self.registry.compare_and_transition(
                        plugin_id,
                        PluginState::Updating,
                        PluginState::Installed,
                        |_| {},
                    )?;
                    tracing::info!("[RECOVERY] 回滚到已安装版本: {}", plugin_id);
                    report.rolled_back.push(plugin_id.to_string());
                    return Ok(());
                }

                if !intact {
                    remove_tree(&live)?;
                }
                self.registry
                    .compare_and_transition(plugin_id, record.state, PluginState::Failed, |r| {
                        r.last_error = Some(INTERRUPTED.to_string());
                    })?;
                tracing::warn!("[RECOVERY] 操作中断，标记为失败: {}", plugin_id);
                report.failed.push(plugin_id.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    /// 清理暂存目录和正式目录下的隐藏残留
    fn sweep(&self) -> usize {
        let mut swept = 0;

        let mut targets: Vec<PathBuf> = read_dir_paths(&self.staging_dir);
        targets.extend(read_dir_paths(&self.live_dir).into_iter().filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with('.') && (n.contains(".backup-") || n.contains(".incoming-")))
        }));

        for path in targets {
            match remove_tree(&path) {
                Ok(()) => swept += 1,
                Err(e) => tracing::warn!("[RECOVERY] 清理失败 {}: {}", path.display(), e),
            }
        }
        swept
    }
}

fn ensure_valid_id(plugin_id: &str) -> Result<(), InstallError> {
    if PackageVerifier::is_valid_id(plugin_id) {
        Ok(())
    } else {
        Err(InstallError::InvalidId(plugin_id.to_string()))
    }
}

fn apply_promotion(record: &mut PluginRecord, pending: &PendingPromotion) {
    if record.state == PluginState::Installing || record.installed_at.is_none() {
        record.installed_at = Some(Utc::now());
    }
    record.installed_version = Some(pending.version.clone());
    record.checksum = pending.checksum.clone();
    record.source = Some(pending.source.clone());
    record.description = pending.description.clone();
    record.author = pending.author.clone();
    record.size_bytes = pending.size_bytes;
}

async fn run_blocking<T, F>(task: F) -> Result<T, InstallError>
where
    F: FnOnce() -> Result<T, InstallError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| InstallError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn tree_checksum(path: &Path) -> Option<String> {
    if !path.is_dir() {
        return None;
    }
    match checksum::hash_tree(path) {
        Ok(digest) => Some(digest.checksum),
        Err(e) => {
            tracing::warn!("[RECOVERY] 计算目录哈希失败 {}: {}", path.display(), e);
            None
        }
    }
}

/// 正式目录中清单声明的版本
fn manifest_version(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path.join(checksum::MANIFEST_FILE)).ok()?;
    serde_json::from_str::<PluginManifest>(&text)
        .ok()
        .map(|manifest| manifest.version)
}

fn read_dir_paths(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}

/// 删除目录或文件，不存在视为成功
fn remove_tree(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// 用暂存目录替换正式目录
///
/// 旧目录先改名为备份；换入失败时把备份改回原位
fn swap_in(staged: &Path, live: &Path, backup: Option<&Path>, incoming: &Path) -> io::Result<()> {
    if let Some(backup) = backup {
        fs::rename(live, backup)?;
    }

    if let Err(e) = move_dir(staged, live, incoming) {
        if let Some(backup) = backup {
            let _ = remove_tree(live);
            let _ = fs::rename(backup, live);
        }
        return Err(e);
    }
    Ok(())
}

/// 目录改名；跨文件系统时先复制到正式目录旁的临时位置再改名
fn move_dir(src: &Path, dst: &Path, incoming: &Path) -> io::Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    fs::create_dir_all(incoming)?;
    let copied = copy_dir_recursive(src, incoming).and_then(|_| fs::rename(incoming, dst));
    if copied.is_err() {
        let _ = remove_tree(incoming);
    }
    copied
}

/// 递归复制目录，保持可执行权限
fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            // fs::copy 会同时复制权限位
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
