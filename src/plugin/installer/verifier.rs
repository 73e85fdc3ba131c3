//! 插件包验证器
//!
//! 验证暂存的插件包并解压到暂存目录：
//! - 按文件头识别格式（zip / tar.gz），结构损坏返回 `Corrupt`
//! - 解压前先完整扫描一遍条目：路径逃逸、符号链接、硬链接一律拒绝，
//!   条目数与声明大小超限返回 `TooLarge`
//! - 解压时再按实际写入字节数限额
//! - 解析并校验 plugin.json，计算目录内容哈希并与声明的校验和比对

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use super::checksum::{self, MANIFEST_FILE};
use super::types::VerifyError;
use crate::plugin::PluginManifest;

/// 解压目录名
const EXTRACT_DIR_NAME: &str = "extracted";

/// 插件 ID 最大长度
const MAX_ID_LEN: usize = 64;

/// 包格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    Zip,
    TarGz,
}

/// 解压限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyLimits {
    /// 解压后总字节数上限
    pub max_extracted_bytes: u64,
    /// 条目数上限
    pub max_entries: usize,
}

impl Default for VerifyLimits {
    fn default() -> Self {
        Self {
            max_extracted_bytes: 512 * 1024 * 1024,
            max_entries: 10_000,
        }
    }
}

/// 验证通过的插件包
#[derive(Debug, Clone)]
pub struct VerifiedPackage {
    /// 插件根目录（包含 plugin.json）
    pub root: PathBuf,
    /// 清单
    pub manifest: PluginManifest,
    /// 计算出的内容哈希
    pub checksum: String,
    /// 内容总字节数
    pub size_bytes: u64,
}

/// 包验证器
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageVerifier {
    limits: VerifyLimits,
}

impl PackageVerifier {
    pub fn new(limits: VerifyLimits) -> Self {
        Self { limits }
    }

    /// 验证插件包并解压到 `staging_root` 下
    ///
    /// `expected_id` 存在时要求清单 id 与之一致。
    /// 阻塞调用，异步上下文中应放到 `spawn_blocking` 执行。
    pub fn verify(
        &self,
        archive: &Path,
        staging_root: &Path,
        expected_id: Option<&str>,
    ) -> Result<VerifiedPackage, VerifyError> {
        let format = Self::detect_format(archive)?;
        tracing::debug!("[VERIFY] 包格式: {:?}", format);

        match format {
            PackageFormat::Zip => self.inspect_zip(archive)?,
            PackageFormat::TarGz => self.inspect_targz(archive)?,
        }

        let extract_dir = staging_root.join(EXTRACT_DIR_NAME);
        fs::create_dir_all(&extract_dir)?;
        match format {
            PackageFormat::Zip => self.extract_zip(archive, &extract_dir)?,
            PackageFormat::TarGz => self.extract_targz(archive, &extract_dir)?,
        }

        let root = find_plugin_root(&extract_dir)?;
        let manifest = read_manifest(&root)?;

        if let Some(expected) = expected_id {
            if manifest.id != expected {
                return Err(VerifyError::IdMismatch {
                    expected: expected.to_string(),
                    actual: manifest.id.clone(),
                });
            }
        }

        let digest = checksum::hash_tree(&root)?;
        if let Some(declared) = manifest.checksum.as_deref() {
            if !checksum::checksums_match(declared, &digest.checksum) {
                return Err(VerifyError::ChecksumMismatch {
                    expected: declared.to_string(),
                    actual: digest.checksum,
                });
            }
        }

        tracing::info!(
            "[VERIFY] 验证通过: {} v{} ({} 个文件, {} bytes)",
            manifest.id,
            manifest.version,
            digest.file_count,
            digest.size_bytes
        );

        Ok(VerifiedPackage {
            root,
            manifest,
            checksum: digest.checksum,
            size_bytes: digest.size_bytes,
        })
    }

    /// 按文件头识别包格式
    pub fn detect_format(path: &Path) -> Result<PackageFormat, VerifyError> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        let read = file.read(&mut magic)?;

        match &magic[..read] {
            // PK\x03\x04 普通压缩包，PK\x05\x06 空压缩包
            [0x50, 0x4B, 0x03, 0x04] | [0x50, 0x4B, 0x05, 0x06] => Ok(PackageFormat::Zip),
            [0x1f, 0x8b, ..] => Ok(PackageFormat::TarGz),
            [] => Err(VerifyError::Corrupt("文件为空".to_string())),
            _ => Err(VerifyError::Corrupt(
                "不支持的包格式，仅支持 zip 和 tar.gz".to_string(),
            )),
        }
    }

    /// 验证插件 ID 格式
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    /// 验证版本格式：x.y 或 x.y.z，可带 -suffix
    pub fn is_valid_version(version: &str) -> bool {
        let (numbers, suffix) = match version.split_once('-') {
            Some((numbers, suffix)) => (numbers, Some(suffix)),
            None => (version, None),
        };

        if suffix.is_some_and(|s| {
            s.is_empty()
                || !s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }) {
            return false;
        }

        let parts: Vec<&str> = numbers.split('.').collect();
        (2..=3).contains(&parts.len())
            && parts
                .iter()
                .all(|n| !n.is_empty() && n.parse::<u32>().is_ok())
    }

    fn check_budget(&self, entries: usize, declared_bytes: u64) -> Result<(), VerifyError> {
        if entries > self.limits.max_entries {
            return Err(VerifyError::TooLarge(format!(
                "条目数超过上限 {}",
                self.limits.max_entries
            )));
        }
        if declared_bytes > self.limits.max_extracted_bytes {
            return Err(VerifyError::TooLarge(format!(
                "解压后大小超过上限 {} bytes",
                self.limits.max_extracted_bytes
            )));
        }
        Ok(())
    }

    /// 扫描 ZIP 条目
    fn inspect_zip(&self, path: &Path) -> Result<(), VerifyError> {
        let mut archive = zip::ZipArchive::new(File::open(path)?)
            .map_err(|e| VerifyError::Corrupt(format!("无法读取 ZIP 文件: {}", e)))?;

        if archive.len() == 0 {
            return Err(VerifyError::Corrupt("ZIP 压缩包为空".to_string()));
        }

        let mut declared = 0u64;
        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(|e| {
                VerifyError::Corrupt(format!("ZIP 文件损坏，无法读取条目 {}: {}", i, e))
            })?;

            safe_relative_path(file.name())?;
            if file.unix_mode().is_some_and(is_symlink_mode) {
                return Err(VerifyError::UnsafePath(format!(
                    "不允许符号链接: {}",
                    file.name()
                )));
            }

            declared = declared.saturating_add(file.size());
            self.check_budget(i + 1, declared)?;
        }

        Ok(())
    }

    /// 扫描 tar.gz 条目
    fn inspect_targz(&self, path: &Path) -> Result<(), VerifyError> {
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(File::open(path)?));

        let mut count = 0usize;
        let mut declared = 0u64;
        for entry in archive
            .entries()
            .map_err(|e| VerifyError::Corrupt(format!("无法读取 tar.gz 文件: {}", e)))?
        {
            let entry =
                entry.map_err(|e| VerifyError::Corrupt(format!("tar.gz 文件损坏: {}", e)))?;
            let entry_path = entry
                .path()
                .map_err(|e| VerifyError::Corrupt(format!("tar.gz 条目路径无效: {}", e)))?
                .to_string_lossy()
                .into_owned();

            if !tar_entry_kind(&entry, &entry_path)?.is_extractable() {
                continue;
            }
            safe_relative_path(&entry_path)?;

            count += 1;
            declared = declared.saturating_add(entry.header().size().unwrap_or(0));
            self.check_budget(count, declared)?;
        }

        if count == 0 {
            return Err(VerifyError::Corrupt("tar.gz 压缩包为空".to_string()));
        }
        Ok(())
    }

    /// 解压 ZIP 文件
    fn extract_zip(&self, path: &Path, dest: &Path) -> Result<(), VerifyError> {
        let mut archive = zip::ZipArchive::new(File::open(path)?)
            .map_err(|e| VerifyError::Corrupt(format!("无法读取 ZIP 文件: {}", e)))?;
        let mut budget = self.limits.max_extracted_bytes;

        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| VerifyError::Corrupt(format!("无法读取 ZIP 条目 {}: {}", i, e)))?;

            let relative = safe_relative_path(file.name())?;
            if relative.as_os_str().is_empty() || is_macos_metadata(&relative) {
                continue;
            }
            let outpath = dest.join(&relative);

            if file.is_dir() {
                fs::create_dir_all(&outpath)?;
                continue;
            }

            write_entry(&mut file, &outpath, &mut budget, self.limits.max_extracted_bytes)?;
            set_mode(&outpath, file.unix_mode())?;
        }

        Ok(())
    }

    /// 解压 tar.gz 文件
    fn extract_targz(&self, path: &Path, dest: &Path) -> Result<(), VerifyError> {
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(File::open(path)?));
        let mut budget = self.limits.max_extracted_bytes;

        for entry in archive
            .entries()
            .map_err(|e| VerifyError::Corrupt(format!("无法读取 tar.gz 文件: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| VerifyError::Corrupt(format!("tar.gz 条目读取失败: {}", e)))?;
            let entry_path = entry
                .path()
                .map_err(|e| VerifyError::Corrupt(format!("tar.gz 条目路径无效: {}", e)))?
                .to_string_lossy()
                .into_owned();

            let kind = tar_entry_kind(&entry, &entry_path)?;
            if !kind.is_extractable() {
                continue;
            }

            let relative = safe_relative_path(&entry_path)?;
            if relative.as_os_str().is_empty() || is_macos_metadata(&relative) {
                continue;
            }
            let outpath = dest.join(&relative);

            if kind == TarEntryKind::Directory {
                fs::create_dir_all(&outpath)?;
                continue;
            }

            let mode = entry.header().mode().ok();
            write_entry(&mut entry, &outpath, &mut budget, self.limits.max_extracted_bytes)?;
            set_mode(&outpath, mode)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TarEntryKind {
    File,
    Directory,
    /// pax 全局头等元数据条目
    Metadata,
}

impl TarEntryKind {
    fn is_extractable(self) -> bool {
        self != TarEntryKind::Metadata
    }
}

fn tar_entry_kind<R: Read>(
    entry: &tar::Entry<'_, R>,
    entry_path: &str,
) -> Result<TarEntryKind, VerifyError> {
    let entry_type = entry.header().entry_type();

    if entry_type.is_file() || entry_type.is_contiguous() {
        Ok(TarEntryKind::File)
    } else if entry_type.is_dir() {
        Ok(TarEntryKind::Directory)
    } else if entry_type.is_pax_global_extensions()
        || entry_type.is_pax_local_extensions()
        || entry_type.is_gnu_longname()
        || entry_type.is_gnu_longlink()
    {
        Ok(TarEntryKind::Metadata)
    } else if entry_type.is_symlink() || entry_type.is_hard_link() {
        Err(VerifyError::UnsafePath(format!(
            "不允许链接条目: {}",
            entry_path
        )))
    } else {
        Err(VerifyError::UnsafePath(format!(
            "不支持的条目类型 {:?}: {}",
            entry_type, entry_path
        )))
    }
}

/// 把条目路径规范化为暂存目录内的相对路径
///
/// 绝对路径、盘符、`..` 一律视为逃逸
fn safe_relative_path(raw: &str) -> Result<PathBuf, VerifyError> {
    let normalized = raw.replace('\\', "/");
    let mut relative = PathBuf::new();

    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(VerifyError::UnsafePath(raw.to_string()));
            }
        }
    }

    Ok(relative)
}

fn is_macos_metadata(relative: &Path) -> bool {
    relative
        .components()
        .next()
        .is_some_and(|c| c.as_os_str() == "__MACOSX")
}

fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o120000
}

/// 写出单个文件，按实际字节数扣减额度
fn write_entry<R: Read>(
    reader: &mut R,
    outpath: &Path,
    budget: &mut u64,
    limit: u64,
) -> Result<(), VerifyError> {
    if let Some(parent) = outpath.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut outfile = File::create(outpath)?;
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| VerifyError::Corrupt(format!("读取条目失败: {}", e)))?;
        if read == 0 {
            break;
        }
        if read as u64 > *budget {
            return Err(VerifyError::TooLarge(format!(
                "解压后大小超过上限 {} bytes",
                limit
            )));
        }
        *budget -= read as u64;
        outfile.write_all(&buffer[..read])?;
    }

    outfile.flush()?;
    Ok(())
}

/// 保持可执行权限
fn set_mode(path: &Path, mode: Option<u32>) -> Result<(), VerifyError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode {
            if mode & 0o111 != 0 {
                fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// 查找插件根目录：解压目录本身，或唯一的顶层子目录
fn find_plugin_root(extract_dir: &Path) -> Result<PathBuf, VerifyError> {
    if extract_dir.join(MANIFEST_FILE).is_file() {
        return Ok(extract_dir.to_path_buf());
    }

    let entries = fs::read_dir(extract_dir)?.collect::<Result<Vec<_>, _>>()?;
    if let [only] = entries.as_slice() {
        let path = only.path();
        if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
            return Ok(path);
        }
    }

    Err(VerifyError::InvalidManifest(
        "未找到 plugin.json 文件".to_string(),
    ))
}

/// 读取并校验清单
fn read_manifest(root: &Path) -> Result<PluginManifest, VerifyError> {
    let content = fs::read_to_string(root.join(MANIFEST_FILE))
        .map_err(|e| VerifyError::InvalidManifest(format!("无法读取 plugin.json: {}", e)))?;
    let manifest: PluginManifest = serde_json::from_str(&content)
        .map_err(|e| VerifyError::InvalidManifest(format!("plugin.json 解析失败: {}", e)))?;

    if !PackageVerifier::is_valid_id(&manifest.id) {
        return Err(VerifyError::InvalidManifest(format!(
            "插件 ID 只能包含字母、数字、连字符和下划线，且不超过 {} 个字符: {:?}",
            MAX_ID_LEN, manifest.id
        )));
    }
    if !PackageVerifier::is_valid_version(&manifest.version) {
        return Err(VerifyError::InvalidManifest(format!(
            "无效的版本格式: {}，期望如 1.0.0",
            manifest.version
        )));
    }

    Ok(manifest)
}
