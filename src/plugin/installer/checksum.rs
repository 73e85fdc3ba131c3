//! 插件目录内容哈希
//!
//! 对解压后的目录树计算 SHA256：按相对路径排序逐个文件写入哈希，
//! 根目录下的 plugin.json 不参与计算（清单中声明的校验和不能包含自身）。
//! 同一函数用于验证暂存目录和启动恢复时核对正式目录。

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// 清单文件名
pub const MANIFEST_FILE: &str = "plugin.json";

/// 目录哈希结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    /// 小写十六进制 SHA256
    pub checksum: String,
    /// 文件总字节数
    pub size_bytes: u64,
    /// 文件数量
    pub file_count: usize,
}

/// 计算目录内容哈希
pub fn hash_tree(root: &Path) -> io::Result<TreeDigest> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    let mut buffer = [0u8; 8192];

    for (relative, path) in &files {
        let len = fs::metadata(path)?.len();
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(len.to_le_bytes());

        let mut reader = File::open(path)?;
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        size_bytes += len;
    }

    Ok(TreeDigest {
        checksum: format!("{:x}", hasher.finalize()),
        size_bytes,
        file_count: files.len(),
    })
}

/// 两个校验和是否相同（忽略大小写）
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    !expected.is_empty() && expected.eq_ignore_ascii_case(actual)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if relative == MANIFEST_FILE {
            continue;
        }
        out.push((relative, path));
    }
    Ok(())
}
