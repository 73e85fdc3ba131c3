//! 插件生命周期类型定义
//!
//! 定义 PluginState、PluginRecord、PluginManifest 等核心类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// 插件生命周期状态
///
/// 瞬态（Installing / Updating / Uninstalling）只会在持有该插件的操作锁时出现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// 未安装
    #[default]
    Absent,
    /// 安装中
    Installing,
    /// 已安装
    Installed,
    /// 更新中
    Updating,
    /// 卸载中
    Uninstalling,
    /// 失败
    Failed,
}

impl PluginState {
    /// 全部状态，按生命周期顺序
    pub const ALL: [PluginState; 6] = [
        PluginState::Absent,
        PluginState::Installing,
        PluginState::Installed,
        PluginState::Updating,
        PluginState::Uninstalling,
        PluginState::Failed,
    ];

    /// 是否为瞬态
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            PluginState::Installing | PluginState::Updating | PluginState::Uninstalling
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Absent => "absent",
            PluginState::Installing => "installing",
            PluginState::Installed => "installed",
            PluginState::Updating => "updating",
            PluginState::Uninstalling => "uninstalling",
            PluginState::Failed => "failed",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("未知的插件状态: {}", s))
    }
}

/// 插件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// 数据脱敏
    Desensitization,
    /// 加密
    Encryption,
    /// 验证
    Validation,
    /// 数据转换
    Transform,
    /// 自定义
    #[default]
    Custom,
}

/// 插件注册表记录
///
/// 每个插件 id 恰好一条，注册表是已提交状态的唯一持有者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// 插件 ID
    pub id: String,
    /// 已安装版本，未安装时为 None
    pub installed_version: Option<String>,
    /// 生命周期状态
    pub state: PluginState,
    /// 最近一次使用的来源
    pub source: Option<String>,
    /// 当前已安装内容的哈希，未安装时为空
    pub checksum: String,
    /// 描述（来自清单）
    pub description: Option<String>,
    /// 作者（来自清单）
    pub author: Option<String>,
    /// 已安装内容大小
    pub size_bytes: u64,
    /// 首次安装时间
    pub installed_at: Option<DateTime<Utc>>,
    /// 最近更新时间
    pub updated_at: DateTime<Utc>,
    /// 最近一次失败原因，仅在 Failed 状态下存在
    pub last_error: Option<String>,
}

impl PluginRecord {
    /// 创建未安装记录
    pub fn absent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            installed_version: None,
            state: PluginState::Absent,
            source: None,
            checksum: String::new(),
            description: None,
            author: None,
            size_bytes: 0,
            installed_at: None,
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.state == PluginState::Installed
    }

    /// 清空已安装内容相关字段（卸载完成后）
    pub(crate) fn clear_installation(&mut self) {
        self.installed_version = None;
        self.checksum.clear();
        self.size_bytes = 0;
    }
}

fn default_plugin_type() -> PluginType {
    PluginType::Custom
}

/// 插件清单 (plugin.json)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    /// 插件 ID
    pub id: String,
    /// 插件版本
    pub version: String,
    /// 声明的内容校验和（SHA256，十六进制）
    #[serde(default)]
    pub checksum: Option<String>,
    /// 插件描述
    #[serde(default)]
    pub description: String,
    /// 作者
    #[serde(default)]
    pub author: Option<String>,
    /// 插件类型
    #[serde(default = "default_plugin_type")]
    pub plugin_type: PluginType,
}

/// 待提交的提升记录
///
/// 在暂存目录被提升为正式目录之前写入，注册表提交时在同一事务内删除。
/// 启动恢复依据它判断崩溃发生在提升的哪一步。
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPromotion {
    pub plugin_id: String,
    pub operation_id: String,
    pub version: String,
    pub checksum: String,
    pub source: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub size_bytes: u64,
    /// 旧正式目录的备份位置（更新时存在）
    pub backup_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip_through_str() {
        for state in PluginState::ALL {
            assert_eq!(state.as_str().parse::<PluginState>().unwrap(), state);
        }
        assert!("enabled".parse::<PluginState>().is_err());
    }

    #[test]
    fn test_transient_states() {
        assert!(PluginState::Installing.is_transient());
        assert!(PluginState::Updating.is_transient());
        assert!(PluginState::Uninstalling.is_transient());
        assert!(!PluginState::Absent.is_transient());
        assert!(!PluginState::Installed.is_transient());
        assert!(!PluginState::Failed.is_transient());
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: PluginManifest =
            serde_json::from_str(r#"{"id": "demo", "version": "1.0.0"}"#).unwrap();
        assert_eq!(manifest.id, "demo");
        assert_eq!(manifest.checksum, None);
        assert_eq!(manifest.plugin_type, PluginType::Custom);
        assert!(manifest.description.is_empty());
    }

    #[test]
    fn test_absent_record() {
        let record = PluginRecord::absent("demo");
        assert_eq!(record.state, PluginState::Absent);
        assert!(record.installed_version.is_none());
        assert!(record.checksum.is_empty());
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_string(&PluginRecord::absent("demo")).unwrap();
        assert!(json.contains("\"installedVersion\":null"));
        assert!(json.contains("\"state\":\"absent\""));
    }
}
