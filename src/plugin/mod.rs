//! 插件生命周期模块
//!
//! - 生命周期状态与记录类型
//! - 状态机
//! - 持久化注册表
//! - 安装器（下载、验证、协调、恢复）

pub mod installer;
pub mod registry;
pub mod state_machine;
mod types;

pub use registry::{PluginRegistry, RecordListing, RegistryError};
pub use state_machine::LifecycleStateMachine;
pub use types::{PendingPromotion, PluginManifest, PluginRecord, PluginState, PluginType};
