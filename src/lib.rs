//! 插件宿主
//!
//! 负责插件包的下载、验证、安装、更新与卸载，
//! 并把每个插件的生命周期状态持久化到 SQLite 注册表。

pub mod config;
pub mod database;
pub mod logger;
pub mod plugin;
pub mod resilience;

pub use config::{ConfigError, HostConfig};
pub use plugin::installer::{InstallCoordinator, InstallError, OperationContext, RecoveryReport};
pub use plugin::{PluginRecord, PluginRegistry, PluginState};
