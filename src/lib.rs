//! hotswap - 运行时模块热插拔管理
//!
//! 在不重启宿主进程的前提下加载、启用、禁用、卸载和重载模块，
//! 并保持模块表与命令注册表在整个过程中一致。
//!
//! # 架构分层
//!
//! - **模块管理层**: 描述文件加载、命令注册表、资源回收、生命周期编排
//! - **核心基础层**: 宿主事件总线、调度能力适配
//! - **基础设施**: 类型、错误、配置、日志

pub mod config;
pub mod core;
pub mod error;
pub mod plugins;
pub mod types;

// 重新导出核心类型
pub use config::{ConfigManager, LogLevel, LoggingConfig, ManagerConfig};
pub use error::*;
pub use types::*;

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "hotswap";

/// 初始化日志系统
///
/// 已安装全局subscriber时不做任何事，返回 `false`。
pub fn initialize(logging: &LoggingConfig) -> bool {
    let installed = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(logging.level))
        .with_target(logging.verbose)
        .with_thread_ids(logging.verbose)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Initializing {} v{}", FRAMEWORK_NAME, VERSION);
    }
    installed
}
