//! 模块管理层
//!
//! 描述文件加载、命令注册表同步、资源回收和生命周期编排

pub mod core;
pub mod host;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod reclaimer;
pub mod registry;
pub mod results;
pub mod table;

// 重新导出核心组件
pub use self::core::*;
pub use host::*;
pub use lifecycle::*;
pub use loader::*;
pub use metadata::*;
pub use reclaimer::{reclaim, Reclaimed};
pub use registry::*;
pub use results::*;
pub use table::*;
