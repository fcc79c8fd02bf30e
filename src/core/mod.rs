//! 核心基础层模块
//!
//! 提供宿主事件总线与调度能力适配器

pub mod event_bus;
pub mod scheduling;

// 重新导出核心组件
pub use event_bus::*;
pub use scheduling::*;
