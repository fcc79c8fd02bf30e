//! 宿主事件总线
//!
//! 模块加载、启用、禁用、卸载前后的通知。监听器在宿主控制线程上同步执行，
//! 单个监听器失败或panic只会被记录，不影响其余监听器和生命周期操作本身。

use crate::types::{now_ns, ModuleId, TimestampNs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 生命周期事件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleEventKind {
    Load,
    Enable,
    Disable,
    Unload,
}

/// 事件阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStage {
    Pre,
    Post,
}

/// 模块生命周期事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEvent {
    pub kind: ModuleEventKind,
    pub stage: EventStage,
    pub module_id: ModuleId,
    pub timestamp: TimestampNs,
}

impl ModuleEvent {
    pub fn new(kind: ModuleEventKind, stage: EventStage, module_id: impl Into<ModuleId>) -> Self {
        Self {
            kind,
            stage,
            module_id: module_id.into(),
            timestamp: now_ns(),
        }
    }

    pub fn pre(kind: ModuleEventKind, module_id: impl Into<ModuleId>) -> Self {
        Self::new(kind, EventStage::Pre, module_id)
    }

    pub fn post(kind: ModuleEventKind, module_id: impl Into<ModuleId>) -> Self {
        Self::new(kind, EventStage::Post, module_id)
    }
}

impl fmt::Display for ModuleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?}({})", self.stage, self.kind, self.module_id)
    }
}

/// 事件监听器
pub trait EventListener: Send + Sync {
    /// 处理事件
    fn handle(&self, event: &ModuleEvent) -> anyhow::Result<()>;

    /// 监听器名称
    fn name(&self) -> &str;
}

/// 宿主事件总线
#[derive(Default)]
pub struct EventBus {
    /// 按事件种类注册的监听器
    handlers: HashMap<ModuleEventKind, Vec<Arc<dyn EventListener>>>,
    /// 接收全部事件的监听器
    catch_all: Vec<Arc<dyn EventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册某一种类事件的监听器
    pub fn register_handler(&mut self, kind: ModuleEventKind, handler: Arc<dyn EventListener>) {
        info!("Registered event handler {} for {:?} events", handler.name(), kind);
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// 注册接收全部事件的监听器
    pub fn register_catch_all(&mut self, handler: Arc<dyn EventListener>) {
        info!("Registered catch-all event handler {}", handler.name());
        self.catch_all.push(handler);
    }

    /// 发布事件，返回成功处理的监听器数量
    pub fn publish(&self, event: &ModuleEvent) -> usize {
        debug!("Publishing {}", event);

        let targeted = self.handlers.get(&event.kind).into_iter().flatten();
        let mut delivered = 0;
        for handler in targeted.chain(self.catch_all.iter()) {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Event handler {} failed on {}: {:?}", handler.name(), event, e),
                Err(_) => warn!("Event handler {} panicked on {}", handler.name(), event),
            }
        }
        delivered
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum::<usize>() + self.catch_all.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
