//! 模块系统核心特征定义
//!
//! 模块实例、隔离上下文以及已加载模块的表示

use super::metadata::ModuleDescriptor;
use super::registry::CommandHandler;
use crate::types::{ModuleId, ModuleState};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// 核心模块特征 - 所有模块实例必须实现
pub trait Module: Send {
    /// 初始化钩子。调用时同一批次中先实例化的兄弟模块已在 `peers` 中可见
    fn on_load(&mut self, _peers: &ModuleView<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// 启用钩子
    fn on_enable(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 禁用钩子
    fn on_disable(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// 声明命令对应的处理器
    fn command_handler(&self, _command: &str) -> Option<Arc<dyn CommandHandler>> {
        None
    }

    /// 卸载时调用：丢弃实例持有的指向隔离上下文的反向引用
    fn detach(&mut self) {}

    /// 类型擦除转换
    fn as_any(&self) -> &dyn Any;
}

/// 可关闭的子资源，由卸载调用方在调用返回后关闭
pub trait Closeable: Send {
    fn close(self: Box<Self>) -> std::io::Result<()>;

    /// 用于日志的简短描述
    fn describe(&self) -> String;
}

/// 隔离上下文 - 模块运行所在的执行/资源边界
pub struct IsolationContext {
    id: Uuid,
    module_id: ModuleId,
    /// 该边界内定义的符号，用于符号到模块的反向查找
    symbols: BTreeSet<String>,
    /// 辅助依赖加载器
    library_loader: Option<Box<dyn Closeable>>,
    /// 边界本身持有的资源句柄
    boundary: Option<Box<dyn Closeable>>,
}

impl IsolationContext {
    pub fn new(module_id: impl Into<ModuleId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_id: module_id.into(),
            symbols: BTreeSet::new(),
            library_loader: None,
            boundary: None,
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols.extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn with_library_loader(mut self, loader: Box<dyn Closeable>) -> Self {
        self.library_loader = Some(loader);
        self
    }

    pub fn with_boundary(mut self, boundary: Box<dyn Closeable>) -> Self {
        self.boundary = Some(boundary);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn symbols(&self) -> &BTreeSet<String> {
        &self.symbols
    }

    /// 拆解为待关闭资源：先辅助加载器，后边界本身
    pub fn into_closeables(self) -> Vec<Box<dyn Closeable>> {
        self.library_loader.into_iter().chain(self.boundary).collect()
    }
}

impl fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationContext")
            .field("id", &self.id)
            .field("module_id", &self.module_id)
            .field("symbols", &self.symbols)
            .field("library_loader", &self.library_loader.as_ref().map(|c| c.describe()))
            .field("boundary", &self.boundary.as_ref().map(|c| c.describe()))
            .finish()
    }
}

/// 已加载的模块
pub struct LoadedModule {
    descriptor: Arc<ModuleDescriptor>,
    context: Option<IsolationContext>,
    instance: Box<dyn Module>,
    state: ModuleState,
    loaded_at: Instant,
}

impl LoadedModule {
    pub fn new(
        descriptor: Arc<ModuleDescriptor>,
        context: IsolationContext,
        instance: Box<dyn Module>,
    ) -> Self {
        Self {
            descriptor,
            context: Some(context),
            instance,
            state: ModuleState::Loaded,
            loaded_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ModuleDescriptor> {
        &self.descriptor
    }

    pub fn file(&self) -> &Path {
        &self.descriptor.file
    }

    /// 卸载后为 `None`
    pub fn context(&self) -> Option<&IsolationContext> {
        self.context.as_ref()
    }

    pub(crate) fn take_context(&mut self) -> Option<IsolationContext> {
        self.context.take()
    }

    pub fn instance(&self) -> &dyn Module {
        self.instance.as_ref()
    }

    pub fn instance_mut(&mut self) -> &mut dyn Module {
        self.instance.as_mut()
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn set_state(&mut self, state: ModuleState) {
        self.state = state;
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("context", &self.context)
            .finish()
    }
}

/// 初始化期间对兄弟模块的只读视图
pub struct ModuleView<'a> {
    peers: Vec<&'a LoadedModule>,
}

impl<'a> ModuleView<'a> {
    pub(crate) fn new(peers: Vec<&'a LoadedModule>) -> Self {
        Self { peers }
    }

    pub fn get(&self, module_id: &str) -> Option<&'a LoadedModule> {
        self.peers.iter().copied().find(|m| m.id() == module_id)
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.get(module_id).is_some()
    }

    /// 按类型取得兄弟模块实例
    pub fn instance<T: Any>(&self, module_id: &str) -> Option<&'a T> {
        self.get(module_id)?.instance().as_any().downcast_ref::<T>()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.peers.iter().map(|m| m.id())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
