//! 宿主适配层
//!
//! 生命周期编排通过 [`ModuleHost`] 调用宿主原语：实例化、启用、禁用、配方释放和事件派发。
//! [`InProcessHost`] 是一个完整的进程内宿主，按描述文件中的 `main` 入口查找模块工厂。

use super::core::{Closeable, IsolationContext, LoadedModule, Module};
use super::metadata::ModuleDescriptor;
use super::registry::CommandRegistry;
use super::table::ModuleTable;
use crate::core::event_bus::{EventBus, ModuleEvent};
use crate::types::{ModuleId, ModuleState, Outcome};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 实例化失败原因
#[derive(Error, Debug)]
pub enum InstantiateError {
    #[error("invalid description: {0}")]
    InvalidDescription(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("module already initialized: {0}")]
    AlreadyInitialized(ModuleId),

    #[error("host produced no instance for {0}")]
    NoInstance(ModuleId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InstantiateError {
    /// 对应的结果码
    pub fn outcome(&self) -> Outcome {
        match self {
            InstantiateError::InvalidDescription(_) => Outcome::InvalidDescription,
            InstantiateError::UnknownDependency(_) => Outcome::UnknownDependency,
            InstantiateError::AlreadyInitialized(_) => Outcome::AlreadyEnabled,
            InstantiateError::NoInstance(_) => Outcome::InvalidPlugin,
            InstantiateError::Other(_) => Outcome::Error,
        }
    }
}

/// 宿主原语
pub trait ModuleHost {
    /// 宿主是否自行完成实例化（包括初始化钩子）
    fn manages_instantiation(&self) -> bool {
        false
    }

    /// 宿主是否支持按区域并行调度
    fn supports_region_scheduling(&self) -> bool {
        false
    }

    /// 创建隔离上下文和模块实例，不修改模块表
    fn instantiate(
        &mut self,
        descriptor: Arc<ModuleDescriptor>,
        table: &ModuleTable,
    ) -> Result<LoadedModule, InstantiateError>;

    /// 启用模块并注册其声明的命令。宿主可以静默拒绝。
    fn enable(&mut self, module: &mut LoadedModule, commands: &mut CommandRegistry);

    /// 禁用模块
    fn disable(&mut self, module: &mut LoadedModule, commands: &mut CommandRegistry) -> anyhow::Result<()>;

    fn is_enabled(&self, module: &LoadedModule) -> bool {
        module.state().is_enabled()
    }

    /// 释放模块注册的配方类条目，返回释放数量
    fn release_recipes(&mut self, _module_id: &str) -> usize {
        0
    }

    /// 派发生命周期事件
    fn call_event(&mut self, event: &ModuleEvent);
}

/// 模块工厂：返回 `Ok(None)` 表示入口存在但没有产生实例
pub type ModuleFactory =
    Box<dyn Fn(&ModuleDescriptor) -> anyhow::Result<Option<Box<dyn Module>>> + Send + Sync>;

/// 进程内上下文边界
struct InProcessBoundary {
    module_id: ModuleId,
    context_id: Uuid,
}

impl Closeable for InProcessBoundary {
    fn close(self: Box<Self>) -> std::io::Result<()> {
        debug!("Closed isolation boundary {} of {}", self.context_id, self.module_id);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("isolation boundary {}", self.context_id)
    }
}

/// 进程内辅助库加载器
struct LibraryLoader {
    module_id: ModuleId,
    libraries: Vec<String>,
}

impl Closeable for LibraryLoader {
    fn close(self: Box<Self>) -> std::io::Result<()> {
        debug!("Released {} libraries of {}", self.libraries.len(), self.module_id);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("library loader ({} libraries)", self.libraries.len())
    }
}

/// 进程内宿主
pub struct InProcessHost {
    factories: HashMap<String, ModuleFactory>,
    /// 各模块注册的配方键
    recipes: HashMap<ModuleId, Vec<String>>,
    events: EventBus,
    managed_instantiation: bool,
    region_scheduling: bool,
}

impl InProcessHost {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            recipes: HashMap::new(),
            events: EventBus::new(),
            managed_instantiation: false,
            region_scheduling: false,
        }
    }

    /// 注册 `main` 入口对应的工厂
    pub fn register_factory<F>(&mut self, main: impl Into<String>, factory: F)
    where
        F: Fn(&ModuleDescriptor) -> anyhow::Result<Option<Box<dyn Module>>> + Send + Sync + 'static,
    {
        let main = main.into();
        info!("Registered module factory for entry point {}", main);
        self.factories.insert(main, Box::new(factory));
    }

    pub fn with_managed_instantiation(mut self, managed: bool) -> Self {
        self.managed_instantiation = managed;
        self
    }

    pub fn with_region_scheduling(mut self, supported: bool) -> Self {
        self.region_scheduling = supported;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// 记录模块注册的配方
    pub fn add_recipe(&mut self, owner: &str, key: impl Into<String>) {
        self.recipes.entry(owner.to_string()).or_default().push(key.into());
    }

    pub fn recipes(&self, owner: &str) -> &[String] {
        self.recipes.get(owner).map(Vec::as_slice).unwrap_or_default()
    }

    fn create_context(descriptor: &ModuleDescriptor) -> IsolationContext {
        let mut context = IsolationContext::new(descriptor.id.clone()).with_symbols([descriptor.metadata.main.clone()]);
        let boundary = InProcessBoundary {
            module_id: descriptor.id.clone(),
            context_id: context.id(),
        };
        context = context.with_boundary(Box::new(boundary));

        if !descriptor.metadata.libraries.is_empty() {
            context = context.with_library_loader(Box::new(LibraryLoader {
                module_id: descriptor.id.clone(),
                libraries: descriptor.metadata.libraries.clone(),
            }));
        }
        context
    }
}

impl Default for InProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InProcessHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessHost")
            .field("factories", &self.factories.len())
            .field("events", &self.events)
            .field("managed_instantiation", &self.managed_instantiation)
            .field("region_scheduling", &self.region_scheduling)
            .finish()
    }
}

impl ModuleHost for InProcessHost {
    fn manages_instantiation(&self) -> bool {
        self.managed_instantiation
    }

    fn supports_region_scheduling(&self) -> bool {
        self.region_scheduling
    }

    fn instantiate(
        &mut self,
        descriptor: Arc<ModuleDescriptor>,
        table: &ModuleTable,
    ) -> Result<LoadedModule, InstantiateError> {
        if table.lookup(&descriptor.id).is_some() {
            return Err(InstantiateError::AlreadyInitialized(descriptor.id.clone()));
        }
        if let Some(dependency) = table.missing_dependency(&descriptor) {
            return Err(InstantiateError::UnknownDependency(dependency.to_string()));
        }

        let factory = self.factories.get(&descriptor.metadata.main).ok_or_else(|| {
            anyhow::anyhow!("cannot find entry point {} for {}", descriptor.metadata.main, descriptor.id)
        })?;
        let mut instance = factory(&descriptor)?.ok_or_else(|| InstantiateError::NoInstance(descriptor.id.clone()))?;

        if self.managed_instantiation {
            instance.on_load(&table.view())?;
        }

        let context = Self::create_context(&descriptor);
        debug!("Instantiated {} in context {}", descriptor.id, context.id());
        Ok(LoadedModule::new(descriptor, context, instance))
    }

    fn enable(&mut self, module: &mut LoadedModule, commands: &mut CommandRegistry) {
        if module.state().is_enabled() {
            return;
        }

        let id = module.id().to_string();
        match catch_unwind(AssertUnwindSafe(|| module.instance_mut().on_enable())) {
            Ok(Ok(())) => {
                let descriptor = Arc::clone(module.descriptor());
                for (name, spec) in &descriptor.metadata.commands {
                    let handler = module.instance().command_handler(name);
                    commands.register(&id, name, spec, handler);
                }
                module.set_state(ModuleState::Enabled);
            }
            Ok(Err(e)) => error!("Error occurred while enabling {}: {:?}", id, e),
            Err(_) => error!("{} panicked while enabling", id),
        }
    }

    fn disable(&mut self, module: &mut LoadedModule, commands: &mut CommandRegistry) -> anyhow::Result<()> {
        if !module.state().is_enabled() {
            return Ok(());
        }

        let id = module.id().to_string();
        match catch_unwind(AssertUnwindSafe(|| module.instance_mut().on_disable())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error occurred while disabling {}: {:?}", id, e),
            Err(_) => warn!("{} panicked while disabling", id),
        }

        let released = commands.release_handlers(&id);
        debug!("Released {} command handlers of {}", released, id);
        module.set_state(ModuleState::Disabled);
        Ok(())
    }

    fn release_recipes(&mut self, module_id: &str) -> usize {
        self.recipes.remove(module_id).map(|keys| keys.len()).unwrap_or(0)
    }

    fn call_event(&mut self, event: &ModuleEvent) {
        self.events.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::metadata::{CommandSpec, ModuleMetadata};
    use std::any::Any;

    #[derive(Default)]
    struct Sample {
        loaded: bool,
        fail_enable: bool,
    }

    impl Module for Sample {
        fn on_load(&mut self, _peers: &crate::plugins::core::ModuleView<'_>) -> anyhow::Result<()> {
            self.loaded = true;
            Ok(())
        }

        fn on_enable(&mut self) -> anyhow::Result<()> {
            if self.fail_enable {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn descriptor(metadata: ModuleMetadata) -> Arc<ModuleDescriptor> {
        let file = format!("modules/{}", metadata.name);
        Arc::new(ModuleDescriptor::new(metadata, file).unwrap())
    }

    fn host() -> InProcessHost {
        let mut host = InProcessHost::new();
        host.register_factory("sample.Main", |_| Ok(Some(Box::new(Sample::default()) as Box<dyn Module>)));
        host.register_factory("sample.Broken", |_| {
            Ok(Some(Box::new(Sample { fail_enable: true, ..Sample::default() }) as Box<dyn Module>))
        });
        host.register_factory("sample.Empty", |_| Ok(None));
        host
    }

    #[test]
    fn test_instantiate_failures() {
        let mut host = host();
        let table = ModuleTable::new();

        let missing = descriptor(ModuleMetadata::named("addon", "sample.Main").with_dependency("core"));
        let error = host.instantiate(missing, &table).unwrap_err();
        assert_eq!(error.outcome(), Outcome::UnknownDependency);
        assert_eq!(error.to_string(), "unknown dependency: core");

        let empty = descriptor(ModuleMetadata::named("empty", "sample.Empty"));
        assert_eq!(host.instantiate(empty, &table).unwrap_err().outcome(), Outcome::InvalidPlugin);

        let unknown = descriptor(ModuleMetadata::named("stray", "sample.Nowhere"));
        assert_eq!(host.instantiate(unknown, &table).unwrap_err().outcome(), Outcome::Error);
    }

    #[test]
    fn test_managed_instantiation_runs_init_hook() {
        let mut host = host().with_managed_instantiation(true);
        let table = ModuleTable::new();

        let module = host.instantiate(descriptor(ModuleMetadata::named("alpha", "sample.Main")), &table).unwrap();
        let sample = module.instance().as_any().downcast_ref::<Sample>().unwrap();
        assert!(sample.loaded);
        assert!(host.manages_instantiation());
    }

    #[test]
    fn test_enable_registers_commands_and_disable_releases_handlers() {
        let mut host = host();
        let mut commands = CommandRegistry::default();
        let metadata = ModuleMetadata::named("alpha", "sample.Main").with_command("home", CommandSpec::with_aliases(["h"]));
        let mut module = host.instantiate(descriptor(metadata), &ModuleTable::new()).unwrap();

        host.enable(&mut module, &mut commands);
        assert!(host.is_enabled(&module));
        assert_eq!(commands.lookup("h").unwrap().owner, "alpha");

        host.disable(&mut module, &mut commands).unwrap();
        assert_eq!(module.state(), ModuleState::Disabled);
        assert!(commands.lookup("home").is_some());
    }

    #[test]
    fn test_enable_refused_silently() {
        let mut host = host();
        let mut commands = CommandRegistry::default();
        let metadata = ModuleMetadata::named("broken", "sample.Broken").with_command("fix", CommandSpec::default());
        let mut module = host.instantiate(descriptor(metadata), &ModuleTable::new()).unwrap();

        host.enable(&mut module, &mut commands);

        assert!(!host.is_enabled(&module));
        assert!(commands.is_empty());
    }

    #[test]
    fn test_release_recipes() {
        let mut host = host();
        host.add_recipe("alpha", "alpha:golden_pick");
        host.add_recipe("alpha", "alpha:magic_wand");

        assert_eq!(host.recipes("alpha").len(), 2);
        assert_eq!(host.release_recipes("alpha"), 2);
        assert_eq!(host.release_recipes("alpha"), 0);
        assert!(host.recipes("alpha").is_empty());
    }
}
