//! 模块生命周期管理器
//!
//! 负责模块的加载、启用、禁用、卸载和重载。所有操作接收有序批次，快速失败：
//! 第一个非成功结果终止批次，之前已提交的变更保留，不做回滚。
//!
//! 管理器运行在宿主的单一控制线程上，所有方法接收 `&mut self`，内部不加锁。

use super::core::LoadedModule;
use super::host::{InstantiateError, ModuleHost};
use super::loader::DescriptorLoader;
use super::metadata::ModuleDescriptor;
use super::reclaimer;
use super::registry::{CommandRegistration, CommandRegistry};
use super::results::{BatchResults, ModuleResult, UnloadResults};
use super::table::ModuleTable;
use crate::config::ManagerConfig;
use crate::core::event_bus::{EventStage, ModuleEvent, ModuleEventKind};
use crate::core::scheduling::SchedulerAdapter;
use crate::types::{ModuleId, ModuleState, Outcome};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// 模块管理器
pub struct ModuleManager<H: ModuleHost> {
    /// 宿主原语
    host: H,
    /// 已加载模块
    table: ModuleTable,
    /// 命令注册表
    commands: CommandRegistry,
    /// 描述文件加载器
    loader: DescriptorLoader,
    /// 启动时绑定一次
    scheduler: Option<SchedulerAdapter>,
    config: ManagerConfig,
}

impl<H: ModuleHost> ModuleManager<H> {
    pub fn new(host: H, config: ManagerConfig) -> Self {
        Self {
            host,
            table: ModuleTable::new(),
            commands: CommandRegistry::default(),
            loader: DescriptorLoader::from_config(&config),
            scheduler: None,
            config,
        }
    }

    /// 替换命令注册表（例如接入宿主自己的派发索引）
    pub fn with_commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_loader(mut self, loader: DescriptorLoader) -> Self {
        self.loader = loader;
        self
    }

    /// 根据宿主能力绑定调度适配器，已绑定时返回现有适配器
    pub fn bind_scheduler(&mut self, runtime: Handle) -> &SchedulerAdapter {
        let region_capable = self.host.supports_region_scheduling();
        self.scheduler
            .get_or_insert_with(|| SchedulerAdapter::select(region_capable, runtime))
    }

    pub fn scheduler(&self) -> Option<&SchedulerAdapter> {
        self.scheduler.as_ref()
    }

    // ---------------------------------------------------------------------
    // 加载
    // ---------------------------------------------------------------------

    /// 加载一批模块描述
    ///
    /// 先全部实例化并放入模块表，再逐个调用初始化钩子，这样初始化时可以看到同批次的兄弟模块。
    /// 宿主自行管理实例化时跳过第二阶段。
    pub fn load<I>(&mut self, descriptors: I) -> BatchResults
    where
        I: IntoIterator<Item = ModuleDescriptor>,
    {
        match self.instantiate_all(descriptors) {
            Ok((pending, results)) => self.initialize_all(pending, results),
            Err(halted) => halted,
        }
    }

    /// 从模块包路径加载
    ///
    /// 全部路径先解析成描述；不存在的路径以文件名作为结果键。
    pub fn load_files<I, P>(&mut self, paths: I) -> BatchResults
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut descriptors = Vec::new();
        for path in paths {
            let path = path.as_ref();
            match self.loader.load_description(path) {
                Ok(Some(descriptor)) => descriptors.push(descriptor),
                Ok(None) => {
                    warn!("Module package {} does not exist", path.display());
                    return BatchResults::new().halt(ModuleResult::new(file_label(path), Outcome::NotExists));
                }
                Err(e) => {
                    warn!("Invalid module description in {}: {}", path.display(), e);
                    return BatchResults::new().halt(
                        ModuleResult::new(file_label(path), Outcome::InvalidDescription)
                            .with_detail("reason", e.to_string()),
                    );
                }
            }
        }
        self.load(descriptors)
    }

    /// 按文件名从模块目录加载
    pub fn load_file_named(&mut self, name: &str) -> BatchResults {
        let path = self.config.modules_dir.join(name);
        self.load_files([path])
    }

    fn instantiate_all<I>(&mut self, descriptors: I) -> Result<(Vec<ModuleId>, BatchResults), BatchResults>
    where
        I: IntoIterator<Item = ModuleDescriptor>,
    {
        let managed = self.host.manages_instantiation();
        let mut results = BatchResults::new();
        let mut pending = Vec::new();

        for descriptor in descriptors {
            let descriptor = Arc::new(descriptor);
            let id = descriptor.id.clone();

            let host = &mut self.host;
            let table = &self.table;
            let module = match catch_unwind(AssertUnwindSafe(|| host.instantiate(Arc::clone(&descriptor), table))) {
                Ok(Ok(module)) => module,
                Ok(Err(e)) => return Err(results.halt(instantiate_failure(&id, e))),
                Err(_) => {
                    error!("{} panicked during instantiation", id);
                    return Err(results.halt(ModuleResult::new(id, Outcome::Error)));
                }
            };

            if let Err(rejected) = self.table.insert(module) {
                warn!("{} is already loaded", rejected.id());
                return Err(results.halt(ModuleResult::new(id, Outcome::AlreadyEnabled)));
            }

            if managed {
                self.fire(ModuleEventKind::Load, EventStage::Post, &id);
                info!("Loaded {} {}", id, descriptor.version());
                results.push(ModuleResult::success(id));
            } else {
                self.fire(ModuleEventKind::Load, EventStage::Pre, &id);
                pending.push(id);
            }
        }

        Ok((pending, results))
    }

    fn initialize_all(&mut self, pending: Vec<ModuleId>, mut results: BatchResults) -> BatchResults {
        for id in pending {
            let initialized = self.table.with_peers(&id, |module, peers| {
                catch_unwind(AssertUnwindSafe(|| module.instance_mut().on_load(peers)))
            });

            match initialized {
                Some(Ok(Ok(()))) => {
                    self.fire(ModuleEventKind::Load, EventStage::Post, &id);
                    info!("Loaded {}", id);
                    results.push(ModuleResult::success(id));
                }
                Some(Ok(Err(e))) => {
                    error!("Error occurred while initializing {}: {:?}", id, e);
                    self.mark_error(&id);
                    return results.halt(ModuleResult::new(id, Outcome::Error));
                }
                Some(Err(_)) => {
                    error!("{} panicked while initializing", id);
                    self.mark_error(&id);
                    return results.halt(ModuleResult::new(id, Outcome::Error));
                }
                None => {
                    error!("{} disappeared from the module table before initialization", id);
                    return results.halt(ModuleResult::new(id, Outcome::Error));
                }
            }
        }
        results
    }

    // ---------------------------------------------------------------------
    // 启用 / 禁用
    // ---------------------------------------------------------------------

    /// 启用一批模块，批次结束后同步一次命令索引
    pub fn enable<I, S>(&mut self, ids: I) -> BatchResults
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = BatchResults::new();
        for id in ids {
            let result = self.enable_one(id.as_ref());
            let halted = !result.is_success();
            results.push(result);
            if halted {
                break;
            }
        }

        self.commands.resync(&BTreeSet::new());
        results
    }

    fn enable_one(&mut self, id: &str) -> ModuleResult {
        let Some(module) = self.table.get(id) else {
            warn!("Cannot enable {}: not loaded", id);
            return ModuleResult::new(id, Outcome::NotExists);
        };
        if module.state() == ModuleState::Error {
            error!("Cannot enable {}: module is in error state", id);
            return ModuleResult::new(id, Outcome::Error);
        }
        if self.host.is_enabled(module) {
            warn!("{} is already enabled", id);
            return ModuleResult::new(id, Outcome::AlreadyEnabled);
        }

        self.fire(ModuleEventKind::Enable, EventStage::Pre, id);

        let enabled = match self.table.get_mut(id) {
            Some(module) => {
                let host = &mut self.host;
                let commands = &mut self.commands;
                let call = catch_unwind(AssertUnwindSafe(|| host.enable(module, commands)));
                if call.is_err() {
                    error!("Host panicked while enabling {}", id);
                }
                let enabled = call.is_ok() && self.host.is_enabled(module);
                if enabled {
                    module.set_state(ModuleState::Enabled);
                }
                enabled
            }
            None => false,
        };

        if !enabled {
            error!("{} did not enable", id);
            self.mark_error(id);
            return ModuleResult::new(id, Outcome::Error);
        }

        self.fire(ModuleEventKind::Enable, EventStage::Post, id);
        info!("Enabled {}", id);
        ModuleResult::success(id)
    }

    /// 禁用一批模块
    ///
    /// 批次结束后（包括提前终止时）同步一次命令索引，只带上已完成模块移除的名称。
    pub fn disable<I, S>(&mut self, ids: I) -> BatchResults
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = BatchResults::new();
        let mut removed = BTreeSet::new();
        let mut completed = true;

        for id in ids {
            let result = self.disable_one(id.as_ref(), &mut removed);
            let halted = !result.is_success();
            results.push(result);
            if halted {
                completed = false;
                break;
            }
        }

        if completed || !removed.is_empty() {
            self.commands.resync(&removed);
        }
        results
    }

    fn disable_one(&mut self, id: &str, removed: &mut BTreeSet<String>) -> ModuleResult {
        let Some(module) = self.table.get(id) else {
            warn!("Cannot disable {}: not loaded", id);
            return ModuleResult::new(id, Outcome::NotExists);
        };
        if !self.host.is_enabled(module) {
            warn!("{} is already disabled", id);
            return ModuleResult::new(id, Outcome::AlreadyDisabled);
        }

        self.fire(ModuleEventKind::Disable, EventStage::Pre, id);

        // 宿主禁用时可能清理归属信息，必须先取快照
        let snapshot = self.commands.registrations_owned_by(id);

        let call = match self.table.get_mut(id) {
            Some(module) => {
                let host = &mut self.host;
                let commands = &mut self.commands;
                catch_unwind(AssertUnwindSafe(|| host.disable(module, commands)))
            }
            None => return ModuleResult::new(id, Outcome::NotExists),
        };
        match call {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Error occurred while disabling {}: {:?}", id, e);
                self.mark_error(id);
                return ModuleResult::new(id, Outcome::Error);
            }
            Err(_) => {
                error!("Host panicked while disabling {}", id);
                self.mark_error(id);
                return ModuleResult::new(id, Outcome::Error);
            }
        }

        let recipes = self.host.release_recipes(id);
        let dropped = self.commands.unregister(&snapshot);
        debug!("Disabled {}: released {} recipes, removed {} command labels", id, recipes, dropped.len());
        removed.extend(dropped);

        if let Some(module) = self.table.get_mut(id) {
            module.set_state(ModuleState::Disabled);
        }
        self.fire(ModuleEventKind::Disable, EventStage::Post, id);
        info!("Disabled {}", id);
        ModuleResult::success(id)
    }

    // ---------------------------------------------------------------------
    // 卸载 / 重载
    // ---------------------------------------------------------------------

    /// 卸载一批模块
    ///
    /// 返回的结果中带有各模块待关闭的资源，由调用方在返回后关闭。
    pub fn unload<I, S>(&mut self, ids: I) -> UnloadResults
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = UnloadResults::new();
        let mut removed = BTreeSet::new();

        for id in ids {
            let id = id.as_ref();
            let Some(module) = self.table.get(id) else {
                warn!("Cannot unload {}: not loaded", id);
                results = results.halt(ModuleResult::new(id, Outcome::NotExists));
                break;
            };
            if self.host.is_enabled(module) {
                warn!("Unloading {} while it is still enabled", id);
            }

            self.fire(ModuleEventKind::Unload, EventStage::Pre, id);

            let recipes = self.host.release_recipes(id);
            let snapshot = self.commands.registrations_owned_by(id);
            let dropped = self.commands.unregister(&snapshot);
            debug!("Unloading {}: released {} recipes, removed {} command labels", id, recipes, dropped.len());
            removed.extend(dropped);

            let table = &mut self.table;
            match catch_unwind(AssertUnwindSafe(|| reclaimer::reclaim(table, id))) {
                Ok(Some(reclaimed)) => {
                    self.fire(ModuleEventKind::Unload, EventStage::Post, id);
                    info!("Unloaded {}", id);
                    results.push(ModuleResult::success(id), reclaimed.closeables);
                }
                Ok(None) => {
                    results = results.halt(ModuleResult::new(id, Outcome::NotExists));
                    break;
                }
                Err(_) => {
                    error!("{} panicked while being detached", id);
                    results = results.halt(ModuleResult::new(id, Outcome::Error));
                    break;
                }
            }
        }

        if !removed.is_empty() {
            self.commands.resync(&removed);
        }
        results
    }

    /// 重载模块：禁用、卸载旧实例并关闭其资源、从原文件重新加载、启用
    ///
    /// 任一阶段失败即返回该阶段的结果；重新加载时文件已不存在返回 `FILE_CHANGED`。
    pub fn reload(&mut self, id: &str) -> ModuleResult {
        let disabled = self.disable([id]);
        if let Some(failure) = disabled.first_failure() {
            return failure.clone();
        }

        let Some(file) = self.module_file(id).map(Path::to_path_buf) else {
            return ModuleResult::new(id, Outcome::NotExists);
        };

        let mut unloaded = self.unload([id]);
        let failures = unloaded.close_all();
        if !failures.is_empty() {
            warn!("{} resources of {} failed to close during reload", failures.len(), id);
        }
        if let Some(failure) = unloaded.results().first_failure() {
            return failure.clone();
        }

        let loaded = self.load_files([&file]);
        let new_id = match loaded.first_failure() {
            Some(failure) if failure.outcome == Outcome::NotExists => {
                warn!("Module file of {} changed: {} is gone", id, file.display());
                return ModuleResult::new(id, Outcome::FileChanged);
            }
            Some(failure) => return failure.clone(),
            None => match loaded.last() {
                Some(result) => result.module_id.clone(),
                None => return ModuleResult::new(id, Outcome::Error),
            },
        };

        let enabled = self.enable([new_id.as_str()]);
        enabled
            .last()
            .cloned()
            .unwrap_or_else(|| ModuleResult::new(new_id, Outcome::Error))
    }

    // ---------------------------------------------------------------------
    // 查询
    // ---------------------------------------------------------------------

    /// 按加载顺序列出模块
    pub fn modules(&self) -> impl Iterator<Item = &LoadedModule> {
        self.table.iter()
    }

    /// 按ID或查找名取得模块
    pub fn module(&self, name: &str) -> Option<&LoadedModule> {
        self.table.lookup(name)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.table.get(id).is_some_and(|module| self.host.is_enabled(module))
    }

    /// 模块状态，未加载时为 `Unloaded`
    pub fn state(&self, id: &str) -> ModuleState {
        self.table.get(id).map_or(ModuleState::Unloaded, LoadedModule::state)
    }

    /// 模块的包文件
    pub fn module_file(&self, id: &str) -> Option<&Path> {
        self.table.get(id).map(LoadedModule::file)
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn command(&self, label: &str) -> Option<&CommandRegistration> {
        self.commands.lookup(label)
    }

    /// 按标签精确注销命令，有移除时同步一次
    pub fn unregister_command_labels<S: AsRef<str>>(&mut self, labels: &[S]) -> BTreeSet<String> {
        let removed = self.commands.unregister_labels(labels);
        if !removed.is_empty() {
            self.commands.resync(&removed);
        }
        removed
    }

    pub fn table(&self) -> &ModuleTable {
        &self.table
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn fire(&mut self, kind: ModuleEventKind, stage: EventStage, id: &str) {
        self.host.call_event(&ModuleEvent::new(kind, stage, id));
    }

    fn mark_error(&mut self, id: &str) {
        if let Some(module) = self.table.get_mut(id) {
            module.set_state(ModuleState::Error);
        }
    }
}

fn instantiate_failure(id: &str, e: InstantiateError) -> ModuleResult {
    let result = ModuleResult::new(id, e.outcome());
    match e {
        InstantiateError::UnknownDependency(dependency) => {
            warn!("Cannot load {}: unknown dependency {}", id, dependency);
            result.with_detail("dependency", dependency)
        }
        InstantiateError::Other(e) => {
            error!("Error occurred while instantiating {}: {:?}", id, e);
            result
        }
        e => {
            warn!("Cannot load {}: {}", id, e);
            result
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
