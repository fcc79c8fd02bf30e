//! 宿主模块表
//!
//! 按加载顺序保存已加载模块，另有查找名索引和符号到模块的反向索引。

use super::core::{LoadedModule, ModuleView};
use super::metadata::ModuleDescriptor;
use crate::types::{normalized_lookup_name, ModuleId};
use std::collections::HashMap;
use tracing::debug;

/// 模块表
#[derive(Debug, Default)]
pub struct ModuleTable {
    /// 按加载顺序排列
    modules: Vec<LoadedModule>,
    /// 查找名（规范ID及其规范化形式）到模块ID
    lookup_names: HashMap<String, ModuleId>,
    /// 符号到定义它的模块
    symbol_owners: HashMap<String, ModuleId>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入模块，ID或其规范化查找名已被占用时原样退回
    pub fn insert(&mut self, module: LoadedModule) -> std::result::Result<(), LoadedModule> {
        if self.contains(module.id()) || self.lookup_names.contains_key(&normalized_lookup_name(module.id())) {
            return Err(module);
        }

        let id = module.id().to_string();
        self.lookup_names.insert(id.clone(), id.clone());
        self.lookup_names.insert(normalized_lookup_name(&id), id.clone());
        if let Some(context) = module.context() {
            for symbol in context.symbols() {
                self.symbol_owners.insert(symbol.clone(), id.clone());
            }
        }

        debug!("Module {} added to table at position {}", id, self.modules.len());
        self.modules.push(module);
        Ok(())
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.position(module_id).is_some()
    }

    pub fn get(&self, module_id: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.id() == module_id)
    }

    pub fn get_mut(&mut self, module_id: &str) -> Option<&mut LoadedModule> {
        self.modules.iter_mut().find(|m| m.id() == module_id)
    }

    /// 通过查找名解析模块，不区分大小写，空格等同下划线
    pub fn lookup(&self, name: &str) -> Option<&LoadedModule> {
        let id = self
            .lookup_names
            .get(name)
            .or_else(|| self.lookup_names.get(&normalized_lookup_name(name)))?;
        self.get(id)
    }

    pub fn has_lookup_name(&self, name: &str) -> bool {
        self.lookup_names.contains_key(name)
    }

    /// 符号所属模块
    pub fn owner_of_symbol(&self, symbol: &str) -> Option<&str> {
        self.symbol_owners.get(symbol).map(String::as_str)
    }

    /// 第一个未加载的硬依赖
    pub fn missing_dependency<'d>(&self, descriptor: &'d ModuleDescriptor) -> Option<&'d str> {
        descriptor
            .metadata
            .depend
            .iter()
            .map(String::as_str)
            .find(|dependency| self.lookup(dependency).is_none())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedModule> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 全部模块的只读视图
    pub fn view(&self) -> ModuleView<'_> {
        ModuleView::new(self.modules.iter().collect())
    }

    /// 以可变方式访问一个模块，同时提供其余模块的只读视图
    pub fn with_peers<R>(
        &mut self,
        module_id: &str,
        f: impl FnOnce(&mut LoadedModule, &ModuleView<'_>) -> R,
    ) -> Option<R> {
        let index = self.position(module_id)?;
        let (before, rest) = self.modules.split_at_mut(index);
        let (current, after) = rest.split_first_mut()?;
        let peers = ModuleView::new(before.iter().chain(after.iter()).collect());
        Some(f(current, &peers))
    }

    /// 从有序列表中移除
    pub(crate) fn remove_module(&mut self, module_id: &str) -> Option<LoadedModule> {
        let index = self.position(module_id)?;
        Some(self.modules.remove(index))
    }

    /// 移除指向该模块的全部查找名，返回移除数量
    pub(crate) fn remove_lookup_names(&mut self, module_id: &str) -> usize {
        let before = self.lookup_names.len();
        self.lookup_names.retain(|_, id| id != module_id);
        before - self.lookup_names.len()
    }

    /// 移除该模块定义的全部符号，返回移除数量
    pub(crate) fn remove_symbols(&mut self, module_id: &str) -> usize {
        let before = self.symbol_owners.len();
        self.symbol_owners.retain(|_, id| id != module_id);
        before - self.symbol_owners.len()
    }

    fn position(&self, module_id: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.id() == module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::core::{IsolationContext, Module};
    use crate::plugins::metadata::ModuleMetadata;
    use std::any::Any;
    use std::sync::Arc;

    struct Counter(u32);

    impl Module for Counter {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn module(name: &str, value: u32) -> LoadedModule {
        let descriptor = ModuleDescriptor::new(ModuleMetadata::named(name, "x.Main"), format!("modules/{}", name)).unwrap();
        let context = IsolationContext::new(descriptor.id.clone()).with_symbols([format!("{}::Main", descriptor.id)]);
        LoadedModule::new(Arc::new(descriptor), context, Box::new(Counter(value)))
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = ModuleTable::new();
        table.insert(module("World Edit", 1)).unwrap();

        assert!(table.contains("World_Edit"));
        assert!(table.lookup("world_edit").is_some());
        assert!(table.lookup("World Edit").is_some());
        assert_eq!(table.owner_of_symbol("World_Edit::Main"), Some("World_Edit"));
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut table = ModuleTable::new();
        table.insert(module("alpha", 1)).unwrap();
        let rejected = table.insert(module("alpha", 2)).unwrap_err();

        assert_eq!(rejected.id(), "alpha");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_case_variant_insert_is_rejected() {
        let mut table = ModuleTable::new();
        table.insert(module("Alpha", 1)).unwrap();
        let rejected = table.insert(module("alpha", 2)).unwrap_err();

        assert_eq!(rejected.id(), "alpha");
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("ALPHA").map(|m| m.id()), Some("Alpha"));
        assert_eq!(table.owner_of_symbol("Alpha::Main"), Some("Alpha"));
    }

    #[test]
    fn test_with_peers_excludes_current() {
        let mut table = ModuleTable::new();
        table.insert(module("alpha", 1)).unwrap();
        table.insert(module("beta", 2)).unwrap();
        table.insert(module("gamma", 3)).unwrap();

        let seen = table
            .with_peers("beta", |current, peers| {
                assert_eq!(current.id(), "beta");
                assert!(!peers.contains("beta"));
                peers.instance::<Counter>("gamma").map(|c| c.0)
            })
            .unwrap();

        assert_eq!(seen, Some(3));
        assert!(table.with_peers("delta", |_, _| ()).is_none());
    }

    #[test]
    fn test_missing_dependency() {
        let mut table = ModuleTable::new();
        table.insert(module("core", 1)).unwrap();

        let descriptor = ModuleDescriptor::new(
            ModuleMetadata::named("addon", "x.Main").with_dependency("Core").with_dependency("economy"),
            "modules/addon",
        )
        .unwrap();

        assert_eq!(table.missing_dependency(&descriptor), Some("economy"));
    }

    #[test]
    fn test_removal_severs_indexes() {
        let mut table = ModuleTable::new();
        table.insert(module("alpha", 1)).unwrap();

        assert!(table.remove_module("alpha").is_some());
        assert_eq!(table.remove_lookup_names("alpha"), 1);
        assert_eq!(table.remove_symbols("alpha"), 1);
        assert!(table.lookup("alpha").is_none());
        assert!(table.owner_of_symbol("alpha::Main").is_none());
    }
}
