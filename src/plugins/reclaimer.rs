//! 资源回收
//!
//! 卸载时切断宿主对模块的全部引用：有序列表、查找名、符号索引以及实例对隔离上下文的反向引用。
//! 上下文持有的子资源不在这里关闭，而是交给调用方。

use super::core::{Closeable, LoadedModule};
use super::table::ModuleTable;
use crate::types::ModuleState;
use tracing::debug;

/// 回收结果
pub struct Reclaimed {
    /// 已脱离模块表的模块
    pub module: LoadedModule,
    /// 待关闭资源：先辅助加载器，后上下文边界
    pub closeables: Vec<Box<dyn Closeable>>,
}

/// 从模块表中回收模块，模块不存在时返回 `None`
pub fn reclaim(table: &mut ModuleTable, module_id: &str) -> Option<Reclaimed> {
    let mut module = table.remove_module(module_id)?;
    let lookup_names = table.remove_lookup_names(module_id);
    let symbols = table.remove_symbols(module_id);

    module.instance_mut().detach();
    let closeables = module
        .take_context()
        .map(|context| context.into_closeables())
        .unwrap_or_default();
    module.set_state(ModuleState::Unloaded);

    debug!(
        "Reclaimed {}: {} lookup names, {} symbols, {} closeables",
        module_id,
        lookup_names,
        symbols,
        closeables.len()
    );

    Some(Reclaimed { module, closeables })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::core::{IsolationContext, Module};
    use crate::plugins::metadata::{ModuleDescriptor, ModuleMetadata};
    use parking_lot::Mutex;
    use std::any::Any;
    use std::sync::Arc;

    struct Handle(&'static str);

    impl Closeable for Handle {
        fn close(self: Box<Self>) -> std::io::Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            self.0.to_string()
        }
    }

    /// 持有指向上下文的引用，detach 时清空
    struct Attached {
        context_ref: Arc<Mutex<Option<String>>>,
    }

    impl Module for Attached {
        fn detach(&mut self) {
            *self.context_ref.lock() = None;
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_reclaim_severs_everything() {
        let context_ref = Arc::new(Mutex::new(Some("ctx".to_string())));
        let descriptor = Arc::new(ModuleDescriptor::new(ModuleMetadata::named("alpha", "a.Main"), "modules/alpha").unwrap());
        let context = IsolationContext::new("alpha")
            .with_symbols(["a.Main", "a.Util"])
            .with_library_loader(Box::new(Handle("libraries")))
            .with_boundary(Box::new(Handle("boundary")));
        let module = LoadedModule::new(descriptor, context, Box::new(Attached { context_ref: context_ref.clone() }));

        let mut table = ModuleTable::new();
        table.insert(module).unwrap();

        let reclaimed = reclaim(&mut table, "alpha").unwrap();

        assert!(table.is_empty());
        assert!(table.lookup("alpha").is_none());
        assert!(table.owner_of_symbol("a.Util").is_none());
        assert!(context_ref.lock().is_none());
        assert!(reclaimed.module.context().is_none());
        assert_eq!(reclaimed.module.state(), ModuleState::Unloaded);
        let order: Vec<String> = reclaimed.closeables.iter().map(|c| c.describe()).collect();
        assert_eq!(order, vec!["libraries", "boundary"]);
    }

    #[test]
    fn test_reclaim_unknown_module() {
        let mut table = ModuleTable::new();
        assert!(reclaim(&mut table, "ghost").is_none());
    }
}
