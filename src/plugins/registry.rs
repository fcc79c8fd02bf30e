//! 命令注册表
//!
//! 标签到命令注册的映射，以及派发索引的同步。一个注册可以占用多个标签：
//! 命令名、别名和 `owner:name` 形式的后备标签。

use super::metadata::CommandSpec;
use crate::types::{ModuleId, RegistrationId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 命令处理器
pub trait CommandHandler: Send + Sync {
    /// 执行命令，返回是否处理成功
    fn execute(&self, sender: &str, label: &str, args: &[String]) -> anyhow::Result<bool>;
}

/// 一条命令注册
pub struct CommandRegistration {
    pub id: RegistrationId,
    pub name: String,
    pub aliases: Vec<String>,
    /// 所属模块
    pub owner: ModuleId,
    pub description: Option<String>,
    /// 执行绑定，模块禁用后被清除
    handler: Option<Arc<dyn CommandHandler>>,
}

impl CommandRegistration {
    pub fn handler(&self) -> Option<&Arc<dyn CommandHandler>> {
        self.handler.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.handler.is_some()
    }

    /// 后备标签
    pub fn fallback_label(&self) -> String {
        fallback_label(&self.owner, &self.name)
    }
}

impl fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("owner", &self.owner)
            .field("bound", &self.is_bound())
            .finish()
    }
}

fn fallback_label(owner: &str, name: &str) -> String {
    format!("{}:{}", owner.to_lowercase(), name.to_lowercase())
}

/// 派发索引，例如供补全使用的命令树
#[cfg_attr(test, mockall::automock)]
pub trait DispatcherIndex {
    /// 立即移除若干标签
    fn remove_entries(&mut self, labels: &[String]);

    /// 按当前已知标签重建索引，`removed` 中的名称必须不再出现
    fn sync(&mut self, known: &BTreeMap<String, RegistrationId>, removed: &BTreeSet<String>);
}

/// 默认派发索引
#[derive(Debug, Default)]
pub struct CommandTree {
    nodes: BTreeMap<String, RegistrationId>,
    syncs: usize,
}

impl CommandTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.nodes.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn sync_count(&self) -> usize {
        self.syncs
    }
}

impl DispatcherIndex for CommandTree {
    fn remove_entries(&mut self, labels: &[String]) {
        for label in labels {
            self.nodes.remove(label);
        }
    }

    fn sync(&mut self, known: &BTreeMap<String, RegistrationId>, removed: &BTreeSet<String>) {
        self.nodes = known
            .iter()
            .filter(|(label, _)| !removed.contains(*label))
            .map(|(label, id)| (label.clone(), *id))
            .collect();
        self.syncs += 1;
    }
}

/// 命令注册表
pub struct CommandRegistry {
    /// 标签到注册的映射
    known: BTreeMap<String, RegistrationId>,
    registrations: HashMap<RegistrationId, CommandRegistration>,
    next_id: u64,
    dispatcher: Box<dyn DispatcherIndex>,
    resyncs: usize,
}

impl CommandRegistry {
    pub fn new(dispatcher: Box<dyn DispatcherIndex>) -> Self {
        Self {
            known: BTreeMap::new(),
            registrations: HashMap::new(),
            next_id: 1,
            dispatcher,
            resyncs: 0,
        }
    }

    /// 注册命令
    ///
    /// 后备标签、命令名和别名都只在未被占用时绑定。一个标签都拿不到的注册
    /// 被拒绝，返回 `None`。
    pub fn register(
        &mut self,
        owner: &str,
        name: &str,
        spec: &CommandSpec,
        handler: Option<Arc<dyn CommandHandler>>,
    ) -> Option<RegistrationId> {
        let id = RegistrationId(self.next_id);

        let registration = CommandRegistration {
            id,
            name: name.to_lowercase(),
            aliases: spec.aliases.iter().map(|a| a.to_lowercase()).collect(),
            owner: owner.to_string(),
            description: spec.description.clone(),
            handler,
        };

        let labels: Vec<String> = std::iter::once(registration.fallback_label())
            .chain(std::iter::once(registration.name.clone()))
            .chain(registration.aliases.iter().cloned())
            .filter(|label| match self.known.get(label) {
                Some(existing) => {
                    debug!("Label '{}' already bound to {}, skipped for {}", label, existing, owner);
                    false
                }
                None => true,
            })
            .collect();
        if labels.is_empty() {
            warn!("Command '{}' of {} has no free label, not registered", registration.name, owner);
            return None;
        }

        self.next_id += 1;
        for label in labels {
            self.known.insert(label, id);
        }
        debug!("Registered command '{}' of {} as {}", registration.name, owner, id);
        self.registrations.insert(id, registration);
        Some(id)
    }

    /// 按标签查找
    pub fn lookup(&self, label: &str) -> Option<&CommandRegistration> {
        let id = self.known.get(&label.to_lowercase())?;
        self.registrations.get(id)
    }

    pub fn registration(&self, id: RegistrationId) -> Option<&CommandRegistration> {
        self.registrations.get(&id)
    }

    /// 全部已知标签
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.known.keys().map(String::as_str)
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.known.contains_key(&label.to_lowercase())
    }

    /// 某模块拥有的标签快照
    pub fn registrations_owned_by(&self, owner: &str) -> BTreeMap<String, RegistrationId> {
        self.known
            .iter()
            .filter(|(_, id)| self.registrations.get(id).is_some_and(|r| r.owner == owner))
            .map(|(label, id)| (label.clone(), *id))
            .collect()
    }

    /// 所有注册的所属模块
    pub fn owners(&self) -> BTreeSet<&str> {
        self.registrations.values().map(|r| r.owner.as_str()).collect()
    }

    /// 清除某模块全部注册的执行绑定，注册和标签保持不变
    pub fn release_handlers(&mut self, owner: &str) -> usize {
        let mut released = 0;
        for registration in self.registrations.values_mut().filter(|r| r.owner == owner) {
            if registration.handler.take().is_some() {
                released += 1;
            }
        }
        released
    }

    /// 注销快照中的注册
    ///
    /// 每个注册的执行绑定被清除，只移除仍然指向该注册本身的标签，
    /// 已被其他注册接管的别名保持不动。返回被移除的标签。
    pub fn unregister(&mut self, snapshot: &BTreeMap<String, RegistrationId>) -> BTreeSet<String> {
        let ids: BTreeSet<RegistrationId> = snapshot.values().copied().collect();
        for id in &ids {
            if let Some(mut registration) = self.registrations.remove(id) {
                registration.handler = None;
            }
        }

        let mut removed = BTreeSet::new();
        self.known.retain(|label, id| {
            if ids.contains(id) {
                removed.insert(label.clone());
                false
            } else {
                true
            }
        });

        self.remove_from_dispatcher(&removed);
        removed
    }

    /// 按标签精确注销，不再持有任何标签的注册随之删除
    pub fn unregister_labels<S: AsRef<str>>(&mut self, labels: &[S]) -> BTreeSet<String> {
        let mut removed = BTreeSet::new();
        for label in labels {
            let label = label.as_ref().to_lowercase();
            if self.known.remove(&label).is_some() {
                removed.insert(label);
            }
        }

        let live: BTreeSet<RegistrationId> = self.known.values().copied().collect();
        self.registrations.retain(|id, registration| {
            if live.contains(id) {
                return true;
            }
            registration.handler = None;
            false
        });

        self.remove_from_dispatcher(&removed);
        removed
    }

    /// 重新同步派发索引
    pub fn resync(&mut self, removed: &BTreeSet<String>) {
        self.dispatcher.sync(&self.known, removed);
        self.resyncs += 1;
        info!(
            "Command index resynced: {} labels, {} removed",
            self.known.len(),
            removed.len()
        );
    }

    pub fn resync_count(&self) -> usize {
        self.resyncs
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn remove_from_dispatcher(&mut self, removed: &BTreeSet<String>) {
        if removed.is_empty() {
            return;
        }
        let labels: Vec<String> = removed.iter().cloned().collect();
        self.dispatcher.remove_entries(&labels);
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(Box::new(CommandTree::new()))
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("labels", &self.known.len())
            .field("registrations", &self.registrations.len())
            .field("resyncs", &self.resyncs)
            .finish()
    }
}
