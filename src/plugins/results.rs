//! 批量操作结果

use super::core::Closeable;
use crate::types::{ModuleId, Outcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

/// 单个模块的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleResult {
    pub module_id: ModuleId,
    pub outcome: Outcome,
    /// 附加详情，例如缺失的依赖名
    pub details: BTreeMap<String, String>,
}

impl ModuleResult {
    pub fn new(module_id: impl Into<ModuleId>, outcome: Outcome) -> Self {
        Self {
            module_id: module_id.into(),
            outcome,
            details: BTreeMap::new(),
        }
    }

    pub fn success(module_id: impl Into<ModuleId>) -> Self {
        Self::new(module_id, Outcome::Success)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

impl fmt::Display for ModuleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.module_id, self.outcome)?;
        for (key, value) in &self.details {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// 批量操作结果，按处理顺序排列
///
/// 快速失败：第一个非成功结果总是最后一项。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResults {
    results: Vec<ModuleResult>,
}

impl BatchResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: ModuleResult) {
        self.results.push(result);
    }

    /// 记录导致批次终止的结果
    pub fn halt(mut self, result: ModuleResult) -> Self {
        self.results.push(result);
        self
    }

    pub fn get(&self, module_id: &str) -> Option<&ModuleResult> {
        self.results.iter().find(|r| r.module_id == module_id)
    }

    pub fn outcome_of(&self, module_id: &str) -> Option<Outcome> {
        self.get(module_id).map(|r| r.outcome)
    }

    pub fn last(&self) -> Option<&ModuleResult> {
        self.results.last()
    }

    pub fn first_failure(&self) -> Option<&ModuleResult> {
        self.results.iter().find(|r| !r.is_success())
    }

    /// 全部成功（空批次也算成功）
    pub fn is_success(&self) -> bool {
        self.first_failure().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl IntoIterator for BatchResults {
    type Item = ModuleResult;
    type IntoIter = std::vec::IntoIter<ModuleResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// 卸载结果：每模块结果加上待调用方关闭的资源
#[derive(Default)]
pub struct UnloadResults {
    results: BatchResults,
    closeables: Vec<(ModuleId, Vec<Box<dyn Closeable>>)>,
}

impl UnloadResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, result: ModuleResult, closeables: Vec<Box<dyn Closeable>>) {
        if !closeables.is_empty() {
            self.closeables.push((result.module_id.clone(), closeables));
        }
        self.results.push(result);
    }

    pub(crate) fn halt(mut self, result: ModuleResult) -> Self {
        self.results.push(result);
        self
    }

    pub fn results(&self) -> &BatchResults {
        &self.results
    }

    pub fn into_results(self) -> BatchResults {
        self.results
    }

    pub fn is_success(&self) -> bool {
        self.results.is_success()
    }

    /// 尚未关闭的资源数量
    pub fn pending_closeables(&self) -> usize {
        self.closeables.iter().map(|(_, c)| c.len()).sum()
    }

    /// 关闭全部资源，单个关闭失败不影响其余资源
    pub fn close_all(&mut self) -> Vec<(ModuleId, std::io::Error)> {
        let mut failures = Vec::new();
        for (module_id, closeables) in self.closeables.drain(..) {
            for closeable in closeables {
                let description = closeable.describe();
                match closeable.close() {
                    Ok(()) => info!("Closed {} of {}", description, module_id),
                    Err(e) => {
                        warn!("Failed to close {} of {}: {}", description, module_id, e);
                        failures.push((module_id.clone(), e));
                    }
                }
            }
        }
        failures
    }
}

impl fmt::Debug for UnloadResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnloadResults")
            .field("results", &self.results)
            .field("pending_closeables", &self.pending_closeables())
            .finish()
    }
}
