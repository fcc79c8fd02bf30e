//! hotswap 核心数据类型
//!
//! 标识符、生命周期状态以及单模块操作结果码

use serde::{Deserialize, Serialize};
use std::fmt;

/// 纳秒时间戳
pub type TimestampNs = i64;

/// 模块ID，在已加载模块中唯一
pub type ModuleId = String;

/// 命令注册ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 模块生命周期状态
///
/// `Unloaded → Loaded → Enabled ⇄ Disabled → Unloaded`，任何转换失败都会进入 `Error`。
/// 处于 `Error` 的模块只能被卸载。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    Unloaded,
    Loaded,
    Enabled,
    Disabled,
    Error,
}

impl ModuleState {
    pub fn is_enabled(self) -> bool {
        self == ModuleState::Enabled
    }
}

/// 单个模块的操作结果码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    NotExists,
    AlreadyEnabled,
    AlreadyDisabled,
    NotEnabled,
    InvalidDescription,
    InvalidPlugin,
    /// 详情中携带 `dependency` 键
    UnknownDependency,
    FileChanged,
    Error,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    /// 稳定的结果码字符串，用于日志和对外展示
    pub fn code(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::NotExists => "NOT_EXISTS",
            Outcome::AlreadyEnabled => "ALREADY_ENABLED",
            Outcome::AlreadyDisabled => "ALREADY_DISABLED",
            Outcome::NotEnabled => "NOT_ENABLED",
            Outcome::InvalidDescription => "INVALID_DESCRIPTION",
            Outcome::InvalidPlugin => "INVALID_PLUGIN",
            Outcome::UnknownDependency => "UNKNOWN_DEPENDENCY",
            Outcome::FileChanged => "FILE_CHANGED",
            Outcome::Error => "ERROR",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 查找名规范化：空格替换为下划线并转小写
pub fn normalized_lookup_name(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}

/// 当前时间戳（纳秒）
pub fn now_ns() -> TimestampNs {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(Outcome::UnknownDependency.to_string(), "UNKNOWN_DEPENDENCY");
        assert!(Outcome::Success.is_success());
        assert!(!Outcome::FileChanged.is_success());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&Outcome::AlreadyDisabled).unwrap();
        assert_eq!(json, "\"ALREADY_DISABLED\"");
    }

    #[test]
    fn test_normalized_lookup_name() {
        assert_eq!(normalized_lookup_name("World Edit"), "world_edit");
        assert_eq!(normalized_lookup_name("Essentials"), "essentials");
    }
}
