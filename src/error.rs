//! hotswap 错误处理系统
//!
//! 基础设施层面的统一错误类型。单个模块的生命周期结果不走这里，见 [`crate::types::Outcome`]。

use thiserror::Error;

/// 框架统一错误类型
#[derive(Error, Debug)]
pub enum HotswapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid module description: {message}")]
    InvalidDescription { message: String },

    #[error("Module not found: {module_id}")]
    ModuleNotFound { module_id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },
}

impl HotswapError {
    /// 创建描述文件相关错误
    pub fn invalid_description(message: impl Into<String>) -> Self {
        Self::InvalidDescription {
            message: message.into(),
        }
    }

    /// 创建配置相关错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// 创建调度相关错误
    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// 是否为描述文件错误
    pub fn is_invalid_description(&self) -> bool {
        matches!(self, Self::InvalidDescription { .. })
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, HotswapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = HotswapError::invalid_description("Package does not contain module.yml");
        assert!(error.is_invalid_description());
        assert_eq!(
            error.to_string(),
            "Invalid module description: Package does not contain module.yml"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error = HotswapError::from(io_error);
        assert!(matches!(error, HotswapError::Io(_)));
        assert!(!error.is_invalid_description());
    }

    #[test]
    fn test_result_type() {
        let success: Result<i32> = Ok(42);
        let failure: Result<i32> = Err(HotswapError::config("modules_dir must not be empty"));

        assert!(success.is_ok());
        assert!(failure.is_err());
    }
}
