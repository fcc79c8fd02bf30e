//! hotswap 配置管理系统
//!
//! 支持YAML或TOML配置文件，按扩展名选择格式

use crate::{HotswapError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 模块管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// 模块包所在目录
    pub modules_dir: PathBuf,
    /// 首选描述文件名
    pub primary_descriptor: String,
    /// 备用描述文件名
    pub fallback_descriptor: String,
    /// 一个调度刻度的毫秒数
    pub tick_millis: u64,
    /// 日志配置
    pub logging: LoggingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            modules_dir: PathBuf::from("modules"),
            primary_descriptor: "module.yml".to_string(),
            fallback_descriptor: "module-host.yml".to_string(),
            tick_millis: 50,
            logging: LoggingConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// 刻度数换算为时长
    pub fn ticks(&self, ticks: u64) -> Duration {
        Duration::from_millis(self.tick_millis.saturating_mul(ticks))
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 是否启用详细日志（输出target和线程信息）
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            verbose: false,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: ManagerConfig,
}

impl ConfigManager {
    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HotswapError::config(format!("Failed to read config file {:?}: {}", path, e)))?;

        let config = Self::parse(&content, ConfigFormat::from_path(path))?;
        let manager = Self { config };
        manager.validate()?;
        Ok(manager)
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::to_string(&self.config)?,
            ConfigFormat::Toml => toml::to_string_pretty(&self.config)
                .map_err(|e| HotswapError::config(format!("Failed to serialize config: {}", e)))?,
        };

        tokio::fs::write(path, content)
            .await
            .map_err(|e| HotswapError::config(format!("Failed to write config file {:?}: {}", path, e)))?;

        Ok(())
    }

    /// 获取配置
    pub fn get_config(&self) -> &ManagerConfig {
        &self.config
    }

    /// 获取可变配置
    pub fn get_config_mut(&mut self) -> &mut ManagerConfig {
        &mut self.config
    }

    /// 取出配置
    pub fn into_config(self) -> ManagerConfig {
        self.config
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.config.primary_descriptor.trim().is_empty() {
            return Err(HotswapError::config("primary_descriptor cannot be empty"));
        }

        if self.config.primary_descriptor == self.config.fallback_descriptor {
            return Err(HotswapError::config(
                "fallback_descriptor must differ from primary_descriptor",
            ));
        }

        if self.config.tick_millis == 0 {
            return Err(HotswapError::config("tick_millis must be positive"));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    fn parse(content: &str, format: ConfigFormat) -> Result<ManagerConfig> {
        let config = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
        };
        Ok(config)
    }
}
