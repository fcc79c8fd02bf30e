//! 模块元数据
//!
//! 模块包内描述文件的结构与解析

use crate::{HotswapError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

/// 描述文件内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// 模块名称
    pub name: String,
    /// 版本字符串，不做格式要求
    #[serde(deserialize_with = "scalar_string")]
    pub version: String,
    /// 入口点，宿主据此创建实例
    pub main: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub authors: Vec<String>,
    /// 硬依赖，实例化时必须已存在
    #[serde(default, deserialize_with = "one_or_many")]
    pub depend: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub softdepend: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub loadbefore: Vec<String>,
    /// 辅助依赖库，非空时宿主为模块创建独立的库加载器
    #[serde(default, deserialize_with = "one_or_many")]
    pub libraries: Vec<String>,
    /// 声明的命令
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSpec>,
}

impl ModuleMetadata {
    /// 只含必填字段的元数据
    pub fn named(name: impl Into<String>, main: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            main: main.into(),
            description: None,
            authors: Vec::new(),
            depend: Vec::new(),
            softdepend: Vec::new(),
            loadbefore: Vec::new(),
            libraries: Vec::new(),
            commands: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.depend.push(dependency.into());
        self
    }

    pub fn with_command(mut self, name: impl Into<String>, spec: CommandSpec) -> Self {
        self.commands.insert(name.into(), spec);
        self
    }

    /// 校验名称：非空，仅允许字母数字、空格、下划线、点和连字符
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HotswapError::invalid_description("name is not defined"));
        }
        if let Some(c) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-')))
        {
            return Err(HotswapError::invalid_description(format!(
                "name '{}' contains invalid character '{}'",
                self.name, c
            )));
        }
        if self.main.trim().is_empty() {
            return Err(HotswapError::invalid_description(format!(
                "main is not defined for {}",
                self.name
            )));
        }
        Ok(())
    }
}

/// 命令声明
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub usage: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub permission: Option<String>,
}

impl CommandSpec {
    pub fn with_aliases<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            aliases: aliases.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// 描述文件中允许写成单个字符串或字符串列表的字段
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
        None => Vec::new(),
    })
}

/// `version: 1` 和 `version: 1.5` 同样按字符串处理
fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(value) => value,
        Scalar::Integer(value) => value.to_string(),
        Scalar::Float(value) => value.to_string(),
    })
}

/// 模块描述：解析后的元数据加上包文件位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// 规范ID，名称中的空格替换为下划线
    pub id: String,
    pub file: PathBuf,
    pub metadata: ModuleMetadata,
}

impl ModuleDescriptor {
    pub fn new(metadata: ModuleMetadata, file: impl Into<PathBuf>) -> Result<Self> {
        metadata.validate()?;
        Ok(Self {
            id: metadata.name.replace(' ', "_"),
            file: file.into(),
            metadata,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    /// 全部声明命令名及其别名
    pub fn command_labels(&self) -> impl Iterator<Item = &str> {
        self.metadata
            .commands
            .iter()
            .flat_map(|(name, spec)| std::iter::once(name.as_str()).chain(spec.aliases.iter().map(String::as_str)))
    }
}

/// 描述文件解析器
pub trait MetadataParser: Send + Sync {
    fn parse(&self, reader: &mut dyn Read) -> Result<ModuleMetadata>;
}

/// YAML描述文件解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlMetadataParser;

impl MetadataParser for YamlMetadataParser {
    fn parse(&self, reader: &mut dyn Read) -> Result<ModuleMetadata> {
        serde_yaml::from_reader(reader).map_err(|e| HotswapError::invalid_description(e.to_string()))
    }
}
