//! 描述文件加载器
//!
//! 从模块包中读取描述文件：先找首选条目，找不到再找备用条目

use super::metadata::{MetadataParser, ModuleDescriptor, YamlMetadataParser};
use crate::config::ManagerConfig;
use crate::{HotswapError, Result};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 打开的模块包
pub trait PackageReader {
    /// 读取包内条目，不存在时返回 `None`
    fn entry(&mut self, name: &str) -> io::Result<Option<Box<dyn Read>>>;
}

/// 模块包格式
pub trait PackageFormat: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn PackageReader>>;
}

/// 展开的目录包：描述文件直接位于包目录下
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryFormat;

impl PackageFormat for DirectoryFormat {
    fn open(&self, path: &Path) -> io::Result<Box<dyn PackageReader>> {
        if !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a module package directory", path.display()),
            ));
        }
        Ok(Box::new(DirectoryPackage {
            root: path.to_path_buf(),
        }))
    }
}

/// 目录包读取器
#[derive(Debug)]
pub struct DirectoryPackage {
    root: PathBuf,
}

impl PackageReader for DirectoryPackage {
    fn entry(&mut self, name: &str) -> io::Result<Option<Box<dyn Read>>> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Box::new(BufReader::new(File::open(path)?))))
    }
}

/// 描述文件加载器
pub struct DescriptorLoader {
    primary: String,
    fallback: String,
    format: Box<dyn PackageFormat>,
    parser: Box<dyn MetadataParser>,
}

impl DescriptorLoader {
    pub fn new(primary: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.into(),
            format: Box::new(DirectoryFormat),
            parser: Box::new(YamlMetadataParser),
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.primary_descriptor.clone(), config.fallback_descriptor.clone())
    }

    pub fn with_format(mut self, format: Box<dyn PackageFormat>) -> Self {
        self.format = format;
        self
    }

    pub fn with_parser(mut self, parser: Box<dyn MetadataParser>) -> Self {
        self.parser = parser;
        self
    }

    /// 读取模块描述
    ///
    /// 文件不存在时返回 `Ok(None)`；包无法打开、两个条目都不存在或内容无法解析时
    /// 返回 [`HotswapError::InvalidDescription`]。
    pub fn load_description(&self, path: &Path) -> Result<Option<ModuleDescriptor>> {
        if !path.exists() {
            debug!("Module package {} does not exist", path.display());
            return Ok(None);
        }

        let mut package = self
            .format
            .open(path)
            .map_err(|e| HotswapError::invalid_description(format!("cannot open {}: {}", path.display(), e)))?;

        let metadata = {
            let mut entry = match self.open_entry(package.as_mut(), &self.primary)? {
                Some(entry) => entry,
                None => self.open_entry(package.as_mut(), &self.fallback)?.ok_or_else(|| {
                    HotswapError::invalid_description(format!(
                        "{} does not contain {}",
                        path.display(),
                        self.primary
                    ))
                })?,
            };
            self.parser.parse(entry.as_mut())?
        };

        let descriptor = ModuleDescriptor::new(metadata, path)?;
        debug!("Read description of {} from {}", descriptor.id, path.display());
        Ok(Some(descriptor))
    }

    fn open_entry(&self, package: &mut dyn PackageReader, name: &str) -> Result<Option<Box<dyn Read>>> {
        package
            .entry(name)
            .map_err(|e| HotswapError::invalid_description(format!("cannot read {}: {}", name, e)))
    }
}

impl Default for DescriptorLoader {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}
