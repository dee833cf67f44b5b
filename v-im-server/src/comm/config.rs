use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 配置错误类型 / Configuration error kinds.
#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error("配置文件不存在: {path}")]
    FileNotFound { path: String },
    #[error("配置项 '{key}' 不存在")]
    KeyNotFound { key: String },
    #[error("配置初始化失败: {message}")]
    InitializationError { message: String },
}

/// 配置数据源 / A configuration source.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File { path: String, required: bool },
    Env { prefix: String, separator: String },
}

/// 配置管理器：分层加载，后加入者优先生效
/// Layered configuration manager; later sources win.
pub struct ConfigManager {
    config: Config,
}

impl ConfigManager {
    /// 默认源：development.toml -> default.toml -> production.toml -> VIM_前缀环境变量
    /// Default sources, lowest priority first, env vars on top.
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    pub fn with_sources(extra: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let defaults = vec![
            ConfigSource::File { path: "config/development.toml".to_string(), required: false },
            ConfigSource::File { path: "config/default.toml".to_string(), required: false },
            ConfigSource::File { path: "config/production.toml".to_string(), required: false },
            ConfigSource::Env { prefix: "VIM".to_string(), separator: "_".to_string() },
        ];
        for source in defaults.into_iter().chain(extra) {
            match source {
                ConfigSource::File { path, required } => {
                    let exists = std::path::Path::new(&path).exists();
                    if !exists && required {
                        return Err(anyhow!("必需的配置文件不存在 / required config file missing: {}", path));
                    }
                    if exists {
                        builder = builder
                            .add_source(File::with_name(&path).format(FileFormat::Toml).required(false));
                    }
                }
                ConfigSource::Env { prefix, separator } => {
                    builder = builder.add_source(Environment::with_prefix(&prefix).separator(&separator));
                }
            }
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("配置初始化失败 / config init failed: {}", e))?;
        Ok(ConfigManager { config })
    }

    /// 读取配置项 / Typed lookup.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get::<T>(key)
            .map_err(|e| anyhow!("配置项 '{}' 读取失败 / config key failed: {}", key, e))
    }

    /// 读取配置项，缺省回退 / Typed lookup with a default.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.config.get::<T>(key).unwrap_or(default)
    }
}

/// 初始化全局配置管理器 / Install the global config manager.
pub fn init_global_config_manager(config_path: Option<&str>) -> Result<Arc<ConfigManager>> {
    let extra = match config_path {
        Some(path) => vec![ConfigSource::File { path: path.to_string(), required: true }],
        None => vec![],
    };
    let manager = Arc::new(ConfigManager::with_sources(extra)?);
    let mut guard = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|_| anyhow!("配置管理器锁中毒 / config manager lock poisoned"))?;
    *guard = Some(manager.clone());
    Ok(manager)
}

/// 获取全局配置管理器 / Fetch the global config manager.
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    let guard = GLOBAL_CONFIG_MANAGER
        .read()
        .map_err(|_| anyhow!("配置管理器锁中毒 / config manager lock poisoned"))?;
    guard
        .clone()
        .ok_or_else(|| anyhow!("全局配置管理器未初始化 / global config manager not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_falls_back() {
        let mgr = ConfigManager::with_sources(vec![]).expect("build");
        assert_eq!(mgr.get_or("no.such.key", 42_i64), 42);
        assert!(mgr.get::<String>("no.such.key").is_err());
    }
}
