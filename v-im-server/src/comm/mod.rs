//! 公共基础设施：配置、日志、HTTP响应
//! Shared infrastructure: configuration, logging, HTTP responses.

pub mod config;
pub mod response;
pub mod tracing;

pub use config::{get_global_config_manager, init_global_config_manager, ConfigManager};
