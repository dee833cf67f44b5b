use anyhow::Result;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

/// 初始化日志：级别与target开关取自配置，RUST_LOG优先生效
/// Init tracing: level and the target toggle come from `logging.*` config,
/// an explicit RUST_LOG wins over both.
pub fn init_tracing() -> Result<()> {
    let (level, with_target) = match crate::comm::config::get_global_config_manager() {
        Ok(mgr) => (
            mgr.get_or("logging.level", "info".to_string()),
            mgr.get_or("logging.with_target", false),
        ),
        Err(_) => ("info".to_string(), false),
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // log宏桥接到tracing，依赖库的日志同样进过滤器
    // bridge log-crate macros so dependency logs hit the same filter
    LogTracer::init().ok();
    fmt()
        .with_env_filter(filter)
        .with_target(with_target)
        .compact()
        .try_init()
        .ok();
    Ok(())
}
