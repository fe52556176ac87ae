//! 日志初始化模块
//!
//! 为各个服务二进制提供统一的 tracing 初始化入口。

use tracing_subscriber::{EnvFilter, fmt};

/// 从配置初始化日志系统
///
/// 优先使用环境变量 RUST_LOG，如果没有则使用配置文件的日志级别。
/// 重复初始化是安全的（第二次调用静默失败）。
pub fn init_tracing_from_config(logging_config: Option<&crate::config::LoggingConfig>) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level_str = logging_config.map(|c| c.level.as_str()).unwrap_or("info");
            EnvFilter::new(level_str)
        }
    };

    let default_config = crate::config::LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let _ = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter)
        .try_init();
}
