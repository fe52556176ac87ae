//! Puctee Core 公共库
//!
//! 提供统一的配置加载、日志初始化和基础工具

pub mod config;
pub mod error;
pub mod tracing;
pub mod utils;

pub use config::{
    BackendConfig, LocationShareConfig, LoggingConfig, PostgresConfig, PucteeAppConfig,
    RedisConfig, app_config, load_config,
};
pub use error::{AccessError, ChannelError, CoordinateError};
pub use tracing::init_tracing_from_config;
pub use utils::geo;
