//! Puctee Core 配置模块
//!
//! 该模块提供应用程序配置管理功能，包括：
//! - 配置文件加载和解析（TOML）
//! - 环境变量覆盖
//! - 各基础设施配置定义（Redis / PostgreSQL / 后端 API）
//! - 位置共享子系统的运行参数

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<PucteeAppConfig> = OnceLock::new();

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 环境变量优先）
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// Redis 连接配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisConfig {
    /// Redis 服务器地址
    #[serde(default)]
    pub url: Option<String>,
}

/// PostgreSQL 数据库配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PostgresConfig {
    /// 数据库连接 URL
    #[serde(default)]
    pub url: Option<String>,
    /// 最大连接数
    #[serde(default)]
    pub max_connections: Option<u32>,
}

/// 后端 REST API 配置（参加者校验用）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendConfig {
    /// 带版本号的基础 URL
    #[serde(default)]
    pub base_url: Option<String>,
}

/// 位置共享子系统运行参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationShareConfig {
    /// 计划开始前多少秒进入共享窗口
    pub lead_secs: u64,
    /// 协调器全量对账周期（秒）
    pub reconcile_tick_secs: u64,
    /// 上报节流：最小间隔（秒）
    pub min_publish_interval_secs: u64,
    /// 上报节流：最小移动距离（米）
    pub min_publish_distance_m: f64,
    /// 上报失败最大尝试次数
    pub publish_max_attempts: u32,
    /// 第 n 次失败后等待 n * backoff_step 秒
    pub publish_backoff_step_secs: f64,
    /// 一次性测位的默认等待上限（秒）
    pub one_shot_timeout_secs: u64,
    /// 一次性测位的默认精度要求（米）
    pub desired_accuracy_m: f64,
    /// 测位缓存视为新鲜的时长（秒）
    pub fix_cache_freshness_secs: u64,
    /// 实时通道名前缀（plan_location_<planId>）
    pub channel_prefix: String,
}

impl Default for LocationShareConfig {
    fn default() -> Self {
        Self {
            lead_secs: 15 * 60,
            reconcile_tick_secs: 60,
            min_publish_interval_secs: 10,
            min_publish_distance_m: 20.0,
            publish_max_attempts: 5,
            publish_backoff_step_secs: 1.5,
            one_shot_timeout_secs: 12,
            desired_accuracy_m: 100.0,
            fix_cache_freshness_secs: 5,
            channel_prefix: "plan_location".to_string(),
        }
    }
}

/// 应用配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PucteeAppConfig {
    pub logging: LoggingConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub backend: BackendConfig,
    pub location_share: LocationShareConfig,
}

impl PucteeAppConfig {
    /// 解析配置文件并应用环境变量覆盖
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: PucteeAppConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("PUCTEE_REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Ok(url) = env::var("PUCTEE_POSTGRES_URL") {
            self.postgres.url = Some(url);
        }
        if let Ok(url) = env::var("PUCTEE_BACKEND_URL") {
            self.backend.base_url = Some(url);
        }
    }
}

/// 加载应用配置
///
/// 查找顺序：`PUCTEE_CONFIG` 环境变量指定的文件 → `<dir>/config.toml`。
/// 找不到配置文件时回退到默认值（仅环境变量覆盖生效）。
pub fn load_config(config_dir: Option<&str>) -> &'static PucteeAppConfig {
    APP_CONFIG.get_or_init(|| {
        let candidate = env::var("PUCTEE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                Path::new(config_dir.unwrap_or("config")).join("config.toml")
            });

        if candidate.is_file() {
            match PucteeAppConfig::from_file(&candidate) {
                Ok(config) => return config,
                Err(err) => {
                    warn!(
                        path = %candidate.display(),
                        error = %err,
                        "Failed to load config file, falling back to defaults"
                    );
                }
            }
        }

        let mut config = PucteeAppConfig::default();
        config.apply_env_overrides();
        config
    })
}

/// 获取全局配置（未加载时使用默认值初始化）
pub fn app_config() -> &'static PucteeAppConfig {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_location_share_parameters() {
        let config = LocationShareConfig::default();
        assert_eq!(config.lead_secs, 900);
        assert_eq!(config.reconcile_tick_secs, 60);
        assert_eq!(config.min_publish_interval_secs, 10);
        assert_eq!(config.min_publish_distance_m, 20.0);
        assert_eq!(config.publish_max_attempts, 5);
        assert_eq!(config.one_shot_timeout_secs, 12);
    }

    #[test]
    fn parse_partial_config() {
        let raw = r#"
            [logging]
            level = "debug"

            [redis]
            url = "redis://127.0.0.1:6379/0"

            [location_share]
            lead_secs = 600
        "#;
        let config: PucteeAppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.redis.url.as_deref(), Some("redis://127.0.0.1:6379/0"));
        assert_eq!(config.location_share.lead_secs, 600);
        // 未指定的字段保持默认值
        assert_eq!(config.location_share.min_publish_distance_m, 20.0);
        assert!(config.postgres.url.is_none());
    }
}
