//! 应用启动器 - 负责依赖注入和服务启动

use std::sync::Arc;

use anyhow::{Context, Result};
use puctee_core::PucteeAppConfig;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::application::coordinator::{FleetDeps, ShareFleetCoordinator};
use crate::config::LocationShareSettings;
use crate::domain::repository::{ChannelClient, PlanAccessValidator};
use crate::domain::service::coordinate_source::CoordinateSource;
use crate::infrastructure::location::feed_provider::FeedLocationProvider;
use crate::infrastructure::messaging::memory_channel::InMemoryChannelClient;
use crate::infrastructure::messaging::redis_channel::RedisChannelClient;
use crate::infrastructure::transport::access_validator::RestAccessValidator;

const DEFAULT_PG_MAX_CONNECTIONS: u32 = 10;

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub provider: Arc<FeedLocationProvider>,
    pub source: Arc<CoordinateSource>,
    pub channel: Arc<dyn ChannelClient>,
    pub coordinator: ShareFleetCoordinator,
}

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点：构建上下文后驻留，直到收到 ctrl-c
    pub async fn run(config: &'static PucteeAppConfig) -> Result<()> {
        let context = Self::create_context(config).await?;

        info!("location share coordinator running, press ctrl-c to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;

        info!("shutting down location share coordinator");
        context.coordinator.shutdown().await;
        Ok(())
    }

    /// 创建应用上下文
    pub async fn create_context(config: &PucteeAppConfig) -> Result<ApplicationContext> {
        let settings = Arc::new(LocationShareSettings::from_app_config(config));

        let channel = Self::build_channel(config, settings.clone()).await?;
        let validator = Self::build_validator(config)?;

        let provider = Arc::new(FeedLocationProvider::new());
        let source = Arc::new(CoordinateSource::new(provider.clone(), &settings)?);

        let coordinator = ShareFleetCoordinator::new(FleetDeps {
            source: source.clone(),
            channel: channel.clone(),
            validator,
            settings,
        });

        Ok(ApplicationContext {
            provider,
            source,
            channel,
            coordinator,
        })
    }

    /// 构建实时通道：redis + postgres 都配齐走生产实现，否则退回进程内通道
    async fn build_channel(
        config: &PucteeAppConfig,
        settings: Arc<LocationShareSettings>,
    ) -> Result<Arc<dyn ChannelClient>> {
        let (Some(redis_url), Some(postgres_url)) =
            (config.redis.url.as_deref(), config.postgres.url.as_deref())
        else {
            info!("redis/postgres not configured, using in-memory location channel");
            return Ok(Arc::new(InMemoryChannelClient::new()));
        };

        let client = redis::Client::open(redis_url).context("failed to open redis client")?;
        let pool = PgPoolOptions::new()
            .max_connections(
                config
                    .postgres
                    .max_connections
                    .unwrap_or(DEFAULT_PG_MAX_CONNECTIONS),
            )
            .connect(postgres_url)
            .await
            .context("failed to connect to postgres")?;

        info!("using redis + postgres location channel");
        Ok(Arc::new(RedisChannelClient::new(
            Arc::new(client),
            Arc::new(pool),
            settings,
        )))
    }

    fn build_validator(
        config: &PucteeAppConfig,
    ) -> Result<Option<Arc<dyn PlanAccessValidator>>> {
        match config.backend.base_url.as_deref() {
            Some(base_url) => {
                let validator = RestAccessValidator::new(base_url)
                    .map_err(|err| anyhow::anyhow!("failed to build access validator: {err}"))?;
                Ok(Some(Arc::new(validator)))
            }
            None => {
                info!("backend base_url not configured, skipping plan access validation");
                Ok(None)
            }
        }
    }
}
