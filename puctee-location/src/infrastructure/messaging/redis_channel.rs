//! 生产通道实现：postgres 落库 + redis 发布订阅
//!
//! 写路径先在 `location_shares` 表上以 (plan_id, user_id) 为冲突键做
//! upsert，再把落库后的整行封装成变更事件发布到 `plan_location_<planId>`
//! 频道。读路径为每个订阅开一条专用的异步 pubsub 连接，事件泵把严格
//! 解码后的事件推给订阅方；解码失败的消息丢弃并记日志，流本身不中断。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use puctee_core::error::ChannelError;
use redis::AsyncCommands;
use sqlx::{FromRow, PgPool, Row};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::LocationShareSettings;
use crate::domain::model::{ChangeEvent, LocationShare};
use crate::domain::repository::{ChannelClient, ChannelSubscription};

/// 订阅事件缓冲容量
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// 严格解码一条通道消息；不合模式的载荷丢弃并记日志，流不中断
fn decode_change_event(channel: &str, payload: &str) -> Option<ChangeEvent> {
    match serde_json::from_str::<ChangeEvent>(payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(%channel, error = %err, "dropping malformed change event payload");
            None
        }
    }
}

#[derive(Debug, FromRow)]
struct LocationShareRow {
    id: i64,
    plan_id: i64,
    user_id: i64,
    display_name: String,
    profile_image_url: Option<String>,
    latitude: f64,
    longitude: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<LocationShareRow> for LocationShare {
    fn from(row: LocationShareRow) -> Self {
        LocationShare {
            id: Some(row.id),
            plan_id: row.plan_id,
            user_id: row.user_id,
            display_name: row.display_name,
            profile_image_url: row.profile_image_url,
            latitude: row.latitude,
            longitude: row.longitude,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        }
    }
}

pub struct RedisChannelClient {
    client: Arc<redis::Client>,
    pool: Arc<PgPool>,
    settings: Arc<LocationShareSettings>,
}

impl RedisChannelClient {
    pub fn new(
        client: Arc<redis::Client>,
        pool: Arc<PgPool>,
        settings: Arc<LocationShareSettings>,
    ) -> Self {
        Self {
            client,
            pool,
            settings,
        }
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager, ChannelError> {
        redis::aio::ConnectionManager::new(self.client.as_ref().clone())
            .await
            .map_err(|err| ChannelError::Network(err.to_string()))
    }
}

#[async_trait]
impl ChannelClient for RedisChannelClient {
    async fn subscribe(&self, plan_id: i64) -> Result<ChannelSubscription, ChannelError> {
        let channel = self.settings.channel_name(plan_id);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| ChannelError::Network(err.to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|err| ChannelError::Network(err.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let pump = tokio::spawn(async move {
            {
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        message = stream.next() => {
                            let Some(message) = message else { break };
                            let payload: String = match message.get_payload() {
                                Ok(payload) => payload,
                                Err(err) => {
                                    warn!(%channel, error = %err, "failed to read pubsub payload, dropping");
                                    continue;
                                }
                            };
                            if let Some(event) = decode_change_event(&channel, &payload) {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            let _ = pubsub.unsubscribe(&channel).await;
            debug!(%channel, "pubsub pump stopped");
        });

        Ok(ChannelSubscription::new(
            event_rx,
            Some(shutdown_tx),
            Some(pump),
        ))
    }

    async fn publish(&self, share: &LocationShare) -> Result<(), ChannelError> {
        // xmax = 0 表示这条是新插入的行（而非冲突覆盖）
        let row = sqlx::query(
            r#"
            INSERT INTO location_shares (
                plan_id,
                user_id,
                display_name,
                profile_image_url,
                latitude,
                longitude,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (plan_id, user_id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                profile_image_url = EXCLUDED.profile_image_url,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                updated_at = NOW()
            RETURNING
                id,
                plan_id,
                user_id,
                display_name,
                profile_image_url,
                latitude,
                longitude,
                created_at,
                updated_at,
                (xmax = 0) AS inserted
            "#,
        )
        .bind(share.plan_id)
        .bind(share.user_id)
        .bind(&share.display_name)
        .bind(&share.profile_image_url)
        .bind(share.latitude)
        .bind(share.longitude)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|err| ChannelError::Database(err.to_string()))?;

        let inserted: bool = row
            .try_get("inserted")
            .map_err(|err| ChannelError::Database(err.to_string()))?;
        let stored = LocationShareRow::from_row(&row)
            .map_err(|err| ChannelError::Database(err.to_string()))?;
        let stored = LocationShare::from(stored);

        let event = if inserted {
            ChangeEvent::Insert(stored)
        } else {
            ChangeEvent::Update(stored)
        };
        let payload =
            serde_json::to_string(&event).map_err(|err| ChannelError::Decode(err.to_string()))?;

        let channel = self.settings.channel_name(share.plan_id);
        let mut conn = self.connection().await?;
        let _: () = conn
            .publish(&channel, payload)
            .await
            .map_err(|err| ChannelError::Network(err.to_string()))?;

        Ok(())
    }

    async fn load_snapshot(
        &self,
        plan_id: i64,
        excluding_user_id: i64,
    ) -> Result<Vec<LocationShare>, ChannelError> {
        let rows = sqlx::query_as::<_, LocationShareRow>(
            r#"
            SELECT
                id,
                plan_id,
                user_id,
                display_name,
                profile_image_url,
                latitude,
                longitude,
                created_at,
                updated_at
            FROM location_shares
            WHERE plan_id = $1
              AND user_id <> $2
            ORDER BY updated_at ASC
            "#,
        )
        .bind(plan_id)
        .bind(excluding_user_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|err| ChannelError::Database(err.to_string()))?;

        Ok(rows.into_iter().map(LocationShare::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_payload() -> String {
        serde_json::to_string(&ChangeEvent::Update(LocationShare {
            id: Some(7),
            plan_id: 3,
            user_id: 22,
            display_name: "friend".to_string(),
            profile_image_url: None,
            latitude: 35.6,
            longitude: 139.7,
            created_at: None,
            updated_at: None,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_breaking_the_stream() {
        let payloads = vec![
            "{not json".to_string(),
            // 合法 JSON 但不符合事件模式
            r#"{"event":"noise","record":{}}"#.to_string(),
            valid_payload(),
        ];

        // 和订阅泵一致的处理：解码失败丢弃，成功的照常转发
        let (event_tx, mut event_rx) = mpsc::channel(8);
        for payload in &payloads {
            if let Some(event) = decode_change_event("plan_location_3", payload) {
                event_tx.send(event).await.unwrap();
            }
        }
        drop(event_tx);

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.share().user_id, 22);
        // 坏载荷之后只剩这一条
        assert!(event_rx.recv().await.is_none());
    }
}
