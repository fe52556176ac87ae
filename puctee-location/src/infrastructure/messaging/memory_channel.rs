//! 进程内通道实现
//!
//! 不依赖 redis / postgres 的 ChannelClient：upsert 落在内存表里，
//! 变更事件经每计划一个的 broadcast 扇出。本地联调和集成测试用。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use puctee_core::error::ChannelError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::domain::model::{ChangeEvent, LocationShare};
use crate::domain::repository::{ChannelClient, ChannelSubscription};

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Default)]
struct MemoryState {
    rows: HashMap<(i64, i64), LocationShare>,
    feeds: HashMap<i64, broadcast::Sender<ChangeEvent>>,
    next_id: i64,
}

#[derive(Default)]
pub struct InMemoryChannelClient {
    state: Mutex<MemoryState>,
}

impl InMemoryChannelClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn feed(&self, plan_id: i64) -> broadcast::Sender<ChangeEvent> {
        let mut state = self.state.lock().unwrap();
        state
            .feeds
            .entry(plan_id)
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// 删除一行并广播 delete 事件（模拟其他参加者退出共享）
    pub fn remove(&self, plan_id: i64, user_id: i64) {
        let (removed, feed) = {
            let mut state = self.state.lock().unwrap();
            let removed = state.rows.remove(&(plan_id, user_id));
            let feed = state.feeds.get(&plan_id).cloned();
            (removed, feed)
        };
        if let (Some(share), Some(feed)) = (removed, feed) {
            let _ = feed.send(ChangeEvent::Delete(share));
        }
    }
}

#[async_trait]
impl ChannelClient for InMemoryChannelClient {
    async fn subscribe(&self, plan_id: i64) -> Result<ChannelSubscription, ChannelError> {
        let mut feed = self.feed(plan_id).subscribe();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = feed.recv() => {
                        match event {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        Ok(ChannelSubscription::new(
            event_rx,
            Some(shutdown_tx),
            Some(pump),
        ))
    }

    async fn publish(&self, share: &LocationShare) -> Result<(), ChannelError> {
        let (event, feed) = {
            let mut state = self.state.lock().unwrap();
            let key = (share.plan_id, share.user_id);
            let existing = state.rows.get(&key).cloned();

            let mut stored = share.clone();
            stored.updated_at = Some(Utc::now());
            match &existing {
                Some(previous) => {
                    stored.id = previous.id;
                    stored.created_at = previous.created_at;
                }
                None => {
                    state.next_id += 1;
                    stored.id = Some(state.next_id);
                    stored.created_at = stored.updated_at;
                }
            }
            state.rows.insert(key, stored.clone());

            let event = if existing.is_some() {
                ChangeEvent::Update(stored)
            } else {
                ChangeEvent::Insert(stored)
            };
            (event, state.feeds.get(&share.plan_id).cloned())
        };

        if let Some(feed) = feed {
            let _ = feed.send(event);
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        plan_id: i64,
        excluding_user_id: i64,
    ) -> Result<Vec<LocationShare>, ChannelError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<LocationShare> = state
            .rows
            .values()
            .filter(|share| share.plan_id == plan_id && share.user_id != excluding_user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|share| share.updated_at);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(plan_id: i64, user_id: i64, latitude: f64) -> LocationShare {
        LocationShare {
            id: None,
            plan_id,
            user_id,
            display_name: format!("user-{user_id}"),
            profile_image_url: None,
            latitude,
            longitude: 139.0,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn publish_upserts_and_emits_insert_then_update() {
        let channel = InMemoryChannelClient::new();
        let mut sub = channel.subscribe(7).await.unwrap();

        channel.publish(&share(7, 1, 35.0)).await.unwrap();
        channel.publish(&share(7, 1, 35.5)).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert!(matches!(first, ChangeEvent::Insert(_)));
        let second = sub.recv().await.unwrap();
        match second {
            ChangeEvent::Update(updated) => {
                assert_eq!(updated.id, first.share().id);
                assert_eq!(updated.latitude, 35.5);
            }
            other => panic!("expected update, got {other:?}"),
        }

        // 同一键只剩一行
        let rows = channel.load_snapshot(7, 99).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_excludes_requested_user() {
        let channel = InMemoryChannelClient::new();
        channel.publish(&share(7, 1, 35.0)).await.unwrap();
        channel.publish(&share(7, 2, 36.0)).await.unwrap();

        let rows = channel.load_snapshot(7, 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 2);
    }

    #[tokio::test]
    async fn remove_emits_delete() {
        let channel = InMemoryChannelClient::new();
        channel.publish(&share(7, 2, 36.0)).await.unwrap();
        let mut sub = channel.subscribe(7).await.unwrap();

        channel.remove(7, 2);
        let event = sub.recv().await.unwrap();
        match event {
            ChangeEvent::Delete(deleted) => assert_eq!(deleted.user_id, 2),
            other => panic!("expected delete, got {other:?}"),
        }
        assert!(channel.load_snapshot(7, 99).await.unwrap().is_empty());
    }
}
