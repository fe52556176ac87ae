//! 计划级位置共享会话
//!
//! 每个处于共享窗口内的计划对应一个会话任务，独占自己的状态：
//! `Idle → Connecting → Active → Disconnecting → Idle`。
//!
//! 会话在 Active 阶段做两件事：
//! - 把舰队协调器转发来的持续坐标送入节流上报（10 秒 / 20 米双阈值，
//!   写入在途时只保留最新一条待发坐标）
//! - 把通道上的行级变更事件合并进本地参加者位置表（忽略本人回声）
//!
//! 上报失败走有界重试（最多 5 次，第 n 次失败后等 n * 1.5 秒），
//! 最终失败静默放弃，等下一拍自然更新兜底。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LocationShareSettings;
use crate::domain::model::{
    ChangeEvent, Coordinate, LocationShare, SessionPhase, SessionSnapshot, UserIdentity,
};
use crate::domain::repository::{ChannelClient, ChannelSubscription, PlanAccessValidator};

/// 会话外部依赖
#[derive(Clone)]
pub struct SessionDeps {
    pub channel: Arc<dyn ChannelClient>,
    /// 订阅前参加者校验（未配置时跳过）
    pub validator: Option<Arc<dyn PlanAccessValidator>>,
    pub settings: Arc<LocationShareSettings>,
}

enum SessionCommand {
    Stop { reason: String },
}

struct WriteOutcome {
    coordinate: Coordinate,
    success: bool,
}

/// 会话句柄（协调器持有）
pub struct ShareSessionHandle {
    plan_id: i64,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl ShareSessionHandle {
    pub fn plan_id(&self) -> i64 {
        self.plan_id
    }

    /// 会话状态的可观察句柄（UI 层订阅本地位置表）
    pub fn state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    /// 停止会话（尽力而为，从不失败）
    pub async fn stop(self, reason: &str) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::Stop {
                reason: reason.to_string(),
            })
            .await;
        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                warn!(plan_id = self.plan_id, error = %err, "share session task ended abnormally");
            }
        }
    }
}

/// 计划级会话任务
pub struct ShareSession {
    plan_id: i64,
    user: UserIdentity,
    deps: SessionDeps,
    coordinates: broadcast::Receiver<Coordinate>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<SessionSnapshot>,
    snapshot: SessionSnapshot,

    // 节流与写入合并状态
    last_sent: Option<(Coordinate, Instant)>,
    write_in_flight: bool,
    /// 写入在途时的待发坐标，至多一条，新的覆盖旧的
    pending_coordinate: Option<Coordinate>,
    write_task: Option<JoinHandle<()>>,
    write_done_tx: mpsc::Sender<WriteOutcome>,
    write_done_rx: mpsc::Receiver<WriteOutcome>,
}

impl ShareSession {
    /// 启动会话任务并返回句柄；连接过程在任务内进行，不阻塞调用方
    pub fn spawn(
        plan_id: i64,
        user: UserIdentity,
        coordinates: broadcast::Receiver<Coordinate>,
        deps: SessionDeps,
    ) -> ShareSessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());
        let (write_done_tx, write_done_rx) = mpsc::channel(8);

        let session = Self {
            plan_id,
            user,
            deps,
            coordinates,
            cmd_rx,
            state_tx,
            snapshot: SessionSnapshot::default(),
            last_sent: None,
            write_in_flight: false,
            pending_coordinate: None,
            write_task: None,
            write_done_tx,
            write_done_rx,
        };

        let task = tokio::spawn(session.run());

        ShareSessionHandle {
            plan_id,
            cmd_tx,
            state_rx,
            task,
        }
    }

    async fn run(mut self) {
        info!(plan_id = self.plan_id, user_id = self.user.user_id, "starting location share session");
        self.set_phase(SessionPhase::Connecting);

        if let Some(validator) = self.deps.validator.clone() {
            match validator.validate(self.plan_id, self.user.user_id).await {
                Ok(_) => {}
                Err(err) => {
                    warn!(plan_id = self.plan_id, error = %err, "location share access validation failed");
                    self.set_error(Some(format!("Access validation failed: {err}")));
                    self.set_phase(SessionPhase::Idle);
                    return;
                }
            }
        }

        let mut subscription = match self.deps.channel.subscribe(self.plan_id).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(plan_id = self.plan_id, error = %err, "failed to subscribe location channel");
                self.set_error(Some(format!("Failed to connect: {err}")));
                self.set_phase(SessionPhase::Idle);
                return;
            }
        };

        // 既存快照是最终一致性的优化，加载失败不阻止会话进入 Active
        match self
            .deps
            .channel
            .load_snapshot(self.plan_id, self.user.user_id)
            .await
        {
            Ok(existing) => {
                for share in existing {
                    self.snapshot.locations.insert(share.user_id, share);
                }
            }
            Err(err) => {
                debug!(plan_id = self.plan_id, error = %err, "failed to load existing locations");
                self.snapshot.error_message =
                    Some(format!("Failed to load existing locations: {err}"));
            }
        }

        self.snapshot.phase = SessionPhase::Active;
        self.snapshot.is_sharing = true;
        self.publish_snapshot();

        let mut channel_open = true;
        let reason = loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(SessionCommand::Stop { reason }) => break reason,
                        // 所有句柄都被丢弃，等同于停止
                        None => break "handle dropped".to_string(),
                    }
                }
                event = subscription.recv(), if channel_open => {
                    match event {
                        Some(event) => self.merge_change_event(event),
                        None => {
                            channel_open = false;
                            self.set_error(Some("Realtime channel closed".to_string()));
                        }
                    }
                }
                coordinate = self.coordinates.recv() => {
                    match coordinate {
                        Ok(coordinate) => self.publish_throttled(coordinate).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(plan_id = self.plan_id, skipped, "coordinate feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            // 协调器已停止持续追踪，事件合并继续工作
                            debug!(plan_id = self.plan_id, "coordinate feed closed");
                        }
                    }
                }
                Some(outcome) = self.write_done_rx.recv() => {
                    self.finish_write(outcome).await;
                }
            }
        };

        self.disconnect(subscription, &reason).await;
    }

    /// 节流上报：间隔與移动距离都低于阈值时跳过；写入在途时只记住最新
    async fn publish_throttled(&mut self, coordinate: Coordinate) {
        if let Some((last_coordinate, sent_at)) = self.last_sent {
            let elapsed = sent_at.elapsed();
            let moved_m = coordinate.distance_m(&last_coordinate);
            if elapsed < self.deps.settings.min_publish_interval
                && moved_m < self.deps.settings.min_publish_distance_m
            {
                debug!(
                    plan_id = self.plan_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    moved_m,
                    "throttling location publish"
                );
                return;
            }
        }

        if self.write_in_flight {
            // 新值覆盖旧值：在途写入完成后只补发最近的一条
            self.pending_coordinate = Some(coordinate);
            return;
        }

        self.start_write(coordinate);
    }

    fn start_write(&mut self, coordinate: Coordinate) {
        self.write_in_flight = true;

        let share = LocationShare {
            id: None,
            plan_id: self.plan_id,
            user_id: self.user.user_id,
            display_name: self.user.display_name.clone(),
            profile_image_url: self.user.profile_image_url.clone(),
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            created_at: None,
            updated_at: None,
        };
        let channel = self.deps.channel.clone();
        let settings = self.deps.settings.clone();
        let done_tx = self.write_done_tx.clone();
        let plan_id = self.plan_id;

        self.write_task = Some(tokio::spawn(async move {
            let max_attempts = settings.publish_max_attempts.max(1);
            for attempt in 1..=max_attempts {
                match channel.publish(&share).await {
                    Ok(()) => {
                        let _ = done_tx
                            .send(WriteOutcome {
                                coordinate,
                                success: true,
                            })
                            .await;
                        return;
                    }
                    Err(err) => {
                        debug!(
                            plan_id,
                            attempt,
                            max_attempts,
                            error = %err,
                            "location publish attempt failed"
                        );
                        if attempt < max_attempts {
                            tokio::time::sleep(settings.publish_backoff(attempt)).await;
                        }
                    }
                }
            }
            // 最终失败静默放弃：不打扰用户，等下一拍自然更新
            debug!(plan_id, "abandoning location publish after bounded retries");
            let _ = done_tx
                .send(WriteOutcome {
                    coordinate,
                    success: false,
                })
                .await;
        }));
    }

    async fn finish_write(&mut self, outcome: WriteOutcome) {
        self.write_in_flight = false;
        self.write_task = None;

        if outcome.success {
            self.last_sent = Some((outcome.coordinate, Instant::now()));
            if let Some(pending) = self.pending_coordinate.take() {
                self.publish_throttled(pending).await;
            }
        } else {
            // 重试耗尽后不再自动补发，丢弃待发坐标
            self.pending_coordinate = None;
        }
    }

    /// 合并通道事件；本人产生的回声不进入本地表
    fn merge_change_event(&mut self, event: ChangeEvent) {
        if event.share().user_id == self.user.user_id {
            return;
        }

        match event {
            ChangeEvent::Insert(share) | ChangeEvent::Update(share) => {
                self.snapshot.locations.insert(share.user_id, share);
            }
            ChangeEvent::Delete(share) => {
                self.snapshot.locations.remove(&share.user_id);
            }
        }
        self.publish_snapshot();
    }

    /// 断开：退订 → 取消在途写入 → 清空本地状态，全部尽力而为
    async fn disconnect(mut self, subscription: ChannelSubscription, reason: &str) {
        info!(plan_id = self.plan_id, reason, "stopping location share session");
        self.set_phase(SessionPhase::Disconnecting);

        subscription.unsubscribe().await;

        if let Some(write_task) = self.write_task.take() {
            write_task.abort();
        }
        self.pending_coordinate = None;

        self.snapshot.locations.clear();
        self.snapshot.error_message = None;
        self.snapshot.is_sharing = false;
        self.snapshot.phase = SessionPhase::Idle;
        self.publish_snapshot();
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        self.snapshot.phase = phase;
        self.publish_snapshot();
    }

    fn set_error(&mut self, message: Option<String>) {
        self.snapshot.error_message = message;
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let _ = self.state_tx.send(self.snapshot.clone());
    }
}
