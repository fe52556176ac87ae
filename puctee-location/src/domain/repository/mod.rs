//! 领域端口定义
//!
//! 外部协作方（平台定位服务、实时通道、后端校验接口）都以 trait
//! 形式注入，保持单实例语义的同时避免隐藏的全局可变状态。

use async_trait::async_trait;
use puctee_core::error::{AccessError, ChannelError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::model::{AuthorizationStatus, ChangeEvent, FixReport, LocationShare, UserIdentity};

/// 平台定位服务端口（对应 OS 的定位回调层）
///
/// 实现方约定：
/// - `fixes()` 只能被领取一次（坐标源是进程级单例、唯一消费者）
/// - 无效测位（精度 <= 0）也按原样上报，由坐标源判别丢弃
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// 请求定位权限（即发即忘，结果通过 authorization_status 观察）
    fn request_authorization(&self);

    /// 权限状态的可观察句柄
    fn authorization_status(&self) -> watch::Receiver<AuthorizationStatus>;

    /// 系统定位服务是否可用
    fn services_enabled(&self) -> bool;

    /// 触发一次单次测位
    async fn request_fix(&self, desired_accuracy_m: f64);

    /// 开始持续测位
    async fn start_updates(&self);

    /// 停止持续测位
    async fn stop_updates(&self);

    /// 领取测位回报流（只允许领取一次，重复领取返回 None）
    fn take_fixes(&self) -> Option<mpsc::Receiver<FixReport>>;
}

/// 一个计划的实时订阅句柄
///
/// 流在订阅存续期间是无界的；退订保证不抛错。
pub struct ChannelSubscription {
    events: mpsc::Receiver<ChangeEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl ChannelSubscription {
    pub fn new(
        events: mpsc::Receiver<ChangeEvent>,
        shutdown: Option<oneshot::Sender<()>>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            events,
            shutdown,
            pump,
        }
    }

    /// 下一条变更事件；订阅被关闭后返回 None
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// 退订（尽力而为，从不失败）
    pub async fn unsubscribe(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut pump) = self.pump.take() {
            // 给事件泵一点时间自然退出，不配合就强行取消
            if tokio::time::timeout(std::time::Duration::from_secs(1), &mut pump)
                .await
                .is_err()
            {
                pump.abort();
            }
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// 实时通道客户端端口
///
/// 写入以 (plan_id, user_id) 为冲突键做 upsert，已有键必须覆盖而非重复。
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// 订阅一个计划的行级变更事件流
    async fn subscribe(&self, plan_id: i64) -> Result<ChannelSubscription, ChannelError>;

    /// 上报（upsert）一条位置
    async fn publish(&self, share: &LocationShare) -> Result<(), ChannelError>;

    /// 读取计划当前的位置快照（排除指定用户）
    async fn load_snapshot(
        &self,
        plan_id: i64,
        excluding_user_id: i64,
    ) -> Result<Vec<LocationShare>, ChannelError>;
}

/// 参加者校验结果
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub user: UserIdentity,
}

/// 订阅前的参加者校验端口（后端 REST）
#[async_trait]
pub trait PlanAccessValidator: Send + Sync {
    async fn validate(&self, plan_id: i64, user_id: i64) -> Result<AccessGrant, AccessError>;
}
