//! 舰队协调器
//!
//! 根据最新的计划快照和墙钟时间决定哪些计划应当持有活跃会话：
//! `0 < startTime - now <= lead（默认 15 分钟）` 且参加者多于一人且
//! 状态为 upcoming。每次计划更新和每 60 秒的对账拍都会重算，启动
//! 缺失的会话、停掉不再合规的会话，并为每个会话安排一个在
//! startTime 准点触发的停止任务。对账是幂等的：输入不变时不会
//! 启停任何已经正确的会话。
//!
//! 持续测位全程只向坐标源注册一个消费者（进程内约束），由协调器
//! 经 broadcast 扇出到各会话。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::LocationShareSettings;
use crate::domain::model::{Coordinate, Plan, PlanStatus, SessionSnapshot, UserIdentity};
use crate::domain::repository::{ChannelClient, PlanAccessValidator};
use crate::domain::service::coordinate_source::CoordinateSource;
use crate::domain::service::share_session::{SessionDeps, ShareSession, ShareSessionHandle};

/// 坐标扇出通道容量
const FAN_OUT_CAPACITY: usize = 64;

/// 协调器外部依赖
#[derive(Clone)]
pub struct FleetDeps {
    pub source: Arc<CoordinateSource>,
    pub channel: Arc<dyn ChannelClient>,
    pub validator: Option<Arc<dyn PlanAccessValidator>>,
    pub settings: Arc<LocationShareSettings>,
}

struct FleetState {
    /// 最新的计划快照（外部喂入）
    plans: HashMap<i64, Plan>,
    /// 活跃会话（不变式：每个计划至多一个）
    sessions: HashMap<i64, ShareSessionHandle>,
    /// 每计划的定点停止任务（startTime 触发）
    stop_deadlines: HashMap<i64, (DateTime<Utc>, JoinHandle<()>)>,
    current_user: Option<UserIdentity>,
    /// 持续坐标流 → broadcast 的转发任务（首个会话启动时创建）
    feed_task: Option<JoinHandle<()>>,
}

struct Inner {
    deps: FleetDeps,
    state: Mutex<FleetState>,
    fan_out: broadcast::Sender<Coordinate>,
    /// 墙钟锚点 + 单调时钟，保证资格判定和定点停止走同一个时间轴
    wall_anchor: DateTime<Utc>,
    monotonic_anchor: tokio::time::Instant,
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        self.wall_anchor
            + chrono::Duration::from_std(self.monotonic_anchor.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// 位置共享舰队协调器（可克隆句柄）
#[derive(Clone)]
pub struct ShareFleetCoordinator {
    inner: Arc<Inner>,
}

impl ShareFleetCoordinator {
    pub fn new(deps: FleetDeps) -> Self {
        let (fan_out, _) = broadcast::channel(FAN_OUT_CAPACITY);
        let tick = deps.settings.reconcile_tick;
        let inner = Arc::new(Inner {
            deps,
            state: Mutex::new(FleetState {
                plans: HashMap::new(),
                sessions: HashMap::new(),
                stop_deadlines: HashMap::new(),
                current_user: None,
                feed_task: None,
            }),
            fan_out,
            wall_anchor: Utc::now(),
            monotonic_anchor: tokio::time::Instant::now(),
        });

        // 每分钟重算一次接続対象；协调器被整体丢弃时任务自行退出
        let weak = Arc::downgrade(&inner);
        tokio::spawn(Self::run_ticks(weak, tick));

        Self { inner }
    }

    async fn run_ticks(weak: Weak<Inner>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            Inner::reconcile(&inner).await;
        }
    }

    /// 设置当前登录用户（会话启动的前提；None 时启动被跳过）
    pub async fn set_current_user(&self, user: Option<UserIdentity>) {
        {
            let mut state = self.inner.state.lock().await;
            state.current_user = user;
        }
        Inner::reconcile(&self.inner).await;
    }

    /// 喂入计划的最新快照并立即对账
    pub async fn update_plans(&self, plans: Vec<Plan>) {
        {
            let mut state = self.inner.state.lock().await;
            state.plans = plans.into_iter().map(|plan| (plan.id, plan)).collect();
        }
        Inner::reconcile(&self.inner).await;
    }

    /// 手动对账（计划更新和定时拍之外的显式触发）
    pub async fn reconcile(&self) {
        Inner::reconcile(&self.inner).await;
    }

    /// 明确断开某个计划的会话（例如计划被删除时）
    pub async fn disconnect(&self, plan_id: i64, reason: &str) {
        Inner::disconnect(&self.inner, plan_id, reason).await;
    }

    /// 某计划会话状态的可观察句柄（UI 用）
    pub async fn session_state(&self, plan_id: i64) -> Option<watch::Receiver<SessionSnapshot>> {
        let state = self.inner.state.lock().await;
        state.sessions.get(&plan_id).map(|handle| handle.state())
    }

    /// 当前持有活跃会话的计划集合
    pub async fn active_plan_ids(&self) -> Vec<i64> {
        let state = self.inner.state.lock().await;
        state.sessions.keys().copied().collect()
    }

    /// 停止所有会话和定时任务
    ///
    /// 计划快照一并清空，后续的对账拍不会复活任何会话。
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.plans.clear();
        for (_, (_, timer)) in state.stop_deadlines.drain() {
            timer.abort();
        }
        let sessions: Vec<ShareSessionHandle> =
            state.sessions.drain().map(|(_, handle)| handle).collect();
        for handle in sessions {
            handle.stop("shutdown").await;
        }
        Inner::stop_feed_locked(&self.inner, &mut state).await;
    }
}

impl Inner {
    /// 共享窗口判定：开始前 lead 以内、参加者多于一人、状态 upcoming
    fn should_connect(plan: &Plan, now: DateTime<Utc>, lead: Duration) -> bool {
        let Ok(lead) = chrono::Duration::from_std(lead) else {
            return false;
        };
        let until_start = plan.start_time - now;
        until_start > chrono::Duration::zero()
            && until_start <= lead
            && plan.participant_count > 1
            && plan.status == PlanStatus::Upcoming
    }

    async fn reconcile(inner: &Arc<Inner>) {
        let now = inner.now();
        let mut state = inner.state.lock().await;

        let should_connect_ids: HashSet<i64> = state
            .plans
            .values()
            .filter(|plan| Self::should_connect(plan, now, inner.deps.settings.lead))
            .map(|plan| plan.id)
            .collect();

        // 启动缺失的会话（没有当前用户就整体跳过，不算错误）
        if let Some(user) = state.current_user.clone() {
            let to_start: Vec<Plan> = should_connect_ids
                .iter()
                .filter(|plan_id| !state.sessions.contains_key(plan_id))
                .filter_map(|plan_id| state.plans.get(plan_id).cloned())
                .collect();
            for plan in to_start {
                Self::start_session_locked(inner, &mut state, &plan, &user).await;
            }

            // 计划时刻变了就重排定点停止任务
            let to_reschedule: Vec<Plan> = state
                .sessions
                .keys()
                .filter(|plan_id| should_connect_ids.contains(plan_id))
                .filter_map(|plan_id| state.plans.get(plan_id))
                .filter(|plan| {
                    state
                        .stop_deadlines
                        .get(&plan.id)
                        .is_none_or(|(at, _)| *at != plan.start_time)
                })
                .cloned()
                .collect();
            for plan in to_reschedule {
                Self::schedule_stop_locked(inner, &mut state, &plan, now);
            }
        } else if !should_connect_ids.is_empty() {
            debug!("plans in share window but no current user, skipping session start");
        }

        // 不再合规的会话立即停掉（包括从快照里消失的计划）
        let to_stop: Vec<i64> = state
            .sessions
            .keys()
            .filter(|plan_id| !should_connect_ids.contains(plan_id))
            .copied()
            .collect();
        for plan_id in to_stop {
            Self::stop_session_locked(inner, &mut state, plan_id, "out of window / status change")
                .await;
        }
    }

    async fn start_session_locked(
        inner: &Arc<Inner>,
        state: &mut FleetState,
        plan: &Plan,
        user: &UserIdentity,
    ) {
        // 首个会话：领取坐标源的持续流并开始扇出
        if state.sessions.is_empty() {
            inner.deps.source.request_authorization();
            let mut updates = inner.deps.source.start_continuous_updates().await;
            let fan_out = inner.fan_out.clone();
            state.feed_task = Some(tokio::spawn(async move {
                while let Some(coordinate) = updates.recv().await {
                    let _ = fan_out.send(coordinate);
                }
            }));
        }

        info!(plan_id = plan.id, start_time = %plan.start_time, "starting share session for plan");
        let handle = ShareSession::spawn(
            plan.id,
            user.clone(),
            inner.fan_out.subscribe(),
            SessionDeps {
                channel: inner.deps.channel.clone(),
                validator: inner.deps.validator.clone(),
                settings: inner.deps.settings.clone(),
            },
        );
        state.sessions.insert(plan.id, handle);
        Self::schedule_stop_locked(inner, state, plan, inner.now());
    }

    /// 在 startTime 准点停止会话；时刻已过就当场停止
    fn schedule_stop_locked(
        inner: &Arc<Inner>,
        state: &mut FleetState,
        plan: &Plan,
        now: DateTime<Utc>,
    ) {
        if let Some((_, previous)) = state.stop_deadlines.remove(&plan.id) {
            previous.abort();
        }

        let until_start = plan.start_time - now;
        let Ok(delay) = until_start.to_std() else {
            // 已经过了开始时刻
            let weak = Arc::downgrade(inner);
            let plan_id = plan.id;
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    Self::disconnect(&inner, plan_id, "startTime passed").await;
                }
            });
            return;
        };

        let weak = Arc::downgrade(inner);
        let plan_id = plan.id;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                // 断开放到独立任务里执行：stop_session 清理定时任务时会
                // abort 这个句柄，不能让它取消掉正在进行的断开本身
                tokio::spawn(async move {
                    Self::disconnect(&inner, plan_id, "startTime reached").await;
                });
            }
        });
        state.stop_deadlines.insert(plan.id, (plan.start_time, timer));
    }

    async fn disconnect(inner: &Arc<Inner>, plan_id: i64, reason: &str) {
        let mut state = inner.state.lock().await;
        Self::stop_session_locked(inner, &mut state, plan_id, reason).await;
    }

    async fn stop_session_locked(
        inner: &Arc<Inner>,
        state: &mut FleetState,
        plan_id: i64,
        reason: &str,
    ) {
        if let Some((_, timer)) = state.stop_deadlines.remove(&plan_id) {
            timer.abort();
        }
        if let Some(handle) = state.sessions.remove(&plan_id) {
            info!(plan_id, reason, "stopping share session for plan");
            handle.stop(reason).await;
        }
        // 最后一个会话停掉后释放持续测位
        if state.sessions.is_empty() {
            Self::stop_feed_locked(inner, state).await;
        }
    }

    async fn stop_feed_locked(inner: &Arc<Inner>, state: &mut FleetState) {
        if let Some(feed_task) = state.feed_task.take() {
            feed_task.abort();
            inner.deps.source.stop_continuous_updates().await;
        }
    }
}
