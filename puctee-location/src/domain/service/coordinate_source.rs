//! 坐标源服务
//!
//! 包装平台定位端口，提供两种取坐标方式：
//! - 一次性测位：带缓存与超时；并发调用方被多路复用到同一个底层
//!   请求上（挂起请求注册表），同批调用方收到同一结果或同一失败。
//!   调用方超时只取消自己的等待，不取消底层请求。
//! - 持续追踪：无超时，直到显式停止；同一时刻只支持一个活跃消费者，
//!   重新注册会替换上一个。
//!
//! 进程内应当只构造一个实例，由所有会话共享。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::LocationShareSettings;
use crate::domain::model::{AuthorizationStatus, Coordinate, FixReport, LocationFix};
use crate::domain::repository::LocationProvider;
use puctee_core::error::CoordinateError;

/// 持续追踪通道容量；满了就丢最新的一拍，等下一拍
const CONTINUOUS_CHANNEL_CAPACITY: usize = 64;

type PendingSender = oneshot::Sender<std::result::Result<Coordinate, CoordinateError>>;

struct SourceState {
    /// 最近一次有效测位（新鲜度判断用）
    cached: Option<LocationFix>,
    /// 挂起的一次性请求注册表，测位回报到达时整体排空
    pending: HashMap<Uuid, PendingSender>,
    /// 是否已有一个底层一次性请求在途
    one_shot_in_flight: bool,
    /// 当前持续追踪消费者（注册新的会替换旧的）
    continuous: Option<mpsc::Sender<Coordinate>>,
    tracking: bool,
}

/// 坐标源（进程级共享服务）
pub struct CoordinateSource {
    provider: Arc<dyn LocationProvider>,
    state: Arc<Mutex<SourceState>>,
    fix_cache_freshness: Duration,
    one_shot_timeout: Duration,
    desired_accuracy_m: f64,
    _pump: JoinHandle<()>,
}

impl CoordinateSource {
    /// 构造坐标源并接管平台层的测位回报流
    ///
    /// 回报流只能被领取一次，重复构造会失败。
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        settings: &LocationShareSettings,
    ) -> Result<Self> {
        let fixes = provider
            .take_fixes()
            .context("location provider fix stream already claimed")?;

        let state = Arc::new(Mutex::new(SourceState {
            cached: None,
            pending: HashMap::new(),
            one_shot_in_flight: false,
            continuous: None,
            tracking: false,
        }));

        let pump = tokio::spawn(Self::pump_fixes(fixes, state.clone()));

        Ok(Self {
            provider,
            state,
            fix_cache_freshness: settings.fix_cache_freshness,
            one_shot_timeout: settings.one_shot_timeout,
            desired_accuracy_m: settings.desired_accuracy_m,
            _pump: pump,
        })
    }

    /// 以配置的超时与精度要求做一次性测位
    pub async fn current_coordinate(&self) -> std::result::Result<Coordinate, CoordinateError> {
        self.get_coordinate(self.one_shot_timeout, self.desired_accuracy_m)
            .await
    }

    /// 请求定位权限（即发即忘）
    pub fn request_authorization(&self) {
        self.provider.request_authorization();
    }

    /// 权限状态的可观察句柄
    pub fn authorization_status(&self) -> watch::Receiver<AuthorizationStatus> {
        self.provider.authorization_status()
    }

    /// 一次性测位
    ///
    /// 缓存新鲜（5 秒内）且精度满足要求时直接返回；否则挂入注册表等待
    /// 底层回报。超时只移除自己的等待项。
    pub async fn get_coordinate(
        &self,
        timeout: Duration,
        desired_accuracy_m: f64,
    ) -> std::result::Result<Coordinate, CoordinateError> {
        if !self.provider.services_enabled() {
            return Err(CoordinateError::ServicesDisabled);
        }
        if !self.provider.authorization_status().borrow().is_authorized() {
            return Err(CoordinateError::NotAuthorized);
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let need_request = {
            let mut state = self.state.lock().expect("coordinate source state poisoned");

            if let Some(fix) = state.cached {
                if fix.is_valid()
                    && fix.obtained_at.elapsed() < self.fix_cache_freshness
                    && fix.horizontal_accuracy_m <= desired_accuracy_m
                {
                    return Ok(fix.coordinate);
                }
            }

            state.pending.insert(request_id, tx);
            // 已有在途请求时全部复用，保证同一时刻至多一个底层一次性请求
            !std::mem::replace(&mut state.one_shot_in_flight, true)
        };

        if need_request {
            self.provider.request_fix(desired_accuracy_m).await;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoordinateError::Provider(
                "fix stream terminated".to_string(),
            )),
            Err(_) => {
                let mut state = self.state.lock().expect("coordinate source state poisoned");
                state.pending.remove(&request_id);
                // 最后一个等待方也超时了：底层请求视为失踪，放行下一次请求，
                // 避免从不回报的提供方把一次性测位永久卡死
                if state.pending.is_empty() {
                    state.one_shot_in_flight = false;
                }
                Err(CoordinateError::Timeout)
            }
        }
    }

    /// 开始持续追踪，返回坐标流
    ///
    /// 重新调用会替换上一个消费者（旧的接收端随即关闭）。
    pub async fn start_continuous_updates(&self) -> mpsc::Receiver<Coordinate> {
        let (tx, rx) = mpsc::channel(CONTINUOUS_CHANNEL_CAPACITY);
        {
            let mut state = self.state.lock().expect("coordinate source state poisoned");
            if state.continuous.replace(tx).is_some() {
                debug!("replacing previous continuous updates consumer");
            }
            state.tracking = true;
        }

        if !matches!(
            *self.provider.authorization_status().borrow(),
            AuthorizationStatus::Always
        ) {
            warn!("continuous tracking started without Always authorization, background fixes may be unreliable");
        }

        self.provider.start_updates().await;
        rx
    }

    /// 停止持续追踪并丢弃当前消费者
    pub async fn stop_continuous_updates(&self) {
        {
            let mut state = self.state.lock().expect("coordinate source state poisoned");
            state.continuous = None;
            state.tracking = false;
        }
        self.provider.stop_updates().await;
    }

    /// 消化平台层回报：更新缓存、排空注册表、转发给持续消费者
    async fn pump_fixes(mut fixes: mpsc::Receiver<FixReport>, state: Arc<Mutex<SourceState>>) {
        while let Some(report) = fixes.recv().await {
            match report {
                FixReport::Fix(fix) if fix.is_valid() => {
                    let (drained, continuous) = {
                        let mut state = state.lock().expect("coordinate source state poisoned");
                        state.cached = Some(fix);
                        state.one_shot_in_flight = false;
                        let drained: Vec<PendingSender> =
                            state.pending.drain().map(|(_, tx)| tx).collect();
                        let continuous = state.tracking.then(|| state.continuous.clone()).flatten();
                        (drained, continuous)
                    };

                    for tx in drained {
                        let _ = tx.send(Ok(fix.coordinate));
                    }
                    if let Some(sink) = continuous {
                        // 消费者落后时丢弃本拍，绝不阻塞回报泵
                        let _ = sink.try_send(fix.coordinate);
                    }
                }
                FixReport::Fix(_) => {
                    // 无效测位：持续流静默丢弃，一次性等待方收到 NoLocation
                    Self::drain_pending(&state, || Err(CoordinateError::NoLocation));
                }
                FixReport::Failed(message) => {
                    debug!(error = %message, "location provider reported failure");
                    Self::drain_pending(&state, || {
                        Err(CoordinateError::Provider(message.clone()))
                    });
                }
            }
        }
    }

    fn drain_pending<F>(state: &Arc<Mutex<SourceState>>, make_result: F)
    where
        F: Fn() -> std::result::Result<Coordinate, CoordinateError>,
    {
        let drained: Vec<PendingSender> = {
            let mut state = state.lock().expect("coordinate source state poisoned");
            state.one_shot_in_flight = false;
            state.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(make_result());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;

    /// 脚本化的平台定位端口
    struct FakeProvider {
        auth_tx: watch::Sender<AuthorizationStatus>,
        services_enabled: AtomicBool,
        fix_tx: mpsc::Sender<FixReport>,
        fixes: StdMutex<Option<mpsc::Receiver<FixReport>>>,
        fix_requests: AtomicUsize,
        updating: AtomicBool,
    }

    impl FakeProvider {
        fn new(status: AuthorizationStatus) -> Arc<Self> {
            let (auth_tx, _) = watch::channel(status);
            let (fix_tx, fix_rx) = mpsc::channel(16);
            Arc::new(Self {
                auth_tx,
                services_enabled: AtomicBool::new(true),
                fix_tx,
                fixes: StdMutex::new(Some(fix_rx)),
                fix_requests: AtomicUsize::new(0),
                updating: AtomicBool::new(false),
            })
        }

        async fn report_fix(&self, latitude: f64, longitude: f64, accuracy: f64) {
            let fix = LocationFix {
                coordinate: Coordinate::new(latitude, longitude),
                horizontal_accuracy_m: accuracy,
                obtained_at: Instant::now(),
            };
            self.fix_tx.send(FixReport::Fix(fix)).await.unwrap();
        }
    }

    #[async_trait]
    impl LocationProvider for FakeProvider {
        fn request_authorization(&self) {}

        fn authorization_status(&self) -> watch::Receiver<AuthorizationStatus> {
            self.auth_tx.subscribe()
        }

        fn services_enabled(&self) -> bool {
            self.services_enabled.load(Ordering::SeqCst)
        }

        async fn request_fix(&self, _desired_accuracy_m: f64) {
            self.fix_requests.fetch_add(1, Ordering::SeqCst);
        }

        async fn start_updates(&self) {
            self.updating.store(true, Ordering::SeqCst);
        }

        async fn stop_updates(&self) {
            self.updating.store(false, Ordering::SeqCst);
        }

        fn take_fixes(&self) -> Option<mpsc::Receiver<FixReport>> {
            self.fixes.lock().unwrap().take()
        }
    }

    fn source_with(provider: Arc<FakeProvider>) -> CoordinateSource {
        CoordinateSource::new(provider, &LocationShareSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn rejects_when_not_authorized() {
        let provider = FakeProvider::new(AuthorizationStatus::Denied);
        let source = source_with(provider);
        let err = source
            .get_coordinate(Duration::from_secs(1), 100.0)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinateError::NotAuthorized);
    }

    #[tokio::test]
    async fn rejects_when_services_disabled() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        provider.services_enabled.store(false, Ordering::SeqCst);
        let source = source_with(provider.clone());
        let err = source
            .get_coordinate(Duration::from_secs(1), 100.0)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinateError::ServicesDisabled);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_underlying_request() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        let source = Arc::new(source_with(provider.clone()));

        let a = tokio::spawn({
            let source = source.clone();
            async move { source.get_coordinate(Duration::from_secs(12), 100.0).await }
        });
        let b = tokio::spawn({
            let source = source.clone();
            async move { source.get_coordinate(Duration::from_secs(12), 100.0).await }
        });

        // 两个调用方都挂起后再回报
        tokio::time::sleep(Duration::from_millis(50)).await;
        provider.report_fix(35.0, 139.0, 30.0).await;

        let coord_a = a.await.unwrap().unwrap();
        let coord_b = b.await.unwrap().unwrap();
        assert_eq!(coord_a, coord_b);
        assert_eq!(provider.fix_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_short_circuits() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        let source = Arc::new(source_with(provider.clone()));

        let pending = tokio::spawn({
            let source = source.clone();
            async move { source.get_coordinate(Duration::from_secs(12), 100.0).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        provider.report_fix(35.0, 139.0, 30.0).await;
        pending.await.unwrap().unwrap();

        // 缓存仍然新鲜：直接命中，不触发新的底层请求
        let coord = source.current_coordinate().await.unwrap();
        assert_eq!(coord, Coordinate::new(35.0, 139.0));
        assert_eq!(provider.fix_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_only_that_caller() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        let source = Arc::new(source_with(provider.clone()));

        let impatient = tokio::spawn({
            let source = source.clone();
            async move { source.get_coordinate(Duration::from_secs(1), 100.0).await }
        });
        let patient = tokio::spawn({
            let source = source.clone();
            async move { source.get_coordinate(Duration::from_secs(30), 100.0).await }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            impatient.await.unwrap().unwrap_err(),
            CoordinateError::Timeout
        );

        // 底层请求仍然在途，后来的回报照常解决耐心的调用方
        provider.report_fix(35.1, 139.1, 20.0).await;
        let coord = patient.await.unwrap().unwrap();
        assert_eq!(coord, Coordinate::new(35.1, 139.1));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_unblocks_after_all_waiters_time_out() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        let source = Arc::new(source_with(provider.clone()));

        // 提供方吞掉了请求，唯一的等待方超时
        let err = source
            .get_coordinate(Duration::from_secs(1), 100.0)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinateError::Timeout);
        assert_eq!(provider.fix_requests.load(Ordering::SeqCst), 1);

        // 注册表已空：下一个调用方要能触发新的底层请求并正常解决
        let retry = tokio::spawn({
            let source = source.clone();
            async move { source.get_coordinate(Duration::from_secs(12), 100.0).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.fix_requests.load(Ordering::SeqCst), 2);

        provider.report_fix(35.4, 139.4, 20.0).await;
        assert_eq!(
            retry.await.unwrap().unwrap(),
            Coordinate::new(35.4, 139.4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_fix_resolves_one_shot_with_no_location() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        let source = Arc::new(source_with(provider.clone()));

        let waiter = tokio::spawn({
            let source = source.clone();
            async move { source.get_coordinate(Duration::from_secs(12), 100.0).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        provider.report_fix(0.0, 0.0, -1.0).await;

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            CoordinateError::NoLocation
        );
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_updates_discard_invalid_fixes() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        let source = source_with(provider.clone());

        let mut updates = source.start_continuous_updates().await;
        assert!(provider.updating.load(Ordering::SeqCst));

        provider.report_fix(0.0, 0.0, -1.0).await;
        provider.report_fix(35.2, 139.2, 10.0).await;

        // 无效测位被静默丢弃，只有有效坐标被转发
        let coord = updates.recv().await.unwrap();
        assert_eq!(coord, Coordinate::new(35.2, 139.2));
    }

    #[tokio::test(start_paused = true)]
    async fn new_continuous_consumer_replaces_previous() {
        let provider = FakeProvider::new(AuthorizationStatus::Always);
        let source = source_with(provider.clone());

        let mut first = source.start_continuous_updates().await;
        let mut second = source.start_continuous_updates().await;

        provider.report_fix(35.3, 139.3, 10.0).await;

        assert_eq!(
            second.recv().await.unwrap(),
            Coordinate::new(35.3, 139.3)
        );
        // 旧消费者的发送端已被替换丢弃，流应当终止
        assert!(first.recv().await.is_none());

        source.stop_continuous_updates().await;
        assert!(!provider.updating.load(Ordering::SeqCst));
    }
}
