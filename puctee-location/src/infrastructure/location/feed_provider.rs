//! 进程内定位提供方
//!
//! 把 LocationProvider 端口落成一个可以从外部喂数的适配器：宿主
//! （联调脚本、集成测试、桥接进程）通过句柄方法推送测位回报和权限
//! 变化，坐标源一侧看到的行为和真实平台定位层一致。

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::domain::model::{AuthorizationStatus, FixReport, LocationFix};
use crate::domain::repository::LocationProvider;

const FIX_CHANNEL_CAPACITY: usize = 64;

pub struct FeedLocationProvider {
    auth_tx: watch::Sender<AuthorizationStatus>,
    services: AtomicBool,
    updating: AtomicBool,
    fix_tx: mpsc::Sender<FixReport>,
    fix_rx: Mutex<Option<mpsc::Receiver<FixReport>>>,
    request_tx: mpsc::Sender<f64>,
    request_rx: Mutex<Option<mpsc::Receiver<f64>>>,
}

impl FeedLocationProvider {
    pub fn new() -> Self {
        let (auth_tx, _) = watch::channel(AuthorizationStatus::NotDetermined);
        let (fix_tx, fix_rx) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        Self {
            auth_tx,
            services: AtomicBool::new(true),
            updating: AtomicBool::new(false),
            fix_tx,
            fix_rx: Mutex::new(Some(fix_rx)),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
        }
    }

    /// 喂入一次有效测位
    pub async fn push_fix(&self, fix: LocationFix) {
        let _ = self.fix_tx.send(FixReport::Fix(fix)).await;
    }

    /// 喂入一次测位失败
    pub async fn push_failure(&self, message: impl Into<String>) {
        let _ = self.fix_tx.send(FixReport::Failed(message.into())).await;
    }

    pub fn set_authorization(&self, status: AuthorizationStatus) {
        let _ = self.auth_tx.send(status);
    }

    pub fn set_services_enabled(&self, enabled: bool) {
        self.services.store(enabled, Ordering::SeqCst);
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// 领取单次测位请求流（宿主用它来响应 request_fix；只能领取一次）
    pub fn take_fix_requests(&self) -> Option<mpsc::Receiver<f64>> {
        self.request_rx.lock().unwrap().take()
    }
}

impl Default for FeedLocationProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationProvider for FeedLocationProvider {
    fn request_authorization(&self) {
        // 权限由宿主决定；完全没设置过就当作即时授予
        if *self.auth_tx.borrow() == AuthorizationStatus::NotDetermined {
            let _ = self.auth_tx.send(AuthorizationStatus::Always);
        }
    }

    fn authorization_status(&self) -> watch::Receiver<AuthorizationStatus> {
        self.auth_tx.subscribe()
    }

    fn services_enabled(&self) -> bool {
        self.services.load(Ordering::SeqCst)
    }

    async fn request_fix(&self, desired_accuracy_m: f64) {
        if self.request_tx.send(desired_accuracy_m).await.is_err() {
            debug!("no fix request listener attached, one-shot request dropped");
        }
    }

    async fn start_updates(&self) {
        self.updating.store(true, Ordering::SeqCst);
    }

    async fn stop_updates(&self) {
        self.updating.store(false, Ordering::SeqCst);
    }

    fn take_fixes(&self) -> Option<mpsc::Receiver<FixReport>> {
        self.fix_rx.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::domain::model::Coordinate;

    #[tokio::test]
    async fn fixes_can_only_be_claimed_once() {
        let provider = FeedLocationProvider::new();
        assert!(provider.take_fixes().is_some());
        assert!(provider.take_fixes().is_none());
    }

    #[tokio::test]
    async fn pushed_fixes_arrive_in_order() {
        let provider = FeedLocationProvider::new();
        let mut fixes = provider.take_fixes().unwrap();

        provider
            .push_fix(LocationFix {
                coordinate: Coordinate::new(35.0, 139.0),
                horizontal_accuracy_m: 10.0,
                obtained_at: Instant::now(),
            })
            .await;
        provider.push_failure("gps unavailable").await;

        assert!(matches!(fixes.recv().await, Some(FixReport::Fix(_))));
        assert!(matches!(fixes.recv().await, Some(FixReport::Failed(_))));
    }

    #[tokio::test]
    async fn authorization_grant_is_observable() {
        let provider = FeedLocationProvider::new();
        let rx = provider.authorization_status();
        assert_eq!(*rx.borrow(), AuthorizationStatus::NotDetermined);

        provider.request_authorization();
        assert_eq!(*rx.borrow(), AuthorizationStatus::Always);

        provider.set_authorization(AuthorizationStatus::Denied);
        assert_eq!(*rx.borrow(), AuthorizationStatus::Denied);
    }
}
