use std::time::Duration;

use puctee_core::config::PucteeAppConfig;

/// 位置共享服务运行参数（从应用配置组装，换算为 Duration）
#[derive(Clone, Debug)]
pub struct LocationShareSettings {
    /// 开始前多久进入共享窗口
    pub lead: Duration,
    /// 协调器对账周期
    pub reconcile_tick: Duration,
    /// 上报节流：最小间隔
    pub min_publish_interval: Duration,
    /// 上报节流：最小移动距离（米）
    pub min_publish_distance_m: f64,
    /// 上报失败最大尝试次数
    pub publish_max_attempts: u32,
    /// 第 n 次失败后等待 n * backoff_step
    pub publish_backoff_step: Duration,
    /// 一次性测位等待上限
    pub one_shot_timeout: Duration,
    /// 一次性测位精度要求（米）
    pub desired_accuracy_m: f64,
    /// 测位缓存新鲜时长
    pub fix_cache_freshness: Duration,
    /// 通道名前缀
    pub channel_prefix: String,
}

impl LocationShareSettings {
    pub fn from_app_config(app: &PucteeAppConfig) -> Self {
        let share = &app.location_share;
        Self {
            lead: Duration::from_secs(share.lead_secs),
            reconcile_tick: Duration::from_secs(share.reconcile_tick_secs),
            min_publish_interval: Duration::from_secs(share.min_publish_interval_secs),
            min_publish_distance_m: share.min_publish_distance_m,
            publish_max_attempts: share.publish_max_attempts,
            publish_backoff_step: Duration::from_secs_f64(share.publish_backoff_step_secs),
            one_shot_timeout: Duration::from_secs(share.one_shot_timeout_secs),
            desired_accuracy_m: share.desired_accuracy_m,
            fix_cache_freshness: Duration::from_secs(share.fix_cache_freshness_secs),
            channel_prefix: share.channel_prefix.clone(),
        }
    }

    /// 计算第 attempt 次失败后的退避等待（attempt 从 1 开始）
    pub fn publish_backoff(&self, attempt: u32) -> Duration {
        self.publish_backoff_step.saturating_mul(attempt)
    }

    /// 通道名：plan_location_<planId>
    pub fn channel_name(&self, plan_id: i64) -> String {
        format!("{}_{}", self.channel_prefix, plan_id)
    }
}

impl Default for LocationShareSettings {
    fn default() -> Self {
        Self::from_app_config(&PucteeAppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_attempt_multiples() {
        let settings = LocationShareSettings::default();
        assert_eq!(settings.publish_backoff(1), Duration::from_millis(1500));
        assert_eq!(settings.publish_backoff(2), Duration::from_millis(3000));
        assert_eq!(settings.publish_backoff(3), Duration::from_millis(4500));
        assert_eq!(settings.publish_backoff(4), Duration::from_millis(6000));
    }

    #[test]
    fn channel_name_follows_convention() {
        let settings = LocationShareSettings::default();
        assert_eq!(settings.channel_name(42), "plan_location_42");
    }
}
