//! 位置共享领域模型

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 经纬度坐标（十进制度）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// 到另一坐标的大圆距离（米）
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        puctee_core::geo::haversine_distance_m(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }
}

/// 平台层上报的一次测位结果
#[derive(Debug, Clone, Copy)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    /// 水平精度（米）；<= 0 表示无效测位
    pub horizontal_accuracy_m: f64,
    /// 测位产生时刻（单调时钟，用于缓存新鲜度判断）
    pub obtained_at: Instant,
}

impl LocationFix {
    pub fn is_valid(&self) -> bool {
        self.horizontal_accuracy_m > 0.0
    }
}

/// 平台层回报：有效测位或失败
#[derive(Debug, Clone)]
pub enum FixReport {
    Fix(LocationFix),
    Failed(String),
}

/// 定位权限状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    NotDetermined,
    Denied,
    WhenInUse,
    Always,
}

impl AuthorizationStatus {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::WhenInUse | Self::Always)
    }
}

/// 一名参加者在一个计划里的最近位置
///
/// 合并身份是 (plan_id, user_id)，后端以该组合做 upsert 冲突键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationShare {
    /// 后端分配的行 ID（首次写入前为 None）
    #[serde(default)]
    pub id: Option<i64>,
    pub plan_id: i64,
    pub user_id: i64,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LocationShare {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// 实时通道上的行级变更事件
///
/// Delete 携带的是删除前的行内容（合并时按其 user_id 移除）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "record", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert(LocationShare),
    Update(LocationShare),
    Delete(LocationShare),
}

impl ChangeEvent {
    pub fn share(&self) -> &LocationShare {
        match self {
            Self::Insert(share) | Self::Update(share) | Self::Delete(share) => share,
        }
    }
}

/// 计划生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Upcoming,
    Ongoing,
    Completed,
    Cancelled,
}

/// 计划快照（对本子系统只读，来源于外部的计划列表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub participant_count: usize,
    pub status: PlanStatus,
}

/// 当前登录用户的身份信息（上报时写入行内容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: i64,
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// 会话状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Active,
    Disconnecting,
}

/// 会话对外快照（UI 观察用）
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// participant user_id -> 最近位置
    pub locations: HashMap<i64, LocationShare>,
    pub is_sharing: bool,
    /// 最近一次需要展示的失败信息
    pub error_message: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            locations: HashMap::new(),
            is_sharing: false,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_event_wire_format_is_snake_case() {
        let share = LocationShare {
            id: Some(7),
            plan_id: 3,
            user_id: 11,
            display_name: "kj".to_string(),
            profile_image_url: None,
            latitude: 35.0,
            longitude: 139.0,
            created_at: None,
            updated_at: None,
        };
        let json = serde_json::to_value(ChangeEvent::Update(share.clone())).unwrap();
        assert_eq!(json["event"], "update");
        assert_eq!(json["record"]["plan_id"], 3);
        assert_eq!(json["record"]["display_name"], "kj");

        let decoded: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.share(), &share);
    }

    #[test]
    fn invalid_fix_detected_by_accuracy() {
        let fix = LocationFix {
            coordinate: Coordinate::new(0.0, 0.0),
            horizontal_accuracy_m: -1.0,
            obtained_at: Instant::now(),
        };
        assert!(!fix.is_valid());
    }
}
