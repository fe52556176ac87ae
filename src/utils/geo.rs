//! 地理计算工具
//!
//! 上报节流需要比较两次坐标之间的大圆距离（见位置共享子系统的
//! `publish_throttled`），这里提供 haversine 实现。

/// 地球平均半径（米）
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// 计算两点之间的大圆距离（米），参数为十进制度
pub fn haversine_distance_m(
    lat1_deg: f64,
    lon1_deg: f64,
    lat2_deg: f64,
    lon2_deg: f64,
) -> f64 {
    let lat1 = lat1_deg.to_radians();
    let lat2 = lat2_deg.to_radians();
    let dlat = (lat2_deg - lat1_deg).to_radians();
    let dlon = (lon2_deg - lon1_deg).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin().min(std::f64::consts::PI);

    EARTH_RADIUS_M * c
}
