//! Puctee Core 错误类型
//!
//! 错误分层约定：
//! - 领域层使用这里定义的具名错误类型
//! - 应用/装配层使用 `anyhow::Result` 聚合上下文
//! - 位置共享子系统内没有致命错误，最坏情况是位置数据过期

use thiserror::Error;

/// 定位请求错误（一次性测位）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinateError {
    /// 系统定位服务整体关闭
    #[error("location services disabled")]
    ServicesDisabled,
    /// 未获得定位权限
    #[error("location not authorized")]
    NotAuthorized,
    /// 调用方等待超时（不会取消底层请求）
    #[error("location request timed out")]
    Timeout,
    /// 底层返回了无效定位
    #[error("no usable location fix")]
    NoLocation,
    /// 平台层故障
    #[error("location provider failure: {0}")]
    Provider(String),
}

/// 实时通道 / 位置上报错误
#[derive(Debug, Error)]
pub enum ChannelError {
    /// 网络层故障（发布重试的对象）
    #[error("channel network error: {0}")]
    Network(String),
    /// 存储层故障
    #[error("channel database error: {0}")]
    Database(String),
    /// 事件载荷不符合模式（丢弃并记录，不中断流）
    #[error("change event decode error: {0}")]
    Decode(String),
}

/// 参加者校验错误
#[derive(Debug, Error)]
pub enum AccessError {
    /// 非参加者，明确拒绝
    #[error("access denied: {0}")]
    Denied(String),
    /// 校验服务不可用
    #[error("access validator unavailable: {0}")]
    Unavailable(String),
}
