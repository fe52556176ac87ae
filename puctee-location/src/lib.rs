//! Puctee 位置共享协调服务
//!
//! 负责「计划开始前的实时位置共享」的全部客户端协调逻辑：
//! - 坐标源：一次性测位多路复用 + 持续追踪（单消费者）
//! - 实时通道：按计划维度订阅 / 变更事件流 / upsert 上报
//! - 会话：每个计划一个独立任务，节流上报 + 有界重试 + 事件合并
//! - 舰队协调器：根据计划快照与时钟决定会话的启停

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod service;
