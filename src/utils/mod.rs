//! 基础工具集合

pub mod geo;
