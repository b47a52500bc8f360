//! 共享库
//!
//! 包含推送服务共用的配置加载、可观测性初始化与重试退避策略。

pub mod config;
pub mod observability;
pub mod retry;
