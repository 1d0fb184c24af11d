//! 共享库
//!
//! 包含目录服务共用的配置、错误处理、数据库连接、可观测性以及后台任务基础设施（工作池与批处理器）。

pub mod config;
pub mod database;
pub mod error;
pub mod observability;
pub mod worker;
