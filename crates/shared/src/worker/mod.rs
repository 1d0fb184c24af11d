//! 后台任务基础设施
//!
//! - [`pool::WorkerPool`]：有界并发的异步任务池，队列满时按超时施加背压
//! - [`batcher::BatchProcessor`]：按大小或时间触发刷新的缓冲区，批次严格串行处理
//!
//! 两者都与业务无关，任务体返回 `anyhow::Result`，失败只记录日志，不影响池本身。

pub mod batcher;
pub mod pool;

use std::any::Any;
use thiserror::Error;

pub use batcher::{BatchConfig, BatchHandler, BatchProcessor};
pub use pool::{
    ChannelObserver, Job, JobObserver, JobOutcome, JobStatus, LogObserver, PoolConfig, WorkerPool,
};

/// 后台任务错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("{0} 队列已满，提交超时")]
    QueueFull(String),

    #[error("{0} 尚未启动")]
    NotRunning(String),

    #[error("{0} 已停止")]
    Stopped(String),
}

impl WorkerError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::Stopped(_) => "STOPPED",
        }
    }
}

/// 从 panic 负载中提取可读信息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_error_code() {
        assert_eq!(WorkerError::QueueFull("p".into()).code(), "QUEUE_FULL");
        assert_eq!(
            WorkerError::Stopped("p".into()).to_string(),
            "p 已停止"
        );
    }
}
