//! 有界并发工作池
//!
//! 任务通过有界队列提交，调度器用信号量限制同时执行的任务数。
//! 每个任务完成后（成功、失败、取消或 panic）都会生成一条 [`JobOutcome`]，
//! 交给注入的 [`JobObserver`] 处理。失败的任务不会自动重试，也不会影响池本身。
//!
//! 队列满时 [`WorkerPool::submit`] 最多等待 `submit_timeout`，超时返回
//! [`WorkerError::QueueFull`]，由调用方决定如何处理被拒绝的任务。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{WorkerError, panic_message};
use crate::observability::metrics;

/// 可提交到工作池的任务
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// 稳定的任务标识，仅用于日志与观测，不用于去重
    fn id(&self) -> String;

    async fn execute(&self) -> anyhow::Result<()>;
}

type BoxedJob = Box<dyn Job>;

/// 任务结束状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed(String),
    /// 池停止时仍在执行，任务 future 被丢弃
    Cancelled,
    Panicked(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// 单个任务的执行结果
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub duration: Duration,
}

/// 任务完成回调
pub trait JobObserver: Send + Sync {
    fn on_complete(&self, outcome: &JobOutcome);
}

/// 默认观察者：只记录日志
pub struct LogObserver {
    pool: String,
}

impl LogObserver {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }
}

impl JobObserver for LogObserver {
    fn on_complete(&self, outcome: &JobOutcome) {
        let duration_ms = outcome.duration.as_millis() as u64;
        match &outcome.status {
            JobStatus::Succeeded => {
                debug!(pool = %self.pool, job_id = %outcome.job_id, duration_ms, "任务执行完成");
            }
            JobStatus::Failed(e) => {
                error!(pool = %self.pool, job_id = %outcome.job_id, duration_ms, error = %e, "任务执行失败");
            }
            JobStatus::Cancelled => {
                warn!(pool = %self.pool, job_id = %outcome.job_id, duration_ms, "任务因工作池停止被取消");
            }
            JobStatus::Panicked(msg) => {
                error!(pool = %self.pool, job_id = %outcome.job_id, panic = %msg, "任务执行 panic");
            }
        }
    }
}

/// 将结果转发到 channel 的观察者，便于调用方等待特定任务完成
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JobOutcome>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobObserver for ChannelObserver {
    fn on_complete(&self, outcome: &JobOutcome) {
        // 接收端已关闭时直接丢弃
        let _ = self.tx.send(outcome.clone());
    }
}

/// 工作池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub max_workers: usize,
    pub queue_size: usize,
    pub submit_timeout: Duration,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_workers: 5,
            queue_size: 200,
            submit_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }
}

enum PoolState {
    Idle(mpsc::Receiver<BoxedJob>),
    Running(JoinHandle<()>),
    Stopped,
}

struct PoolShared {
    name: String,
    observer: Arc<dyn JobObserver>,
    active: AtomicUsize,
}

/// 有界并发工作池
///
/// 启动前提交的任务会在队列中等待，直到 [`WorkerPool::start`] 被调用。
pub struct WorkerPool {
    config: PoolConfig,
    shared: Arc<PoolShared>,
    tx: mpsc::Sender<BoxedJob>,
    shutdown: watch::Sender<bool>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let observer = Arc::new(LogObserver::new(config.name.clone()));
        Self::with_observer(config, observer)
    }

    pub fn with_observer(config: PoolConfig, observer: Arc<dyn JobObserver>) -> Self {
        let config = PoolConfig {
            max_workers: config.max_workers.max(1),
            queue_size: config.queue_size.max(1),
            ..config
        };
        let (tx, rx) = mpsc::channel(config.queue_size);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(PoolShared {
                name: config.name.clone(),
                observer,
                active: AtomicUsize::new(0),
            }),
            config,
            tx,
            shutdown,
            state: Mutex::new(PoolState::Idle(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 启动调度器，重复调用无副作用
    pub fn start(&self) {
        let mut state = self.state.lock();
        let rx = match std::mem::replace(&mut *state, PoolState::Stopped) {
            PoolState::Idle(rx) => rx,
            other => {
                *state = other;
                debug!(pool = %self.config.name, "工作池已启动或已停止，忽略重复启动");
                return;
            }
        };

        let handle = tokio::spawn(dispatch(
            self.shared.clone(),
            rx,
            Arc::new(Semaphore::new(self.config.max_workers)),
            self.shutdown.subscribe(),
        ));
        *state = PoolState::Running(handle);

        info!(
            pool = %self.config.name,
            max_workers = self.config.max_workers,
            queue_size = self.config.queue_size,
            "工作池已启动"
        );
    }

    /// 停止工作池
    ///
    /// 先广播停止信号，执行中的任务被取消（其 future 被丢弃）并上报 `Cancelled`，
    /// 队列中尚未开始的任务直接丢弃。返回前等待所有工作任务退出。
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let previous = std::mem::replace(&mut *self.state.lock(), PoolState::Stopped);
        match previous {
            PoolState::Running(handle) => {
                if let Err(e) = handle.await {
                    error!(pool = %self.config.name, error = %e, "工作池调度器异常退出");
                }
            }
            PoolState::Idle(mut rx) => {
                rx.close();
                let dropped = drain(&mut rx);
                if dropped > 0 {
                    warn!(pool = %self.config.name, dropped, "工作池未启动即停止，丢弃排队任务");
                }
            }
            PoolState::Stopped => return,
        }

        metrics::set_queue_depth(&self.config.name, 0);
        info!(pool = %self.config.name, "工作池已停止");
    }

    /// 提交任务
    ///
    /// 队列有空位时立即返回；队列已满时最多等待 `submit_timeout`，超时返回 `QueueFull`。
    pub async fn submit<J: Job>(&self, job: J) -> Result<(), WorkerError> {
        if *self.shutdown.borrow() {
            return Err(WorkerError::Stopped(self.config.name.clone()));
        }

        match self.tx.try_send(Box::new(job)) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                return Err(WorkerError::Stopped(self.config.name.clone()));
            }
            Err(TrySendError::Full(job)) => {
                debug!(pool = %self.config.name, job_id = %job.id(), "队列已满，等待空位");
                match self.tx.send_timeout(job, self.config.submit_timeout).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(job)) => {
                        warn!(
                            pool = %self.config.name,
                            job_id = %job.id(),
                            timeout_ms = self.config.submit_timeout.as_millis() as u64,
                            "队列已满，任务提交超时"
                        );
                        return Err(WorkerError::QueueFull(self.config.name.clone()));
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        return Err(WorkerError::Stopped(self.config.name.clone()));
                    }
                }
            }
        }

        metrics::set_queue_depth(&self.config.name, self.queue_len());
        Ok(())
    }

    /// 非阻塞提交，队列已满立即返回 `QueueFull`
    pub fn try_submit<J: Job>(&self, job: J) -> Result<(), WorkerError> {
        if *self.shutdown.borrow() {
            return Err(WorkerError::Stopped(self.config.name.clone()));
        }

        self.tx.try_send(Box::new(job)).map_err(|e| match e {
            TrySendError::Full(_) => WorkerError::QueueFull(self.config.name.clone()),
            TrySendError::Closed(_) => WorkerError::Stopped(self.config.name.clone()),
        })
    }

    /// 正在执行的任务数
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// 排队中（尚未被调度）的任务数
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

fn drain(rx: &mut mpsc::Receiver<BoxedJob>) -> usize {
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

/// 调度循环：先拿到执行许可再取任务，保证同时执行数不超过 max_workers
async fn dispatch(
    shared: Arc<PoolShared>,
    mut rx: mpsc::Receiver<BoxedJob>,
    semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();

    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        while let Some(result) = tasks.try_join_next() {
            log_join_error(&shared.name, result);
        }

        metrics::set_queue_depth(&shared.name, rx.len());
        tasks.spawn(run_job(shared.clone(), job, permit, shutdown.clone()));
    }

    rx.close();
    let dropped = drain(&mut rx);
    if dropped > 0 {
        warn!(pool = %shared.name, dropped, "工作池停止，丢弃未开始的排队任务");
    }

    while let Some(result) = tasks.join_next().await {
        log_join_error(&shared.name, result);
    }
}

fn log_join_error(pool: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(pool = %pool, error = %e, "工作任务异常退出");
    }
}

async fn run_job(
    shared: Arc<PoolShared>,
    job: BoxedJob,
    _permit: OwnedSemaphorePermit,
    mut shutdown: watch::Receiver<bool>,
) {
    let job_id = job.id();
    shared.active.fetch_add(1, Ordering::AcqRel);
    let started = Instant::now();

    let status = tokio::select! {
        result = AssertUnwindSafe(job.execute()).catch_unwind() => match result {
            Ok(Ok(())) => JobStatus::Succeeded,
            Ok(Err(e)) => JobStatus::Failed(format!("{e:#}")),
            Err(payload) => JobStatus::Panicked(panic_message(payload.as_ref())),
        },
        _ = shutdown.wait_for(|stop| *stop) => JobStatus::Cancelled,
    };

    shared.active.fetch_sub(1, Ordering::AcqRel);

    let outcome = JobOutcome {
        job_id,
        status,
        duration: started.elapsed(),
    };
    metrics::record_job(
        &shared.name,
        outcome.status.as_str(),
        outcome.duration.as_secs_f64(),
    );
    shared.observer.on_complete(&outcome);
}
