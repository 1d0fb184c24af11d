//! 批处理器
//!
//! 调用方通过 [`BatchProcessor::add`] 把条目放入缓冲区，从不等待处理。
//! 缓冲区在以下任一条件满足时被切成一个批次：
//! - 条目数达到 `batch_size`
//! - 距最早入队的条目已过去 `flush_interval`
//!
//! 所有批次按切分顺序进入同一个后台任务串行处理，批次之间不会重叠。
//! 处理函数返回错误或 panic 只记录日志，后台任务继续运行。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{WorkerError, panic_message};
use crate::observability::metrics;

/// 批次处理函数
#[async_trait]
pub trait BatchHandler<T>: Send + Sync + 'static {
    async fn handle_batch(&self, items: Vec<T>) -> anyhow::Result<()>;
}

/// 批处理器配置
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl BatchConfig {
    pub fn new(name: impl Into<String>, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            name: name.into(),
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }
}

enum Command<T> {
    Batch(Vec<T>),
    Barrier(oneshot::Sender<()>),
}

struct Buffer<T> {
    items: Vec<T>,
    oldest: Option<Instant>,
}

impl<T> Buffer<T> {
    fn take(&mut self) -> Vec<T> {
        self.oldest = None;
        std::mem::take(&mut self.items)
    }
}

/// 缓冲区与命令通道
///
/// 切分批次和发送命令都在缓冲区锁内完成，保证批次进入通道的顺序与条目入队顺序一致。
struct Shared<T> {
    config: BatchConfig,
    buffer: Mutex<Buffer<T>>,
    first_item: Notify,
    commands: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Shared<T> {
    /// 切出当前缓冲区并发送，返回批次大小
    fn cut_locked(&self, buffer: &mut Buffer<T>) -> usize {
        if buffer.items.is_empty() {
            return 0;
        }
        let items = buffer.take();
        let size = items.len();
        if self.commands.send(Command::Batch(items)).is_err() {
            warn!(processor = %self.config.name, size, "批处理任务已退出，丢弃批次");
        }
        size
    }

    fn cut(&self) -> usize {
        let mut buffer = self.buffer.lock();
        self.cut_locked(&mut buffer)
    }

    fn deadline(&self) -> Option<Instant> {
        self.buffer
            .lock()
            .oldest
            .map(|oldest| oldest + self.config.flush_interval)
    }
}

enum Lifecycle<T> {
    Idle(mpsc::UnboundedReceiver<Command<T>>),
    Running(JoinHandle<()>),
    Stopped,
}

/// 按大小或时间触发的批处理器
pub struct BatchProcessor<T> {
    shared: Arc<Shared<T>>,
    handler: Arc<dyn BatchHandler<T>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle<T>>,
}

impl<T: Send + 'static> BatchProcessor<T> {
    pub fn new(config: BatchConfig, handler: Arc<dyn BatchHandler<T>>) -> Self {
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        let (commands, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(Buffer {
                    items: Vec::with_capacity(config.batch_size),
                    oldest: None,
                }),
                config,
                first_item: Notify::new(),
                commands,
            }),
            handler,
            closed: AtomicBool::new(false),
            shutdown,
            lifecycle: Mutex::new(Lifecycle::Idle(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// 启动后台刷新任务，重复调用无副作用
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let rx = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle(rx) => rx,
            other => {
                *lifecycle = other;
                return;
            }
        };

        let handle = tokio::spawn(run(
            self.shared.clone(),
            self.handler.clone(),
            rx,
            self.shutdown.subscribe(),
        ));
        *lifecycle = Lifecycle::Running(handle);

        info!(
            processor = %self.shared.config.name,
            batch_size = self.shared.config.batch_size,
            flush_interval_ms = self.shared.config.flush_interval.as_millis() as u64,
            "批处理器已启动"
        );
    }

    /// 停止批处理器，返回前处理完所有已缓冲的条目
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cut();
        self.shutdown.send_replace(true);

        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running(handle) => {
                if let Err(e) = handle.await {
                    error!(processor = %self.shared.config.name, error = %e, "批处理任务异常退出");
                }
            }
            Lifecycle::Idle(rx) => {
                // 从未启动：就地处理已缓冲的条目
                drain(&self.shared, self.handler.as_ref(), rx).await;
            }
            Lifecycle::Stopped => {}
        }

        info!(processor = %self.shared.config.name, "批处理器已停止");
    }

    /// 缓冲一个条目，从不等待处理
    pub fn add(&self, item: T) -> Result<(), WorkerError> {
        self.add_batch(std::iter::once(item))
    }

    /// 缓冲多个条目，满批即切分
    pub fn add_batch(&self, items: impl IntoIterator<Item = T>) -> Result<(), WorkerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::Stopped(self.shared.config.name.clone()));
        }

        let mut buffer = self.shared.buffer.lock();
        for item in items {
            if buffer.items.is_empty() {
                buffer.oldest = Some(Instant::now());
                self.shared.first_item.notify_one();
            }
            buffer.items.push(item);
            if buffer.items.len() >= self.shared.config.batch_size {
                self.shared.cut_locked(&mut buffer);
            }
        }
        Ok(())
    }

    /// 立即切分缓冲区，并等待此前入队的所有条目处理完毕
    pub async fn flush(&self) -> Result<(), WorkerError> {
        if !matches!(*self.lifecycle.lock(), Lifecycle::Running(_)) {
            return Err(WorkerError::NotRunning(self.shared.config.name.clone()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut buffer = self.shared.buffer.lock();
            self.shared.cut_locked(&mut buffer);
            if self.shared.commands.send(Command::Barrier(ack_tx)).is_err() {
                return Err(WorkerError::Stopped(self.shared.config.name.clone()));
            }
        }

        ack_rx
            .await
            .map_err(|_| WorkerError::Stopped(self.shared.config.name.clone()))
    }

    /// 缓冲区中尚未切分的条目数
    pub fn buffer_len(&self) -> usize {
        self.shared.buffer.lock().items.len()
    }
}

async fn run<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    handler: Arc<dyn BatchHandler<T>>,
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let deadline = shared.deadline();

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop).map(|_| ()) => break,
            command = rx.recv() => match command {
                Some(Command::Batch(items)) => process(&shared.config.name, handler.as_ref(), items).await,
                Some(Command::Barrier(ack)) => {
                    let _ = ack.send(());
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let size = shared.cut();
                if size > 0 {
                    debug!(processor = %shared.config.name, size, "刷新间隔到期，切分批次");
                }
            }
            _ = shared.first_item.notified(), if deadline.is_none() => {}
        }
    }

    drain(&shared, handler.as_ref(), rx).await;
}

/// 停止时处理剩余命令与缓冲区
async fn drain<T: Send + 'static>(
    shared: &Shared<T>,
    handler: &dyn BatchHandler<T>,
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
) {
    shared.cut();
    rx.close();
    while let Ok(command) = rx.try_recv() {
        match command {
            Command::Batch(items) => process(&shared.config.name, handler, items).await,
            Command::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn process<T: Send + 'static>(name: &str, handler: &dyn BatchHandler<T>, items: Vec<T>) {
    let size = items.len();
    if size == 0 {
        return;
    }

    let started = std::time::Instant::now();
    match AssertUnwindSafe(handler.handle_batch(items))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            debug!(
                processor = %name,
                size,
                duration_ms = started.elapsed().as_millis() as u64,
                "批次处理完成"
            );
            metrics::record_batch(name, "ok", size);
        }
        Ok(Err(e)) => {
            error!(processor = %name, size, error = %e, "批次处理失败");
            metrics::record_batch(name, "failed", size);
        }
        Err(payload) => {
            error!(processor = %name, size, panic = %panic_message(payload.as_ref()), "批次处理 panic");
            metrics::record_batch(name, "panicked", size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 记录每个批次内容的处理函数
    struct Recorder {
        batches: Mutex<Vec<Vec<u32>>>,
        fail_on: Option<u32>,
        delay: Duration,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail_on: None,
                delay: Duration::ZERO,
            })
        }

        fn batches(&self) -> Vec<Vec<u32>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl BatchHandler<u32> for Recorder {
        async fn handle_batch(&self, items: Vec<u32>) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failed = self.fail_on.is_some_and(|bad| items.contains(&bad));
            self.batches.lock().push(items);
            if failed {
                anyhow::bail!("bad item in batch");
            }
            Ok(())
        }
    }

    fn processor(size: usize, interval: Duration, recorder: Arc<Recorder>) -> BatchProcessor<u32> {
        BatchProcessor::new(BatchConfig::new("test-batch", size, interval), recorder)
    }

    #[tokio::test]
    async fn test_flush_on_size() {
        let recorder = Recorder::new();
        let batcher = processor(3, Duration::from_secs(60), recorder.clone());
        batcher.start();

        batcher.add_batch([1, 2, 3, 4]).unwrap();
        assert_eq!(batcher.buffer_len(), 1);

        batcher.flush().await.unwrap();
        assert_eq!(recorder.batches(), vec![vec![1, 2, 3], vec![4]]);

        batcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval() {
        let recorder = Recorder::new();
        let batcher = processor(100, Duration::from_millis(500), recorder.clone());
        batcher.start();

        batcher.add(7).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(recorder.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        // 让后台任务处理已切分的批次
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(recorder.batches(), vec![vec![7]]);
        assert_eq!(batcher.buffer_len(), 0);

        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_batches_are_processed_in_order() {
        let recorder = Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
            fail_on: None,
            delay: Duration::from_millis(5),
        });
        let batcher = processor(2, Duration::from_secs(60), recorder.clone());
        batcher.start();

        for i in 0..10 {
            batcher.add(i).unwrap();
        }
        batcher.flush().await.unwrap();

        let flattened: Vec<u32> = recorder.batches().into_iter().flatten().collect();
        assert_eq!(flattened, (0..10).collect::<Vec<_>>());

        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_processor() {
        let recorder = Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
            fail_on: Some(2),
            delay: Duration::ZERO,
        });
        let batcher = processor(2, Duration::from_secs(60), recorder.clone());
        batcher.start();

        batcher.add_batch([1, 2, 3, 4]).unwrap();
        batcher.flush().await.unwrap();

        assert_eq!(recorder.batches(), vec![vec![1, 2], vec![3, 4]]);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_remaining_items() {
        let recorder = Recorder::new();
        let batcher = processor(10, Duration::from_secs(60), recorder.clone());
        batcher.start();

        batcher.add_batch([5, 6]).unwrap();
        batcher.stop().await;

        assert_eq!(recorder.batches(), vec![vec![5, 6]]);
        assert!(matches!(batcher.add(9), Err(WorkerError::Stopped(_))));
    }

    #[tokio::test]
    async fn test_flush_requires_running_processor() {
        let recorder = Recorder::new();
        let batcher = processor(10, Duration::from_secs(60), recorder.clone());

        batcher.add(1).unwrap();
        assert_eq!(
            batcher.flush().await,
            Err(WorkerError::NotRunning("test-batch".to_string()))
        );

        // 未启动即停止时仍会处理缓冲区
        batcher.stop().await;
        assert_eq!(recorder.batches(), vec![vec![1]]);
    }
}
