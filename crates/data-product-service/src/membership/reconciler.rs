//! 周期对账
//!
//! 首次等待 `initial_delay`，之后每隔 `interval` 调用一次
//! [`MembershipEngine::reconcile_all`]。周期运行与手动触发共用一把锁，任意时刻最多一次对账。

use std::sync::Arc;

use catalog_shared::config::ReconcilerConfig;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use super::engine::{MembershipEngine, ReconcileReport};
use crate::error::Result;

pub struct Reconciler {
    engine: Arc<MembershipEngine>,
    initial_delay: Duration,
    interval: Duration,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(engine: Arc<MembershipEngine>, initial_delay: Duration, interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            initial_delay,
            interval: interval.max(Duration::from_secs(1)),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn from_config(engine: Arc<MembershipEngine>, config: &ReconcilerConfig) -> Self {
        Self::new(engine, config.initial_delay(), config.interval())
    }

    /// 启动周期任务，重复调用无副作用
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let engine = self.engine.clone();
        let run_lock = self.run_lock.clone();
        let mut shutdown = self.shutdown.subscribe();
        let initial_delay = self.initial_delay;
        let interval = self.interval;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + initial_delay,
                interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stopped| *stopped) => break,
                    _ = ticker.tick() => {}
                }

                let _guard = run_lock.lock().await;
                if let Err(e) = engine.reconcile_all().await {
                    error!(error = %e, "周期对账失败");
                }
            }
        }));

        info!(
            initial_delay_secs = self.initial_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "周期对账已启动"
        );
    }

    /// 停止周期任务；正在进行的对账会跑完当前规则后由引擎决定是否提前结束
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "周期对账任务异常退出");
            }
            info!("周期对账已停止");
        }
    }

    /// 立即执行一次对账，若周期对账正在进行则等待其结束
    pub async fn run_now(&self) -> Result<ReconcileReport> {
        let _guard = self.run_lock.lock().await;
        self.engine.reconcile_all().await
    }
}
