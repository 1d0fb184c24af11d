//! 成员关系引擎
//!
//! 维护"资产属于哪些数据产品"这张预计算表，让它随规则和资产的变化保持一致：
//!
//! - 规则创建/更新：抽取并保存索引键，启用的规则提交到工作池做全量评估
//! - 资产创建：进入批处理器，按候选规则做增量评估，只插入不删除
//! - 资产删除：同步删除该资产的全部成员关系
//! - 对账：逐条规则先删后评估，修复任何原因造成的漂移
//!
//! 所有评估工作对触发方都是"发出即忘"，失败只记录日志，正确性由对账兜底。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use catalog_shared::config::MembershipConfig;
use catalog_shared::observability::metrics;
use catalog_shared::worker::{
    BatchConfig, BatchHandler, BatchProcessor, Job, JobObserver, LogObserver, PoolConfig,
    WorkerPool,
};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::matcher;
use super::targets::extract_rule_targets;
use crate::error::Result;
use crate::models::{Asset, AssetSignature, Membership, PatternType, Rule, RuleSpec};
use crate::observer::{AssetObserver, RuleObserver};
use crate::query::QueryEvaluator;
use crate::repository::{AssetGetter, DataProductRepository, MembershipRepository};

const POOL_NAME: &str = "rule-evaluation";
const PROCESSOR_NAME: &str = "asset-membership";

/// 一次对账的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub products: usize,
    pub rules_evaluated: usize,
    pub rules_failed: usize,
    /// 已禁用、只清理了成员关系的规则
    pub rules_cleared: usize,
    pub duration: Duration,
}

/// 引擎的评估逻辑，由工作池任务和批处理器共享
pub(crate) struct EngineCore {
    products: Arc<dyn DataProductRepository>,
    memberships: Arc<dyn MembershipRepository>,
    query: Arc<dyn QueryEvaluator>,
    max_reconcile_products: i64,
    batch_concurrency: usize,
    shutdown: watch::Sender<bool>,
}

impl EngineCore {
    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 全量评估一条规则，返回写入的成员关系数
    ///
    /// 规则已禁用时直接成功；不删除旧成员关系，调用方负责先删后评估。
    #[instrument(skip(self), fields(rule_id = %rule_id))]
    async fn evaluate_rule(&self, rule_id: &str) -> Result<usize> {
        let rule = self.products.get_rule(rule_id).await?;
        if !rule.is_enabled {
            debug!("规则已禁用，跳过全量评估");
            return Ok(0);
        }

        let asset_ids = match self.products.execute_rule(&rule).await {
            Ok(ids) => ids,
            Err(e) => {
                metrics::record_rule_evaluation("full", "error");
                return Err(e);
            }
        };

        let memberships: Vec<Membership> = asset_ids
            .iter()
            .map(|asset_id| Membership::from_rule(&rule.data_product_id, asset_id, &rule.id))
            .collect();

        if !memberships.is_empty() {
            if let Err(e) = self.memberships.create_memberships(&memberships).await {
                metrics::record_rule_evaluation("full", "error");
                return Err(e);
            }
        }

        metrics::record_rule_evaluation("full", "success");
        info!(
            product_id = %rule.data_product_id,
            matched = memberships.len(),
            "规则全量评估完成"
        );
        Ok(memberships.len())
    }

    /// 增量评估单个资产，返回写入的成员关系数
    ///
    /// 单个候选规则失败只记录 debug 日志并跳过，不影响其他候选。
    async fn evaluate_asset(&self, asset: &Asset) -> Result<usize> {
        let signature = AssetSignature::from_asset(asset);
        let candidates = self.memberships.find_candidate_rules(&signature).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut matched = Vec::new();
        for candidate in &candidates {
            let rule = match self.products.get_rule(&candidate.rule_id).await {
                Ok(rule) => rule,
                Err(e) => {
                    debug!(rule_id = %candidate.rule_id, asset_id = %asset.id, error = %e, "获取候选规则失败，跳过");
                    continue;
                }
            };
            if !rule.is_enabled {
                continue;
            }

            match self.rule_matches(&rule, asset).await {
                Ok(true) => matched.push(Membership::from_rule(
                    &rule.data_product_id,
                    &asset.id,
                    &rule.id,
                )),
                Ok(false) => {}
                Err(e) => {
                    debug!(rule_id = %rule.id, asset_id = %asset.id, error = %e, "候选规则评估失败，跳过");
                }
            }
        }

        if !matched.is_empty() {
            self.memberships.create_memberships(&matched).await?;
        }

        debug!(
            asset_id = %asset.id,
            candidates = candidates.len(),
            matched = matched.len(),
            "资产增量评估完成"
        );
        Ok(matched.len())
    }

    /// 元数据规则在内存中求值；查询规则和正则模式交给仓储层按单资产范围求值
    async fn rule_matches(&self, rule: &Rule, asset: &Asset) -> Result<bool> {
        match &rule.spec {
            RuleSpec::MetadataMatch { pattern_type, .. } if *pattern_type != PatternType::Regex => {
                Ok(matcher::matches(rule, asset))
            }
            _ => self.memberships.evaluate_rule_for_asset(rule, &asset.id).await,
        }
    }

    /// 对账：逐个数据产品、逐条规则先删后评估
    async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let started = Instant::now();
        let mut report = ReconcileReport::default();

        let list = match self.products.list(0, self.max_reconcile_products).await {
            Ok(list) => list,
            Err(e) => {
                metrics::record_reconciliation("error", started.elapsed().as_secs_f64());
                return Err(e);
            }
        };
        if list.total > self.max_reconcile_products {
            warn!(
                total = list.total,
                limit = self.max_reconcile_products,
                "数据产品数量超过单次对账上限，超出部分留待下次"
            );
        }

        for product in &list.data_products {
            if self.is_stopping() {
                warn!(processed = report.products, "引擎停止中，提前结束对账");
                break;
            }

            let rules = match self.products.get_rules(&product.id).await {
                Ok(rules) => rules,
                Err(e) => {
                    error!(product_id = %product.id, error = %e, "获取数据产品规则失败");
                    continue;
                }
            };

            for rule in &rules {
                if let Err(e) = self.memberships.delete_memberships_by_rule(&rule.id).await {
                    error!(rule_id = %rule.id, error = %e, "对账删除成员关系失败");
                    report.rules_failed += 1;
                    continue;
                }
                if !rule.is_enabled {
                    report.rules_cleared += 1;
                    continue;
                }

                match self.evaluate_rule(&rule.id).await {
                    Ok(_) => report.rules_evaluated += 1,
                    Err(e) => {
                        error!(rule_id = %rule.id, error = %e, "对账评估规则失败");
                        report.rules_failed += 1;
                    }
                }
            }

            report.products += 1;
        }

        report.duration = started.elapsed();
        let status = if report.rules_failed == 0 { "success" } else { "partial" };
        metrics::record_reconciliation(status, report.duration.as_secs_f64());

        info!(
            products = report.products,
            rules_evaluated = report.rules_evaluated,
            rules_failed = report.rules_failed,
            rules_cleared = report.rules_cleared,
            duration_ms = report.duration.as_millis() as u64,
            "成员关系对账完成"
        );
        Ok(report)
    }
}

#[async_trait]
impl BatchHandler<Asset> for EngineCore {
    async fn handle_batch(&self, assets: Vec<Asset>) -> anyhow::Result<()> {
        let total = assets.len();
        let results: Vec<(String, Result<usize>)> = futures::stream::iter(assets)
            .map(|asset| async move {
                let result = self.evaluate_asset(&asset).await;
                (asset.id, result)
            })
            .buffer_unordered(self.batch_concurrency)
            .collect()
            .await;

        let mut failed = 0;
        for (asset_id, result) in results {
            match result {
                Ok(_) => metrics::record_rule_evaluation("incremental", "success"),
                Err(e) => {
                    failed += 1;
                    metrics::record_rule_evaluation("incremental", "error");
                    error!(asset_id = %asset_id, error = %e, "资产增量评估失败");
                }
            }
        }

        if failed > 0 {
            warn!(total, failed, "资产批次部分失败，等待对账修复");
        }
        Ok(())
    }
}

/// 单条规则的全量评估任务
struct RuleEvaluationJob {
    core: Arc<EngineCore>,
    rule_id: String,
}

#[async_trait]
impl Job for RuleEvaluationJob {
    fn id(&self) -> String {
        format!("rule-eval:{}", self.rule_id)
    }

    /// 引擎停止信号先于工作池停止，收到后立即放弃评估，由对账补齐
    async fn execute(&self) -> anyhow::Result<()> {
        let mut shutdown = self.core.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            anyhow::bail!("引擎正在停止，放弃规则 {} 的全量评估", self.rule_id);
        }

        tokio::select! {
            result = self.core.evaluate_rule(&self.rule_id) => {
                result?;
                Ok(())
            }
            _ = shutdown.wait_for(|stopping| *stopping) => {
                anyhow::bail!("引擎正在停止，中断规则 {} 的全量评估", self.rule_id)
            }
        }
    }
}

/// 成员关系引擎
///
/// 持有自己的工作池和批处理器，所有协作方都通过构造函数注入。
pub struct MembershipEngine {
    core: Arc<EngineCore>,
    pool_config: PoolConfig,
    pool: WorkerPool,
    batcher: BatchProcessor<Asset>,
    assets: Arc<dyn AssetGetter>,
}

impl MembershipEngine {
    pub fn new(
        products: Arc<dyn DataProductRepository>,
        memberships: Arc<dyn MembershipRepository>,
        assets: Arc<dyn AssetGetter>,
        query: Arc<dyn QueryEvaluator>,
        config: &MembershipConfig,
    ) -> Self {
        let config = config.clone().normalized();
        let (shutdown, _) = watch::channel(false);

        let core = Arc::new(EngineCore {
            products,
            memberships,
            query,
            max_reconcile_products: config.max_reconcile_products,
            batch_concurrency: config.max_workers,
            shutdown,
        });

        let pool_config = PoolConfig::new(POOL_NAME)
            .with_max_workers(config.max_workers)
            .with_queue_size(config.queue_size)
            .with_submit_timeout(config.submit_timeout());
        let pool = WorkerPool::with_observer(
            pool_config.clone(),
            Arc::new(LogObserver::new(POOL_NAME)),
        );

        let handler: Arc<dyn BatchHandler<Asset>> = core.clone();
        let batcher = BatchProcessor::new(
            BatchConfig::new(PROCESSOR_NAME, config.batch_size, config.flush_interval()),
            handler,
        );

        Self {
            core,
            pool_config,
            pool,
            batcher,
            assets,
        }
    }

    /// 替换全量评估任务的完成观察者，需在 [`start`](Self::start) 之前调用
    pub fn with_job_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.pool = WorkerPool::with_observer(self.pool_config.clone(), observer);
        self
    }

    pub fn start(&self) {
        self.pool.start();
        self.batcher.start();
        info!("成员关系引擎已启动");
    }

    /// 先广播停止信号让进行中的全量评估退出，再排空批处理器，最后停止工作池
    pub async fn stop(&self) {
        self.core.shutdown.send_replace(true);
        self.batcher.stop().await;
        self.pool.stop().await;
        info!("成员关系引擎已停止");
    }

    /// 重新加载资产并排队做增量评估
    ///
    /// 只会新增成员关系；不再命中的旧关系由对账清理。
    pub async fn refresh_asset(&self, asset_id: &str) -> Result<()> {
        let asset = self.assets.get(asset_id).await?;
        self.on_asset_created(&asset).await
    }

    /// 等待已缓冲的资产全部评估完成
    pub async fn flush_pending(&self) -> Result<()> {
        self.batcher.flush().await?;
        Ok(())
    }

    /// 同步全量评估一条规则
    pub async fn evaluate_rule(&self, rule_id: &str) -> Result<usize> {
        self.core.evaluate_rule(rule_id).await
    }

    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        self.core.reconcile_all().await
    }

    /// 排队失败只记录日志
    async fn queue_evaluation(&self, rule: &Rule) {
        if !rule.is_enabled {
            return;
        }

        let job = RuleEvaluationJob {
            core: self.core.clone(),
            rule_id: rule.id.clone(),
        };
        match self.pool.submit(job).await {
            Ok(()) => debug!(rule_id = %rule.id, "规则评估任务已排队"),
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "规则评估任务排队失败，等待对账修复");
            }
        }
    }

    async fn save_targets(&self, rule: &Rule) -> Result<()> {
        let targets = extract_rule_targets(rule, self.core.query.as_ref());
        self.core
            .memberships
            .save_rule_targets(&rule.id, &rule.data_product_id, &targets)
            .await
    }
}

#[async_trait]
impl RuleObserver for MembershipEngine {
    async fn on_rule_created(&self, rule: &Rule) -> Result<()> {
        self.save_targets(rule).await?;
        self.queue_evaluation(rule).await;
        Ok(())
    }

    async fn on_rule_updated(&self, rule: &Rule) -> Result<()> {
        let removed = self.core.memberships.delete_memberships_by_rule(&rule.id).await?;
        debug!(rule_id = %rule.id, removed, "规则更新，已清除旧成员关系");

        self.save_targets(rule).await?;
        self.queue_evaluation(rule).await;
        Ok(())
    }

    async fn on_rule_deleted(&self, rule_id: &str) -> Result<()> {
        let removed = self.core.memberships.delete_memberships_by_rule(rule_id).await?;
        self.core.memberships.delete_rule_targets(rule_id).await?;
        debug!(rule_id = %rule_id, removed, "规则删除，已清除成员关系");
        Ok(())
    }
}

#[async_trait]
impl AssetObserver for MembershipEngine {
    async fn on_asset_created(&self, asset: &Asset) -> Result<()> {
        if asset.is_stub {
            return Ok(());
        }
        self.batcher.add(asset.clone())?;
        Ok(())
    }

    async fn on_asset_deleted(&self, asset_id: &str) -> Result<()> {
        let removed = self.core.memberships.delete_memberships_by_asset(asset_id).await?;
        debug!(asset_id = %asset_id, removed, "资产删除，已清除成员关系");
        Ok(())
    }
}
