//! 运行时装配
//!
//! 按 [`AppConfig`] 连接数据库、执行迁移，组装服务层、成员关系引擎与周期对账。
//! 查询语言由宿主进程提供，通过 [`QueryEvaluator`] 注入。

use std::sync::Arc;

use catalog_shared::config::AppConfig;
use catalog_shared::database::Database;
use catalog_shared::observability::{self, ObservabilityGuard};
use sqlx::migrate::Migrator;
use tracing::{info, warn};

use crate::membership::{MembershipEngine, Reconciler};
use crate::query::QueryEvaluator;
use crate::repository::{PgAssetGetter, PgDataProductRepository, PgMembershipRepository};
use crate::service::DataProductService;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub struct DataProductRuntime {
    database: Database,
    service: Arc<DataProductService>,
    engine: Arc<MembershipEngine>,
    reconciler: Option<Reconciler>,
    _observability: ObservabilityGuard,
}

impl DataProductRuntime {
    pub async fn start(config: &AppConfig, query: Arc<dyn QueryEvaluator>) -> anyhow::Result<Self> {
        // 指标端口被占用或宿主已装 recorder 时不导出指标
        let observability =
            match observability::init(&config.service_name, &config.observability).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "跳过可观测性初始化");
                    ObservabilityGuard::empty()
                }
            };

        info!(environment = %config.environment, "正在启动数据产品服务");

        let database = Database::connect(&config.database).await?;
        database.run_migrations(&MIGRATOR).await?;

        let pool = database.pool().clone();
        let products = Arc::new(PgDataProductRepository::new(pool.clone(), query.clone()));
        let memberships = Arc::new(PgMembershipRepository::new(pool.clone(), query.clone()));
        let assets = Arc::new(PgAssetGetter::new(pool));

        let engine = Arc::new(MembershipEngine::new(
            products.clone(),
            memberships.clone(),
            assets,
            query.clone(),
            &config.membership,
        ));
        engine.start();

        let service = Arc::new(DataProductService::new(products, memberships, query));
        service.set_rule_observer(engine.clone()).await;

        let reconciler = if config.reconciler.enabled {
            let reconciler = Reconciler::from_config(engine.clone(), &config.reconciler);
            reconciler.start();
            Some(reconciler)
        } else {
            info!("周期对账已禁用");
            None
        };

        info!("数据产品服务已启动");
        Ok(Self {
            database,
            service,
            engine,
            reconciler,
            _observability: observability,
        })
    }

    pub fn service(&self) -> Arc<DataProductService> {
        self.service.clone()
    }

    /// 资产服务通过它发送资产变更通知
    pub fn engine(&self) -> Arc<MembershipEngine> {
        self.engine.clone()
    }

    pub fn reconciler(&self) -> Option<&Reconciler> {
        self.reconciler.as_ref()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// 先停引擎让进行中的对账提前结束，再停对账任务，最后关闭连接池
    pub async fn shutdown(&self) {
        self.engine.stop().await;
        if let Some(reconciler) = &self.reconciler {
            reconciler.stop().await;
        }
        self.database.close().await;
        info!("数据产品服务已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StaticQueryEvaluator;

    #[tokio::test]
    #[ignore = "需要 PostgreSQL，设置 TEST_DATABASE_URL 后运行"]
    async fn test_runtime_start_and_shutdown() {
        let mut config = AppConfig::default();
        config.database.url = std::env::var("TEST_DATABASE_URL").unwrap();
        config.observability.metrics_enabled = false;
        config.reconciler.enabled = false;

        let runtime = DataProductRuntime::start(&config, Arc::new(StaticQueryEvaluator))
            .await
            .unwrap();
        runtime.database().health_check().await.unwrap();

        let listed = runtime.service().list(0, 10).await.unwrap();
        assert!(listed.total >= 0);
        assert!(runtime.reconciler().is_none());

        runtime.shutdown().await;
    }
}
