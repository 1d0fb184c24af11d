//! 数据产品服务
//!
//! 数据产品是资产的具名分组。资产可以人工加入，也可以由规则自动纳入；
//! 本 crate 负责数据产品与规则的管理，以及让"资产属于哪些数据产品"这张表保持一致。
//!
//! ## 核心功能
//!
//! - **数据产品管理**：创建、查询、删除数据产品，人工维护成员资产
//! - **规则管理**：查询规则与元数据匹配规则的增删改与预览
//! - **增量评估**：新资产按候选规则批量评估，只插入不删除
//! - **全量评估**：规则创建/更新后在工作池中重新计算成员关系
//! - **周期对账**：逐条规则先删后评估，修复漂移
//!
//! ## 模块结构
//!
//! - `models`: 领域模型定义
//! - `error`: 错误类型定义
//! - `query`: 查询求值器接口
//! - `repository`: 数据库仓储层
//! - `service`: 业务服务层
//! - `membership`: 成员关系引擎与对账
//! - `observer`: 规则与资产变更通知接口
//! - `bootstrap`: 按配置装配运行时
//! - `test_utils`: 内存仓储与测试用查询求值器

pub mod bootstrap;
pub mod error;
pub mod membership;
pub mod models;
pub mod observer;
pub mod query;
pub mod repository;
pub mod service;
pub mod test_utils;

pub use bootstrap::DataProductRuntime;
pub use error::{DataProductError, Result};
pub use membership::{MembershipEngine, ReconcileReport, Reconciler, extract_rule_targets};
pub use models::*;
pub use observer::{AssetObserver, RuleObserver};
pub use query::{ParsedQuery, QueryError, QueryEvaluator, SqlPredicate};
pub use repository::{
    AssetGetter, DataProductRepository, MembershipRepository, PgAssetGetter,
    PgDataProductRepository, PgMembershipRepository,
};
pub use service::DataProductService;
