//! 数据库仓储层
//!
//! 服务层和成员关系引擎只依赖 [`traits`] 中的接口，PostgreSQL 实现位于各 `*_repo` 模块。
//!
//! ## 设计原则
//!
//! - 仓储只负责数据持久化，不包含业务逻辑
//! - 规则条件统一编译成作用于资产表的 SQL 片段（见 [`predicate`]）
//! - 候选规则索引驻留在数据库中，进程内不做缓存

mod asset_getter;
mod data_product_repo;
mod membership_repo;
pub mod predicate;
mod traits;

pub use asset_getter::PgAssetGetter;
pub use data_product_repo::PgDataProductRepository;
pub use membership_repo::PgMembershipRepository;
pub use traits::*;
