//! 变更通知接口
//!
//! 数据产品服务在规则事务提交后调用 [`RuleObserver`]，资产服务在资产写入后调用
//! [`AssetObserver`]。成员关系引擎同时实现两者。

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Asset, Rule};

/// 规则变更通知
///
/// 只有规则簿记（索引键、已有成员关系）的写入失败才返回错误；
/// 评估任务排队失败由实现方记录日志后吞掉，由对账兜底。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleObserver: Send + Sync {
    async fn on_rule_created(&self, rule: &Rule) -> Result<()>;

    async fn on_rule_updated(&self, rule: &Rule) -> Result<()>;

    async fn on_rule_deleted(&self, rule_id: &str) -> Result<()>;
}

/// 资产变更通知
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetObserver: Send + Sync {
    /// 不阻塞调用方，只负责排队
    async fn on_asset_created(&self, asset: &Asset) -> Result<()>;

    /// 同步删除该资产的全部成员关系
    async fn on_asset_deleted(&self, asset_id: &str) -> Result<()>;
}
