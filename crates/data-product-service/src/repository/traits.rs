//! 仓储层 trait 定义
//!
//! 定义数据访问的抽象接口，便于服务层依赖注入和单元测试 mock。

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Asset, AssetSignature, AssetsResult, CandidateRule, DataProduct, ListResult, Membership,
    MembershipPage, NewDataProduct, NewRule, Rule, RulePreview, RuleSpec, RuleTarget,
};

/// 数据产品与规则仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataProductRepository: Send + Sync {
    async fn create(&self, product: NewDataProduct) -> Result<DataProduct>;

    /// 不存在时返回 `NotFound`
    async fn get(&self, id: &str) -> Result<DataProduct>;

    async fn list(&self, offset: i64, limit: i64) -> Result<ListResult>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn create_rule(&self, data_product_id: &str, rule: NewRule) -> Result<Rule>;

    async fn update_rule(&self, rule_id: &str, rule: NewRule) -> Result<Rule>;

    async fn delete_rule(&self, rule_id: &str) -> Result<()>;

    /// 不存在时返回 `RuleNotFound`
    async fn get_rule(&self, rule_id: &str) -> Result<Rule>;

    /// 按 priority 升序
    async fn get_rules(&self, data_product_id: &str) -> Result<Vec<Rule>>;

    /// 对全部非占位资产执行规则，返回命中的资产 ID
    async fn execute_rule(&self, rule: &Rule) -> Result<Vec<String>>;

    async fn preview_rule(&self, spec: &RuleSpec, limit: i64) -> Result<RulePreview>;

    /// 人工添加成员，已存在的忽略
    async fn add_assets(
        &self,
        data_product_id: &str,
        asset_ids: &[String],
        created_by: Option<String>,
    ) -> Result<()>;

    async fn remove_asset(&self, data_product_id: &str, asset_id: &str) -> Result<()>;

    async fn get_manual_assets(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<AssetsResult>;
}

/// 成员关系与候选索引仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipRepository: Send + Sync {
    /// 批量写入，重复的忽略
    async fn create_memberships(&self, memberships: &[Membership]) -> Result<()>;

    async fn delete_memberships_by_asset(&self, asset_id: &str) -> Result<u64>;

    async fn delete_memberships_by_rule(&self, rule_id: &str) -> Result<u64>;

    async fn delete_memberships_by_data_product(&self, data_product_id: &str) -> Result<u64>;

    async fn get_memberships(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<MembershipPage>;

    async fn get_data_products_for_asset(&self, asset_id: &str) -> Result<Vec<String>>;

    /// 整体替换规则的索引键
    async fn save_rule_targets(
        &self,
        rule_id: &str,
        data_product_id: &str,
        targets: &[RuleTarget],
    ) -> Result<()>;

    async fn delete_rule_targets(&self, rule_id: &str) -> Result<()>;

    /// 启用规则中索引键与签名相交的，加上全部兜底规则
    async fn find_candidate_rules(&self, signature: &AssetSignature) -> Result<Vec<CandidateRule>>;

    /// 在单个资产范围内求值规则
    async fn evaluate_rule_for_asset(&self, rule: &Rule, asset_id: &str) -> Result<bool>;

    async fn update_membership_stats(&self, data_product_id: &str) -> Result<()>;
}

/// 资产只读访问
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetGetter: Send + Sync {
    /// 不存在时返回 `AssetNotFound`
    async fn get(&self, asset_id: &str) -> Result<Asset>;
}
