//! 数据产品服务
//!
//! 数据产品与规则的增删改查。规则写入成功后同步通知已注册的 [`RuleObserver`]，
//! 通知失败只记录警告，不影响调用结果，遗漏的评估由对账补齐。

pub mod validation;

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::error::{DataProductError, Result};
use crate::models::{
    AssetsResult, CreateDataProductInput, DataProduct, ListResult, MembershipPage, NewDataProduct,
    Rule, RuleInput, RulePreview,
};
use crate::observer::RuleObserver;
use crate::query::QueryEvaluator;
use crate::repository::{DataProductRepository, MembershipRepository};

pub use validation::{MAX_RULES_PER_PRODUCT, validate_rule};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 100;

/// 分页参数归一化：limit 非正取默认值、超上限截断，offset 不小于 0
fn page(offset: i64, limit: i64) -> (i64, i64) {
    let limit = if limit <= 0 {
        DEFAULT_LIMIT
    } else {
        limit.min(MAX_LIMIT)
    };
    (offset.max(0), limit)
}

pub struct DataProductService {
    products: Arc<dyn DataProductRepository>,
    memberships: Arc<dyn MembershipRepository>,
    query: Arc<dyn QueryEvaluator>,
    rule_observer: RwLock<Option<Arc<dyn RuleObserver>>>,
}

impl DataProductService {
    pub fn new(
        products: Arc<dyn DataProductRepository>,
        memberships: Arc<dyn MembershipRepository>,
        query: Arc<dyn QueryEvaluator>,
    ) -> Self {
        Self {
            products,
            memberships,
            query,
            rule_observer: RwLock::new(None),
        }
    }

    /// 注册规则变更观察者（通常是成员关系引擎）
    pub async fn set_rule_observer(&self, observer: Arc<dyn RuleObserver>) {
        *self.rule_observer.write().await = Some(observer);
        info!("规则观察者已注册");
    }

    async fn observer(&self) -> Option<Arc<dyn RuleObserver>> {
        self.rule_observer.read().await.clone()
    }

    async fn notify_created(&self, rule: &Rule) {
        if let Some(observer) = self.observer().await {
            if let Err(e) = observer.on_rule_created(rule).await {
                warn!(rule_id = %rule.id, error = %e, "规则创建通知失败，等待对账修复");
            }
        }
    }

    /// 创建数据产品，可同时内联创建规则
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create(&self, input: CreateDataProductInput) -> Result<DataProduct> {
        input
            .validate()
            .map_err(|e| DataProductError::InvalidInput(e.to_string()))?;

        if input.rules.len() > MAX_RULES_PER_PRODUCT {
            return Err(DataProductError::TooManyRules {
                max: MAX_RULES_PER_PRODUCT,
            });
        }

        let rules = input
            .rules
            .iter()
            .map(|rule| validate_rule(rule, self.query.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let product = self
            .products
            .create(NewDataProduct {
                name: input.name.trim().to_string(),
                description: input.description,
                metadata: input.metadata,
                tags: input.tags,
                owners: input.owners,
                rules,
                created_by: input.created_by,
            })
            .await?;

        for rule in &product.rules {
            self.notify_created(rule).await;
        }

        info!(product_id = %product.id, rules = product.rules.len(), "数据产品已创建");
        Ok(product)
    }

    pub async fn get(&self, id: &str) -> Result<DataProduct> {
        self.products.get(id).await
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<ListResult> {
        let (offset, limit) = page(offset, limit);
        self.products.list(offset, limit).await
    }

    /// 删除数据产品及其全部成员关系
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.products.get(id).await?;

        let removed = self.memberships.delete_memberships_by_data_product(id).await?;
        self.products.delete(id).await?;

        info!(product_id = %id, removed, "数据产品已删除");
        Ok(())
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_rule(&self, data_product_id: &str, input: RuleInput) -> Result<Rule> {
        let new_rule = validate_rule(&input, self.query.as_ref())?;

        let product = self.products.get(data_product_id).await?;
        if product.rules.len() >= MAX_RULES_PER_PRODUCT {
            return Err(DataProductError::TooManyRules {
                max: MAX_RULES_PER_PRODUCT,
            });
        }

        let rule = self.products.create_rule(data_product_id, new_rule).await?;
        self.notify_created(&rule).await;

        info!(rule_id = %rule.id, product_id = %data_product_id, "规则已创建");
        Ok(rule)
    }

    #[instrument(skip(self, input))]
    pub async fn update_rule(&self, rule_id: &str, input: RuleInput) -> Result<Rule> {
        let new_rule = validate_rule(&input, self.query.as_ref())?;
        let rule = self.products.update_rule(rule_id, new_rule).await?;

        if let Some(observer) = self.observer().await {
            if let Err(e) = observer.on_rule_updated(&rule).await {
                warn!(rule_id = %rule.id, error = %e, "规则更新通知失败，等待对账修复");
            }
        }

        info!(rule_id = %rule.id, "规则已更新");
        Ok(rule)
    }

    /// 先清理规则的成员关系再删除规则行
    #[instrument(skip(self))]
    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        if let Some(observer) = self.observer().await {
            if let Err(e) = observer.on_rule_deleted(rule_id).await {
                warn!(rule_id = %rule_id, error = %e, "规则删除通知失败");
            }
        }

        self.products.delete_rule(rule_id).await?;
        info!(rule_id = %rule_id, "规则已删除");
        Ok(())
    }

    pub async fn get_rules(&self, data_product_id: &str) -> Result<Vec<Rule>> {
        self.products.get(data_product_id).await?;
        self.products.get_rules(data_product_id).await
    }

    /// 预览规则命中的资产
    ///
    /// 校验或执行失败都放在返回值的 `errors` 中，而不是作为错误返回。
    pub async fn preview_rule(&self, input: RuleInput, limit: i64) -> Result<RulePreview> {
        let new_rule = match validate_rule(&input, self.query.as_ref()) {
            Ok(rule) => rule,
            Err(e) => {
                return Ok(RulePreview {
                    errors: vec![e.to_string()],
                    ..Default::default()
                });
            }
        };

        let (_, limit) = page(0, limit);
        match self.products.preview_rule(&new_rule.spec, limit).await {
            Ok(preview) => Ok(preview),
            Err(e @ (DataProductError::Query(_) | DataProductError::InvalidInput(_))) => {
                Ok(RulePreview {
                    errors: vec![e.to_string()],
                    ..Default::default()
                })
            }
            Err(e) => Err(e),
        }
    }

    /// 人工添加资产
    pub async fn add_assets(
        &self,
        data_product_id: &str,
        asset_ids: &[String],
        created_by: Option<String>,
    ) -> Result<()> {
        if asset_ids.is_empty() {
            return Err(DataProductError::InvalidInput(
                "至少需要一个资产 ID".to_string(),
            ));
        }
        self.products.get(data_product_id).await?;
        self.products
            .add_assets(data_product_id, asset_ids, created_by)
            .await?;
        if let Err(e) = self.memberships.update_membership_stats(data_product_id).await {
            warn!(product_id = %data_product_id, error = %e, "更新成员关系统计失败");
        }
        Ok(())
    }

    /// 移除人工添加的资产，规则产生的成员关系不受影响
    pub async fn remove_asset(&self, data_product_id: &str, asset_id: &str) -> Result<()> {
        self.products.get(data_product_id).await?;
        self.products.remove_asset(data_product_id, asset_id).await?;
        if let Err(e) = self.memberships.update_membership_stats(data_product_id).await {
            warn!(product_id = %data_product_id, error = %e, "更新成员关系统计失败");
        }
        Ok(())
    }

    pub async fn get_manual_assets(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<AssetsResult> {
        self.products.get(data_product_id).await?;
        let (offset, limit) = page(offset, limit);
        self.products
            .get_manual_assets(data_product_id, limit, offset)
            .await
    }

    /// 数据产品的全部成员关系（人工与规则）
    pub async fn get_memberships(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<MembershipPage> {
        self.products.get(data_product_id).await?;
        let (offset, limit) = page(offset, limit);
        self.memberships
            .get_memberships(data_product_id, limit, offset)
            .await
    }

    /// 资产所属的数据产品，期间被删除的数据产品跳过
    pub async fn get_data_products_for_asset(&self, asset_id: &str) -> Result<Vec<DataProduct>> {
        let ids = self.memberships.get_data_products_for_asset(asset_id).await?;

        let mut products = Vec::with_capacity(ids.len());
        for id in ids {
            match self.products.get(&id).await {
                Ok(product) => products.push(product),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OwnerInput, PatternType, RuleSpec};
    use crate::observer::MockRuleObserver;
    use crate::query::{MockQueryEvaluator, QueryError};
    use crate::repository::{MockDataProductRepository, MockMembershipRepository};
    use chrono::Utc;

    fn product(id: &str, rules: usize) -> DataProduct {
        DataProduct {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            metadata: Default::default(),
            tags: vec![],
            owners: vec![],
            rules: (0..rules).map(|i| rule(&format!("r-{i}"), id)).collect(),
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            asset_count: 0,
            manual_asset_count: 0,
            rule_asset_count: 0,
        }
    }

    fn rule(id: &str, product_id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            data_product_id: product_id.to_string(),
            name: id.to_string(),
            description: None,
            spec: RuleSpec::MetadataMatch {
                field: "owner".to_string(),
                pattern_type: PatternType::Exact,
                pattern_value: "core".to_string(),
            },
            priority: 0,
            is_enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            matched_asset_count: None,
        }
    }

    fn accepting_query() -> MockQueryEvaluator {
        let mut evaluator = MockQueryEvaluator::new();
        evaluator.expect_parse().returning(|_| Ok(Default::default()));
        evaluator
    }

    fn service(
        products: MockDataProductRepository,
        memberships: MockMembershipRepository,
    ) -> DataProductService {
        DataProductService::new(
            Arc::new(products),
            Arc::new(memberships),
            Arc::new(accepting_query()),
        )
    }

    fn create_input(rules: Vec<RuleInput>) -> CreateDataProductInput {
        CreateDataProductInput {
            name: "Payments".to_string(),
            owners: vec![OwnerInput {
                id: "u-1".to_string(),
                owner_type: "user".to_string(),
            }],
            rules,
            ..Default::default()
        }
    }

    #[test]
    fn test_page_normalization() {
        assert_eq!(page(-5, 0), (0, DEFAULT_LIMIT));
        assert_eq!(page(10, 1000), (10, MAX_LIMIT));
        assert_eq!(page(3, 20), (3, 20));
    }

    #[tokio::test]
    async fn test_create_notifies_observer_per_rule() {
        let mut products = MockDataProductRepository::new();
        products
            .expect_create()
            .withf(|p| p.name == "Payments" && p.rules.len() == 2)
            .returning(|_| Ok(product("dp-1", 2)));

        let mut observer = MockRuleObserver::new();
        observer.expect_on_rule_created().times(2).returning(|_| Ok(()));

        let service = service(products, MockMembershipRepository::new());
        service.set_rule_observer(Arc::new(observer)).await;

        let created = service
            .create(create_input(vec![
                RuleInput::query("a", "type:table"),
                RuleInput::metadata_match("b", "owner", PatternType::Exact, "core"),
            ]))
            .await
            .unwrap();
        assert_eq!(created.id, "dp-1");
    }

    #[tokio::test]
    async fn test_create_rejects_too_many_rules() {
        let mut products = MockDataProductRepository::new();
        products.expect_create().never();

        let rules = (0..=MAX_RULES_PER_PRODUCT)
            .map(|i| RuleInput::query(format!("r-{i}"), "type:table"))
            .collect();
        let err = service(products, MockMembershipRepository::new())
            .create(create_input(rules))
            .await
            .unwrap_err();
        assert!(matches!(err, DataProductError::TooManyRules { max: 10 }));
    }

    #[tokio::test]
    async fn test_create_rule_enforces_limit() {
        let mut products = MockDataProductRepository::new();
        products
            .expect_get()
            .returning(|id| Ok(product(id, MAX_RULES_PER_PRODUCT)));
        products.expect_create_rule().never();

        let err = service(products, MockMembershipRepository::new())
            .create_rule("dp-1", RuleInput::query("extra", "type:table"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TOO_MANY_RULES");
    }

    #[tokio::test]
    async fn test_create_rule_invalid_syntax_is_rejected_before_write() {
        let mut query = MockQueryEvaluator::new();
        query
            .expect_parse()
            .returning(|_| Err(QueryError::Parse("bad".to_string())));

        let mut products = MockDataProductRepository::new();
        products.expect_get().never();
        products.expect_create_rule().never();

        let service = DataProductService::new(
            Arc::new(products),
            Arc::new(MockMembershipRepository::new()),
            Arc::new(query),
        );
        let err = service
            .create_rule("dp-1", RuleInput::query("bad", "type:("))
            .await
            .unwrap_err();
        assert!(matches!(err, DataProductError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_observer_failure_does_not_fail_rule_write() {
        let mut products = MockDataProductRepository::new();
        products.expect_get().returning(|id| Ok(product(id, 0)));
        products
            .expect_create_rule()
            .returning(|product_id, _| Ok(rule("r-new", product_id)));

        let mut observer = MockRuleObserver::new();
        observer
            .expect_on_rule_created()
            .returning(|_| Err(DataProductError::Internal("targets down".to_string())));

        let service = service(products, MockMembershipRepository::new());
        service.set_rule_observer(Arc::new(observer)).await;

        let created = service
            .create_rule("dp-1", RuleInput::query("new", "type:table"))
            .await
            .unwrap();
        assert_eq!(created.id, "r-new");
    }

    #[tokio::test]
    async fn test_update_rule_notifies_observer() {
        let mut products = MockDataProductRepository::new();
        products
            .expect_update_rule()
            .returning(|rule_id, _| Ok(rule(rule_id, "dp-1")));

        let mut observer = MockRuleObserver::new();
        observer
            .expect_on_rule_updated()
            .withf(|rule| rule.id == "r-1")
            .times(1)
            .returning(|_| Ok(()));

        let service = service(products, MockMembershipRepository::new());
        service.set_rule_observer(Arc::new(observer)).await;
        service
            .update_rule("r-1", RuleInput::query("renamed", "type:table"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_rule_missing_is_typed_error() {
        let mut products = MockDataProductRepository::new();
        products
            .expect_delete_rule()
            .returning(|id| Err(DataProductError::RuleNotFound(id.to_string())));

        let err = service(products, MockMembershipRepository::new())
            .delete_rule("r-404")
            .await
            .unwrap_err();
        assert!(matches!(err, DataProductError::RuleNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_clears_memberships() {
        let mut products = MockDataProductRepository::new();
        products.expect_get().returning(|id| Ok(product(id, 0)));
        products.expect_delete().times(1).returning(|_| Ok(()));

        let mut memberships = MockMembershipRepository::new();
        memberships
            .expect_delete_memberships_by_data_product()
            .withf(|id| id == "dp-1")
            .times(1)
            .returning(|_| Ok(7));

        service(products, memberships).delete("dp-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_preview_returns_validation_errors_inline() {
        let mut products = MockDataProductRepository::new();
        products.expect_preview_rule().never();

        let input = RuleInput::metadata_match("bad", "owner", PatternType::Regex, "(");
        let preview = service(products, MockMembershipRepository::new())
            .preview_rule(input, 10)
            .await
            .unwrap();

        assert!(preview.asset_ids.is_empty());
        assert_eq!(preview.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_preview_clamps_limit() {
        let mut products = MockDataProductRepository::new();
        products
            .expect_preview_rule()
            .withf(|_, limit| *limit == MAX_LIMIT)
            .returning(|_, _| {
                Ok(RulePreview {
                    asset_ids: vec!["a-1".to_string()],
                    asset_count: 1,
                    errors: vec![],
                })
            });

        let preview = service(products, MockMembershipRepository::new())
            .preview_rule(RuleInput::query("p", "type:table"), 10_000)
            .await
            .unwrap();
        assert_eq!(preview.asset_count, 1);
    }

    #[tokio::test]
    async fn test_add_assets_requires_ids() {
        let err = service(MockDataProductRepository::new(), MockMembershipRepository::new())
            .add_assets("dp-1", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DataProductError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_products_for_asset_skips_deleted() {
        let mut products = MockDataProductRepository::new();
        products.expect_get().returning(|id| match id {
            "dp-gone" => Err(DataProductError::NotFound(id.to_string())),
            _ => Ok(product(id, 0)),
        });

        let mut memberships = MockMembershipRepository::new();
        memberships
            .expect_get_data_products_for_asset()
            .returning(|_| Ok(vec!["dp-1".to_string(), "dp-gone".to_string()]));

        let found = service(products, memberships)
            .get_data_products_for_asset("a-1")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "dp-1");
    }
}
