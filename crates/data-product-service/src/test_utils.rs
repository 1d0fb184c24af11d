//! 测试工具模块
//!
//! 提供不依赖数据库的仓储实现和一个只认识少量语法的查询求值器，
//! 供单元测试和 `tests/` 下的集成测试组装完整的引擎。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use uuid::Uuid;

use crate::error::{DataProductError, Result};
use crate::membership::matcher::{self, resolve_path};
use crate::models::{
    Asset, AssetSignature, AssetsResult, CandidateRule, DataProduct, ListResult, Membership,
    MembershipPage, MembershipSource, NewDataProduct, NewRule, Owner, PatternType, Rule,
    RulePreview, RuleSpec, RuleTarget,
};
use crate::query::{
    BooleanQuery, FieldType, Filter, FilterValue, Operator, ParsedQuery, QueryError,
    QueryEvaluator, SqlParam, SqlPredicate,
};
use crate::repository::{AssetGetter, DataProductRepository, MembershipRepository};

// ==================== 查询求值器 ====================

/// 只支持 `key:value` 词项的查询求值器
///
/// - `type:` / `provider:` / `name:` / `metadata.<path>:` 生成等值条件
/// - 词项之间用空格或 `AND` 连接；出现 `OR` 时所有条件改为 OR 关系
/// - 不含冒号的词作为自由文本，整个表达式只有自由文本时 `bool_query` 为空
/// - 括号、未知字段与空表达式都是解析错误
#[derive(Debug, Clone, Default)]
pub struct StaticQueryEvaluator;

impl StaticQueryEvaluator {
    /// 在内存中判断资产是否满足解析后的查询
    pub fn evaluate(&self, query: &ParsedQuery, asset: &Asset) -> bool {
        if !query.free_text.is_empty() {
            let needle = query.free_text.to_lowercase();
            if !asset.name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        match &query.bool_query {
            Some(bool_query) => evaluate_bool(bool_query, asset),
            None => true,
        }
    }
}

impl QueryEvaluator for StaticQueryEvaluator {
    fn parse(&self, expression: &str) -> std::result::Result<ParsedQuery, QueryError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(QueryError::Parse("表达式为空".to_string()));
        }
        if expression.contains(['(', ')']) {
            return Err(QueryError::Parse(format!("不支持括号: {expression}")));
        }

        let mut filters = Vec::new();
        let mut free_text = Vec::new();
        let mut any_of = false;

        for token in expression.split_whitespace() {
            match token {
                "AND" => continue,
                "OR" => {
                    any_of = true;
                    continue;
                }
                _ => {}
            }

            let Some((key, value)) = token.split_once(':') else {
                free_text.push(token);
                continue;
            };
            if value.is_empty() {
                return Err(QueryError::Parse(format!("缺少取值: {token}")));
            }

            let text = FilterValue::Text(value.to_string());
            let filter = match key {
                "type" => Filter::new(FieldType::AssetType, &[], Operator::Equals, text),
                "provider" => Filter::new(FieldType::Provider, &[], Operator::Equals, text),
                "name" => Filter::new(FieldType::Name, &[], Operator::Equals, text),
                _ => match key.strip_prefix("metadata.") {
                    Some(path) if !path.split('.').any(str::is_empty) => {
                        let path: Vec<&str> = path.split('.').collect();
                        Filter::new(FieldType::Metadata, &path, Operator::Equals, text)
                    }
                    _ => return Err(QueryError::Parse(format!("未知字段: {key}"))),
                },
            };
            filters.push(filter);
        }

        let bool_query = (!filters.is_empty()).then(|| {
            if any_of {
                BooleanQuery {
                    should: filters,
                    ..Default::default()
                }
            } else {
                BooleanQuery {
                    must: filters,
                    ..Default::default()
                }
            }
        });

        Ok(ParsedQuery {
            free_text: free_text.join(" "),
            bool_query,
        })
    }

    fn compile(
        &self,
        query: &ParsedQuery,
        first_param: usize,
    ) -> std::result::Result<SqlPredicate, QueryError> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut next = first_param;

        if !query.free_text.is_empty() {
            clauses.push(format!("a.name ILIKE ${next}"));
            params.push(SqlParam::Text(format!("%{}%", query.free_text)));
            next += 1;
        }

        if let Some(bool_query) = &query.bool_query {
            let (filters, joiner) = if bool_query.should.is_empty() {
                (&bool_query.must, " AND ")
            } else {
                (&bool_query.should, " OR ")
            };

            let mut parts = Vec::new();
            for filter in filters {
                let FilterValue::Text(value) = &filter.value else {
                    return Err(QueryError::Unsupported("只支持文本取值".to_string()));
                };
                let part = match filter.field_type {
                    FieldType::AssetType => format!("a.type = ${next}"),
                    FieldType::Provider => format!("${next} = ANY(a.providers)"),
                    FieldType::Name => format!("a.name = ${next}"),
                    // 路径与取值都走占位符
                    FieldType::Metadata => {
                        params.push(SqlParam::TextArray(filter.field.clone()));
                        next += 1;
                        format!("a.metadata #>> ${} = ${next}", next - 1)
                    }
                    FieldType::Kind => {
                        return Err(QueryError::Unsupported("kind".to_string()));
                    }
                };
                parts.push(part);
                params.push(SqlParam::Text(value.clone()));
                next += 1;
            }
            if !parts.is_empty() {
                clauses.push(format!("({})", parts.join(joiner)));
            }
        }

        let clause = if clauses.is_empty() {
            "TRUE".to_string()
        } else {
            clauses.join(" AND ")
        };
        Ok(SqlPredicate { clause, params })
    }
}

fn evaluate_bool(query: &BooleanQuery, asset: &Asset) -> bool {
    query.must.iter().all(|f| evaluate_filter(f, asset))
        && (query.should.is_empty() || query.should.iter().any(|f| evaluate_filter(f, asset)))
        && !query.must_not.iter().any(|f| evaluate_filter(f, asset))
}

fn evaluate_filter(filter: &Filter, asset: &Asset) -> bool {
    let FilterValue::Text(value) = &filter.value else {
        return false;
    };
    match filter.field_type {
        FieldType::AssetType => asset.asset_type == *value,
        FieldType::Provider => asset.providers.iter().any(|p| p == value),
        FieldType::Name => asset.name == *value,
        FieldType::Metadata => {
            resolve_path(&asset.metadata, &filter.field.join(".")) == Some(value.as_str())
        }
        FieldType::Kind => false,
    }
}

// ==================== 内存仓储 ====================

#[derive(Default)]
struct CatalogState {
    /// 按创建顺序
    products: Vec<DataProduct>,
    rules: HashMap<String, Rule>,
    targets: HashMap<String, Vec<RuleTarget>>,
    memberships: Vec<Membership>,
    assets: HashMap<String, Asset>,
    failing_assets: HashSet<String>,
}

impl CatalogState {
    fn product(&self, id: &str) -> Option<&DataProduct> {
        self.products.iter().find(|p| p.id == id)
    }

    fn rules_of(&self, data_product_id: &str) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .rules
            .values()
            .filter(|r| r.data_product_id == data_product_id)
            .map(|r| self.with_match_count(r.clone()))
            .collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        rules
    }

    fn with_match_count(&self, mut rule: Rule) -> Rule {
        let count = self
            .memberships
            .iter()
            .filter(|m| m.rule_id() == Some(rule.id.as_str()))
            .count();
        rule.matched_asset_count = Some(count as i64);
        rule
    }

    fn hydrate(&self, product: &DataProduct) -> DataProduct {
        let mut product = product.clone();
        product.rules = self.rules_of(&product.id);

        let id = product.id.clone();
        let distinct = |manual: Option<bool>| -> i64 {
            self.memberships
                .iter()
                .filter(|m| m.data_product_id == id)
                .filter(|m| manual.is_none_or(|manual| manual == m.rule_id().is_none()))
                .map(|m| m.asset_id.as_str())
                .collect::<BTreeSet<_>>()
                .len() as i64
        };
        product.asset_count = distinct(None);
        product.manual_asset_count = distinct(Some(true));
        product.rule_asset_count = distinct(Some(false));
        product
    }

    fn insert_rule(&mut self, data_product_id: &str, rule: NewRule) -> Result<Rule> {
        let id = rule.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.rules.contains_key(&id) {
            return Err(DataProductError::Conflict(format!("规则 ID 已存在: {id}")));
        }

        let now = Utc::now();
        let stored = Rule {
            id: id.clone(),
            data_product_id: data_product_id.to_string(),
            name: rule.name,
            description: rule.description,
            spec: rule.spec,
            priority: rule.priority,
            is_enabled: rule.is_enabled,
            created_at: now,
            updated_at: now,
            matched_asset_count: None,
        };
        self.rules.insert(id, stored.clone());
        Ok(stored)
    }

    fn remove_rule(&mut self, rule_id: &str) {
        self.rules.remove(rule_id);
        self.targets.remove(rule_id);
        self.memberships.retain(|m| m.rule_id() != Some(rule_id));
    }

    fn matching_assets(&self, spec: &RuleSpec, query: &StaticQueryEvaluator) -> Result<Vec<String>> {
        let matcher = SpecMatcher::new(spec, query)?;
        let mut ids: Vec<String> = self
            .assets
            .values()
            .filter(|a| !a.is_stub && matcher.matches(a))
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// 规则条件的内存求值，正则在这里预先编译
enum SpecMatcher<'a> {
    Query(ParsedQuery, &'a StaticQueryEvaluator),
    Regex(String, Regex),
    Pattern(Rule),
}

impl<'a> SpecMatcher<'a> {
    fn new(spec: &RuleSpec, query: &'a StaticQueryEvaluator) -> Result<Self> {
        Ok(match spec {
            RuleSpec::Query { expression } => Self::Query(query.parse(expression)?, query),
            RuleSpec::MetadataMatch {
                field,
                pattern_type: PatternType::Regex,
                pattern_value,
            } => {
                let regex = Regex::new(pattern_value)
                    .map_err(|e| DataProductError::InvalidInput(e.to_string()))?;
                Self::Regex(field.clone(), regex)
            }
            RuleSpec::MetadataMatch { .. } => Self::Pattern(Rule {
                id: String::new(),
                data_product_id: String::new(),
                name: String::new(),
                description: None,
                spec: spec.clone(),
                priority: 0,
                is_enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                matched_asset_count: None,
            }),
        })
    }

    fn matches(&self, asset: &Asset) -> bool {
        match self {
            Self::Query(parsed, query) => query.evaluate(parsed, asset),
            Self::Regex(field, regex) => {
                resolve_path(&asset.metadata, field).is_some_and(|v| regex.is_match(v))
            }
            Self::Pattern(rule) => matcher::matches(rule, asset),
        }
    }
}

/// 同时实现三个仓储接口的内存目录
///
/// 资产通过 [`insert_asset`](Self::insert_asset) 直接写入；
/// [`fail_asset`](Self::fail_asset) 让指定资产的候选查找和单资产求值返回错误。
#[derive(Default)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
    query: StaticQueryEvaluator,
    single_asset_evaluations: AtomicUsize,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_asset(&self, asset: Asset) {
        self.state.lock().assets.insert(asset.id.clone(), asset);
    }

    /// 只删除资产行，成员关系需由引擎清理
    pub fn drop_asset(&self, asset_id: &str) {
        self.state.lock().assets.remove(asset_id);
    }

    pub fn fail_asset(&self, asset_id: &str) {
        self.state.lock().failing_assets.insert(asset_id.to_string());
    }

    /// 绕过引擎直接写入成员关系，模拟漂移
    pub fn inject_membership(&self, membership: Membership) {
        self.state.lock().memberships.push(membership);
    }

    /// 数据产品当前的成员资产，去重并排序
    pub fn member_assets(&self, data_product_id: &str) -> Vec<String> {
        self.state
            .lock()
            .memberships
            .iter()
            .filter(|m| m.data_product_id == data_product_id)
            .map(|m| m.asset_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn memberships_of_rule(&self, rule_id: &str) -> Vec<Membership> {
        self.state
            .lock()
            .memberships
            .iter()
            .filter(|m| m.rule_id() == Some(rule_id))
            .cloned()
            .collect()
    }

    pub fn membership_count(&self) -> usize {
        self.state.lock().memberships.len()
    }

    pub fn targets_of(&self, rule_id: &str) -> Option<Vec<RuleTarget>> {
        self.state.lock().targets.get(rule_id).cloned()
    }

    /// `evaluate_rule_for_asset` 被调用的次数
    pub fn single_asset_evaluations(&self) -> usize {
        self.single_asset_evaluations.load(Ordering::SeqCst)
    }

    pub fn query(&self) -> &StaticQueryEvaluator {
        &self.query
    }
}

#[async_trait]
impl DataProductRepository for InMemoryCatalog {
    async fn create(&self, product: NewDataProduct) -> Result<DataProduct> {
        let mut state = self.state.lock();
        if state.products.iter().any(|p| p.name == product.name) {
            return Err(DataProductError::Conflict(format!(
                "数据产品名称已存在: {}",
                product.name
            )));
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        state.products.push(DataProduct {
            id: id.clone(),
            name: product.name,
            description: product.description,
            metadata: product.metadata,
            tags: product.tags,
            owners: product
                .owners
                .into_iter()
                .map(|o| Owner {
                    id: o.id,
                    owner_type: o.owner_type,
                })
                .collect(),
            rules: vec![],
            created_by: product.created_by,
            created_at: now,
            updated_at: now,
            asset_count: 0,
            manual_asset_count: 0,
            rule_asset_count: 0,
        });

        for rule in product.rules {
            if let Err(e) = state.insert_rule(&id, rule) {
                state.products.retain(|p| p.id != id);
                state.rules.retain(|_, r| r.data_product_id != id);
                return Err(e);
            }
        }

        let stored = state
            .product(&id)
            .ok_or_else(|| DataProductError::NotFound(id.clone()))?;
        Ok(state.hydrate(stored))
    }

    async fn get(&self, id: &str) -> Result<DataProduct> {
        let state = self.state.lock();
        state
            .product(id)
            .map(|p| state.hydrate(p))
            .ok_or_else(|| DataProductError::NotFound(id.to_string()))
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<ListResult> {
        let state = self.state.lock();
        let data_products = state
            .products
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|p| state.hydrate(p))
            .collect();
        Ok(ListResult {
            data_products,
            total: state.products.len() as i64,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.product(id).is_none() {
            return Err(DataProductError::NotFound(id.to_string()));
        }

        let rule_ids: Vec<String> = state
            .rules
            .values()
            .filter(|r| r.data_product_id == id)
            .map(|r| r.id.clone())
            .collect();
        for rule_id in &rule_ids {
            state.remove_rule(rule_id);
        }
        state.memberships.retain(|m| m.data_product_id != id);
        state.products.retain(|p| p.id != id);
        Ok(())
    }

    async fn create_rule(&self, data_product_id: &str, rule: NewRule) -> Result<Rule> {
        let mut state = self.state.lock();
        if state.product(data_product_id).is_none() {
            return Err(DataProductError::NotFound(data_product_id.to_string()));
        }
        state.insert_rule(data_product_id, rule)
    }

    async fn update_rule(&self, rule_id: &str, rule: NewRule) -> Result<Rule> {
        let mut state = self.state.lock();
        let stored = state
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| DataProductError::RuleNotFound(rule_id.to_string()))?;

        stored.name = rule.name;
        stored.description = rule.description;
        stored.spec = rule.spec;
        stored.priority = rule.priority;
        stored.is_enabled = rule.is_enabled;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.rules.contains_key(rule_id) {
            return Err(DataProductError::RuleNotFound(rule_id.to_string()));
        }
        state.remove_rule(rule_id);
        Ok(())
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Rule> {
        let state = self.state.lock();
        state
            .rules
            .get(rule_id)
            .map(|r| state.with_match_count(r.clone()))
            .ok_or_else(|| DataProductError::RuleNotFound(rule_id.to_string()))
    }

    async fn get_rules(&self, data_product_id: &str) -> Result<Vec<Rule>> {
        Ok(self.state.lock().rules_of(data_product_id))
    }

    async fn execute_rule(&self, rule: &Rule) -> Result<Vec<String>> {
        self.state.lock().matching_assets(&rule.spec, &self.query)
    }

    async fn preview_rule(&self, spec: &RuleSpec, limit: i64) -> Result<RulePreview> {
        let ids = self.state.lock().matching_assets(spec, &self.query)?;
        Ok(RulePreview {
            asset_count: ids.len() as i64,
            asset_ids: ids.into_iter().take(limit.max(0) as usize).collect(),
            errors: vec![],
        })
    }

    async fn add_assets(
        &self,
        data_product_id: &str,
        asset_ids: &[String],
        _created_by: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for asset_id in asset_ids {
            let exists = state.memberships.iter().any(|m| {
                m.data_product_id == data_product_id
                    && m.asset_id == *asset_id
                    && m.source == MembershipSource::Manual
            });
            if !exists {
                state
                    .memberships
                    .push(Membership::manual(data_product_id, asset_id.as_str()));
            }
        }
        Ok(())
    }

    async fn remove_asset(&self, data_product_id: &str, asset_id: &str) -> Result<()> {
        self.state.lock().memberships.retain(|m| {
            !(m.data_product_id == data_product_id
                && m.asset_id == asset_id
                && m.source == MembershipSource::Manual)
        });
        Ok(())
    }

    async fn get_manual_assets(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<AssetsResult> {
        let state = self.state.lock();
        let ids: BTreeSet<&str> = state
            .memberships
            .iter()
            .filter(|m| m.data_product_id == data_product_id && m.rule_id().is_none())
            .map(|m| m.asset_id.as_str())
            .collect();
        Ok(AssetsResult {
            total: ids.len() as i64,
            asset_ids: ids
                .into_iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize)
                .map(str::to_string)
                .collect(),
        })
    }
}

#[async_trait]
impl MembershipRepository for InMemoryCatalog {
    async fn create_memberships(&self, memberships: &[Membership]) -> Result<()> {
        let mut state = self.state.lock();
        for membership in memberships {
            let duplicate = state.memberships.iter().any(|m| {
                m.data_product_id == membership.data_product_id
                    && m.asset_id == membership.asset_id
                    && m.rule_id() == membership.rule_id()
            });
            if !duplicate {
                state.memberships.push(membership.clone());
            }
        }
        Ok(())
    }

    async fn delete_memberships_by_asset(&self, asset_id: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.memberships.len();
        state.memberships.retain(|m| m.asset_id != asset_id);
        Ok((before - state.memberships.len()) as u64)
    }

    async fn delete_memberships_by_rule(&self, rule_id: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.memberships.len();
        state.memberships.retain(|m| m.rule_id() != Some(rule_id));
        Ok((before - state.memberships.len()) as u64)
    }

    async fn delete_memberships_by_data_product(&self, data_product_id: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.memberships.len();
        state.memberships.retain(|m| m.data_product_id != data_product_id);
        Ok((before - state.memberships.len()) as u64)
    }

    async fn get_memberships(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<MembershipPage> {
        let state = self.state.lock();
        let all: Vec<&Membership> = state
            .memberships
            .iter()
            .filter(|m| m.data_product_id == data_product_id)
            .collect();
        Ok(MembershipPage {
            total: all.len() as i64,
            memberships: all
                .into_iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize)
                .cloned()
                .collect(),
        })
    }

    async fn get_data_products_for_asset(&self, asset_id: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .memberships
            .iter()
            .filter(|m| m.asset_id == asset_id)
            .map(|m| m.data_product_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    async fn save_rule_targets(
        &self,
        rule_id: &str,
        data_product_id: &str,
        targets: &[RuleTarget],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let owned_by_product = state
            .rules
            .get(rule_id)
            .is_some_and(|r| r.data_product_id == data_product_id);
        if !owned_by_product {
            return Err(DataProductError::RuleNotFound(rule_id.to_string()));
        }
        state.targets.insert(rule_id.to_string(), targets.to_vec());
        Ok(())
    }

    async fn delete_rule_targets(&self, rule_id: &str) -> Result<()> {
        self.state.lock().targets.remove(rule_id);
        Ok(())
    }

    async fn find_candidate_rules(&self, signature: &AssetSignature) -> Result<Vec<CandidateRule>> {
        let state = self.state.lock();
        if state.failing_assets.contains(&signature.asset_id) {
            return Err(DataProductError::Internal(format!(
                "候选规则查找失败: {}",
                signature.asset_id
            )));
        }

        let mut candidates: Vec<CandidateRule> = state
            .targets
            .iter()
            .filter(|(_, targets)| targets.iter().any(|t| signature.intersects(t)))
            .filter_map(|(rule_id, _)| state.rules.get(rule_id))
            .filter(|r| r.is_enabled)
            .map(|r| CandidateRule {
                rule_id: r.id.clone(),
                data_product_id: r.data_product_id.clone(),
            })
            .collect();
        candidates.sort_by(|a, b| {
            (&a.data_product_id, &a.rule_id).cmp(&(&b.data_product_id, &b.rule_id))
        });
        Ok(candidates)
    }

    async fn evaluate_rule_for_asset(&self, rule: &Rule, asset_id: &str) -> Result<bool> {
        self.single_asset_evaluations.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock();
        if state.failing_assets.contains(asset_id) {
            return Err(DataProductError::Timeout(format!("单资产求值超时: {asset_id}")));
        }
        let Some(asset) = state.assets.get(asset_id) else {
            return Ok(false);
        };
        if asset.is_stub {
            return Ok(false);
        }
        Ok(SpecMatcher::new(&rule.spec, &self.query)?.matches(asset))
    }

    async fn update_membership_stats(&self, data_product_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(product) = state.products.iter_mut().find(|p| p.id == data_product_id) {
            product.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl AssetGetter for InMemoryCatalog {
    async fn get(&self, asset_id: &str) -> Result<Asset> {
        self.state
            .lock()
            .assets
            .get(asset_id)
            .cloned()
            .ok_or_else(|| DataProductError::AssetNotFound(asset_id.to_string()))
    }
}
