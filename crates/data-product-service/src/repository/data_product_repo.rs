//! 数据产品仓储
//!
//! 数据产品、负责人、规则三张表的读写，以及规则在资产表上的执行与预览。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::predicate::{bind_params, compile_rule};
use super::traits::DataProductRepository;
use crate::error::{DataProductError, Result};
use crate::models::{
    AssetsResult, DataProduct, ListResult, NewDataProduct, NewRule, Owner, PatternType, Rule,
    RulePreview, RuleSpec, RuleType,
};
use crate::query::QueryEvaluator;

/// 全量执行规则的超时
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(5);

const PRODUCT_COLUMNS: &str = r#"
    dp.id, dp.name, dp.description, dp.metadata, dp.tags, dp.created_by,
    dp.created_at, dp.updated_at,
    (SELECT COUNT(DISTINCT m.asset_id) FROM data_product_memberships m
        WHERE m.data_product_id = dp.id) AS asset_count,
    (SELECT COUNT(*) FROM data_product_memberships m
        WHERE m.data_product_id = dp.id AND m.source = 'manual') AS manual_asset_count,
    (SELECT COUNT(DISTINCT m.asset_id) FROM data_product_memberships m
        WHERE m.data_product_id = dp.id AND m.source = 'rule') AS rule_asset_count
"#;

const RULE_COLUMNS: &str = r#"
    r.id, r.data_product_id, r.name, r.description, r.rule_type, r.query_expression,
    r.metadata_field, r.pattern_type, r.pattern_value, r.priority, r.is_enabled,
    r.created_at, r.updated_at,
    (SELECT COUNT(*) FROM data_product_memberships m WHERE m.rule_id = r.id) AS matched_asset_count
"#;

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    name: String,
    description: Option<String>,
    metadata: Json<Map<String, Value>>,
    tags: Vec<String>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    asset_count: i64,
    manual_asset_count: i64,
    rule_asset_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OwnerRow {
    data_product_id: String,
    owner_id: String,
    owner_type: String,
}

/// 规则表行，载荷列按 rule_type 二选一
#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: String,
    data_product_id: String,
    name: String,
    description: Option<String>,
    rule_type: RuleType,
    query_expression: Option<String>,
    metadata_field: Option<String>,
    pattern_type: Option<PatternType>,
    pattern_value: Option<String>,
    priority: i32,
    is_enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    matched_asset_count: Option<i64>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = DataProductError;

    fn try_from(row: RuleRow) -> Result<Self> {
        let spec = match row.rule_type {
            RuleType::Query => RuleSpec::Query {
                expression: row.query_expression.ok_or_else(|| {
                    DataProductError::Internal(format!("规则 {} 缺少 query_expression", row.id))
                })?,
            },
            RuleType::MetadataMatch => match (row.metadata_field, row.pattern_type, row.pattern_value)
            {
                (Some(field), Some(pattern_type), Some(pattern_value)) => RuleSpec::MetadataMatch {
                    field,
                    pattern_type,
                    pattern_value,
                },
                _ => {
                    return Err(DataProductError::Internal(format!(
                        "规则 {} 的元数据匹配载荷不完整",
                        row.id
                    )));
                }
            },
        };

        Ok(Rule {
            id: row.id,
            data_product_id: row.data_product_id,
            name: row.name,
            description: row.description,
            spec,
            priority: row.priority,
            is_enabled: row.is_enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
            matched_asset_count: row.matched_asset_count,
        })
    }
}

/// 规则载荷拆成表列
struct SpecColumns<'a> {
    rule_type: RuleType,
    query_expression: Option<&'a str>,
    metadata_field: Option<&'a str>,
    pattern_type: Option<PatternType>,
    pattern_value: Option<&'a str>,
}

impl<'a> From<&'a RuleSpec> for SpecColumns<'a> {
    fn from(spec: &'a RuleSpec) -> Self {
        match spec {
            RuleSpec::Query { expression } => Self {
                rule_type: RuleType::Query,
                query_expression: Some(expression),
                metadata_field: None,
                pattern_type: None,
                pattern_value: None,
            },
            RuleSpec::MetadataMatch {
                field,
                pattern_type,
                pattern_value,
            } => Self {
                rule_type: RuleType::MetadataMatch,
                query_expression: None,
                metadata_field: Some(field),
                pattern_type: Some(*pattern_type),
                pattern_value: Some(pattern_value),
            },
        }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

/// PostgreSQL 数据产品仓储
pub struct PgDataProductRepository {
    pool: PgPool,
    query: Arc<dyn QueryEvaluator>,
}

impl PgDataProductRepository {
    pub fn new(pool: PgPool, query: Arc<dyn QueryEvaluator>) -> Self {
        Self { pool, query }
    }

    /// 为一组数据产品行补齐负责人和规则
    async fn hydrate(&self, rows: Vec<ProductRow>) -> Result<Vec<DataProduct>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

        let owner_rows = sqlx::query_as::<_, OwnerRow>(
            r#"
            SELECT data_product_id, owner_id, owner_type
            FROM data_product_owners
            WHERE data_product_id = ANY($1)
            ORDER BY data_product_id, owner_type, owner_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut owners: HashMap<String, Vec<Owner>> = HashMap::new();
        for row in owner_rows {
            owners.entry(row.data_product_id).or_default().push(Owner {
                id: row.owner_id,
                owner_type: row.owner_type,
            });
        }

        let rule_rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM data_product_rules r
             WHERE r.data_product_id = ANY($1)
             ORDER BY r.priority ASC, r.created_at ASC"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut rules: HashMap<String, Vec<Rule>> = HashMap::new();
        for row in rule_rows {
            let rule = Rule::try_from(row)?;
            rules.entry(rule.data_product_id.clone()).or_default().push(rule);
        }

        Ok(rows
            .into_iter()
            .map(|row| DataProduct {
                owners: owners.remove(&row.id).unwrap_or_default(),
                rules: rules.remove(&row.id).unwrap_or_default(),
                id: row.id,
                name: row.name,
                description: row.description,
                metadata: row.metadata.0,
                tags: row.tags,
                created_by: row.created_by,
                created_at: row.created_at,
                updated_at: row.updated_at,
                asset_count: row.asset_count,
                manual_asset_count: row.manual_asset_count,
                rule_asset_count: row.rule_asset_count,
            })
            .collect())
    }

    async fn insert_rule<'e, E>(executor: E, data_product_id: &str, rule: &NewRule) -> Result<String>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let id = rule
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let columns = SpecColumns::from(&rule.spec);

        sqlx::query(
            r#"
            INSERT INTO data_product_rules (
                id, data_product_id, name, description, rule_type, query_expression,
                metadata_field, pattern_type, pattern_value, priority, is_enabled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&id)
        .bind(data_product_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(columns.rule_type)
        .bind(columns.query_expression)
        .bind(columns.metadata_field)
        .bind(columns.pattern_type)
        .bind(columns.pattern_value)
        .bind(rule.priority)
        .bind(rule.is_enabled)
        .execute(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DataProductError::Conflict(format!("规则 ID 已存在: {id}"))
            } else if is_foreign_key_violation(&e) {
                DataProductError::NotFound(data_product_id.to_string())
            } else {
                DataProductError::Database(e)
            }
        })?;

        Ok(id)
    }

    /// 在资产表上执行规则条件，结果按资产 ID 排序
    async fn select_matching(&self, spec: &RuleSpec, limit: Option<i64>) -> Result<Vec<String>> {
        let predicate = compile_rule(spec, self.query.as_ref(), 1)?;
        let limit_clause = match limit {
            Some(limit) => format!(" LIMIT {}", limit.max(0)),
            None => String::new(),
        };
        let sql = format!(
            "SELECT a.id FROM assets a WHERE a.is_stub = FALSE AND ({}) ORDER BY a.id{limit_clause}",
            predicate.clause
        );

        let query = bind_params(sqlx::query_scalar::<_, String>(&sql), &predicate.params);
        tokio::time::timeout(EXECUTE_TIMEOUT, query.fetch_all(&self.pool))
            .await
            .map_err(|_| DataProductError::Timeout("规则执行超时".to_string()))?
            .map_err(DataProductError::from)
    }

    async fn count_matching(&self, spec: &RuleSpec) -> Result<i64> {
        let predicate = compile_rule(spec, self.query.as_ref(), 1)?;
        let sql = format!(
            "SELECT COUNT(*) FROM assets a WHERE a.is_stub = FALSE AND ({})",
            predicate.clause
        );

        let query = bind_params(sqlx::query_scalar::<_, i64>(&sql), &predicate.params);
        let count = tokio::time::timeout(EXECUTE_TIMEOUT, query.fetch_one(&self.pool))
            .await
            .map_err(|_| DataProductError::Timeout("规则计数超时".to_string()))??;

        Ok(count)
    }
}

#[async_trait]
impl DataProductRepository for PgDataProductRepository {
    async fn create(&self, product: NewDataProduct) -> Result<DataProduct> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO data_products (id, name, description, metadata, tags, created_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(Json(&product.metadata))
        .bind(&product.tags)
        .bind(&product.created_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DataProductError::Conflict(format!("数据产品名称已存在: {}", product.name))
            } else {
                DataProductError::Database(e)
            }
        })?;

        for owner in &product.owners {
            sqlx::query(
                r#"
                INSERT INTO data_product_owners (data_product_id, owner_id, owner_type)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(&owner.id)
            .bind(&owner.owner_type)
            .execute(&mut *tx)
            .await?;
        }

        for rule in &product.rules {
            Self::insert_rule(&mut *tx, &id, rule).await?;
        }

        tx.commit().await?;
        debug!(product_id = %id, rules = product.rules.len(), "数据产品已创建");

        self.get(&id).await
    }

    async fn get(&self, id: &str) -> Result<DataProduct> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM data_products dp WHERE dp.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DataProductError::NotFound(id.to_string()))?;

        self.hydrate(vec![row])
            .await?
            .pop()
            .ok_or_else(|| DataProductError::NotFound(id.to_string()))
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<ListResult> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM data_products")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM data_products dp
             ORDER BY dp.created_at DESC, dp.id
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(ListResult {
            data_products: self.hydrate(rows).await?,
            total,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM data_products WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DataProductError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_rule(&self, data_product_id: &str, rule: NewRule) -> Result<Rule> {
        let id = Self::insert_rule(&self.pool, data_product_id, &rule).await?;
        self.get_rule(&id).await
    }

    async fn update_rule(&self, rule_id: &str, rule: NewRule) -> Result<Rule> {
        let columns = SpecColumns::from(&rule.spec);
        let result = sqlx::query(
            r#"
            UPDATE data_product_rules
            SET name = $2, description = $3, rule_type = $4, query_expression = $5,
                metadata_field = $6, pattern_type = $7, pattern_value = $8,
                priority = $9, is_enabled = $10, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(columns.rule_type)
        .bind(columns.query_expression)
        .bind(columns.metadata_field)
        .bind(columns.pattern_type)
        .bind(columns.pattern_value)
        .bind(rule.priority)
        .bind(rule.is_enabled)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DataProductError::RuleNotFound(rule_id.to_string()));
        }
        self.get_rule(rule_id).await
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM data_product_rules WHERE id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DataProductError::RuleNotFound(rule_id.to_string()));
        }
        Ok(())
    }

    async fn get_rule(&self, rule_id: &str) -> Result<Rule> {
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM data_product_rules r WHERE r.id = $1"
        ))
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DataProductError::RuleNotFound(rule_id.to_string()))?;

        Rule::try_from(row)
    }

    async fn get_rules(&self, data_product_id: &str) -> Result<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM data_product_rules r
             WHERE r.data_product_id = $1
             ORDER BY r.priority ASC, r.created_at ASC"
        ))
        .bind(data_product_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Rule::try_from).collect()
    }

    async fn execute_rule(&self, rule: &Rule) -> Result<Vec<String>> {
        let ids = self.select_matching(&rule.spec, None).await?;
        debug!(rule_id = %rule.id, matched = ids.len(), "规则执行完成");
        Ok(ids)
    }

    async fn preview_rule(&self, spec: &RuleSpec, limit: i64) -> Result<RulePreview> {
        let asset_ids = self.select_matching(spec, Some(limit)).await?;
        let asset_count = if (asset_ids.len() as i64) < limit {
            asset_ids.len() as i64
        } else {
            self.count_matching(spec).await?
        };

        Ok(RulePreview {
            asset_ids,
            asset_count,
            errors: Vec::new(),
        })
    }

    async fn add_assets(
        &self,
        data_product_id: &str,
        asset_ids: &[String],
        created_by: Option<String>,
    ) -> Result<()> {
        if asset_ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO data_product_memberships (data_product_id, asset_id, source, created_by)
            SELECT $1, asset_id, 'manual', $3
            FROM UNNEST($2::TEXT[]) AS asset_id
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(data_product_id)
        .bind(asset_ids)
        .bind(&created_by)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                DataProductError::NotFound(data_product_id.to_string())
            } else {
                DataProductError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn remove_asset(&self, data_product_id: &str, asset_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM data_product_memberships
            WHERE data_product_id = $1 AND asset_id = $2 AND source = 'manual'
            "#,
        )
        .bind(data_product_id)
        .bind(asset_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(product_id = %data_product_id, asset_id = %asset_id, "资产不是人工成员，忽略移除");
        }
        Ok(())
    }

    async fn get_manual_assets(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<AssetsResult> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM data_product_memberships
            WHERE data_product_id = $1 AND source = 'manual'
            "#,
        )
        .bind(data_product_id)
        .fetch_one(&self.pool)
        .await?;

        let asset_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT asset_id FROM data_product_memberships
            WHERE data_product_id = $1 AND source = 'manual'
            ORDER BY created_at ASC, asset_id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(data_product_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(AssetsResult { asset_ids, total })
    }
}
