//! 成员关系仓储
//!
//! 成员关系表与规则索引键表的读写。规则索引键表按 `(target_type, target_value)`
//! 建索引，候选规则查找完全在数据库侧完成。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};

use super::predicate::{bind_params, compile_rule};
use super::traits::MembershipRepository;
use crate::error::{DataProductError, Result};
use crate::models::{
    AssetSignature, CandidateRule, Membership, MembershipPage, MembershipSource, Rule, RuleTarget,
    SourceKind,
};
use crate::query::QueryEvaluator;

/// 单资产规则求值的超时
const EVALUATE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    data_product_id: String,
    asset_id: String,
    source: SourceKind,
    rule_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = DataProductError;

    fn try_from(row: MembershipRow) -> Result<Self> {
        let source = match (row.source, row.rule_id) {
            (SourceKind::Manual, _) => MembershipSource::Manual,
            (SourceKind::Rule, Some(rule_id)) => MembershipSource::Rule { rule_id },
            (SourceKind::Rule, None) => {
                return Err(DataProductError::Internal(format!(
                    "规则成员关系缺少 rule_id: {}/{}",
                    row.data_product_id, row.asset_id
                )));
            }
        };

        Ok(Membership {
            data_product_id: row.data_product_id,
            asset_id: row.asset_id,
            source,
            created_at: Some(row.created_at),
        })
    }
}

/// PostgreSQL 成员关系仓储
pub struct PgMembershipRepository {
    pool: PgPool,
    query: Arc<dyn QueryEvaluator>,
}

impl PgMembershipRepository {
    pub fn new(pool: PgPool, query: Arc<dyn QueryEvaluator>) -> Self {
        Self { pool, query }
    }
}

#[async_trait]
impl MembershipRepository for PgMembershipRepository {
    async fn create_memberships(&self, memberships: &[Membership]) -> Result<()> {
        if memberships.is_empty() {
            return Ok(());
        }

        let mut product_ids = Vec::with_capacity(memberships.len());
        let mut asset_ids = Vec::with_capacity(memberships.len());
        let mut sources = Vec::with_capacity(memberships.len());
        let mut rule_ids: Vec<Option<String>> = Vec::with_capacity(memberships.len());
        for m in memberships {
            product_ids.push(m.data_product_id.clone());
            asset_ids.push(m.asset_id.clone());
            sources.push(m.source_kind().as_str().to_string());
            rule_ids.push(m.rule_id().map(str::to_string));
        }

        // 唯一索引为 (data_product_id, asset_id, COALESCE(rule_id, ''))
        let result = sqlx::query(
            r#"
            INSERT INTO data_product_memberships (data_product_id, asset_id, source, rule_id)
            SELECT * FROM UNNEST($1::TEXT[], $2::TEXT[], $3::TEXT[], $4::TEXT[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&product_ids)
        .bind(&asset_ids)
        .bind(&sources)
        .bind(&rule_ids)
        .execute(&self.pool)
        .await?;

        debug!(
            requested = memberships.len(),
            inserted = result.rows_affected(),
            "成员关系已写入"
        );

        let touched: BTreeSet<&str> = memberships
            .iter()
            .map(|m| m.data_product_id.as_str())
            .collect();
        for product_id in touched {
            if let Err(e) = self.update_membership_stats(product_id).await {
                warn!(product_id = %product_id, error = %e, "更新成员关系统计失败");
            }
        }

        Ok(())
    }

    async fn delete_memberships_by_asset(&self, asset_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM data_product_memberships WHERE asset_id = $1")
            .bind(asset_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_memberships_by_rule(&self, rule_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM data_product_memberships WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_memberships_by_data_product(&self, data_product_id: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM data_product_memberships WHERE data_product_id = $1")
                .bind(data_product_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn get_memberships(
        &self,
        data_product_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<MembershipPage> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM data_product_memberships WHERE data_product_id = $1",
        )
        .bind(data_product_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT data_product_id, asset_id, source, rule_id, created_at
            FROM data_product_memberships
            WHERE data_product_id = $1
            ORDER BY created_at ASC, asset_id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(data_product_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(MembershipPage {
            memberships: rows
                .into_iter()
                .map(Membership::try_from)
                .collect::<Result<_>>()?,
            total,
        })
    }

    async fn get_data_products_for_asset(&self, asset_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT DISTINCT data_product_id FROM data_product_memberships
            WHERE asset_id = $1
            ORDER BY data_product_id
            "#,
        )
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn save_rule_targets(
        &self,
        rule_id: &str,
        data_product_id: &str,
        targets: &[RuleTarget],
    ) -> Result<()> {
        let types: Vec<String> = targets
            .iter()
            .map(|t| t.target_type.as_str().to_string())
            .collect();
        let values: Vec<String> = targets.iter().map(|t| t.target_value.clone()).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM data_product_rule_targets WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;

        if !targets.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO data_product_rule_targets (rule_id, data_product_id, target_type, target_value)
                SELECT $1, $2, t.target_type, t.target_value
                FROM UNNEST($3::TEXT[], $4::TEXT[]) AS t(target_type, target_value)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(rule_id)
            .bind(data_product_id)
            .bind(&types)
            .bind(&values)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(rule_id = %rule_id, targets = targets.len(), "规则索引键已保存");
        Ok(())
    }

    async fn delete_rule_targets(&self, rule_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM data_product_rule_targets WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_candidate_rules(&self, signature: &AssetSignature) -> Result<Vec<CandidateRule>> {
        let candidates = sqlx::query_as::<_, CandidateRule>(
            r#"
            SELECT DISTINCT r.id AS rule_id, r.data_product_id
            FROM data_product_rules r
            JOIN data_product_rule_targets t ON t.rule_id = r.id
            WHERE r.is_enabled = TRUE
              AND (
                   (t.target_type = 'asset_type' AND t.target_value = $1)
                OR (t.target_type = 'provider' AND t.target_value = ANY($2))
                OR (t.target_type = 'tag' AND t.target_value = ANY($3))
                OR (t.target_type = 'metadata_key' AND t.target_value = ANY($4))
                OR t.target_type = 'query'
              )
            ORDER BY r.data_product_id, r.id
            "#,
        )
        .bind(&signature.asset_type)
        .bind(&signature.providers)
        .bind(&signature.tags)
        .bind(&signature.metadata_keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(candidates)
    }

    async fn evaluate_rule_for_asset(&self, rule: &Rule, asset_id: &str) -> Result<bool> {
        let predicate = compile_rule(&rule.spec, self.query.as_ref(), 2)?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM assets a WHERE a.id = $1 AND a.is_stub = FALSE AND ({}))",
            predicate.clause
        );

        let query = bind_params(
            sqlx::query_scalar::<_, bool>(&sql).bind(asset_id),
            &predicate.params,
        );
        let matched = tokio::time::timeout(EVALUATE_TIMEOUT, query.fetch_one(&self.pool))
            .await
            .map_err(|_| DataProductError::Timeout(format!("规则 {} 单资产求值超时", rule.id)))??;

        Ok(matched)
    }

    async fn update_membership_stats(&self, data_product_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE data_products
            SET membership_count = (
                    SELECT COUNT(DISTINCT asset_id) FROM data_product_memberships
                    WHERE data_product_id = $1
                ),
                memberships_updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(data_product_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(source: SourceKind, rule_id: Option<&str>) -> MembershipRow {
        MembershipRow {
            data_product_id: "dp-1".to_string(),
            asset_id: "a-1".to_string(),
            source,
            rule_id: rule_id.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_membership_row_conversion() {
        let manual = Membership::try_from(row(SourceKind::Manual, None)).unwrap();
        assert_eq!(manual.source, MembershipSource::Manual);
        assert!(manual.created_at.is_some());

        let derived = Membership::try_from(row(SourceKind::Rule, Some("r-1"))).unwrap();
        assert_eq!(derived.rule_id(), Some("r-1"));
    }

    #[test]
    fn test_rule_membership_without_rule_id_is_rejected() {
        assert!(Membership::try_from(row(SourceKind::Rule, None)).is_err());
    }

    #[tokio::test]
    #[ignore = "需要 PostgreSQL，设置 TEST_DATABASE_URL 后运行"]
    async fn test_candidate_lookup_against_database() {
        use crate::models::{Asset, TargetType};
        use crate::test_utils::StaticQueryEvaluator;

        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        let repo = PgMembershipRepository::new(pool, Arc::new(StaticQueryEvaluator::default()));

        let signature = AssetSignature::from_asset(&Asset::new("missing-asset", "table"));
        let candidates = repo.find_candidate_rules(&signature).await.unwrap();
        assert!(candidates.iter().all(|c| !c.rule_id.is_empty()));

        let targets = [RuleTarget::new(TargetType::AssetType, "table")];
        assert!(
            repo.save_rule_targets("missing-rule", "missing-product", &targets)
                .await
                .is_err()
        );
    }
}
