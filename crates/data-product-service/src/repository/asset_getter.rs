//! 资产只读访问
//!
//! 资产表由资产服务维护，这里只按 ID 读取引擎需要的列。

use async_trait::async_trait;
use sqlx::PgPool;

use super::traits::AssetGetter;
use crate::error::{DataProductError, Result};
use crate::models::Asset;

pub struct PgAssetGetter {
    pool: PgPool,
}

impl PgAssetGetter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetGetter for PgAssetGetter {
    async fn get(&self, asset_id: &str) -> Result<Asset> {
        sqlx::query_as::<_, Asset>(
            r#"
            SELECT id, name, type, providers, tags, metadata, is_stub
            FROM assets
            WHERE id = $1
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DataProductError::AssetNotFound(asset_id.to_string()))
    }
}
