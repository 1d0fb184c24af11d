//! 数据产品模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use super::rule::{NewRule, Rule, RuleInput};

/// 数据产品
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProduct {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub owners: Vec<Owner>,
    /// 按 priority 升序
    #[serde(default)]
    pub rules: Vec<Rule>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub asset_count: i64,
    #[serde(default)]
    pub manual_asset_count: i64,
    #[serde(default)]
    pub rule_asset_count: i64,
}

/// 数据产品负责人
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Owner {
    pub id: String,
    /// user 或 team
    #[serde(rename = "type")]
    #[sqlx(rename = "owner_type")]
    pub owner_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct OwnerInput {
    #[validate(length(min = 1, message = "负责人 ID 不能为空"))]
    pub id: String,

    #[serde(rename = "type")]
    #[validate(custom(function = "validate_owner_type"))]
    pub owner_type: String,
}

fn validate_owner_type(value: &str) -> Result<(), validator::ValidationError> {
    match value {
        "user" | "team" => Ok(()),
        _ => Err(validator::ValidationError::new("owner_type")
            .with_message("负责人类型必须是 user 或 team".into())),
    }
}

/// 创建数据产品的输入
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreateDataProductInput {
    #[validate(length(min = 1, max = 255, message = "名称长度必须在 1-255 之间"))]
    pub name: String,

    pub description: Option<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[validate(length(min = 1, message = "至少需要一个负责人"), nested)]
    pub owners: Vec<OwnerInput>,

    #[serde(default)]
    #[validate(nested)]
    pub rules: Vec<RuleInput>,

    pub created_by: Option<String>,
}

/// 通过校验、待持久化的数据产品
#[derive(Debug, Clone, PartialEq)]
pub struct NewDataProduct {
    pub name: String,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
    pub tags: Vec<String>,
    pub owners: Vec<OwnerInput>,
    pub rules: Vec<NewRule>,
    pub created_by: Option<String>,
}

/// 分页列表结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub data_products: Vec<DataProduct>,
    pub total: i64,
}

/// 规则预览结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePreview {
    pub asset_ids: Vec<String>,
    pub asset_count: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// 数据产品的资产分页
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetsResult {
    pub asset_ids: Vec<String>,
    pub total: i64,
}
