//! 规则模型
//!
//! [`RuleSpec`] 用枚举表达两种规则的载荷，类型本身保证"每种规则只有一种载荷形态"。
//! 调用方提交的 [`RuleInput`] 是扁平结构，经过校验后才转换为 [`RuleSpec`]。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::enums::{PatternType, RuleType};

/// 规则载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleSpec {
    Query {
        #[serde(rename = "query_expression")]
        expression: String,
    },
    MetadataMatch {
        /// 点分路径，如 `owner.team`
        #[serde(rename = "metadata_field")]
        field: String,
        pattern_type: PatternType,
        pattern_value: String,
    },
}

impl RuleSpec {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::Query { .. } => RuleType::Query,
            Self::MetadataMatch { .. } => RuleType::MetadataMatch,
        }
    }
}

/// 归属于某个数据产品的规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub data_product_id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub spec: RuleSpec,
    /// 升序打破平局
    pub priority: i32,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_asset_count: Option<i64>,
}

impl Rule {
    pub fn rule_type(&self) -> RuleType {
        self.spec.rule_type()
    }
}

/// 创建或更新规则的输入
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RuleInput {
    /// 创建数据产品时内联的规则可自带 ID
    pub id: Option<String>,

    #[validate(length(min = 1, max = 255, message = "规则名称长度必须在 1-255 之间"))]
    pub name: String,

    pub description: Option<String>,

    pub rule_type: Option<RuleType>,

    pub query_expression: Option<String>,

    pub metadata_field: Option<String>,

    pub pattern_type: Option<String>,

    pub pattern_value: Option<String>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub is_enabled: bool,
}

/// 通过校验、待持久化的规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub spec: RuleSpec,
    pub priority: i32,
    pub is_enabled: bool,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl RuleInput {
    /// 查询规则输入
    pub fn query(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rule_type: Some(RuleType::Query),
            query_expression: Some(expression.into()),
            is_enabled: true,
            ..Default::default()
        }
    }

    /// 元数据匹配规则输入
    pub fn metadata_match(
        name: impl Into<String>,
        field: impl Into<String>,
        pattern_type: PatternType,
        pattern_value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            rule_type: Some(RuleType::MetadataMatch),
            metadata_field: Some(field.into()),
            pattern_type: Some(pattern_type.as_str().to_string()),
            pattern_value: Some(pattern_value.into()),
            is_enabled: true,
            ..Default::default()
        }
    }

    /// 检查载荷形态并转换为 [`RuleSpec`]
    ///
    /// 只做结构检查；表达式能否解析、正则能否编译由服务层校验。
    pub fn to_spec(&self) -> Result<RuleSpec, String> {
        let rule_type = self.rule_type.ok_or_else(|| "rule_type 不能为空".to_string())?;

        match rule_type {
            RuleType::Query => {
                let expression = non_empty(&self.query_expression)
                    .ok_or_else(|| "查询规则必须提供 query_expression".to_string())?;
                Ok(RuleSpec::Query {
                    expression: expression.to_string(),
                })
            }
            RuleType::MetadataMatch => {
                let field = non_empty(&self.metadata_field);
                let pattern_type = non_empty(&self.pattern_type);
                let pattern_value = non_empty(&self.pattern_value);

                let (Some(field), Some(pattern_type), Some(pattern_value)) =
                    (field, pattern_type, pattern_value)
                else {
                    return Err(
                        "元数据匹配规则必须同时提供 metadata_field、pattern_type 和 pattern_value"
                            .to_string(),
                    );
                };

                Ok(RuleSpec::MetadataMatch {
                    field: field.to_string(),
                    pattern_type: pattern_type.parse()?,
                    pattern_value: pattern_value.to_string(),
                })
            }
        }
    }
}
