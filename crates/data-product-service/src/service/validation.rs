//! 规则校验
//!
//! 把调用方提交的 [`RuleInput`] 校验并转换为 [`NewRule`]。
//! 语法错误在这里同步返回，不会进入成员关系引擎。

use regex::Regex;
use validator::Validate;

use crate::error::{DataProductError, Result};
use crate::models::{NewRule, PatternType, RuleInput, RuleSpec};
use crate::query::QueryEvaluator;

/// 每个数据产品最多的规则数
pub const MAX_RULES_PER_PRODUCT: usize = 10;

pub fn validate_rule(input: &RuleInput, evaluator: &dyn QueryEvaluator) -> Result<NewRule> {
    input
        .validate()
        .map_err(|e| DataProductError::InvalidInput(e.to_string()))?;

    let spec = input.to_spec().map_err(DataProductError::InvalidInput)?;

    match &spec {
        RuleSpec::Query { expression } => {
            evaluator.parse(expression).map_err(|e| {
                DataProductError::InvalidInput(format!("查询表达式语法错误: {e}"))
            })?;
        }
        RuleSpec::MetadataMatch {
            field,
            pattern_type,
            pattern_value,
        } => {
            if field.split('.').any(str::is_empty) {
                return Err(DataProductError::InvalidInput(format!(
                    "metadata_field 路径不合法: {field}"
                )));
            }
            if *pattern_type == PatternType::Regex {
                Regex::new(pattern_value).map_err(|e| {
                    DataProductError::InvalidInput(format!("正则表达式不合法: {e}"))
                })?;
            }
        }
    }

    Ok(NewRule {
        id: input.id.clone(),
        name: input.name.trim().to_string(),
        description: input.description.clone(),
        spec,
        priority: input.priority,
        is_enabled: input.is_enabled,
    })
}
