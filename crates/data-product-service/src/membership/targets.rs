//! 规则索引键抽取
//!
//! 为每条规则推导一组粗粒度的索引键（资产类型、提供方、元数据键或兜底），
//! 仓储层据此为新资产挑选候选规则，避免每个资产都评估全部规则。
//!
//! 抽取遵循保守原则：索引键的并集必须覆盖规则所有可能命中的资产。
//! 多出的索引键只会增加候选评估的开销，缺失的索引键会导致漏匹配，
//! 因此任何无法证明覆盖的情况都退化为单个兜底键。

use tracing::debug;

use crate::models::{Rule, RuleSpec, RuleTarget, TargetType};
use crate::query::{BooleanQuery, FieldType, Filter, FilterValue, Operator, QueryEvaluator};

/// 推导规则的索引键，结果去重且非空
pub fn extract_rule_targets(rule: &Rule, evaluator: &dyn QueryEvaluator) -> Vec<RuleTarget> {
    match &rule.spec {
        RuleSpec::MetadataMatch { field, .. } => {
            let key = field.split('.').next().unwrap_or_default();
            if key.is_empty() {
                return vec![RuleTarget::catch_all()];
            }
            vec![RuleTarget::new(TargetType::MetadataKey, key)]
        }
        RuleSpec::Query { expression } => match evaluator.parse(expression) {
            Ok(parsed) => match parsed.bool_query {
                Some(bool_query) => targets_from_bool(&bool_query),
                None => vec![RuleTarget::catch_all()],
            },
            Err(e) => {
                debug!(rule_id = %rule.id, error = %e, "查询表达式无法解析，按兜底规则索引");
                vec![RuleTarget::catch_all()]
            }
        },
    }
}

fn targets_from_bool(query: &BooleanQuery) -> Vec<RuleTarget> {
    let mut targets = Vec::new();
    if !collect_bool(query, &mut targets) || targets.is_empty() {
        return vec![RuleTarget::catch_all()];
    }
    if targets.iter().any(RuleTarget::is_catch_all) {
        return vec![RuleTarget::catch_all()];
    }

    let mut deduped: Vec<RuleTarget> = Vec::with_capacity(targets.len());
    for target in targets {
        if !deduped.contains(&target) {
            deduped.push(target);
        }
    }
    deduped
}

/// 收集布尔组合中的索引键，返回这些键是否覆盖了组合的全部命中
///
/// - 任一 must 条件可索引即可覆盖（AND 关系）
/// - 否则 should 非空且每个 should 条件都可索引时覆盖（OR 关系）
/// - must_not 不提供任何覆盖
fn collect_bool(query: &BooleanQuery, out: &mut Vec<RuleTarget>) -> bool {
    let mut covered = false;
    for filter in &query.must {
        covered |= collect_filter(filter, out);
    }

    if !query.should.is_empty() {
        let mut all_should = true;
        for filter in &query.should {
            all_should &= collect_filter(filter, out);
        }
        covered |= all_should;
    }

    covered
}

fn collect_filter(filter: &Filter, out: &mut Vec<RuleTarget>) -> bool {
    if let FilterValue::Nested(nested) = &filter.value {
        return collect_bool(nested, out);
    }

    match filter.field_type {
        // 只有等值与集合包含能证明命中资产带有该取值
        FieldType::AssetType | FieldType::Provider
            if !matches!(filter.operator, Operator::Equals | Operator::In) =>
        {
            false
        }
        FieldType::AssetType => collect_values(TargetType::AssetType, &filter.value, out),
        FieldType::Provider => collect_values(TargetType::Provider, &filter.value, out),
        // 否定条件也会命中缺少该键的资产
        FieldType::Metadata if matches!(filter.operator, Operator::NotEquals | Operator::NotIn) => {
            false
        }
        FieldType::Metadata => match filter.field.first() {
            Some(key) if !key.is_empty() => {
                out.push(RuleTarget::new(TargetType::MetadataKey, key.as_str()));
                true
            }
            _ => false,
        },
        // 名称与自由文本无法按键索引
        FieldType::Name => {
            out.push(RuleTarget::catch_all());
            true
        }
        FieldType::Kind => false,
    }
}

fn collect_values(target_type: TargetType, value: &FilterValue, out: &mut Vec<RuleTarget>) -> bool {
    match value {
        FilterValue::Text(v) if !v.is_empty() => {
            out.push(RuleTarget::new(target_type, v.as_str()));
            true
        }
        FilterValue::List(values) if !values.is_empty() => {
            out.extend(values.iter().map(|v| RuleTarget::new(target_type, v.as_str())));
            true
        }
        _ => false,
    }
}
