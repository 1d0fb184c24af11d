//! 元数据匹配规则的内存求值
//!
//! 只用于增量路径（单个新资产）。正则模式在这里恒为不匹配，
//! 由引擎转交仓储层按单资产范围求值。

use serde_json::{Map, Value};

use crate::models::{Asset, PatternType, Rule, RuleSpec};

/// 判断资产是否命中规则
///
/// 查询规则无法在内存中求值，恒返回 false。
pub fn matches(rule: &Rule, asset: &Asset) -> bool {
    let RuleSpec::MetadataMatch {
        field,
        pattern_type,
        pattern_value,
    } = &rule.spec
    else {
        return false;
    };

    let Some(value) = resolve_path(&asset.metadata, field) else {
        return false;
    };

    match pattern_type {
        PatternType::Exact => value == pattern_value,
        PatternType::Prefix => value.starts_with(pattern_value.as_str()),
        PatternType::Wildcard => match_wildcard(pattern_value, value),
        PatternType::Regex => false,
    }
}

/// 按点分路径取字符串值
///
/// 任何中间键缺失、中间值不是对象或叶子不是字符串都返回 None。
pub fn resolve_path<'a>(metadata: &'a Map<String, Value>, path: &str) -> Option<&'a str> {
    let mut segments = path.split('.');
    let mut current = metadata.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    current.as_str()
}

/// `*` 通配匹配，不区分大小写
///
/// 没有 `*` 时要求完全相等；否则首段作为前缀、末段作为后缀，
/// 中间各段按顺序、互不重叠地出现在前缀与后缀之间。
pub fn match_wildcard(pattern: &str, value: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let value = value.to_lowercase();

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, last) = match parts.as_slice() {
        [only] => return *only == value,
        [first, .., last] => (*first, *last),
        [] => return value.is_empty(),
    };

    if first.len() + last.len() > value.len()
        || !value.starts_with(first)
        || !value.ends_with(last)
    {
        return false;
    }

    let mut middle = &value[first.len()..value.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match middle.find(part) {
            Some(idx) => middle = &middle[idx + part.len()..],
            None => return false,
        }
    }

    true
}
