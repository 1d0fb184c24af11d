//! 数据产品枚举类型定义
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum RuleType {
    /// 查询表达式，交给查询求值器编译执行
    Query,
    /// 元数据字段模式匹配
    MetadataMatch,
}

/// 元数据匹配模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum PatternType {
    /// 区分大小写的完全相等
    Exact,
    /// 区分大小写的前缀匹配
    Prefix,
    /// `*` 通配，不区分大小写
    Wildcard,
    /// 正则表达式，仅由仓储层求值
    Regex,
}

/// 规则候选索引的目标类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum TargetType {
    AssetType,
    Provider,
    Tag,
    MetadataKey,
    /// 兜底目标：无法按键索引，任何资产都要评估
    Query,
}

/// 成员关系来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum SourceKind {
    Manual,
    Rule,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(format!(
                        "未知的 {}: {}",
                        stringify!($ty),
                        other
                    )),
                }
            }
        }
    };
}

str_enum!(RuleType {
    Query => "query",
    MetadataMatch => "metadata_match",
});

str_enum!(PatternType {
    Exact => "exact",
    Prefix => "prefix",
    Wildcard => "wildcard",
    Regex => "regex",
});

str_enum!(TargetType {
    AssetType => "asset_type",
    Provider => "provider",
    Tag => "tag",
    MetadataKey => "metadata_key",
    Query => "query",
});

str_enum!(SourceKind {
    Manual => "manual",
    Rule => "rule",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_type_from_str() {
        assert_eq!("wildcard".parse::<PatternType>().unwrap(), PatternType::Wildcard);
        assert_eq!("regex".parse::<PatternType>().unwrap(), PatternType::Regex);
        assert!("glob".parse::<PatternType>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&RuleType::MetadataMatch).unwrap();
        assert_eq!(json, format!("\"{}\"", RuleType::MetadataMatch.as_str()));

        let target: TargetType = serde_json::from_str("\"metadata_key\"").unwrap();
        assert_eq!(target, TargetType::MetadataKey);
    }
}
