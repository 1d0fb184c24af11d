//! 成员关系与候选索引模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::Asset;
use super::enums::{SourceKind, TargetType};

/// 成员关系来源
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MembershipSource {
    /// 人工维护，规则评估从不触碰
    Manual,
    /// 由规则评估产生，归属于该规则
    Rule { rule_id: String },
}

/// 数据产品与资产的关联
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub data_product_id: String,
    pub asset_id: String,
    #[serde(flatten)]
    pub source: MembershipSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn manual(data_product_id: impl Into<String>, asset_id: impl Into<String>) -> Self {
        Self {
            data_product_id: data_product_id.into(),
            asset_id: asset_id.into(),
            source: MembershipSource::Manual,
            created_at: None,
        }
    }

    pub fn from_rule(
        data_product_id: impl Into<String>,
        asset_id: impl Into<String>,
        rule_id: impl Into<String>,
    ) -> Self {
        Self {
            data_product_id: data_product_id.into(),
            asset_id: asset_id.into(),
            source: MembershipSource::Rule {
                rule_id: rule_id.into(),
            },
            created_at: None,
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        match self.source {
            MembershipSource::Manual => SourceKind::Manual,
            MembershipSource::Rule { .. } => SourceKind::Rule,
        }
    }

    pub fn rule_id(&self) -> Option<&str> {
        match &self.source {
            MembershipSource::Manual => None,
            MembershipSource::Rule { rule_id } => Some(rule_id),
        }
    }
}

/// 成员关系分页
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPage {
    pub memberships: Vec<Membership>,
    pub total: i64,
}

/// 规则的候选索引键
///
/// `Query` 类型的值恒为空串，表示规则无法按键索引，任何资产都是它的候选。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleTarget {
    pub target_type: TargetType,
    pub target_value: String,
}

impl RuleTarget {
    pub fn new(target_type: TargetType, target_value: impl Into<String>) -> Self {
        Self {
            target_type,
            target_value: target_value.into(),
        }
    }

    pub fn catch_all() -> Self {
        Self::new(TargetType::Query, "")
    }

    pub fn is_catch_all(&self) -> bool {
        self.target_type == TargetType::Query
    }
}

/// 用于候选规则查找的资产投影，按需计算，不落库
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSignature {
    pub asset_id: String,
    pub asset_type: String,
    pub providers: Vec<String>,
    pub tags: Vec<String>,
    /// 顶层元数据键，已排序
    pub metadata_keys: Vec<String>,
}

impl AssetSignature {
    pub fn from_asset(asset: &Asset) -> Self {
        let mut metadata_keys: Vec<String> = asset.metadata.keys().cloned().collect();
        metadata_keys.sort();

        Self {
            asset_id: asset.id.clone(),
            asset_type: asset.asset_type.clone(),
            providers: asset.providers.clone(),
            tags: asset.tags.clone(),
            metadata_keys,
        }
    }

    /// 判断某个索引键是否可能命中该资产
    pub fn intersects(&self, target: &RuleTarget) -> bool {
        let value = target.target_value.as_str();
        match target.target_type {
            TargetType::Query => true,
            TargetType::AssetType => self.asset_type == value,
            TargetType::Provider => self.providers.iter().any(|p| p == value),
            TargetType::Tag => self.tags.iter().any(|t| t == value),
            TargetType::MetadataKey => self.metadata_keys.iter().any(|k| k == value),
        }
    }
}

/// 候选规则
#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct CandidateRule {
    pub rule_id: String,
    pub data_product_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_from_asset() {
        let asset = Asset::new("a-1", "table")
            .with_provider("postgres")
            .with_tag("pii")
            .with_metadata(json!({"owner": {"team": "core"}, "env": "prod"}));

        let signature = AssetSignature::from_asset(&asset);
        assert_eq!(signature.asset_id, "a-1");
        assert_eq!(signature.metadata_keys, vec!["env", "owner"]);
    }

    #[test]
    fn test_signature_intersects_targets() {
        let signature = AssetSignature::from_asset(
            &Asset::new("a-1", "topic")
                .with_provider("kafka")
                .with_metadata(json!({"owner": "x"})),
        );

        assert!(signature.intersects(&RuleTarget::new(TargetType::AssetType, "topic")));
        assert!(signature.intersects(&RuleTarget::new(TargetType::Provider, "kafka")));
        assert!(signature.intersects(&RuleTarget::new(TargetType::MetadataKey, "owner")));
        assert!(signature.intersects(&RuleTarget::catch_all()));
        assert!(!signature.intersects(&RuleTarget::new(TargetType::Tag, "pii")));
        assert!(!signature.intersects(&RuleTarget::new(TargetType::AssetType, "table")));
    }

    #[test]
    fn test_membership_source() {
        let manual = Membership::manual("dp-1", "a-1");
        assert_eq!(manual.source_kind(), SourceKind::Manual);
        assert_eq!(manual.rule_id(), None);

        let derived = Membership::from_rule("dp-1", "a-1", "r-1");
        assert_eq!(derived.source_kind(), SourceKind::Rule);
        assert_eq!(derived.rule_id(), Some("r-1"));
    }
}
