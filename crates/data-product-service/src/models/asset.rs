//! 资产只读视图
//!
//! 成员关系引擎只读取资产的类型、提供方、标签和元数据，资产本身由资产服务维护。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 目录中的资产
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub asset_type: String,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    #[sqlx(json)]
    pub metadata: Map<String, Value>,
    /// 仅作为血缘端点存在的占位资产，不参与规则评估
    #[serde(default)]
    pub is_stub: bool,
}

impl Asset {
    pub fn new(id: impl Into<String>, asset_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            asset_type: asset_type.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.providers.push(provider.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata = map;
        }
        self
    }

    pub fn stub(mut self) -> Self {
        self.is_stub = true;
        self
    }
}
