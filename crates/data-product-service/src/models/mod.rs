//! 领域模型定义

mod asset;
mod data_product;
mod enums;
mod membership;
mod rule;

pub use asset::Asset;
pub use data_product::{
    AssetsResult, CreateDataProductInput, DataProduct, ListResult, NewDataProduct, Owner, OwnerInput,
    RulePreview,
};
pub use enums::{PatternType, RuleType, SourceKind, TargetType};
pub use membership::{
    AssetSignature, CandidateRule, Membership, MembershipPage, MembershipSource, RuleTarget,
};
pub use rule::{NewRule, Rule, RuleInput, RuleSpec};
