//! 成员关系引擎
//!
//! - [`targets`]：规则索引键抽取
//! - [`matcher`]：元数据规则的内存求值
//! - [`engine`]：增量评估、全量评估与对账
//! - [`reconciler`]：周期对账驱动

pub mod engine;
pub mod matcher;
pub mod reconciler;
pub mod targets;

pub use engine::{MembershipEngine, ReconcileReport};
pub use matcher::{match_wildcard, matches};
pub use reconciler::Reconciler;
pub use targets::extract_rule_targets;
