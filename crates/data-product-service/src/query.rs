//! 查询求值器边界
//!
//! 查询语言的语法与 SQL 编译由外部协作方实现，这里只定义它的接口与解析结果的结构。
//! 成员关系引擎用解析结果抽取规则的索引键，仓储层用编译结果执行规则。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 查询求值器错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("表达式解析失败: {0}")]
    Parse(String),

    #[error("不支持的查询条件: {0}")]
    Unsupported(String),
}

/// 字段类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Metadata,
    AssetType,
    Provider,
    Kind,
    Name,
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    In,
    NotIn,
    Range,
    Wildcard,
    FreeText,
}

/// 过滤条件的取值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterValue {
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
    /// 括号内的子表达式
    Nested(Box<BooleanQuery>),
}

/// 单个过滤条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// 字段路径，如 `["owner", "team"]`
    pub field: Vec<String>,
    pub field_type: FieldType,
    pub operator: Operator,
    pub value: FilterValue,
}

impl Filter {
    pub fn new(field_type: FieldType, field: &[&str], operator: Operator, value: FilterValue) -> Self {
        Self {
            field: field.iter().map(|s| s.to_string()).collect(),
            field_type,
            operator,
            value,
        }
    }
}

/// 布尔组合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BooleanQuery {
    /// AND
    #[serde(default)]
    pub must: Vec<Filter>,
    /// OR
    #[serde(default)]
    pub should: Vec<Filter>,
    /// NOT
    #[serde(default)]
    pub must_not: Vec<Filter>,
}

/// 解析后的查询
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    #[serde(default)]
    pub free_text: String,
    pub bool_query: Option<BooleanQuery>,
}

/// SQL 绑定参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlParam {
    Text(String),
    Number(f64),
    Bool(bool),
    TextArray(Vec<String>),
}

/// 编译后的 WHERE 子句片段，占位符从 `first_param` 开始编号
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlPredicate {
    pub clause: String,
    pub params: Vec<SqlParam>,
}

/// 查询求值器
///
/// 实现方负责语法解析与 SQL 编译；编译结果作用于资产表（别名 `a`）。
#[cfg_attr(test, mockall::automock)]
pub trait QueryEvaluator: Send + Sync {
    fn parse(&self, expression: &str) -> Result<ParsedQuery, QueryError>;

    fn compile(&self, query: &ParsedQuery, first_param: usize) -> Result<SqlPredicate, QueryError>;
}
