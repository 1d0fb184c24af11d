//! 规则到 SQL 条件的转换
//!
//! 两种规则都编译成作用于资产表（别名 `a`）的 [`SqlPredicate`]：
//! 查询规则交给 [`QueryEvaluator`]，元数据匹配规则在这里直接生成。

use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryScalar;

use crate::error::{DataProductError, Result};
use crate::models::{PatternType, RuleSpec};
use crate::query::{QueryEvaluator, SqlParam, SqlPredicate};

/// 编译规则，占位符从 `first_param` 开始编号
pub fn compile_rule(
    spec: &RuleSpec,
    evaluator: &dyn QueryEvaluator,
    first_param: usize,
) -> Result<SqlPredicate> {
    match spec {
        RuleSpec::Query { expression } => {
            let parsed = evaluator.parse(expression)?;
            Ok(evaluator.compile(&parsed, first_param)?)
        }
        RuleSpec::MetadataMatch {
            field,
            pattern_type,
            pattern_value,
        } => metadata_predicate(field, *pattern_type, pattern_value, first_param),
    }
}

/// 元数据匹配条件
///
/// 路径按 `#>` 逐级取值，叶子必须是 JSON 字符串，与内存求值的失败即不匹配保持一致。
fn metadata_predicate(
    field: &str,
    pattern_type: PatternType,
    pattern_value: &str,
    first_param: usize,
) -> Result<SqlPredicate> {
    let path: Vec<String> = field.split('.').map(str::to_string).collect();
    if path.iter().any(String::is_empty) {
        return Err(DataProductError::InvalidInput(format!(
            "元数据路径不合法: {field}"
        )));
    }

    let p = first_param;
    let v = first_param + 1;
    let (operator, value) = match pattern_type {
        PatternType::Exact => ("=", pattern_value.to_string()),
        PatternType::Prefix => ("LIKE", format!("{}%", escape_like(pattern_value))),
        PatternType::Wildcard => (
            "ILIKE",
            pattern_value
                .split('*')
                .map(escape_like)
                .collect::<Vec<_>>()
                .join("%"),
        ),
        PatternType::Regex => ("~", pattern_value.to_string()),
    };

    Ok(SqlPredicate {
        clause: format!(
            "(jsonb_typeof(a.metadata #> ${p}) = 'string' AND a.metadata #>> ${p} {operator} ${v})"
        ),
        params: vec![SqlParam::TextArray(path), SqlParam::Text(value)],
    })
}

/// 转义 LIKE 模式中的元字符（默认转义符为反斜杠）
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// 按顺序绑定编译结果中的参数
pub fn bind_params<'q, O>(
    mut query: QueryScalar<'q, Postgres, O, PgArguments>,
    params: &'q [SqlParam],
) -> QueryScalar<'q, Postgres, O, PgArguments>
where
    O: Send + Unpin,
{
    for param in params {
        query = match param {
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Number(v) => query.bind(*v),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::TextArray(v) => query.bind(v.as_slice()),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MockQueryEvaluator;

    fn metadata(pattern_type: PatternType, value: &str) -> RuleSpec {
        RuleSpec::MetadataMatch {
            field: "owner.team".to_string(),
            pattern_type,
            pattern_value: value.to_string(),
        }
    }

    #[test]
    fn test_metadata_predicate_numbers_placeholders() {
        let evaluator = MockQueryEvaluator::new();
        let predicate = compile_rule(&metadata(PatternType::Exact, "core"), &evaluator, 2).unwrap();

        assert!(predicate.clause.contains("a.metadata #>> $2 = $3"));
        assert_eq!(
            predicate.params,
            vec![
                SqlParam::TextArray(vec!["owner".to_string(), "team".to_string()]),
                SqlParam::Text("core".to_string()),
            ]
        );
    }

    #[test]
    fn test_like_patterns_are_escaped() {
        let evaluator = MockQueryEvaluator::new();

        let prefix = compile_rule(&metadata(PatternType::Prefix, "50%_off"), &evaluator, 1).unwrap();
        assert!(prefix.clause.contains("LIKE $2"));
        assert_eq!(prefix.params[1], SqlParam::Text("50\\%\\_off%".to_string()));

        let wildcard = compile_rule(&metadata(PatternType::Wildcard, "plat*_x*"), &evaluator, 1).unwrap();
        assert!(wildcard.clause.contains("ILIKE $2"));
        assert_eq!(wildcard.params[1], SqlParam::Text("plat%\\_x%".to_string()));
    }

    #[test]
    fn test_empty_path_segment_is_rejected() {
        let evaluator = MockQueryEvaluator::new();
        let spec = RuleSpec::MetadataMatch {
            field: "owner..team".to_string(),
            pattern_type: PatternType::Exact,
            pattern_value: "x".to_string(),
        };
        assert!(compile_rule(&spec, &evaluator, 1).is_err());
    }

    #[test]
    fn test_query_rule_delegates_to_evaluator() {
        let mut evaluator = MockQueryEvaluator::new();
        evaluator.expect_parse().returning(|_| Ok(Default::default()));
        evaluator
            .expect_compile()
            .withf(|_, first| *first == 3)
            .returning(|_, _| {
                Ok(SqlPredicate {
                    clause: "a.type = $3".to_string(),
                    params: vec![SqlParam::Text("table".to_string())],
                })
            });

        let spec = RuleSpec::Query {
            expression: "type:table".to_string(),
        };
        let predicate = compile_rule(&spec, &evaluator, 3).unwrap();
        assert_eq!(predicate.clause, "a.type = $3");
    }
}
