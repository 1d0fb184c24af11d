//! 成员关系评估性能基准测试
//!
//! 测试覆盖：
//! - 通配模式匹配在不同段数下的开销
//! - 元数据规则的内存求值
//! - 规则索引键抽取
//! - 候选索引键与资产签名的相交判断

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use data_product::membership::{extract_rule_targets, match_wildcard, matches};
use data_product::test_utils::StaticQueryEvaluator;
use data_product::{Asset, AssetSignature, PatternType, Rule, RuleSpec, RuleTarget, TargetType};
use serde_json::json;
use std::hint::black_box;

fn rule(spec: RuleSpec) -> Rule {
    Rule {
        id: "bench-rule".to_string(),
        data_product_id: "bench-product".to_string(),
        name: "bench".to_string(),
        description: None,
        spec,
        priority: 0,
        is_enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        matched_asset_count: None,
    }
}

fn bench_wildcard(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_wildcard");

    for segments in [1usize, 3, 8, 16].iter() {
        let pattern = (0..*segments)
            .map(|i| format!("seg{i}"))
            .collect::<Vec<_>>()
            .join("*");
        let value = (0..*segments)
            .map(|i| format!("SEG{i}-padding"))
            .collect::<Vec<_>>()
            .join("/");

        group.throughput(Throughput::Elements(*segments as u64));
        group.bench_with_input(BenchmarkId::from_parameter(segments), segments, |b, _| {
            b.iter(|| match_wildcard(black_box(&pattern), black_box(&value)))
        });
    }

    group.finish();
}

fn bench_metadata_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata_match");
    let asset = Asset::new("a-1", "table").with_metadata(json!({
        "owner": {"team": "platform-core", "oncall": "core-oncall"},
        "env": "prod-eu-west-1",
    }));

    let cases = [
        ("exact", "owner.team", PatternType::Exact, "platform-core"),
        ("prefix", "env", PatternType::Prefix, "prod-"),
        ("wildcard", "env", PatternType::Wildcard, "PROD-*-west-*"),
        ("missing_path", "owner.manager.name", PatternType::Exact, "x"),
    ];

    for (name, field, pattern_type, value) in cases {
        let rule = rule(RuleSpec::MetadataMatch {
            field: field.to_string(),
            pattern_type,
            pattern_value: value.to_string(),
        });
        group.bench_function(name, |b| b.iter(|| matches(black_box(&rule), black_box(&asset))));
    }

    group.finish();
}

fn bench_target_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_rule_targets");
    let evaluator = StaticQueryEvaluator;

    let expressions = [
        ("single_type", "type:table"),
        ("and_terms", "type:table provider:postgres metadata.owner.team:core"),
        ("or_terms", "type:table OR type:view OR provider:s3"),
        ("free_text", "payments"),
        ("unparsable", "type:(table"),
    ];

    for (name, expression) in expressions {
        let rule = rule(RuleSpec::Query {
            expression: expression.to_string(),
        });
        group.bench_function(name, |b| {
            b.iter(|| extract_rule_targets(black_box(&rule), &evaluator))
        });
    }

    group.finish();
}

fn bench_signature_intersection(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_intersects");

    for tag_count in [1usize, 10, 100].iter() {
        let mut asset = Asset::new("a-1", "table").with_provider("postgres");
        for i in 0..*tag_count {
            asset = asset.with_tag(format!("tag-{i}"));
        }
        let signature = AssetSignature::from_asset(&asset);
        let targets = vec![
            RuleTarget::new(TargetType::AssetType, "view"),
            RuleTarget::new(TargetType::Provider, "s3"),
            RuleTarget::new(TargetType::Tag, format!("tag-{}", tag_count - 1)),
        ];

        group.throughput(Throughput::Elements(*tag_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tag_count), tag_count, |b, _| {
            b.iter(|| targets.iter().any(|t| signature.intersects(black_box(t))))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_wildcard,
    bench_metadata_match,
    bench_target_extraction,
    bench_signature_intersection,
);

criterion_main!(benches);
