//! 可观测性模块集成测试
//!
//! 测试指标记录、日志初始化与配置的核心行为。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use catalog_shared::observability::metrics::{
        record_batch, record_job, record_reconciliation, record_rule_evaluation, set_queue_depth,
    };

    #[test]
    fn test_record_job() {
        record_job("rule-evaluation", "succeeded", 0.05);
        record_job("rule-evaluation", "failed", 1.2);
        record_job("rule-evaluation", "cancelled", 0.0);
        record_job("rule-evaluation", "panicked", 0.3);
    }

    #[test]
    fn test_record_batch() {
        record_batch("asset-membership", "ok", 50);
        record_batch("asset-membership", "failed", 1);
        record_batch("asset-membership", "panicked", 0);
    }

    #[test]
    fn test_record_rule_evaluation() {
        record_rule_evaluation("full", "success");
        record_rule_evaluation("full", "error");
        record_rule_evaluation("incremental", "success");
    }

    #[test]
    fn test_metrics_with_edge_cases() {
        set_queue_depth("", 0);
        set_queue_depth("rule-evaluation", usize::MAX);
        record_reconciliation("partial", f64::MAX);
        record_reconciliation("success", 0.0);
    }
}

// ============================================================================
// 日志初始化测试
// ============================================================================

mod logging_tests {
    use catalog_shared::config::ObservabilityConfig;
    use catalog_shared::observability::logging;

    #[test]
    fn test_second_init_returns_error() {
        let config = ObservabilityConfig {
            log_format: "json".to_string(),
            ..Default::default()
        };

        // 同一进程内只有第一次能安装全局订阅者
        let _ = logging::init(&config);
        let second = logging::init(&config);
        assert!(second.is_err());
        assert_eq!(second.unwrap_err().code(), "OBSERVABILITY_ERROR");
    }
}

// ============================================================================
// 配置测试
// ============================================================================

mod config_tests {
    use catalog_shared::config::ObservabilityConfig;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.log_level, "info");
        assert!(config.metrics_enabled);
        assert!(!config.json_logs());
    }

    #[test]
    fn test_custom_config() {
        let config = ObservabilityConfig {
            log_level: "debug".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: false,
            metrics_port: 9091,
        };

        assert_eq!(config.metrics_port, 9091);
        assert!(config.json_logs());
    }
}

// ============================================================================
// Guard 测试
// ============================================================================

mod guard_tests {
    use catalog_shared::config::ObservabilityConfig;
    use catalog_shared::observability::{self, ObservabilityGuard};

    #[test]
    fn test_empty_guard() {
        let guard = ObservabilityGuard::empty();
        assert!(!guard.metrics_enabled());
        drop(guard);
    }

    #[tokio::test]
    async fn test_host_subscriber_does_not_disable_metrics() {
        // 宿主进程先装好自己的订阅者
        let _ = tracing_subscriber::fmt().try_init();

        let config = ObservabilityConfig {
            metrics_enabled: true,
            metrics_port: 0,
            ..Default::default()
        };
        let guard = observability::init("data-product-service", &config)
            .await
            .unwrap();
        assert!(guard.metrics_enabled());
    }
}
