//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{CatalogError, Result};

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CatalogError::Observability(e.to_string()))?;

    describe_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

fn describe_metrics(service_name: &str) {
    metrics::describe_counter!(
        "membership_jobs_total",
        "Total number of worker pool jobs by outcome"
    );
    metrics::describe_histogram!(
        "membership_job_duration_seconds",
        "Worker pool job duration in seconds"
    );
    metrics::describe_gauge!("membership_queue_depth", "Jobs waiting in the worker pool queue");
    metrics::describe_counter!(
        "membership_batches_total",
        "Total number of flushed batches by outcome"
    );
    metrics::describe_histogram!("membership_batch_size", "Number of items per flushed batch");
    metrics::describe_counter!(
        "membership_rule_evaluations_total",
        "Total number of rule evaluations by mode and outcome"
    );
    metrics::describe_counter!(
        "membership_reconciliations_total",
        "Total number of reconciliation sweeps"
    );
    metrics::describe_histogram!(
        "membership_reconciliation_duration_seconds",
        "Reconciliation sweep duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CatalogError::Observability(e.to_string()))?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一次工作池任务完成
#[inline]
pub fn record_job(pool: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "membership_jobs_total",
        "pool" => pool.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "membership_job_duration_seconds",
        "pool" => pool.to_string()
    )
    .record(duration_secs);
}

/// 更新工作池排队深度
#[inline]
pub fn set_queue_depth(pool: &str, depth: usize) {
    metrics::gauge!("membership_queue_depth", "pool" => pool.to_string()).set(depth as f64);
}

/// 记录一次批次刷新
#[inline]
pub fn record_batch(processor: &str, status: &str, size: usize) {
    metrics::counter!(
        "membership_batches_total",
        "processor" => processor.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "membership_batch_size",
        "processor" => processor.to_string()
    )
    .record(size as f64);
}

/// 记录规则评估（mode: full / incremental）
#[inline]
pub fn record_rule_evaluation(mode: &str, status: &str) {
    metrics::counter!(
        "membership_rule_evaluations_total",
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录一次对账
#[inline]
pub fn record_reconciliation(status: &str, duration_secs: f64) {
    metrics::counter!(
        "membership_reconciliations_total",
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!("membership_reconciliation_duration_seconds").record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_job("rule-evaluation", "succeeded", 0.1);
        set_queue_depth("rule-evaluation", 3);
        record_batch("asset-batch", "ok", 50);
        record_rule_evaluation("incremental", "matched");
        record_reconciliation("ok", 1.5);
    }
}
