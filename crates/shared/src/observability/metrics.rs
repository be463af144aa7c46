//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const RULE_EXECUTIONS_TOTAL: &str = "rule_executions_total";
pub const RULE_EXECUTION_DURATION_SECONDS: &str = "rule_execution_duration_seconds";
pub const RULE_FIRINGS_TOTAL: &str = "rule_firings_total";
pub const WEBHOOK_CALLS_TOTAL: &str = "webhook_calls_total";
pub const RULE_COMPILATIONS_TOTAL: &str = "rule_compilations_total";

/// Metrics 资源守卫，drop 时停止指标服务器
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
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_metrics(service_name: &str) {
    metrics::describe_counter!(RULE_EXECUTIONS_TOTAL, "Total number of rule-set executions");
    metrics::describe_histogram!(
        RULE_EXECUTION_DURATION_SECONDS,
        "Rule-set execution duration in seconds"
    );
    metrics::describe_counter!(RULE_FIRINGS_TOTAL, "Total number of rule firings");
    metrics::describe_counter!(WEBHOOK_CALLS_TOTAL, "Total number of webhook calls");
    metrics::describe_counter!(RULE_COMPILATIONS_TOTAL, "Total number of rule compilations");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 记录一次执行
#[inline]
pub fn record_execution(status: &str, dry_run: bool, duration_secs: f64) {
    metrics::counter!(
        RULE_EXECUTIONS_TOTAL,
        "status" => status.to_string(),
        "dry_run" => dry_run.to_string()
    )
    .increment(1);

    metrics::histogram!(RULE_EXECUTION_DURATION_SECONDS, "status" => status.to_string())
        .record(duration_secs);
}

/// 记录规则触发
#[inline]
pub fn record_rule_firing(project_id: &str) {
    metrics::counter!(RULE_FIRINGS_TOTAL, "project_id" => project_id.to_string()).increment(1);
}

/// 记录 Webhook 调用
#[inline]
pub fn record_webhook_call(success: bool) {
    let status = if success { "success" } else { "failure" };
    metrics::counter!(WEBHOOK_CALLS_TOTAL, "status" => status).increment(1);
}

/// 记录规则编译
#[inline]
pub fn record_compilation(success: bool) {
    let status = if success { "success" } else { "failure" };
    metrics::counter!(RULE_COMPILATIONS_TOTAL, "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_execution("success", false, 0.01);
        record_rule_firing("p1");
        record_webhook_call(false);
        record_compilation(true);
    }
}
