//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册推送相关指标的描述（出现在 /metrics 的 HELP 注释中）
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("push_deliveries_total", "Total number of push deliveries");
    metrics::describe_histogram!(
        "push_delivery_duration_seconds",
        "Push gateway call duration in seconds"
    );
    metrics::describe_counter!("push_jobs_total", "Total number of finished queue jobs");
    metrics::describe_gauge!("push_jobs_in_flight", "Queue jobs currently being processed");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
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

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次网关投递
///
/// `error_code` 为空表示成功。
#[inline]
pub fn record_push_delivery(status: &str, error_code: Option<&str>, duration_secs: f64) {
    metrics::counter!(
        "push_deliveries_total",
        "status" => status.to_string(),
        "error" => error_code.unwrap_or("none").to_string()
    )
    .increment(1);

    metrics::histogram!(
        "push_delivery_duration_seconds",
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// 记录队列任务的最终结果（completed / failed / retrying）
#[inline]
pub fn record_queue_job(queue: &str, outcome: &str) {
    metrics::counter!(
        "push_jobs_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 更新正在处理的任务数
#[inline]
pub fn set_jobs_in_flight(queue: &str, in_flight: usize) {
    metrics::gauge!("push_jobs_in_flight", "queue" => queue.to_string()).set(in_flight as f64);
}
