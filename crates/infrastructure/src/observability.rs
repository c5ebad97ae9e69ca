//! 指标导出
//!
//! 任务引擎与控制器通过 `metrics` 宏记录指标，这里负责注册描述并安装 Prometheus 导出器。

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub const TASKS_SUCCEEDED_TOTAL: &str = "kaas_tasks_succeeded_total";
pub const TASKS_RETRIED_TOTAL: &str = "kaas_tasks_retried_total";
pub const TASKS_FAILED_TOTAL: &str = "kaas_tasks_failed_total";
pub const TASK_DURATION_SECONDS: &str = "kaas_task_duration_seconds";
pub const NODE_TRANSITIONS_TOTAL: &str = "kaas_node_transitions_total";
pub const RECONCILE_ORPHANS_TOTAL: &str = "kaas_reconcile_orphan_vms_total";
pub const WORKER_ACTIVE_TASKS: &str = "kaas_worker_active_tasks";

/// 注册所有指标的描述
pub fn describe_metrics() {
    describe_counter!(TASKS_SUCCEEDED_TOTAL, Unit::Count, "成功完成的任务数");
    describe_counter!(TASKS_RETRIED_TOTAL, Unit::Count, "重新排队等待重试的任务数");
    describe_counter!(TASKS_FAILED_TOTAL, Unit::Count, "最终失败的任务数");
    describe_histogram!(TASK_DURATION_SECONDS, Unit::Seconds, "单次任务执行耗时");
    describe_counter!(NODE_TRANSITIONS_TOTAL, Unit::Count, "节点状态迁移次数");
    describe_counter!(RECONCILE_ORPHANS_TOTAL, Unit::Count, "对账时清理的孤儿虚拟机数");
    describe_gauge!(WORKER_ACTIVE_TASKS, Unit::Count, "工作节点正在执行的任务数");
}

/// 安装 Prometheus 导出器，需在 tokio 运行时内调用
pub fn install_prometheus_exporter(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装 Prometheus 导出器失败: {e}"))?;

    describe_metrics();
    info!("Prometheus 指标导出已启动，监听 {}", addr);
    Ok(())
}
