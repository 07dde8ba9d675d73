//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use devicelab_core::{AlertStatus, DeviceStatus, RunStatus, TaskStatus};

use crate::store::Store;

/// Collect all metrics from the store and format as Prometheus text.
pub async fn collect_metrics(store: &Arc<dyn Store>) -> String {
    let mut output = String::new();

    collect_device_metrics(store, &mut output).await;
    collect_task_metrics(store, &mut output).await;
    collect_run_metrics(store, &mut output).await;
    collect_alert_metrics(store, &mut output).await;

    output
}

/// Collect device metrics by status.
async fn collect_device_metrics(store: &Arc<dyn Store>, output: &mut String) {
    let mut available = 0u64;
    let mut busy = 0u64;
    let mut offline = 0u64;
    let mut maintenance = 0u64;

    for device in store.devices().await {
        match device.status {
            DeviceStatus::Available => available += 1,
            DeviceStatus::Busy => busy += 1,
            DeviceStatus::Offline => offline += 1,
            DeviceStatus::Maintenance => maintenance += 1,
        }
    }

    writeln!(
        output,
        "# HELP devicelab_devices Number of pool devices by status"
    )
    .ok();
    writeln!(output, "# TYPE devicelab_devices gauge").ok();
    writeln!(
        output,
        "devicelab_devices{{status=\"available\"}} {available}"
    )
    .ok();
    writeln!(output, "devicelab_devices{{status=\"busy\"}} {busy}").ok();
    writeln!(output, "devicelab_devices{{status=\"offline\"}} {offline}").ok();
    writeln!(
        output,
        "devicelab_devices{{status=\"maintenance\"}} {maintenance}"
    )
    .ok();
}

/// Collect task metrics by status.
async fn collect_task_metrics(store: &Arc<dyn Store>, output: &mut String) {
    let mut queued = 0u64;
    let mut running = 0u64;
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut cancelled = 0u64;

    for task in store.tasks().await {
        match task.status {
            TaskStatus::Queued => queued += 1,
            TaskStatus::Running => running += 1,
            TaskStatus::Succeeded => succeeded += 1,
            TaskStatus::Failed => failed += 1,
            TaskStatus::Cancelled => cancelled += 1,
        }
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP devicelab_tasks_total Total number of tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE devicelab_tasks_total gauge").ok();
    writeln!(output, "devicelab_tasks_total{{status=\"queued\"}} {queued}").ok();
    writeln!(
        output,
        "devicelab_tasks_total{{status=\"running\"}} {running}"
    )
    .ok();
    writeln!(
        output,
        "devicelab_tasks_total{{status=\"succeeded\"}} {succeeded}"
    )
    .ok();
    writeln!(output, "devicelab_tasks_total{{status=\"failed\"}} {failed}").ok();
    writeln!(
        output,
        "devicelab_tasks_total{{status=\"cancelled\"}} {cancelled}"
    )
    .ok();
}

/// Collect run metrics by status.
async fn collect_run_metrics(store: &Arc<dyn Store>, output: &mut String) {
    let mut created = 0u64;
    let mut running = 0u64;
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut cancelled = 0u64;

    for run in store.runs().await {
        match run.status {
            RunStatus::Created => created += 1,
            RunStatus::Running => running += 1,
            RunStatus::Succeeded => succeeded += 1,
            RunStatus::Failed => failed += 1,
            RunStatus::Cancelled => cancelled += 1,
        }
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP devicelab_runs_total Total number of task runs by status"
    )
    .ok();
    writeln!(output, "# TYPE devicelab_runs_total gauge").ok();
    writeln!(output, "devicelab_runs_total{{status=\"created\"}} {created}").ok();
    writeln!(output, "devicelab_runs_total{{status=\"running\"}} {running}").ok();
    writeln!(
        output,
        "devicelab_runs_total{{status=\"succeeded\"}} {succeeded}"
    )
    .ok();
    writeln!(output, "devicelab_runs_total{{status=\"failed\"}} {failed}").ok();
    writeln!(
        output,
        "devicelab_runs_total{{status=\"cancelled\"}} {cancelled}"
    )
    .ok();
}

/// Collect the count of alerts still waiting for a human.
async fn collect_alert_metrics(store: &Arc<dyn Store>, output: &mut String) {
    let pending = store
        .alerts()
        .await
        .iter()
        .filter(|a| a.status == AlertStatus::Pending)
        .count();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP devicelab_alerts_pending Alerts awaiting acknowledgement"
    )
    .ok();
    writeln!(output, "# TYPE devicelab_alerts_pending gauge").ok();
    writeln!(output, "devicelab_alerts_pending {pending}").ok();
}
