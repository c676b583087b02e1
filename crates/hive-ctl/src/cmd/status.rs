//! Master status and worker listing.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatusResponse {
    node_id: String,
    uptime_secs: u64,
    workers_connected: usize,
    workers_known: usize,
    default_strategy: String,
    tasks: TaskCounts,
}

#[derive(Deserialize)]
struct TaskCounts {
    pending: usize,
    dispatched: usize,
    running: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
    total: usize,
}

#[derive(Deserialize)]
struct WorkersResponse {
    workers: Vec<WorkerInfo>,
}

#[derive(Deserialize)]
struct WorkerInfo {
    id: String,
    hostname: String,
    status: String,
    active_tasks: u32,
    latency_ms: Option<f64>,
    resources: Option<Resources>,
    last_seen_secs: u64,
}

#[derive(Deserialize)]
struct Resources {
    cpu_percent: f64,
    mem_percent: f64,
    disk_free_gb: f64,
    core_count: u32,
    memory_total_mb: u64,
    accelerator: Option<String>,
    platform: String,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Hive Master Status");
    println!("═══════════════════════════════════════");
    println!("  Node              : {}", resp.node_id);
    println!("  Uptime            : {}s", resp.uptime_secs);
    println!("  Workers connected : {} / {} known", resp.workers_connected, resp.workers_known);
    println!("  Default strategy  : {}", resp.default_strategy);
    println!();
    println!("  Tasks ({} total)", resp.tasks.total);
    println!("    pending    : {}", resp.tasks.pending);
    println!("    dispatched : {}", resp.tasks.dispatched);
    println!("    running    : {}", resp.tasks.running);
    println!("    completed  : {}", resp.tasks.completed);
    println!("    failed     : {}", resp.tasks.failed);
    println!("    cancelled  : {}", resp.tasks.cancelled);

    Ok(())
}

pub async fn cmd_workers(port: u16) -> Result<()> {
    let resp: WorkersResponse = get_json(&format!("{}/workers", base_url(port))).await?;

    if resp.workers.is_empty() {
        println!("No workers known yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Workers ({})", resp.workers.len());
    println!("═══════════════════════════════════════");

    for w in &resp.workers {
        let latency = w
            .latency_ms
            .map(|l| format!("{:.1} ms", l))
            .unwrap_or_else(|| "-".to_string());
        println!("  ┌─ {} ({})", w.id, w.hostname);
        println!("  │  status    : {} ({} active)", w.status, w.active_tasks);
        println!("  │  latency   : {}", latency);
        if let Some(r) = &w.resources {
            println!("  │  cpu / mem : {:.0}% / {:.0}%", r.cpu_percent, r.mem_percent);
            println!(
                "  │  capacity  : {} cores, {} MB, {:.1} GB free disk",
                r.core_count, r.memory_total_mb, r.disk_free_gb
            );
            println!("  │  platform  : {}", r.platform);
            if let Some(acc) = &r.accelerator {
                println!("  │  gpu       : {}", acc);
            }
        }
        println!("  └─ last seen : {}s ago", w.last_seen_secs);
    }

    Ok(())
}
