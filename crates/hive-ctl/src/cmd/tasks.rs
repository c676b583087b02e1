//! Task commands: list, inspect, submit, cancel, purge.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use super::http::{base_url, delete_json, get_json, post_json, post_json_body};

#[derive(Deserialize)]
struct TasksResponse {
    tasks: Vec<TaskJson>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct TaskJson {
    id: String,
    task_type: String,
    status: String,
    worker: Option<String>,
    attempt: u32,
    progress: Option<u8>,
    outcome: Option<serde_json::Value>,
    submitted_at: u64,
    updated_at: u64,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct SubmitRequest {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub input: serde_json::Value,
    pub requirements: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct CancelResponse {
    task_id: String,
    previous: String,
}

#[derive(Deserialize)]
struct PurgeResponse {
    removed: usize,
}

pub async fn cmd_tasks(port: u16, status: Option<&str>) -> Result<()> {
    let url = match status {
        Some(s) => format!("{}/tasks?status={}", base_url(port), s),
        None => format!("{}/tasks", base_url(port)),
    };
    let resp: TasksResponse = get_json(&url).await?;

    if resp.tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Tasks ({})", resp.tasks.len());
    println!("═══════════════════════════════════════");

    for t in &resp.tasks {
        let progress = t.progress.map(|p| format!(" {}%", p)).unwrap_or_default();
        println!(
            "  {}  {:<10} {:<16} {}{}",
            &t.id[..16.min(t.id.len())],
            t.status,
            t.task_type,
            t.worker.as_deref().unwrap_or("-"),
            progress
        );
    }

    Ok(())
}

pub async fn cmd_task(port: u16, id: &str) -> Result<()> {
    let task: serde_json::Value = get_json(&format!("{}/tasks/{}", base_url(port), id)).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

/// `<type> <payload> [input-json] [--accel] [--strategy S] [--timeout SECS]`
///
/// A payload that is not a JSON object is run as a `/bin/sh -c` command line.
pub fn build_submit(args: &[&str]) -> Result<SubmitRequest> {
    let mut positional = Vec::new();
    let mut accelerator = false;
    let mut strategy = None;
    let mut timeout_secs = None;

    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "--accel" => accelerator = true,
            "--strategy" => {
                i += 1;
                strategy = Some(args.get(i).context("--strategy requires a value")?.to_string());
            }
            "--timeout" => {
                i += 1;
                timeout_secs = Some(
                    args.get(i)
                        .context("--timeout requires a value")?
                        .parse()
                        .context("--timeout must be a number")?,
                );
            }
            other => positional.push(other),
        }
        i += 1;
    }

    let (task_type, payload_arg, input_arg) = match positional.as_slice() {
        [t, p] => (*t, *p, None),
        [t, p, input] => (*t, *p, Some(*input)),
        _ => bail!("usage: submit <type> <payload> [input-json] [--accel]"),
    };

    let payload = if payload_arg.trim_start().starts_with('{') {
        serde_json::from_str(payload_arg).context("payload is not valid JSON")?
    } else {
        serde_json::json!({
            "kind": "command",
            "program": "/bin/sh",
            "args": ["-c", payload_arg],
        })
    };
    let input = match input_arg {
        Some(raw) => serde_json::from_str(raw).context("input is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    Ok(SubmitRequest {
        task_type: task_type.to_string(),
        payload,
        input,
        requirements: serde_json::json!({ "accelerator": accelerator }),
        strategy,
        timeout_secs,
    })
}

pub async fn cmd_submit(port: u16, args: &[&str]) -> Result<()> {
    let req = build_submit(args)?;
    let resp: SubmitResponse = post_json_body(&format!("{}/tasks", base_url(port)), &req).await?;
    println!("Submitted task {}", resp.task_id);
    Ok(())
}

pub async fn cmd_cancel(port: u16, id: &str) -> Result<()> {
    let resp: CancelResponse =
        post_json(&format!("{}/tasks/{}/cancel", base_url(port), id)).await?;
    println!("Cancelled task {} (was {})", resp.task_id, resp.previous);
    Ok(())
}

pub async fn cmd_purge(port: u16, status: Option<&str>) -> Result<()> {
    let url = match status {
        Some(s) => format!("{}/tasks?status={}", base_url(port), s),
        None => format!("{}/tasks", base_url(port)),
    };
    let resp: PurgeResponse = delete_json(&url).await?;
    println!("Purged {} tasks.", resp.removed);
    Ok(())
}
