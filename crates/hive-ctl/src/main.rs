//! hive-ctl — command-line interface for the Hive master.

use anyhow::{Context, Result};

mod cmd;

use cmd::{status, tasks};

const DEFAULT_PORT: u16 = 5555;

fn print_usage() {
    println!("Usage: hive-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                          Show master status and task counts");
    println!("  workers                         List known workers");
    println!("  tasks [status]                  List tasks, optionally by status");
    println!("  task <id>                       Show one task as JSON");
    println!("  submit <type> <payload> [input] Submit a task");
    println!("         [--accel] [--strategy S] [--timeout SECS]");
    println!("  cancel <id>                     Cancel a task");
    println!("  purge [status]                  Drop finished tasks");
    println!();
    println!("A payload that is not a JSON object runs as a shell command line.");
    println!();
    println!("Options:");
    println!("  --port <port>   Master API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => status::cmd_status(port).await,
        ["workers"] => status::cmd_workers(port).await,
        ["tasks"] => tasks::cmd_tasks(port, None).await,
        ["tasks", s] => tasks::cmd_tasks(port, Some(*s)).await,
        ["task", id] => tasks::cmd_task(port, id).await,
        ["submit", rest @ ..] => tasks::cmd_submit(port, rest).await,
        ["cancel", id] => tasks::cmd_cancel(port, id).await,
        ["purge"] => tasks::cmd_purge(port, None).await,
        ["purge", s] => tasks::cmd_purge(port, Some(*s)).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
