//! Execution sandbox — runs one task payload in a resource-limited child.
//!
//! The child gets its own process group with `RLIMIT_CPU` and `RLIMIT_AS`
//! applied before exec. The address-space ceiling sits above the memory
//! limit; the limit itself is enforced on the resident memory of the whole
//! group. While the child runs, the sandbox watches the wall clock, that
//! resident total and a cancel signal, and any of them kills the group.
//! The leader is only reaped after its group has been killed, so the group
//! id cannot have been reused by then. Input arrives as JSON on stdin. The payload may
//! write a JSON return value to `$HIVE_RESULT_FILE` and a 0–100 progress
//! figure to `$HIVE_PROGRESS_FILE`.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, oneshot};

use hive_core::config::SandboxConfig;
use hive_core::task::{effective_timeout_secs, FailureKind, TaskOutcome, TaskPayload};

pub const ENV_TASK_ID: &str = "HIVE_TASK_ID";
pub const ENV_RESULT_FILE: &str = "HIVE_RESULT_FILE";
pub const ENV_PROGRESS_FILE: &str = "HIVE_PROGRESS_FILE";

const MEMORY_POLL: Duration = Duration::from_millis(200);
const EXIT_POLL: Duration = Duration::from_millis(50);
const DIAGNOSTIC_TAIL: usize = 2048;
const MIB: u64 = 1024 * 1024;

/// `RLIMIT_AS` is this multiple of the memory limit.
const ADDRESS_SPACE_HEADROOM: u64 = 2;

/// Lower-cased stderr fragments that mean an allocation was refused.
const ALLOCATION_FAILURES: &[&str] = &[
    "memory exhausted",
    "cannot allocate memory",
    "out of memory",
    "memoryerror",
    "bad_alloc",
    "failed to allocate",
];

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// 0 = unlimited.
    pub cpu_time_secs: u64,
    /// 0 = unlimited.
    pub memory_bytes: u64,
    pub wall_clock: Duration,
    pub output_limit_bytes: usize,
    pub progress_interval: Duration,
}

impl SandboxLimits {
    /// Limits for one task. `timeout_secs` overrides the configured wall clock
    /// under the same rule the master uses for its deadline.
    pub fn from_config(config: &SandboxConfig, timeout_secs: Option<u64>) -> Self {
        let wall = effective_timeout_secs(timeout_secs, config.wall_clock_secs);
        Self {
            cpu_time_secs: config.cpu_time_secs,
            memory_bytes: config.memory_bytes,
            wall_clock: Duration::from_secs(wall),
            output_limit_bytes: config.output_limit_bytes,
            progress_interval: Duration::from_secs(config.progress_interval_secs.max(1)),
        }
    }
}

/// Periodic progress sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percent: Option<u8>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_value: Option<serde_json::Value>,
    pub exit_code: i32,
    pub elapsed_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare work directory: {0}")]
    Setup(std::io::Error),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    ResourceLimit(String),

    #[error("wall-clock limit of {}s exceeded", .0.as_secs())]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl SandboxError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SandboxError::Setup(_) | SandboxError::Execution(_) => FailureKind::ExecutionError,
            SandboxError::ResourceLimit(_) => FailureKind::ResourceLimitExceeded,
            SandboxError::Timeout(_) => FailureKind::Timeout,
            SandboxError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Convert a sandbox result into the outcome reported to the master.
pub fn into_outcome(result: Result<SandboxOutput, SandboxError>, elapsed_ms: u64) -> TaskOutcome {
    match result {
        Ok(out) => TaskOutcome::Completed {
            stdout: out.stdout,
            stderr: out.stderr,
            return_value: out.return_value,
            exit_code: out.exit_code,
            elapsed_ms: out.elapsed_ms,
        },
        Err(e) => TaskOutcome::Failed {
            kind: e.failure_kind(),
            message: e.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms,
        },
    }
}

// ── Sandbox ───────────────────────────────────────────────────────────────────

/// Runs payloads under a per-run directory inside `work_root`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    work_root: PathBuf,
    runs: Arc<AtomicU64>,
}

impl Sandbox {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run(
        &self,
        task_id: &str,
        payload: &TaskPayload,
        input: &serde_json::Value,
        limits: &SandboxLimits,
        progress: Option<mpsc::UnboundedSender<Progress>>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<SandboxOutput, SandboxError> {
        // A re-dispatched task may overlap its replaced run.
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let dir = self.work_root.join(format!("{}.{run}", dir_name(task_id)));
        tokio::fs::create_dir_all(&dir).await.map_err(SandboxError::Setup)?;

        let result = run_in(&dir, task_id, payload, input, limits, progress, cancel).await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::debug!(dir = %dir.display(), error = %e, "failed to clean task directory");
        }
        result
    }
}

async fn run_in(
    dir: &Path,
    task_id: &str,
    payload: &TaskPayload,
    input: &serde_json::Value,
    limits: &SandboxLimits,
    progress: Option<mpsc::UnboundedSender<Progress>>,
    mut cancel: oneshot::Receiver<()>,
) -> Result<SandboxOutput, SandboxError> {
    let result_file = dir.join("result.json");
    let progress_file = dir.join("progress");

    let mut cmd = match payload {
        TaskPayload::Command { program, args } => {
            let mut c = Command::new(program);
            c.args(args);
            c
        }
        TaskPayload::Script { interpreter, source } => {
            let script = dir.join("task.script");
            tokio::fs::write(&script, source)
                .await
                .map_err(SandboxError::Setup)?;
            let mut c = Command::new(interpreter);
            c.arg(&script);
            c
        }
    };

    cmd.current_dir(dir)
        .env(ENV_TASK_ID, task_id)
        .env(ENV_RESULT_FILE, &result_file)
        .env(ENV_PROGRESS_FILE, &progress_file)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let (cpu, mem) = (limits.cpu_time_secs, limits.memory_bytes);
    // SAFETY: the closure only calls async-signal-safe libc functions.
    unsafe {
        cmd.pre_exec(move || apply_limits(cpu, mem));
    }

    // Registered before spawn so the exit of a fast child is not missed.
    let mut sigchld = signal(SignalKind::child()).ok();

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::Execution(format!("failed to spawn '{}': {e}", payload.label())))?;
    let pid = child.id().map(|p| p as libc::pid_t);

    tracing::debug!(task_id, program = payload.label(), ?pid, "sandbox started");

    if let Some(mut stdin) = child.stdin.take() {
        let data = serde_json::to_vec(input).unwrap_or_default();
        tokio::spawn(async move {
            let _ = stdin.write_all(&data).await;
        });
    }
    let cap = limits.output_limit_bytes;
    let stdout_task = tokio::spawn(capture(child.stdout.take(), cap));
    let stderr_task = tokio::spawn(capture(child.stderr.take(), cap));

    let deadline = tokio::time::sleep(limits.wall_clock);
    tokio::pin!(deadline);
    let mut progress_tick = tokio::time::interval(limits.progress_interval);
    let mut memory_tick = tokio::time::interval(MEMORY_POLL);
    let mut exit_tick = tokio::time::interval(EXIT_POLL);
    let mut cancel_closed = false;
    let mut killed: Option<SandboxError> = None;
    let mut peak_rss = 0u64;

    // The leader stays a zombie until the group is gone.
    let exit = loop {
        let exit = match pid {
            Some(pid) => leader_exited(pid),
            None => Some(LeaderExit::default()),
        };
        if let Some(exit) = exit {
            break exit;
        }

        tokio::select! {
            _ = child_signal(&mut sigchld) => {}
            _ = exit_tick.tick() => {}

            _ = &mut deadline, if killed.is_none() => {
                kill_group(pid);
                killed = Some(SandboxError::Timeout(limits.wall_clock));
            }

            res = &mut cancel, if killed.is_none() && !cancel_closed => {
                match res {
                    Ok(()) => {
                        kill_group(pid);
                        killed = Some(SandboxError::Cancelled);
                    }
                    Err(_) => cancel_closed = true,
                }
            }

            _ = progress_tick.tick() => {
                if let Some(tx) = &progress {
                    let _ = tx.send(Progress {
                        percent: read_progress(&progress_file).await,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }

            _ = memory_tick.tick(), if killed.is_none() && mem > 0 => {
                if let Some(rss) = pid.and_then(group_resident_bytes) {
                    peak_rss = peak_rss.max(rss);
                    if rss > mem {
                        kill_group(pid);
                        killed = Some(SandboxError::ResourceLimit(format!(
                            "resident memory {} MiB exceeded limit of {} MiB",
                            rss / MIB,
                            mem / MIB
                        )));
                    }
                }
            }
        }
    };

    // Anything the payload left behind dies with the group before the
    // leader is reaped.
    kill_group(pid);
    let status = child.wait().await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    if let Some(err) = killed {
        tracing::debug!(task_id, error = %err, "sandbox killed");
        return Err(err);
    }
    let status = status.map_err(|e| SandboxError::Execution(format!("wait failed: {e}")))?;

    let ending = match (status.signal(), status.code()) {
        (Some(sig), _) => Some(Ending::Signal(sig)),
        (None, Some(0)) => None,
        (None, code) => Some(Ending::Code(code.unwrap_or(-1))),
    };
    if let Some(ending) = ending {
        let peak_rss = peak_rss.max(exit.max_rss_bytes);
        let err = classify_failure(ending, limits, peak_rss, &diagnostic(&stdout, &stderr));
        tracing::debug!(task_id, ?ending, peak_mib = peak_rss / MIB, error = %err, "sandbox failed");
        return Err(err);
    }

    Ok(SandboxOutput {
        stdout,
        stderr,
        return_value: read_return_value(&result_file, task_id).await,
        exit_code: 0,
        elapsed_ms,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Runs in the forked child before exec.
fn apply_limits(cpu_secs: u64, mem_bytes: u64) -> std::io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if cpu_secs > 0 {
            // Soft limit raises SIGXCPU; the hard limit one second later kills.
            let lim = libc::rlimit {
                rlim_cur: cpu_secs as libc::rlim_t,
                rlim_max: (cpu_secs + 1) as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &lim) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if mem_bytes > 0 {
            let ceiling = mem_bytes.saturating_mul(ADDRESS_SPACE_HEADROOM);
            let lim = libc::rlimit {
                rlim_cur: ceiling as libc::rlim_t,
                rlim_max: ceiling as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &lim) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Only called while the leader is unreaped, so `pid` still names our group.
fn kill_group(pid: Option<libc::pid_t>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LeaderExit {
    /// Peak resident memory of the leader and the children it waited for.
    max_rss_bytes: u64,
}

/// `Some` once `pid` has exited. The process is left a zombie.
fn leader_exited(pid: libc::pid_t) -> Option<LeaderExit> {
    // SAFETY: zeroed siginfo_t and rusage are valid out-parameters.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let flags = libc::WEXITED | libc::WNOHANG | libc::WNOWAIT;
    // The raw syscall takes the rusage argument the libc wrapper drops.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_waitid,
            libc::P_PID,
            pid as libc::id_t,
            &mut info as *mut libc::siginfo_t,
            flags,
            &mut usage as *mut libc::rusage,
        )
    };
    if rc != 0 {
        return match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => None,
            _ => Some(LeaderExit::default()),
        };
    }
    // SAFETY: waitid filled `info` for a child state change, or left it zeroed.
    if unsafe { info.si_pid() } == 0 {
        return None;
    }
    Some(LeaderExit {
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64).saturating_mul(1024),
    })
}

async fn child_signal(stream: &mut Option<Signal>) {
    match stream {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// How a payload ended when it was not killed by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Code(i32),
    Signal(i32),
}

/// Map a failed run to an error, attributing it to a resource limit when
/// the way it died points at one.
fn classify_failure(ending: Ending, limits: &SandboxLimits, peak_rss: u64, diag: &str) -> SandboxError {
    // Shells report a child killed by signal N as status 128+N.
    let signal = match ending {
        Ending::Signal(sig) => Some(sig),
        Ending::Code(code) if code > 128 && code <= 128 + 64 => Some(code - 128),
        Ending::Code(_) => None,
    };
    let (cpu, mem) = (limits.cpu_time_secs, limits.memory_bytes);

    if signal == Some(libc::SIGXCPU) {
        return SandboxError::ResourceLimit(format!("CPU time limit of {cpu}s exceeded"));
    }
    if mem > 0 {
        let crashed = matches!(
            signal,
            Some(libc::SIGSEGV | libc::SIGBUS | libc::SIGABRT | libc::SIGKILL)
        );
        let near_limit = peak_rss.saturating_mul(2) >= mem;
        let lower = diag.to_ascii_lowercase();
        let refused = ALLOCATION_FAILURES.iter().any(|m| lower.contains(m));
        if refused || (crashed && near_limit) {
            return SandboxError::ResourceLimit(format!(
                "memory limit of {} MiB exceeded (peak {} MiB): {diag}",
                mem / MIB,
                peak_rss / MIB
            ));
        }
    }
    // The hard RLIMIT_CPU is enforced with SIGKILL.
    if cpu > 0 && signal == Some(libc::SIGKILL) {
        return SandboxError::ResourceLimit(format!("CPU time limit of {cpu}s exceeded"));
    }

    match ending {
        Ending::Signal(sig) => SandboxError::Execution(format!("terminated by signal {sig}: {diag}")),
        Ending::Code(code) => SandboxError::Execution(format!("exit code {code}: {diag}")),
    }
}

/// Read a stream into memory, keeping at most `cap` bytes but draining the rest.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(out.len());
                if n > room {
                    truncated = true;
                }
                out.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    let mut s = String::from_utf8_lossy(&out).into_owned();
    if truncated {
        s.push_str("\n[output truncated]");
    }
    s
}

fn diagnostic(stdout: &str, stderr: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let source = source.trim_end();
    let mut start = source.len().saturating_sub(DIAGNOSTIC_TAIL);
    while !source.is_char_boundary(start) {
        start += 1;
    }
    source[start..].to_string()
}

async fn read_progress(path: &Path) -> Option<u8> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    parse_progress(&text)
}

fn parse_progress(text: &str) -> Option<u8> {
    let value: f64 = text.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(0.0, 100.0) as u8)
}

async fn read_return_value(path: &Path, task_id: &str) -> Option<serde_json::Value> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(task_id, error = %e, "result file is not valid JSON, ignoring");
            None
        }
    }
}

/// Resident bytes summed over every process in group `pgid`.
fn group_resident_bytes(pgid: libc::pid_t) -> Option<u64> {
    let page = u64::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) })
        .ok()
        .filter(|p| *p > 0)?;
    let mut pages = 0u64;
    let mut members = 0usize;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some((pgrp, rss)) = parse_stat(&stat) {
            if pgrp == pgid {
                pages += rss;
                members += 1;
            }
        }
    }
    (members > 0).then(|| pages.saturating_mul(page))
}

/// `pid (comm) state ppid pgrp ... rss ...` → (pgrp, rss in pages).
fn parse_stat(stat: &str) -> Option<(libc::pid_t, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is `state`, the third field of proc(5).
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss))
}

fn dir_name(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(name: &str) -> Sandbox {
        Sandbox::new(std::env::temp_dir().join(format!("hive-sandbox-{name}-{}", std::process::id())))
    }

    fn limits(wall_ms: u64) -> SandboxLimits {
        SandboxLimits {
            cpu_time_secs: 0,
            memory_bytes: 0,
            wall_clock: Duration::from_millis(wall_ms),
            output_limit_bytes: 1024 * 1024,
            progress_interval: Duration::from_millis(50),
        }
    }

    fn sh(script: &str) -> TaskPayload {
        TaskPayload::Command {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn run(name: &str, payload: TaskPayload, input: serde_json::Value, limits: SandboxLimits)
        -> Result<SandboxOutput, SandboxError>
    {
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        sandbox(name)
            .run(name, &payload, &input, &limits, None, cancel_rx)
            .await
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run("echo", sh("echo hello"), serde_json::Value::Null, limits(5_000))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.return_value, None);
    }

    #[tokio::test]
    async fn input_arrives_on_stdin() {
        let input = serde_json::json!({ "n": 3 });
        let out = run("stdin", sh("cat"), input.clone(), limits(5_000)).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&out.stdout).unwrap();
        assert_eq!(echoed, input);
    }

    #[tokio::test]
    async fn result_file_becomes_return_value() {
        let payload = sh(r#"printf '{"answer":42}' > "$HIVE_RESULT_FILE""#);
        let out = run("result", payload, serde_json::Value::Null, limits(5_000))
            .await
            .unwrap();
        assert_eq!(out.return_value, Some(serde_json::json!({ "answer": 42 })));
    }

    #[tokio::test]
    async fn script_payload_runs_with_interpreter() {
        let payload = TaskPayload::Script {
            interpreter: "/bin/sh".into(),
            source: "echo \"task=$HIVE_TASK_ID\"\n".into(),
        };
        let out = run("script", payload, serde_json::Value::Null, limits(5_000))
            .await
            .unwrap();
        assert_eq!(out.stdout, "task=script\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_execution_error_with_stderr() {
        let err = run("exit", sh("echo broken >&2; exit 3"), serde_json::Value::Null, limits(5_000))
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::ExecutionError);
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    #[tokio::test]
    async fn missing_program_is_execution_error() {
        let payload = TaskPayload::Command {
            program: "/nonexistent/hive-test-binary".into(),
            args: vec![],
        };
        let err = run("missing", payload, serde_json::Value::Null, limits(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
    }

    #[tokio::test]
    async fn wall_clock_limit_kills_group() {
        let start = Instant::now();
        let err = run("timeout", sh("sleep 5; echo late"), serde_json::Value::Null, limits(300))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cpu_limit_is_resource_limit_exceeded() {
        let mut l = limits(10_000);
        l.cpu_time_secs = 1;
        let err = run("cpu", sh("while :; do :; done"), serde_json::Value::Null, l)
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::ResourceLimitExceeded);
    }

    #[tokio::test]
    async fn cancel_kills_running_task() {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let sb = sandbox("cancel");
        let payload = sh("sleep 5");
        let l = limits(10_000);
        let handle = tokio::spawn(async move {
            sb.run("cancel", &payload, &serde_json::Value::Null, &l, None, cancel_rx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(()).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled));
    }

    #[tokio::test]
    async fn progress_file_is_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let payload = sh(r#"echo 40 > "$HIVE_PROGRESS_FILE"; sleep 0.4"#);
        sandbox("progress")
            .run("progress", &payload, &serde_json::Value::Null, &limits(5_000), Some(tx), cancel_rx)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.percent);
        }
        assert!(!seen.is_empty());
        assert!(seen.contains(&Some(40)), "{seen:?}");
    }

    #[tokio::test]
    async fn output_is_capped() {
        let mut l = limits(5_000);
        l.output_limit_bytes = 16;
        let out = run("cap", sh("printf '%0100d' 0"), serde_json::Value::Null, l)
            .await
            .unwrap();
        assert!(out.stdout.starts_with(&"0".repeat(16)));
        assert!(out.stdout.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn forked_cpu_hog_is_resource_limit_exceeded() {
        let mut l = limits(10_000);
        l.cpu_time_secs = 1;
        // The hog is a child of the leader, whose shell reports 128+SIGXCPU.
        let payload = sh("/bin/sh -c 'while :; do :; done'; exit $?");
        let err = run("cpu-fork", payload, serde_json::Value::Null, l)
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::ResourceLimitExceeded, "{err}");
    }

    #[tokio::test]
    async fn memory_hog_is_resource_limit_exceeded() {
        let mut l = limits(20_000);
        l.memory_bytes = 64 * MIB;
        // tail buffers an endless line of NULs.
        let payload = TaskPayload::Command {
            program: "tail".into(),
            args: vec!["/dev/zero".into()],
        };
        let err = run("mem", payload, serde_json::Value::Null, l)
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::ResourceLimitExceeded, "{err}");
    }

    #[tokio::test]
    async fn memory_limit_leaves_small_tasks_alone() {
        let mut l = limits(5_000);
        l.memory_bytes = 64 * MIB;
        let out = run("mem-ok", sh("echo fine"), serde_json::Value::Null, l)
            .await
            .unwrap();
        assert_eq!(out.stdout, "fine\n");
    }

    #[tokio::test]
    async fn background_children_die_with_the_leader() {
        let out = run("orphan", sh("sleep 30 & echo $!"), serde_json::Value::Null, limits(5_000))
            .await
            .unwrap();
        let orphan: u32 = out.stdout.trim().parse().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match std::fs::read_to_string(format!("/proc/{orphan}/stat")) {
                Err(_) => break,
                Ok(stat) if stat.contains(") Z ") => break,
                Ok(_) => {}
            }
            assert!(Instant::now() < deadline, "background sleep {orphan} survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn exit_is_observed_without_reaping() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();
        let pid = child.id() as libc::pid_t;

        let deadline = Instant::now() + Duration::from_secs(5);
        while leader_exited(pid).is_none() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        // Still a zombie, so its pid and group id are not free for reuse.
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        assert!(stat.contains(") Z "), "{stat}");
        assert_eq!(child.wait().unwrap().code(), Some(7));
    }

    #[test]
    fn stat_line_yields_group_and_rss() {
        let stat = "4242 (my (odd) cmd) S 1 4240 4240 0 -1 4194304 100 0 0 0 1 2 0 0 20 0 1 0 \
                    555 12345678 321 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0";
        assert_eq!(parse_stat(stat), Some((4240, 321)));
        assert_eq!(parse_stat("garbage"), None);
    }

    fn limited(cpu: u64, mem: u64) -> SandboxLimits {
        let mut l = limits(1_000);
        l.cpu_time_secs = cpu;
        l.memory_bytes = mem;
        l
    }

    #[test]
    fn cpu_signal_is_a_resource_limit_directly_or_via_shell() {
        let l = limited(2, 0);
        let direct = classify_failure(Ending::Signal(libc::SIGXCPU), &l, 0, "");
        let shell = classify_failure(Ending::Code(128 + libc::SIGXCPU), &l, 0, "");
        let hard = classify_failure(Ending::Signal(libc::SIGKILL), &l, 0, "");
        for err in [direct, shell, hard] {
            assert_eq!(err.failure_kind(), FailureKind::ResourceLimitExceeded, "{err}");
        }
    }

    #[test]
    fn crash_near_memory_limit_is_a_resource_limit() {
        let l = limited(0, 64 * MIB);
        let segv = classify_failure(Ending::Signal(libc::SIGSEGV), &l, 60 * MIB, "");
        assert_eq!(segv.failure_kind(), FailureKind::ResourceLimitExceeded, "{segv}");
        let via_shell = classify_failure(Ending::Code(128 + libc::SIGSEGV), &l, 40 * MIB, "");
        assert_eq!(via_shell.failure_kind(), FailureKind::ResourceLimitExceeded);
        let refused = classify_failure(Ending::Code(1), &l, 0, "tail: memory exhausted");
        assert_eq!(refused.failure_kind(), FailureKind::ResourceLimitExceeded);
        assert!(refused.to_string().contains("memory limit of 64 MiB"), "{refused}");
    }

    #[test]
    fn ordinary_failures_stay_execution_errors() {
        let l = limited(2, 64 * MIB);
        let segv = classify_failure(Ending::Signal(libc::SIGSEGV), &l, MIB, "");
        assert_eq!(segv.failure_kind(), FailureKind::ExecutionError);
        assert!(segv.to_string().starts_with("terminated by signal 11"), "{segv}");
        let exit = classify_failure(Ending::Code(3), &l, 0, "boom");
        assert_eq!(exit.to_string(), "exit code 3: boom");

        // Without limits, signals are just signals.
        let kill = classify_failure(Ending::Signal(libc::SIGKILL), &limited(0, 0), 0, "");
        assert_eq!(kill.failure_kind(), FailureKind::ExecutionError);
    }

    #[test]
    fn progress_parsing_clamps() {
        assert_eq!(parse_progress("55\n"), Some(55));
        assert_eq!(parse_progress("250"), Some(100));
        assert_eq!(parse_progress("12.7"), Some(12));
        assert_eq!(parse_progress("soon"), None);
    }

    #[test]
    fn outcome_carries_failure_kind() {
        let outcome = into_outcome(Err(SandboxError::Timeout(Duration::from_secs(3))), 3000);
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
        assert!(!outcome.is_success());
    }

    #[test]
    fn task_ids_are_safe_directory_names() {
        assert_eq!(dir_name("../etc/passwd"), "___etc_passwd");
        assert_eq!(dir_name("abc-123_x"), "abc-123_x");
    }
}
