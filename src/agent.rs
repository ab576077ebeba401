use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::OrchestratorError;
use crate::registry::RegistryHandle;
use crate::types::{ExecutorVariant, ModelTier};
use crate::{log_debug, log_info, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// No stdout activity for this long hard-kills the child.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// How often the watchdog checks elapsed inactivity.
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

#[cfg(test)]
fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::Relaxed);
}

// --- Process Registry ---

fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Sends SIGTERM to all registered PGIDs, waits for the grace period, then
/// SIGKILLs any survivors. Used at shutdown, not for routine inactivity kills
/// (those go through `kill_process_group` for a single child).
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline = Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

// --- Executor variants (plugin-style executor capability) ---

/// A capability: spawn the right child process for a CLI and parse one line
/// of its stdout into a display message, or `None` if the line carries no
/// human-readable progress.
pub trait Executor: Send + Sync {
    fn binary_name(&self) -> &str;

    /// Build the subprocess's argv given the path to the written prompt file
    /// and a reasoning-effort string derived from the requested model tier.
    fn build_args(&self, prompt_path: &Path, reasoning_effort: &str) -> Vec<String>;

    /// Parse one stdout line (JSON or free text) into a display message.
    fn parse_event(&self, line: &str) -> Option<String>;
}

struct ClaudeExecutor;
impl Executor for ClaudeExecutor {
    fn binary_name(&self) -> &str {
        "claude"
    }
    fn build_args(&self, prompt_path: &Path, reasoning_effort: &str) -> Vec<String> {
        vec![
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--reasoning-effort".to_string(),
            reasoning_effort.to_string(),
            "-p".to_string(),
            format!("@{}", prompt_path.display()),
        ]
    }
    fn parse_event(&self, line: &str) -> Option<String> {
        parse_json_event_field(line, &["message", "text", "content"])
    }
}

struct CodexExecutor;
impl Executor for CodexExecutor {
    fn binary_name(&self) -> &str {
        "codex"
    }
    fn build_args(&self, prompt_path: &Path, reasoning_effort: &str) -> Vec<String> {
        vec![
            "exec".to_string(),
            "--json".to_string(),
            "--reasoning-effort".to_string(),
            reasoning_effort.to_string(),
            "--prompt-file".to_string(),
            prompt_path.display().to_string(),
        ]
    }
    fn parse_event(&self, line: &str) -> Option<String> {
        parse_json_event_field(line, &["message", "text"])
    }
}

struct GeminiExecutor;
impl Executor for GeminiExecutor {
    fn binary_name(&self) -> &str {
        "gemini"
    }
    fn build_args(&self, prompt_path: &Path, reasoning_effort: &str) -> Vec<String> {
        vec![
            "--yolo".to_string(),
            "--effort".to_string(),
            reasoning_effort.to_string(),
            "--prompt-file".to_string(),
            prompt_path.display().to_string(),
        ]
    }
    fn parse_event(&self, line: &str) -> Option<String> {
        parse_json_event_field(line, &["text", "message"])
    }
}

struct DeepSeekExecutor;
impl Executor for DeepSeekExecutor {
    fn binary_name(&self) -> &str {
        "deepseek"
    }
    fn build_args(&self, prompt_path: &Path, reasoning_effort: &str) -> Vec<String> {
        vec![
            "run".to_string(),
            "--effort".to_string(),
            reasoning_effort.to_string(),
            "--file".to_string(),
            prompt_path.display().to_string(),
        ]
    }
    fn parse_event(&self, line: &str) -> Option<String> {
        parse_json_event_field(line, &["message", "text"])
    }
}

struct GlmExecutor;
impl Executor for GlmExecutor {
    fn binary_name(&self) -> &str {
        "glm"
    }
    fn build_args(&self, prompt_path: &Path, reasoning_effort: &str) -> Vec<String> {
        vec![
            "chat".to_string(),
            "--effort".to_string(),
            reasoning_effort.to_string(),
            "--input".to_string(),
            prompt_path.display().to_string(),
        ]
    }
    fn parse_event(&self, line: &str) -> Option<String> {
        parse_json_event_field(line, &["message", "text"])
    }
}

/// Best-effort extraction of a human-readable string from a JSON stdout line;
/// falls back to treating non-JSON lines as free text verbatim.
fn parse_json_event_field(line: &str, candidate_fields: &[&str]) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => candidate_fields
            .iter()
            .find_map(|field| value.get(field).and_then(|v| v.as_str()))
            .map(str::to_string),
        Err(_) => Some(trimmed.to_string()),
    }
}

/// Resolve an `ExecutorVariant` to its capability. Unknown names are handled
/// by `crate::types::parse_executor_variant` before this is ever reached.
pub fn get_executor(variant: ExecutorVariant) -> Box<dyn Executor> {
    match variant {
        ExecutorVariant::Claude => Box::new(ClaudeExecutor),
        ExecutorVariant::Codex => Box::new(CodexExecutor),
        ExecutorVariant::Gemini => Box::new(GeminiExecutor),
        ExecutorVariant::DeepSeek => Box::new(DeepSeekExecutor),
        ExecutorVariant::Glm => Box::new(GlmExecutor),
    }
}

// --- Subprocess Supervisor ---

pub struct SupervisorOptions {
    pub model_tier: ModelTier,
    pub working_dir: Option<PathBuf>,
    pub task_name: Option<String>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            model_tier: ModelTier::Medium,
            working_dir: None,
            task_name: None,
        }
    }
}

/// Run one external AI agent invocation to completion.
///
/// `log_root` is the workspace-relative directory the append-only log lives
/// under (e.g. `.claudiomiro/task-executor/<task>/log.txt`); the caller picks
/// the exact path. `registry`/`ui_active` gate whether parsed stdout messages
/// are mirrored to the Registry and to the terminal.
pub async fn run_agent(
    executor: &dyn Executor,
    prompt_text: &str,
    options: SupervisorOptions,
    registry: Option<&RegistryHandle>,
    ui_active: bool,
    log_path: &Path,
) -> Result<(), OrchestratorError> {
    if prompt_text.trim().is_empty() {
        return Err(OrchestratorError::InvalidPrompt);
    }

    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let mut log_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
        .map_err(OrchestratorError::Io)?;
    let header = format!("=== run started {} ===\n", Utc::now().to_rfc3339());
    let _ = log_file.write_all(header.as_bytes()).await;

    let prompt_path = write_prompt_file(prompt_text).await?;
    let result = run_supervised(executor, &prompt_path, &options, registry, ui_active, &mut log_file).await;

    if let Err(e) = tokio::fs::remove_file(&prompt_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log_warn!(
                "Warning: failed to remove temp prompt file {}: {}",
                prompt_path.display(),
                e
            );
        }
    }
    let _ = log_file.flush().await;

    result
}

async fn write_prompt_file(prompt_text: &str) -> Result<PathBuf, OrchestratorError> {
    let dir = std::env::temp_dir();
    let name = format!("claudiomiro-prompt-{}.txt", Utc::now().timestamp_nanos_opt().unwrap_or(0));
    let path = dir.join(name);
    tokio::fs::write(&path, prompt_text)
        .await
        .map_err(OrchestratorError::Io)?;
    Ok(path)
}

async fn run_supervised(
    executor: &dyn Executor,
    prompt_path: &Path,
    options: &SupervisorOptions,
    registry: Option<&RegistryHandle>,
    ui_active: bool,
    log_file: &mut tokio::fs::File,
) -> Result<(), OrchestratorError> {
    let mut cmd = tokio::process::Command::new(executor.binary_name());
    cmd.args(executor.build_args(prompt_path, options.model_tier.reasoning_effort()));
    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec(); setpgid is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[agent] Spawning {}", executor.binary_name());
    let mut child = cmd
        .spawn()
        .map_err(|e| OrchestratorError::SpawnError(e.to_string()))?;

    let child_pid = child
        .id()
        .ok_or_else(|| OrchestratorError::SpawnError("failed to read child PID".to_string()))?
        as i32;
    let pgid = Pid::from_raw(child_pid);
    register_child(pgid);

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let last_activity = Arc::new(AsyncMutex::new(Instant::now()));
    let (log_tx, mut log_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let display = !ui_active && options.task_name.is_some();
    let stdout_task = read_stdout_lines(
        executor,
        stdout,
        Arc::clone(&last_activity),
        log_tx.clone(),
        registry,
        options.task_name.as_deref(),
        display,
    );

    let stderr_task = read_stderr_lines(stderr, log_tx.clone());

    let watchdog_activity = Arc::clone(&last_activity);
    let (watchdog_tx, mut watchdog_rx) = tokio::sync::oneshot::channel::<()>();
    let watchdog = tokio::spawn(async move {
        loop {
            tokio::time::sleep(WATCHDOG_POLL_INTERVAL).await;
            let elapsed = watchdog_activity.lock().await.elapsed();
            if elapsed >= INACTIVITY_TIMEOUT {
                let _ = watchdog_tx.send(());
                return;
            }
        }
    });

    let wait_fut = child.wait();
    tokio::pin!(wait_fut);

    let outcome = tokio::select! {
        status = &mut wait_fut => {
            Outcome::Exited(status)
        }
        _ = &mut watchdog_rx => {
            Outcome::TimedOut
        }
    };

    // Drain any remaining stdout/stderr lines into the log regardless of outcome.
    tokio::join!(stdout_task, stderr_task);
    watchdog.abort();
    drop(log_tx);
    while let Some(line) = log_rx.recv().await {
        let _ = log_file.write_all(line.as_bytes()).await;
    }

    match outcome {
        Outcome::TimedOut => {
            log_debug!("[agent] inactivity timeout — killing process group {}", child_pid);
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            let _ = log_file
                .write_all(b"=== killed: 15 minute inactivity timeout ===\n")
                .await;
            Err(OrchestratorError::SubprocessTimeout(INACTIVITY_TIMEOUT))
        }
        Outcome::Exited(Ok(status)) => {
            unregister_child(pgid);
            if is_shutdown_requested() {
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                return Err(OrchestratorError::Other("shutdown requested".to_string()));
            }
            if status.success() {
                Ok(())
            } else {
                Err(OrchestratorError::SubprocessExit(status.code()))
            }
        }
        Outcome::Exited(Err(e)) => {
            unregister_child(pgid);
            Err(OrchestratorError::Io(e))
        }
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
}

/// Read stdout line by line, forwarding parsed display messages to the
/// Registry when the UI renderer is inactive and a task name was given.
/// Raw lines are always appended to the log regardless of
/// whether they parsed into a message. Resets `last_activity` on every line.
///
/// Takes `executor` by reference rather than being `tokio::spawn`ed, so the
/// `&dyn Executor` borrow never has to satisfy a `'static` bound.
async fn read_stdout_lines(
    executor: &dyn Executor,
    stdout: tokio::process::ChildStdout,
    last_activity: Arc<AsyncMutex<Instant>>,
    log_tx: tokio::sync::mpsc::UnboundedSender<String>,
    registry: Option<&RegistryHandle>,
    task_name: Option<&str>,
    display: bool,
) {
    let mut reader = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        *last_activity.lock().await = Instant::now();
        let _ = log_tx.send(format!("{}\n", line));

        if let Some(message) = executor.parse_event(&line) {
            if display {
                if let Some(name) = task_name {
                    log_info!("[{}] {}", name, message);
                }
            }
            if let (Some(registry), Some(name)) = (registry, task_name) {
                registry.update_message(name, Some(&message)).await;
            }
        }
    }
}

async fn read_stderr_lines(
    stderr: tokio::process::ChildStderr,
    log_tx: tokio::sync::mpsc::UnboundedSender<String>,
) {
    let mut reader = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        let _ = log_tx.send(format!("[STDERR] {}\n", line));
    }
}

/// Run an agent and forward its parsed stdout events to the Registry and
/// (when the UI renderer is inactive and a task name was given) to stdout.
/// This wraps `run_agent`'s raw line capture with the executor's
/// `parse_event` so the borrow-lifetime split above stays internal.
pub async fn run_agent_with_events(
    executor: &dyn Executor,
    prompt_text: &str,
    options: SupervisorOptions,
    registry: Option<&RegistryHandle>,
    ui_active: bool,
    log_path: &Path,
) -> Result<(), OrchestratorError> {
    // Delegates to `run_agent`; kept as a distinct entry point so callers that
    // do need live per-line forwarding (the Phase Runner) use this name, while
    // tests exercising pure subprocess lifecycle use `run_agent` directly.
    run_agent(executor, prompt_text, options, registry, ui_active, log_path).await
}
