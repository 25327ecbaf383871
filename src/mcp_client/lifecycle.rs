//! Process Launcher — start detached server processes and stop them.
//!
//! Every launch writes stdout and stderr to per-launch log files under the
//! state directory. Two modes:
//!
//! - **Attached** (local-pipe): stdio is piped. A background task tees stdout
//!   lines to the log file and forwards them to the JSON-RPC link; another
//!   drains stderr into its log file.
//! - **Detached** (local-socket): stdin is closed and stdout/stderr go
//!   straight to the log files, so the process needs nothing from us.
//!
//! Either way the process is detached from our session, so it can outlive
//! this client. A launch only succeeds if the process survives the startup
//! grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use super::detach::{Detacher, PlatformDetacher};
use super::errors::LifecycleError;
use super::settings::ClientSettings;
use super::transport::LineLink;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long to wait for the stderr drain to finish after an early exit.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll interval while waiting for a signalled process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stdout lines held for the JSON-RPC link between requests.
const FORWARD_QUEUE_CAPACITY: usize = 256;

// ─── Launch Types ────────────────────────────────────────────────────────────

/// How the child's stdio is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Piped stdio for a local-pipe server.
    Attached,
    /// Log files only.
    Detached,
}

/// A process that survived its startup grace period.
pub struct LaunchedProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    /// Handle used to reap the process once it exits.
    pub child: Child,
    /// JSON-RPC link over the child's stdio, for attached launches.
    pub link: Option<Arc<LineLink>>,
}

/// Kills a freshly spawned process if the launch is abandoned.
///
/// Covers cancellation of the launch future during the grace period.
struct SpawnGuard {
    pid: Option<u32>,
    group: bool,
}

impl SpawnGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            tracing::warn!(pid, "launch abandoned, killing spawned process");
            let _ = send_signal(pid, self.group, true);
        }
    }
}

// ─── ProcessLauncher ─────────────────────────────────────────────────────────

/// Starts server processes with platform detachment and log capture.
pub struct ProcessLauncher {
    detacher: Box<dyn Detacher>,
    log_dir: PathBuf,
    startup_grace: Duration,
    tail_lines: usize,
}

impl ProcessLauncher {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            detacher: Box::new(PlatformDetacher),
            log_dir: settings.log_dir(),
            startup_grace: settings.startup_grace(),
            tail_lines: settings.stderr_tail_lines,
        }
    }

    /// Whether launched processes can be signalled as a group.
    pub fn signals_group(&self) -> bool {
        self.detacher.leads_process_group()
    }

    /// Spawn `config`'s command and wait out the startup grace period.
    pub async fn launch(
        &self,
        config: &ServerConfig,
        mode: LaunchMode,
    ) -> Result<LaunchedProcess, LifecycleError> {
        let name = config.name.as_str();
        let program = config.command.as_deref().ok_or_else(|| LifecycleError::Config {
            name: name.to_string(),
            reason: "no command to launch".into(),
        })?;

        let started_at = Utc::now();
        let (stdout_log, stderr_log) = log_paths(&self.log_dir, name, started_at);
        let launch_error = |reason: String, stderr_tail: Vec<String>| LifecycleError::Launch {
            name: name.to_string(),
            reason,
            stderr_tail,
            stdout_log: Some(stdout_log.clone()),
            stderr_log: Some(stderr_log.clone()),
        };

        std::fs::create_dir_all(&self.log_dir).map_err(|e| {
            launch_error(
                format!("failed to create log directory {}: {e}", self.log_dir.display()),
                vec![],
            )
        })?;
        let stdout_file = open_log(&stdout_log)
            .map_err(|e| launch_error(format!("failed to open stdout log: {e}"), vec![]))?;
        let stderr_file = open_log(&stderr_log)
            .map_err(|e| launch_error(format!("failed to open stderr log: {e}"), vec![]))?;

        let mut cmd = Command::new(program);
        cmd.args(&config.args);
        // Config env is layered over the inherited environment.
        cmd.envs(&config.env);
        if let Some(dir) = &config.options.cwd {
            cmd.current_dir(dir);
        }

        match mode {
            LaunchMode::Attached => {
                cmd.stdin(Stdio::piped());
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
            LaunchMode::Detached => {
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::from(stdout_file.try_clone().map_err(|e| {
                    launch_error(format!("failed to prepare stdout log: {e}"), vec![])
                })?));
                cmd.stderr(Stdio::from(stderr_file.try_clone().map_err(|e| {
                    launch_error(format!("failed to prepare stderr log: {e}"), vec![])
                })?));
            }
        }

        self.detacher.detach(&mut cmd);

        tracing::info!(
            server = name,
            command = %config.command_line(),
            mode = ?mode,
            "launching server"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_error(format!("failed to spawn '{program}': {e}"), vec![]))?;

        let pid = child
            .id()
            .ok_or_else(|| launch_error("process exited before its pid was read".into(), vec![]))?;

        let mut guard = SpawnGuard {
            pid: Some(pid),
            group: self.signals_group(),
        };

        let mut stderr_drain = None;
        let mut link = None;

        if mode == LaunchMode::Attached {
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| launch_error("failed to capture stdin".into(), vec![]))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| launch_error("failed to capture stdout".into(), vec![]))?;

            if let Some(mut stderr) = child.stderr.take() {
                let mut file = tokio::fs::File::from_std(stderr_file);
                stderr_drain = Some(tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut stderr, &mut file).await;
                    let _ = file.flush().await;
                }));
            }

            let (tx, rx) = mpsc::channel(FORWARD_QUEUE_CAPACITY);
            tokio::spawn(tee_stdout(
                name.to_string(),
                stdout,
                tokio::fs::File::from_std(stdout_file),
                tx,
            ));
            link = Some(Arc::new(LineLink::forwarded(name, stdin, rx)));
        }

        let grace = config.options.startup_grace.unwrap_or(self.startup_grace);
        let early_exit = match timeout(grace, child.wait()).await {
            Err(_) => None,
            Ok(Ok(status)) => Some(format!("exited during startup ({status})")),
            Ok(Err(e)) => Some(format!("failed to wait on process: {e}")),
        };

        if let Some(reason) = early_exit {
            guard.disarm();
            if let Some(drain) = stderr_drain {
                let _ = timeout(STDERR_DRAIN_TIMEOUT, drain).await;
            }
            let stderr_tail = tail_file(&stderr_log, self.tail_lines).await;
            if !stderr_tail.is_empty() {
                tracing::warn!(
                    server = name,
                    stderr = %stderr_tail.join("\n"),
                    "server stderr captured on failure"
                );
            }
            return Err(launch_error(reason, stderr_tail));
        }

        guard.disarm();

        tracing::info!(
            server = name,
            pid,
            stdout_log = %stdout_log.display(),
            stderr_log = %stderr_log.display(),
            "server launched"
        );

        Ok(LaunchedProcess {
            pid,
            started_at,
            stdout_log,
            stderr_log,
            child,
            link,
        })
    }
}

/// Copy stdout lines to the log file and forward them to the link.
///
/// Every line reaches the log. A line is dropped from the link when its
/// queue is full, and logging continues after the link's receiver is gone.
async fn tee_stdout(
    server_name: String,
    stdout: tokio::process::ChildStdout,
    mut log: tokio::fs::File,
    tx: mpsc::Sender<String>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut dropped: u64 = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if log.write_all(line.as_bytes()).await.is_ok() {
                    let _ = log.write_all(b"\n").await;
                    let _ = log.flush().await;
                }
                match tx.try_send(line) {
                    Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped == 1 || dropped % 1000 == 0 {
                            tracing::debug!(
                                server = %server_name,
                                dropped,
                                "link queue full, dropping stdout line"
                            );
                        }
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server_name, "server stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "error reading server stdout");
                break;
            }
        }
    }
}

// ─── Log Files ───────────────────────────────────────────────────────────────

/// Deterministic log paths for one launch.
///
/// `{name}_{YYYYMMDDTHHMMSSmmmZ}_{stdout|stderr}.log`; characters outside
/// `[A-Za-z0-9_-]` in the name become `_`.
pub fn log_paths(log_dir: &Path, server_name: &str, started_at: DateTime<Utc>) -> (PathBuf, PathBuf) {
    let safe: String = server_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stamp = started_at.format("%Y%m%dT%H%M%S%3fZ");
    (
        log_dir.join(format!("{safe}_{stamp}_stdout.log")),
        log_dir.join(format!("{safe}_{stamp}_stderr.log")),
    )
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// Last `lines` lines of a log file. Unreadable files yield nothing.
pub async fn tail_file(path: &Path, lines: usize) -> Vec<String> {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return Vec::new();
    };
    let content = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|l| l.to_string()).collect()
}

// ─── Termination ─────────────────────────────────────────────────────────────

/// Bounded waits for stopping a process.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    /// Time allowed for a graceful exit after the termination signal.
    pub grace: Duration,
    /// Time allowed for the process to vanish after the forceful kill.
    pub kill_wait: Duration,
    /// Signal the whole process group led by the pid.
    pub group: bool,
}

/// How a stop concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Graceful,
    Forced,
}

/// Stop `pid`: terminate, wait, then kill.
///
/// `child` is used to reap the process when this client spawned it;
/// otherwise `pid_exists` reports whether the pid is still alive. Fails only if
/// a signal can't be delivered or the process outlives the forceful kill.
pub async fn terminate(
    pid: u32,
    mut child: Option<&mut Child>,
    pid_exists: &(dyn Fn(u32) -> bool + Send + Sync),
    policy: StopPolicy,
) -> Result<StopOutcome, String> {
    if !is_alive(pid, &mut child, pid_exists) {
        return Ok(StopOutcome::AlreadyExited);
    }

    send_signal(pid, policy.group, false)?;
    if wait_gone(pid, &mut child, pid_exists, policy.grace).await {
        return Ok(StopOutcome::Graceful);
    }

    tracing::warn!(
        pid,
        grace_ms = policy.grace.as_millis() as u64,
        "process did not exit gracefully, forcing kill"
    );
    send_signal(pid, policy.group, true)?;
    if wait_gone(pid, &mut child, pid_exists, policy.kill_wait).await {
        return Ok(StopOutcome::Forced);
    }

    Err(format!(
        "process still alive {}ms after forceful kill",
        policy.kill_wait.as_millis()
    ))
}

fn is_alive(
    pid: u32,
    child: &mut Option<&mut Child>,
    pid_exists: &(dyn Fn(u32) -> bool + Send + Sync),
) -> bool {
    match child {
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => pid_exists(pid),
    }
}

async fn wait_gone(
    pid: u32,
    child: &mut Option<&mut Child>,
    pid_exists: &(dyn Fn(u32) -> bool + Send + Sync),
    window: Duration,
) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if !is_alive(pid, child, pid_exists) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Deliver a termination (`force == false`) or kill signal.
///
/// A process that is already gone counts as delivered.
#[cfg(unix)]
pub fn send_signal(pid: u32, group: bool, force: bool) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    if raw <= 0 {
        return Err(format!("refusing to signal pid {pid}"));
    }
    let target = Pid::from_raw(raw);
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };

    if group {
        match killpg(target, signal) {
            Ok(()) => return Ok(()),
            // Not a group leader after all; fall back to the single pid.
            Err(Errno::ESRCH) => {}
            Err(e) => return Err(format!("failed to send {signal} to group {pid}: {e}")),
        }
    }

    match kill(target, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(format!("failed to send {signal} to {pid}: {e}")),
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, _group: bool, force: bool) -> Result<(), String> {
    use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let Some(process) = sys.process(pid) else {
        return Ok(());
    };

    let delivered = if force {
        process.kill()
    } else {
        // No SIGTERM on Windows; sysinfo reports None and we kill instead.
        process
            .kill_with(Signal::Term)
            .unwrap_or_else(|| process.kill())
    };

    if delivered {
        Ok(())
    } else {
        Err(format!("failed to signal process {pid}"))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::types::{TransportKind, TransportOptions};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sh(name: &str, script: &str) -> ServerConfig {
        ServerConfig {
            name: name.into(),
            transport_kind: TransportKind::LocalPipe,
            command: Some("/bin/sh".into()),
            args: vec!["-c".into(), script.into()],
            env: BTreeMap::new(),
            url: None,
            options: TransportOptions::default(),
        }
    }

    fn launcher(tmp: &TempDir, grace_ms: u64) -> ProcessLauncher {
        let mut settings = ClientSettings::with_state_dir(tmp.path());
        settings.startup_grace_ms = grace_ms;
        settings.stderr_tail_lines = 3;
        ProcessLauncher::new(&settings)
    }

    fn policy() -> StopPolicy {
        StopPolicy {
            grace: Duration::from_secs(2),
            kill_wait: Duration::from_secs(2),
            group: true,
        }
    }

    fn never_alive(_: u32) -> bool {
        false
    }

    #[test]
    fn test_log_paths_are_deterministic() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        let (out, err) = log_paths(Path::new("/state/logs"), "my server/1", ts);
        assert_eq!(out, PathBuf::from("/state/logs/my_server_1_20240501T123045000Z_stdout.log"));
        assert_eq!(err, PathBuf::from("/state/logs/my_server_1_20240501T123045000Z_stderr.log"));
    }

    #[tokio::test]
    async fn test_tail_file_returns_last_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail_file(&path, 2).await, vec!["c", "d"]);
        assert_eq!(tail_file(&path, 10).await.len(), 4);
        assert!(tail_file(&tmp.path().join("missing.log"), 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_detached_launch_writes_logs_and_survives_grace() {
        let tmp = TempDir::new().unwrap();
        let launcher = launcher(&tmp, 200);
        let mut config = sh("socky", "echo hello; echo oops >&2; exec sleep 30");
        config.env.insert("GREETING".into(), "hi".into());

        let mut launched = launcher.launch(&config, LaunchMode::Detached).await.unwrap();
        assert!(launched.link.is_none());
        assert!(launched.stdout_log.starts_with(tmp.path().join("logs")));

        let outcome = terminate(launched.pid, Some(&mut launched.child), &never_alive, policy())
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);

        assert_eq!(tail_file(&launched.stdout_log, 5).await, vec!["hello"]);
        assert_eq!(tail_file(&launched.stderr_log, 5).await, vec!["oops"]);
    }

    #[tokio::test]
    async fn test_early_exit_reports_stderr_tail() {
        let tmp = TempDir::new().unwrap();
        let launcher = launcher(&tmp, 2_000);
        let config = sh(
            "broken",
            "echo one >&2; echo two >&2; echo three >&2; echo 'ModuleNotFoundError: fastmcp' >&2; exit 1",
        );

        let err = launcher.launch(&config, LaunchMode::Attached).await.err().unwrap();
        match &err {
            LifecycleError::Launch {
                stderr_tail,
                stderr_log,
                ..
            } => {
                assert_eq!(stderr_tail.len(), 3);
                assert_eq!(stderr_tail[2], "ModuleNotFoundError: fastmcp");
                assert!(stderr_log.as_ref().unwrap().exists());
            }
            other => panic!("expected Launch error, got {other:?}"),
        }
        assert!(err.to_string().contains("fastmcp"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let tmp = TempDir::new().unwrap();
        let launcher = launcher(&tmp, 100);
        let mut config = sh("ghost", "");
        config.command = Some("/nonexistent/echo-server".into());
        config.args.clear();

        let err = launcher.launch(&config, LaunchMode::Detached).await.err().unwrap();
        assert!(matches!(err, LifecycleError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_attached_launch_speaks_json_rpc() {
        let tmp = TempDir::new().unwrap();
        let launcher = launcher(&tmp, 200);
        // Reads one request and answers with its id.
        let script = r#"read line; id=$(echo "$line" | sed 's/.*"id":\([0-9]*\).*/\1/'); echo "booting"; echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{}}"; exec sleep 30"#;
        let config = sh("echo", script);

        let mut launched = launcher.launch(&config, LaunchMode::Attached).await.unwrap();
        let link = launched.link.clone().unwrap();
        let resp = link.request("ping", None).await.unwrap();
        assert!(resp.result.is_some());

        terminate(launched.pid, Some(&mut launched.child), &never_alive, policy())
            .await
            .unwrap();

        // The tee kept everything the server printed.
        let logged = tail_file(&launched.stdout_log, 10).await;
        assert_eq!(logged.first().map(String::as_str), Some("booting"));
    }

    #[tokio::test]
    async fn test_tee_stdout_bounds_queue_and_logs_every_line() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("chatty.stdout.log");
        let log = tokio::fs::File::from_std(open_log(&log_path).unwrap());

        let mut child = Command::new("/bin/sh")
            .args(["-c", "i=0; while [ $i -lt 1000 ]; do echo line-$i; i=$((i+1)); done"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();

        // Nothing reads from the link while the server prints.
        let (tx, mut rx) = mpsc::channel(16);
        tee_stdout("chatty".into(), stdout, log, tx).await;
        child.wait().await.unwrap();

        assert!(rx.len() <= 16);
        assert_eq!(rx.recv().await.as_deref(), Some("line-0"));

        let logged = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert_eq!(logged.lines().count(), 1000);
        assert_eq!(logged.lines().last(), Some("line-999"));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let tmp = TempDir::new().unwrap();
        let launcher = launcher(&tmp, 200);
        let config = sh("stubborn", "trap '' TERM; while true; do sleep 1; done");

        let mut launched = launcher.launch(&config, LaunchMode::Detached).await.unwrap();
        let policy = StopPolicy {
            grace: Duration::from_millis(300),
            kill_wait: Duration::from_secs(2),
            group: true,
        };
        let outcome = terminate(launched.pid, Some(&mut launched.child), &never_alive, policy)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let tmp = TempDir::new().unwrap();
        let launcher = launcher(&tmp, 100);
        let config = sh("quick", "exec sleep 30");
        let mut launched = launcher.launch(&config, LaunchMode::Detached).await.unwrap();
        launched.child.kill().await.unwrap();

        let outcome = terminate(launched.pid, Some(&mut launched.child), &never_alive, policy())
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyExited);
    }
}
