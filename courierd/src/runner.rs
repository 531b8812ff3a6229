//! Container runner: spawns one isolated agent process per turn, pipes
//! prompts over stdin, and streams line-delimited JSON events back.
//!
//! Wire protocol (agent stdout, one JSON object per line):
//! - `{"type":"result","result":...}` — user-visible output chunk
//! - `{"type":"session-update","sessionId":"..."}` — continuation handle
//! - `{"type":"status","status":"success"|"error","error":...}` — terminal
//!
//! Malformed lines are logged and discarded. stdin carries one JSON value
//! per line: the opening `ContainerInput` object, then JSON-encoded strings
//! for piped follow-ups; EOF means "end of turn, you may exit".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::{
    AgentEvent, ContainerInput, ContainerOutput, ContainerStatus, parse_agent_event,
    render_result, resolve_group_folder, strip_internal_blocks,
};
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialService;
use crate::queue::{GroupQueue, StdinCmd};

/// Maximum stdout/stderr kept for the run log (1 MiB each).
const MAX_OUTPUT_SIZE: usize = 1_048_576;

/// Stdin pipe buffer; mirrors the queue's view of "accepting input".
const STDIN_BUFFER: usize = 8;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub runtime_bin: String,
    pub image: String,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    pub timezone: String,
    pub idle_timeout: Duration,
    pub task_close_delay: Duration,
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    pub is_scheduled_task: bool,
    pub assistant_name: Option<String>,
    /// Snapshot file contents the agent reads at startup.
    pub tasks_snapshot: String,
    pub groups_snapshot: String,
}

/// Streamed signals delivered to the caller as they arrive.
#[derive(Debug, Clone)]
pub enum AgentSignal {
    /// A non-empty, internal-stripped output chunk.
    Result { text: String },
    Session { session_id: String },
    Terminal {
        status: ContainerStatus,
        error: Option<String>,
    },
}

pub type OutputCallback = Box<dyn Fn(AgentSignal) -> BoxFuture<'static, ()> + Send + Sync>;
pub type NotifyFn = Box<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct RunResult {
    pub output: ContainerOutput,
    pub container_name: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
enum CloseMode {
    /// Close stdin after this long without a result (interactive runs).
    Idle(Duration),
    /// Close stdin this long after the first result (scheduled tasks are
    /// single-turn).
    AfterFirstResult(Duration),
}

/// Run a container agent with the auth-error retry policy: on a terminal
/// auth error, notify, refresh once, re-run once. The retry never loops.
pub async fn run_container_agent(
    request: &RunRequest,
    config: &RunnerConfig,
    creds: &Arc<dyn CredentialService>,
    queue: &Arc<GroupQueue>,
    on_output: Option<Arc<OutputCallback>>,
    notify: &NotifyFn,
) -> anyhow::Result<RunResult> {
    if let Err(e) = creds.ensure_fresh().await {
        warn!(err = %e, "ensure_fresh failed before spawn, continuing");
    }

    let result = run_once(request, config, queue, on_output.clone()).await?;

    if result.output.status == ContainerStatus::Error {
        let is_auth = result
            .output
            .error
            .as_deref()
            .is_some_and(|e| creds.is_auth_error(e));
        if is_auth {
            notify("system: auth token expired — refreshing".to_string()).await;
            match creds.refresh().await {
                Ok(()) => {
                    info!(
                        group_folder = request.group_folder.as_str(),
                        "credentials refreshed, retrying agent once"
                    );
                    return run_once(request, config, queue, on_output).await;
                }
                Err(e) => {
                    error!(err = %e, "credential refresh failed");
                    notify(
                        "system: credential refresh failed — manual re-auth needed".to_string(),
                    )
                    .await;
                }
            }
        }
    }

    Ok(result)
}

/// One spawn-stream-wait cycle.
async fn run_once(
    request: &RunRequest,
    config: &RunnerConfig,
    queue: &Arc<GroupQueue>,
    on_output: Option<Arc<OutputCallback>>,
) -> anyhow::Result<RunResult> {
    let start = Instant::now();

    let group_dir = resolve_group_folder(&config.groups_dir, &request.group_folder)?;
    tokio::fs::create_dir_all(&group_dir).await.ok();
    let logs_dir = group_dir.join("logs");
    tokio::fs::create_dir_all(&logs_dir).await.ok();
    let ipc_dir = config.data_dir.join("ipc").join(&request.group_folder);
    tokio::fs::create_dir_all(&ipc_dir).await.ok();

    write_snapshots(&group_dir, &request.tasks_snapshot, &request.groups_snapshot).await;

    let name = container_name(&request.group_folder);
    let args = build_container_args(&name, &config.image, &group_dir, &ipc_dir, &config.timezone);

    info!(
        group_folder = request.group_folder.as_str(),
        container_name = name.as_str(),
        is_main = request.is_main,
        is_scheduled_task = request.is_scheduled_task,
        "spawning container agent"
    );

    let child = Command::new(&config.runtime_bin)
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn container: {e}"))?;

    let input = ContainerInput {
        prompt: request.prompt.clone(),
        session_id: request.session_id.clone(),
        group_folder: request.group_folder.clone(),
        chat_jid: request.chat_jid.clone(),
        is_main: request.is_main,
        is_scheduled_task: request.is_scheduled_task.then_some(true),
        assistant_name: request.assistant_name.clone(),
    };
    let initial_line = serde_json::to_string(&input)?;

    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_BUFFER);

    // Hand the process to the queue synchronously so the pipe fast path can
    // target it from the very first poll tick.
    queue
        .register_process(
            &request.chat_jid,
            &name,
            stdin_tx.clone(),
            request.is_scheduled_task,
        )
        .await;

    let close_mode = if request.is_scheduled_task {
        CloseMode::AfterFirstResult(config.task_close_delay)
    } else {
        CloseMode::Idle(config.idle_timeout)
    };

    let summary = stream_agent(
        child,
        initial_line,
        stdin_rx,
        stdin_tx,
        close_mode,
        on_output.as_deref(),
    )
    .await?;
    let duration = start.elapsed();

    let exit_ok = summary.exit_code == Some(0);
    let output = assemble_output(&summary, exit_ok);

    if output.status == ContainerStatus::Error {
        write_container_log(&logs_dir, &name, duration, &summary).await;
        error!(
            group_folder = request.group_folder.as_str(),
            container_name = name.as_str(),
            exit_code = ?summary.exit_code,
            duration_ms = duration.as_millis(),
            error = output.error.as_deref().unwrap_or(""),
            "container run failed"
        );
    } else {
        info!(
            group_folder = request.group_folder.as_str(),
            duration_ms = duration.as_millis(),
            "container completed"
        );
    }

    Ok(RunResult {
        output,
        container_name: name,
        duration,
    })
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

struct StreamSummary {
    terminal: Option<(ContainerStatus, Option<String>)>,
    session_id: Option<String>,
    had_output: bool,
    exit_code: Option<i32>,
    stdout_tail: String,
    stderr_tail: String,
}

async fn stream_agent(
    mut child: Child,
    initial_line: String,
    mut stdin_rx: mpsc::Receiver<StdinCmd>,
    stdin_tx: mpsc::Sender<StdinCmd>,
    close_mode: CloseMode,
    on_output: Option<&OutputCallback>,
) -> anyhow::Result<StreamSummary> {
    // Stdin pump: initial prompt, then piped lines until Close or EOF.
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("child stdin not piped"))?;
    let pump = tokio::spawn(async move {
        if stdin
            .write_all(format!("{initial_line}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
        while let Some(cmd) = stdin_rx.recv().await {
            match cmd {
                StdinCmd::Line(line) => {
                    if stdin.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
                StdinCmd::Close => break,
            }
        }
        stdin.shutdown().await.ok();
    });

    // Activity watchdog closes stdin; the agent chooses to exit on EOF.
    let (activity_tx, activity_rx) = watch::channel(Instant::now());
    let watchdog = tokio::spawn(watchdog_loop(close_mode, activity_rx, stdin_tx));

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("child stdout not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("child stderr not piped"))?;
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut summary = StreamSummary {
        terminal: None,
        session_id: None,
        had_output: false,
        exit_code: None,
        stdout_tail: String::new(),
        stderr_tail: String::new(),
    };
    let mut stderr_done = false;

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        append_capped(&mut summary.stdout_tail, &line);
                        handle_stdout_line(&line, &mut summary, &activity_tx, on_output).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(err = %e, "error reading agent stdout");
                        break;
                    }
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            debug!(agent_stderr = line.as_str(), "agent stderr");
                        }
                        append_capped(&mut summary.stderr_tail, &line);
                    }
                    _ => stderr_done = true,
                }
            }
        }
    }

    let status = child.wait().await?;
    summary.exit_code = status.code();
    watchdog.abort();
    pump.abort();
    Ok(summary)
}

async fn handle_stdout_line(
    line: &str,
    summary: &mut StreamSummary,
    activity_tx: &watch::Sender<Instant>,
    on_output: Option<&OutputCallback>,
) {
    if line.trim().is_empty() {
        return;
    }
    let event = match parse_agent_event(line) {
        Ok(ev) => ev,
        Err(e) => {
            warn!(err = %e, line, "discarding malformed agent output line");
            return;
        }
    };

    match event {
        AgentEvent::Result { result } => {
            // Idle timer resets on every result event, delivered or not.
            activity_tx.send(Instant::now()).ok();
            let text = strip_internal_blocks(&render_result(&result));
            if text.is_empty() {
                return;
            }
            summary.had_output = true;
            if let Some(cb) = on_output {
                cb(AgentSignal::Result { text }).await;
            }
        }
        AgentEvent::SessionUpdate { session_id } => {
            summary.session_id = Some(session_id.clone());
            if let Some(cb) = on_output {
                cb(AgentSignal::Session { session_id }).await;
            }
        }
        AgentEvent::Status { status, error } => {
            summary.terminal = Some((status, error.clone()));
            if let Some(cb) = on_output {
                cb(AgentSignal::Terminal { status, error }).await;
            }
        }
    }
}

async fn watchdog_loop(
    mode: CloseMode,
    mut activity_rx: watch::Receiver<Instant>,
    stdin_tx: mpsc::Sender<StdinCmd>,
) {
    match mode {
        CloseMode::Idle(timeout) => loop {
            let elapsed = activity_rx.borrow().elapsed();
            if elapsed >= timeout {
                debug!("idle timeout reached, closing agent stdin");
                let _ = stdin_tx.try_send(StdinCmd::Close);
                return;
            }
            let remaining = timeout - elapsed;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                changed = activity_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        },
        CloseMode::AfterFirstResult(delay) => {
            if activity_rx.changed().await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            debug!("task close delay elapsed, closing agent stdin");
            let _ = stdin_tx.try_send(StdinCmd::Close);
        }
    }
}

fn append_capped(buffer: &mut String, line: &str) {
    let remaining = MAX_OUTPUT_SIZE.saturating_sub(buffer.len());
    if remaining == 0 {
        return;
    }
    let take = line.len().min(remaining);
    let end = (0..=take)
        .rev()
        .find(|i| line.is_char_boundary(*i))
        .unwrap_or(0);
    buffer.push_str(&line[..end]);
    buffer.push('\n');
}

/// Fold the stream summary into the terminal output.
fn assemble_output(summary: &StreamSummary, exit_ok: bool) -> ContainerOutput {
    if let Some((status, error)) = &summary.terminal {
        return ContainerOutput {
            status: *status,
            result: None,
            new_session_id: summary.session_id.clone(),
            error: error.clone(),
        };
    }
    if exit_ok {
        // An agent that exits cleanly after EOF without a status event is
        // treated as success.
        ContainerOutput {
            status: ContainerStatus::Success,
            result: None,
            new_session_id: summary.session_id.clone(),
            error: None,
        }
    } else {
        let tail: String = summary
            .stderr_tail
            .chars()
            .rev()
            .take(200)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        ContainerOutput {
            status: ContainerStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(format!(
                "container exited with code {}: {tail}",
                summary.exit_code.unwrap_or(-1)
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Spawn plumbing
// ---------------------------------------------------------------------------

/// Safe container name from the group folder plus a timestamp.
pub fn container_name(group_folder: &str) -> String {
    let safe: String = group_folder
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("courier-{safe}-{millis}")
}

fn build_container_args(
    name: &str,
    image: &str,
    group_dir: &Path,
    ipc_dir: &Path,
    timezone: &str,
) -> Vec<String> {
    vec![
        "run".into(),
        "-i".into(),
        "--rm".into(),
        "--name".into(),
        name.into(),
        "-v".into(),
        format!("{}:/workspace/group", group_dir.display()),
        "-v".into(),
        format!("{}:/workspace/ipc", ipc_dir.display()),
        "-e".into(),
        format!("TZ={timezone}"),
        image.into(),
    ]
}

/// Write the startup snapshots consumed by the agent: the group's tasks and
/// (for main) the registered-group directory.
pub async fn write_snapshots(group_dir: &Path, tasks_json: &str, groups_json: &str) {
    if let Err(e) = tokio::fs::write(group_dir.join("tasks.json"), tasks_json).await {
        warn!(err = %e, "failed to write tasks snapshot");
    }
    if let Err(e) = tokio::fs::write(group_dir.join("groups.json"), groups_json).await {
        warn!(err = %e, "failed to write groups snapshot");
    }
}

/// Graceful container stop; used at the shutdown deadline and by recovery.
pub async fn stop_container(runtime_bin: &str, container_name: &str) -> bool {
    match Command::new(runtime_bin)
        .args(["stop", container_name])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            info!(container_name, "container stopped");
            true
        }
        Ok(output) => {
            warn!(
                container_name,
                stderr = String::from_utf8_lossy(&output.stderr).as_ref(),
                "failed to stop container"
            );
            false
        }
        Err(e) => {
            warn!(container_name, err = %e, "failed to execute container stop");
            false
        }
    }
}

/// Write a run log next to the group's files when a container fails.
async fn write_container_log(
    logs_dir: &Path,
    container_name: &str,
    duration: Duration,
    summary: &StreamSummary,
) {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let log_file = logs_dir.join(format!("container-{millis}.log"));
    let content = format!(
        "=== Container Run Log ===\n\
         Container: {container_name}\n\
         Duration: {}ms\n\
         Exit Code: {:?}\n\
         Had Output: {}\n\n\
         === Stderr ===\n{}\n\n\
         === Stdout ===\n{}\n",
        duration.as_millis(),
        summary.exit_code,
        summary.had_output,
        summary.stderr_tail,
        summary.stdout_tail,
    );
    if let Err(e) = tokio::fs::write(&log_file, content).await {
        warn!(log_file = %log_file.display(), err = %e, "failed to write container log");
    }
}

/// Stop leftover courier containers from a previous run.
pub async fn cleanup_orphans(runtime_bin: &str) {
    let output = match Command::new(runtime_bin)
        .args(["ps", "--filter", "name=courier-", "--format", "{{.Names}}"])
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!(err = %e, "failed to list orphaned containers");
            return;
        }
    };

    let names: Vec<&str> = std::str::from_utf8(&output.stdout)
        .unwrap_or("")
        .trim()
        .split('\n')
        .filter(|s| !s.is_empty())
        .collect();

    for name in &names {
        stop_container(runtime_bin, name).await;
    }
    if !names.is_empty() {
        info!(count = names.len(), "stopped orphaned containers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_script(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn sh")
    }

    fn channels() -> (mpsc::Sender<StdinCmd>, mpsc::Receiver<StdinCmd>) {
        mpsc::channel(STDIN_BUFFER)
    }

    #[tokio::test]
    async fn streams_results_and_terminal_status() {
        let child = spawn_script(
            r#"read line
echo '{"type":"result","result":"hi"}'
echo '{"type":"session-update","sessionId":"sess-1"}'
echo '{"type":"status","status":"success"}'"#,
        );
        let (tx, rx) = channels();
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: OutputCallback = Box::new(move |signal| {
            let seen = seen_cb.clone();
            Box::pin(async move {
                let tag = match signal {
                    AgentSignal::Result { text } => format!("result:{text}"),
                    AgentSignal::Session { session_id } => format!("session:{session_id}"),
                    AgentSignal::Terminal { status, .. } => format!("terminal:{status:?}"),
                };
                seen.lock().unwrap().push(tag);
            })
        });

        let summary = stream_agent(
            child,
            "\"open\"".to_string(),
            rx,
            tx,
            CloseMode::Idle(Duration::from_secs(30)),
            Some(&cb),
        )
        .await
        .unwrap();

        assert_eq!(summary.exit_code, Some(0));
        assert!(summary.had_output);
        assert_eq!(summary.session_id.as_deref(), Some("sess-1"));
        assert_eq!(
            summary.terminal,
            Some((ContainerStatus::Success, None))
        );
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "result:hi".to_string(),
                "session:sess-1".to_string(),
                "terminal:Success".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_lines_do_not_poison_stream() {
        let child = spawn_script(
            r#"read line
echo 'not json at all'
echo '{"type":"result","result":"ok"}'
echo '{"type":"status","status":"success"}'"#,
        );
        let (tx, rx) = channels();
        let summary = stream_agent(
            child,
            "\"open\"".to_string(),
            rx,
            tx,
            CloseMode::Idle(Duration::from_secs(30)),
            None,
        )
        .await
        .unwrap();
        assert!(summary.had_output);
        assert!(matches!(
            summary.terminal,
            Some((ContainerStatus::Success, None))
        ));
    }

    #[tokio::test]
    async fn internal_only_result_is_dropped() {
        let child = spawn_script(
            r#"read line
echo '{"type":"result","result":"<internal>scratch</internal>"}'
echo '{"type":"status","status":"success"}'"#,
        );
        let (tx, rx) = channels();
        let delivered = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let delivered_cb = delivered.clone();
        let cb: OutputCallback = Box::new(move |signal| {
            let delivered = delivered_cb.clone();
            Box::pin(async move {
                if matches!(signal, AgentSignal::Result { .. }) {
                    delivered.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        });
        let summary = stream_agent(
            child,
            "\"open\"".to_string(),
            rx,
            tx,
            CloseMode::Idle(Duration::from_secs(30)),
            Some(&cb),
        )
        .await
        .unwrap();
        assert!(!summary.had_output);
        assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn piped_lines_reach_agent_stdin() {
        // The agent echoes its second stdin line back as a result.
        let child = spawn_script(
            r#"read first
read second
echo "{\"type\":\"result\",\"result\":$second}"
echo '{"type":"status","status":"success"}'"#,
        );
        let (tx, rx) = channels();
        tx.send(StdinCmd::Line("\"follow-up\"".to_string()))
            .await
            .unwrap();
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: OutputCallback = Box::new(move |signal| {
            let seen = seen_cb.clone();
            Box::pin(async move {
                if let AgentSignal::Result { text } = signal {
                    seen.lock().unwrap().push(text);
                }
            })
        });
        let summary = stream_agent(
            child,
            "\"open\"".to_string(),
            rx,
            tx,
            CloseMode::Idle(Duration::from_secs(30)),
            Some(&cb),
        )
        .await
        .unwrap();
        assert!(summary.had_output);
        assert_eq!(*seen.lock().unwrap(), vec!["follow-up".to_string()]);
    }

    #[tokio::test]
    async fn error_exit_without_status_becomes_error_output() {
        let child = spawn_script("read line; echo oops >&2; exit 3");
        let (tx, rx) = channels();
        let summary = stream_agent(
            child,
            "\"open\"".to_string(),
            rx,
            tx,
            CloseMode::Idle(Duration::from_secs(30)),
            None,
        )
        .await
        .unwrap();
        let output = assemble_output(&summary, false);
        assert_eq!(output.status, ContainerStatus::Error);
        let err = output.error.unwrap();
        assert!(err.contains("code 3"));
        assert!(err.contains("oops"));
    }

    #[test]
    fn terminal_status_wins_over_exit_code() {
        let summary = StreamSummary {
            terminal: Some((ContainerStatus::Error, Some("agent failed".into()))),
            session_id: Some("sess-2".into()),
            had_output: true,
            exit_code: Some(0),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        };
        let output = assemble_output(&summary, true);
        assert_eq!(output.status, ContainerStatus::Error);
        assert_eq!(output.error.as_deref(), Some("agent failed"));
        assert_eq!(output.new_session_id.as_deref(), Some("sess-2"));
    }

    #[test]
    fn container_name_sanitizes_folder() {
        let name = container_name("team.eng");
        assert!(name.starts_with("courier-team-eng-"));
        assert!(!name.contains('.'));
    }

    #[test]
    fn container_args_mount_group_and_ipc() {
        let args = build_container_args(
            "courier-main-1",
            "courier-agent:latest",
            Path::new("/srv/groups/main"),
            Path::new("/srv/data/ipc/main"),
            "UTC",
        );
        assert!(args.contains(&"/srv/groups/main:/workspace/group".to_string()));
        assert!(args.contains(&"/srv/data/ipc/main:/workspace/ipc".to_string()));
        assert_eq!(args.last().unwrap(), "courier-agent:latest");
    }

    #[tokio::test]
    async fn snapshots_land_in_group_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshots(dir.path(), "[]", "[]").await;
        assert!(dir.path().join("tasks.json").exists());
        assert!(dir.path().join("groups.json").exists());
    }
}
