//! Dispatcher: the message-check callback invoked by the group queue.
//!
//! Converts "new messages exist for group G" into "the agent produced
//! output for G and the cursors are consistent":
//!
//! 1. Load pending messages since the per-group agent cursor
//! 2. Apply the trigger gate for non-main groups
//! 3. Advance the cursor optimistically (pre-cursor-advance), persist
//! 4. Run the container, streaming results to the channel and walking the
//!    status DAG (received → thinking → working → done)
//! 5. On error, roll back: to the pre-pipe cursor when output was already
//!    delivered and more messages were piped afterwards, to the pre-advance
//!    cursor when nothing was delivered, or not at all when output went out
//!    and nothing was piped (done — never double-charge)
//!
//! Any successful user-visible send fixes the prefix up to the pre-advance
//! point: those messages are processed and will not be replayed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_core::{ContainerStatus, NewMessage, QuietSchedule, Store};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelDriver;
use crate::credentials::CredentialService;
use crate::poll_loop::{
    self, CURSOR_BEFORE_PIPE_KEY, LAST_AGENT_TIMESTAMP_KEY, Groups, load_cursor_map,
    save_cursor_map,
};
use crate::queue::{GroupQueue, ProcessMessagesFn};
use crate::runner::{AgentSignal, NotifyFn, OutputCallback, RunRequest, RunnerConfig,
    run_container_agent};
use crate::status_tracker::StatusTracker;

pub type Sessions = Arc<RwLock<HashMap<String, String>>>;

/// Shared state captured by the dispatch callback and the task runner.
pub struct DispatchDeps {
    pub store: Store,
    pub queue: Arc<GroupQueue>,
    pub groups: Groups,
    pub sessions: Sessions,
    pub channel: Arc<dyn ChannelDriver>,
    pub tracker: Arc<StatusTracker>,
    pub creds: Arc<dyn CredentialService>,
    pub runner_config: RunnerConfig,
    pub assistant_name: String,
    pub main_group_folder: String,
    pub quiet: Arc<QuietSchedule>,
    pub quiet_enabled: bool,
}

impl DispatchDeps {
    /// Whether quiet hours currently gate container work.
    pub fn is_quiet_now(&self) -> bool {
        self.quiet_enabled && self.quiet.is_quiet(chrono::Utc::now())
    }

    /// The JID privileged system notices go to; falls back to the chat the
    /// work belongs to when no main group is registered.
    pub async fn notify_jid(&self, fallback: &str) -> String {
        let groups = self.groups.read().await;
        groups
            .values()
            .find(|g| g.folder == self.main_group_folder)
            .map(|g| g.jid.clone())
            .unwrap_or_else(|| fallback.to_string())
    }


    /// Persist a fresh session token for a group folder.
    pub async fn save_session(&self, group_folder: &str, session_id: &str) {
        self.sessions
            .write()
            .await
            .insert(group_folder.to_string(), session_id.to_string());
        if let Err(e) = self.store.set_session(group_folder, session_id) {
            warn!(group_folder, err = %e, "failed to persist session");
        }
    }

    /// Snapshot JSON pair for a container: the group's tasks (all tasks for
    /// main) and the group directory (main only).
    pub async fn build_snapshots(&self, group_folder: &str, is_main: bool) -> (String, String) {
        let tasks_json = match self.store.get_all_tasks() {
            Ok(tasks) => {
                let filtered: Vec<_> = tasks
                    .into_iter()
                    .filter(|t| is_main || t.group_folder == group_folder)
                    .collect();
                serde_json::to_string(&filtered).unwrap_or_else(|_| "[]".into())
            }
            Err(e) => {
                warn!(err = %e, "failed to load tasks for snapshot");
                "[]".into()
            }
        };
        let groups_json = if is_main {
            let groups = self.groups.read().await;
            let entries: Vec<_> = groups
                .values()
                .map(|g| {
                    serde_json::json!({
                        "jid": g.jid,
                        "name": g.name,
                        "folder": g.folder,
                    })
                })
                .collect();
            serde_json::to_string(&entries).unwrap_or_else(|_| "[]".into())
        } else {
            "[]".into()
        };
        (tasks_json, groups_json)
    }
}

/// Build the advisory sink used by the runner's auth-retry path: system
/// notices routed to the main group.
pub fn notify_fn(deps: &Arc<DispatchDeps>, chat_jid: &str) -> NotifyFn {
    let deps = deps.clone();
    let chat_jid = chat_jid.to_string();
    Box::new(move |text: String| {
        let deps = deps.clone();
        let chat_jid = chat_jid.clone();
        Box::pin(async move {
            let jid = deps.notify_jid(&chat_jid).await;
            if let Err(e) = deps.channel.send_message(&jid, &text).await {
                warn!(err = %e, "failed to send system notice");
            }
        })
    })
}

/// Build the `ProcessMessagesFn` the queue invokes per message check.
pub fn build_process_messages_fn(deps: Arc<DispatchDeps>) -> ProcessMessagesFn {
    Arc::new(move |chat_jid: String| {
        let deps = deps.clone();
        Box::pin(async move {
            match process_group_messages(&deps, &chat_jid).await {
                Ok(success) => success,
                Err(e) => {
                    error!(chat_jid, err = %e, "process_group_messages failed");
                    false
                }
            }
        })
    })
}

/// Clears the typing indicator on every exit path, panics included.
struct TypingGuard {
    channel: Arc<dyn ChannelDriver>,
    chat_jid: String,
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        let channel = self.channel.clone();
        let jid = std::mem::take(&mut self.chat_jid);
        tokio::spawn(async move {
            let _ = channel.set_typing(&jid, false).await;
        });
    }
}

async fn process_group_messages(deps: &Arc<DispatchDeps>, chat_jid: &str) -> anyhow::Result<bool> {
    // A check that lands inside quiet hours (e.g. a backoff retry scheduled
    // earlier) does nothing; the quiet→active catch-up re-enqueues it.
    if deps.is_quiet_now() {
        debug!(chat_jid, "quiet hours: skipping message check");
        return Ok(true);
    }

    let group = {
        let groups = deps.groups.read().await;
        match groups.get(chat_jid) {
            Some(group) => group.clone(),
            None => return Ok(true), // unregistered: skip, not an error
        }
    };
    let is_main = group.folder == deps.main_group_folder;

    // 1. Pending messages since the agent cursor.
    let mut agent_cursors = load_cursor_map(&deps.store, LAST_AGENT_TIMESTAMP_KEY);
    let since = agent_cursors.get(chat_jid).cloned().unwrap_or_default();
    let pending = deps
        .store
        .get_messages_since(chat_jid, &since, &deps.assistant_name)?;
    if pending.is_empty() {
        return Ok(true);
    }

    // 2. Trigger gate.
    if !is_main && group.requires_trigger {
        let re = poll_loop::build_trigger_regex(poll_loop::trigger_name(
            &group,
            &deps.assistant_name,
        ));
        if !pending.iter().any(|m| re.is_match(m.content.trim())) {
            return Ok(true);
        }
    }

    let prompt = poll_loop::format_messages(&pending);
    let user_message_ids: Vec<String> = pending
        .iter()
        .filter(|m| !m.is_from_me)
        .map(|m| m.id.clone())
        .collect();

    // 3. Pre-cursor-advance: optimistic, rolled back on failure below.
    let previous_cursor = since.clone();
    let new_cursor = pending
        .last()
        .map(|m| m.timestamp.clone())
        .unwrap_or_default();
    agent_cursors.insert(chat_jid.to_string(), new_cursor);
    save_cursor_map(&deps.store, LAST_AGENT_TIMESTAMP_KEY, &agent_cursors);

    info!(
        group = group.name.as_str(),
        message_count = pending.len(),
        "processing messages"
    );

    // 4. Status: received (idempotent) → thinking.
    for id in &user_message_ids {
        deps.tracker.mark_received(id, chat_jid, is_main).await;
        deps.tracker.mark_thinking(id).await;
    }

    if let Err(e) = deps.channel.set_typing(chat_jid, true).await {
        debug!(err = %e, "set_typing failed (non-fatal)");
    }
    let _typing = TypingGuard {
        channel: deps.channel.clone(),
        chat_jid: chat_jid.to_string(),
    };

    // 5. Run the container, streaming output.
    let session_id = {
        let sessions = deps.sessions.read().await;
        sessions.get(&group.folder).cloned()
    };
    let (tasks_snapshot, groups_snapshot) = deps.build_snapshots(&group.folder, is_main).await;

    let request = RunRequest {
        prompt,
        session_id,
        group_folder: group.folder.clone(),
        chat_jid: chat_jid.to_string(),
        is_main,
        is_scheduled_task: false,
        assistant_name: Some(
            poll_loop::trigger_name(&group, &deps.assistant_name).to_string(),
        ),
        tasks_snapshot,
        groups_snapshot,
    };

    let output_sent = Arc::new(AtomicBool::new(false));
    let on_output = build_stream_callback(deps, chat_jid, &group.folder, &user_message_ids,
        output_sent.clone());
    let notify = notify_fn(deps, chat_jid);

    let run = run_container_agent(
        &request,
        &deps.runner_config,
        &deps.creds,
        &deps.queue,
        Some(Arc::new(on_output)),
        &notify,
    )
    .await;

    // 6. Terminal bookkeeping.
    match run {
        Ok(result) => {
            debug!(
                container = result.container_name.as_str(),
                duration_ms = result.duration.as_millis() as u64,
                "agent run finished"
            );
            if let Some(ref sid) = result.output.new_session_id {
                deps.save_session(&group.folder, sid).await;
            }
            if result.output.status == ContainerStatus::Success {
                deps.tracker.mark_all_done(chat_jid).await;
                clear_pipe_cursor(&deps.store, chat_jid);
                return Ok(true);
            }
            let reason = result
                .output
                .error
                .clone()
                .unwrap_or_else(|| "unknown agent error".into());
            Ok(handle_agent_error(
                deps,
                chat_jid,
                &group.name,
                &previous_cursor,
                output_sent.load(Ordering::SeqCst),
                &reason,
            )
            .await)
        }
        Err(e) => {
            error!(group = group.name.as_str(), err = %e, "container agent error");
            Ok(handle_agent_error(
                deps,
                chat_jid,
                &group.name,
                &previous_cursor,
                output_sent.load(Ordering::SeqCst),
                &e.to_string(),
            )
            .await)
        }
    }
}

/// Streamed-event handler: sessions persist as they update, the first
/// delivered result flips the batch to `working`, results go out through
/// the channel and are logged as bot messages, terminal success frees the
/// queue early.
fn build_stream_callback(
    deps: &Arc<DispatchDeps>,
    chat_jid: &str,
    group_folder: &str,
    user_message_ids: &[String],
    output_sent: Arc<AtomicBool>,
) -> OutputCallback {
    let deps = deps.clone();
    let chat_jid = chat_jid.to_string();
    let group_folder = group_folder.to_string();
    let user_message_ids = user_message_ids.to_vec();
    let first_result = Arc::new(AtomicBool::new(false));

    Box::new(move |signal: AgentSignal| {
        let deps = deps.clone();
        let chat_jid = chat_jid.clone();
        let group_folder = group_folder.clone();
        let user_message_ids = user_message_ids.clone();
        let output_sent = output_sent.clone();
        let first_result = first_result.clone();

        Box::pin(async move {
            match signal {
                AgentSignal::Session { session_id } => {
                    deps.save_session(&group_folder, &session_id).await;
                }
                AgentSignal::Result { text } => {
                    if !first_result.swap(true, Ordering::SeqCst) {
                        for id in &user_message_ids {
                            deps.tracker.mark_working(id).await;
                        }
                    }
                    if let Err(e) = deps.channel.send_message(&chat_jid, &text).await {
                        error!(err = %e, "failed to deliver agent output");
                    }
                    store_bot_message(&deps.store, &chat_jid, &deps.assistant_name, &text);
                    output_sent.store(true, Ordering::SeqCst);
                }
                AgentSignal::Terminal { status, .. } => {
                    if status == ContainerStatus::Success {
                        deps.queue.notify_idle(&chat_jid).await;
                    }
                }
            }
        })
    })
}

/// What to do with the cursors after a terminal agent error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Output was delivered and messages were piped afterwards: roll back
    /// only the piped suffix.
    RollbackToPipeCursor,
    /// Output was delivered and nothing was piped: the turn is charged,
    /// treat as done.
    TreatAsDone,
    /// Nothing reached the user: full rollback to the pre-advance cursor.
    RollbackToPreAdvance,
}

pub fn error_outcome(output_sent: bool, pipe_cursor_set: bool) -> ErrorOutcome {
    match (output_sent, pipe_cursor_set) {
        (true, true) => ErrorOutcome::RollbackToPipeCursor,
        (true, false) => ErrorOutcome::TreatAsDone,
        (false, _) => ErrorOutcome::RollbackToPreAdvance,
    }
}

/// Apply the rollback policy. Returns the job success flag handed back to
/// the queue (false = retriable).
async fn handle_agent_error(
    deps: &Arc<DispatchDeps>,
    chat_jid: &str,
    group_name: &str,
    previous_cursor: &str,
    output_sent: bool,
    reason: &str,
) -> bool {
    let mut before_pipe = load_cursor_map(&deps.store, CURSOR_BEFORE_PIPE_KEY);
    let pipe_cursor = before_pipe.get(chat_jid).cloned();

    match error_outcome(output_sent, pipe_cursor.is_some()) {
        ErrorOutcome::TreatAsDone => {
            warn!(
                group = group_name,
                "agent error after output was sent, treating turn as done"
            );
            deps.tracker.mark_all_done(chat_jid).await;
            true
        }
        ErrorOutcome::RollbackToPipeCursor => {
            let target = pipe_cursor.unwrap_or_default();
            warn!(
                group = group_name,
                cursor = target.as_str(),
                "agent error after piped input, rolling back pipe cursor"
            );
            let mut agent_cursors = load_cursor_map(&deps.store, LAST_AGENT_TIMESTAMP_KEY);
            agent_cursors.insert(chat_jid.to_string(), target);
            save_cursor_map(&deps.store, LAST_AGENT_TIMESTAMP_KEY, &agent_cursors);
            before_pipe.remove(chat_jid);
            save_cursor_map(&deps.store, CURSOR_BEFORE_PIPE_KEY, &before_pipe);
            deps.tracker.mark_all_failed(chat_jid, reason).await;
            false
        }
        ErrorOutcome::RollbackToPreAdvance => {
            warn!(
                group = group_name,
                cursor = previous_cursor,
                "agent error with no output, rolling back for retry"
            );
            let mut agent_cursors = load_cursor_map(&deps.store, LAST_AGENT_TIMESTAMP_KEY);
            agent_cursors.insert(chat_jid.to_string(), previous_cursor.to_string());
            save_cursor_map(&deps.store, LAST_AGENT_TIMESTAMP_KEY, &agent_cursors);
            if before_pipe.remove(chat_jid).is_some() {
                save_cursor_map(&deps.store, CURSOR_BEFORE_PIPE_KEY, &before_pipe);
            }
            deps.tracker.mark_all_failed(chat_jid, reason).await;
            false
        }
    }
}

fn clear_pipe_cursor(store: &Store, chat_jid: &str) {
    let mut before_pipe = load_cursor_map(store, CURSOR_BEFORE_PIPE_KEY);
    if before_pipe.remove(chat_jid).is_some() {
        save_cursor_map(store, CURSOR_BEFORE_PIPE_KEY, &before_pipe);
    }
}

fn store_bot_message(store: &Store, chat_jid: &str, assistant_name: &str, text: &str) {
    let now = courier_core::now_ts();
    let bot_msg = NewMessage {
        id: format!("bot-{}", chrono::Utc::now().timestamp_millis()),
        chat_jid: chat_jid.to_string(),
        sender: "bot".into(),
        sender_name: assistant_name.to_string(),
        content: text.to_string(),
        timestamp: now,
        is_from_me: true,
        is_bot_message: true,
    };
    if let Err(e) = store.store_message(&bot_msg) {
        warn!(err = %e, "failed to store bot response");
    }
}
