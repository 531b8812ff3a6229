//! Message poll loop.
//!
//! Dual-cursor design:
//! - `last_timestamp` (global): advances whenever new messages are observed,
//!   whether or not they are processed. Prevents re-fetching.
//! - `last_agent_timestamp` (per group): advances only when messages are
//!   handed to the agent. Messages accumulate between triggers so the next
//!   trigger pulls its context.
//! - `cursor_before_pipe` (per group): set when messages are piped into a
//!   live container, cleared on successful completion. A non-empty value at
//!   boot means the process died with in-flight piped work; recovery rolls
//!   the agent cursor back to it.
//!
//! Quiet hours gate everything but the global cursor: while quiet, messages
//! accumulate untouched, and the quiet→active edge produces a catch-up
//! summary to the main group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{NewMessage, QuietSchedule, RegisteredGroup, Store};
use regex::Regex;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::channel::ChannelDriver;
use crate::queue::GroupQueue;
use crate::status_tracker::StatusTracker;

pub const LAST_TIMESTAMP_KEY: &str = "last_timestamp";
pub const LAST_AGENT_TIMESTAMP_KEY: &str = "last_agent_timestamp";
pub const CURSOR_BEFORE_PIPE_KEY: &str = "cursor_before_pipe";

pub type Groups = Arc<RwLock<HashMap<String, RegisteredGroup>>>;

#[derive(Debug, Clone)]
pub struct PollLoopConfig {
    pub poll_interval_ms: u64,
    pub assistant_name: String,
    pub main_group_folder: String,
}

/// Everything the poll loop touches.
pub struct Router {
    pub config: PollLoopConfig,
    pub store: Store,
    pub queue: Arc<GroupQueue>,
    pub groups: Groups,
    pub channel: Arc<dyn ChannelDriver>,
    pub tracker: Arc<StatusTracker>,
    pub quiet: Arc<QuietSchedule>,
    pub quiet_enabled: bool,
}

impl Router {
    fn is_quiet_now(&self) -> bool {
        self.quiet_enabled && self.quiet.is_quiet(chrono::Utc::now())
    }

    async fn main_jid(&self) -> Option<String> {
        let groups = self.groups.read().await;
        groups
            .values()
            .find(|g| g.folder == self.config.main_group_folder)
            .map(|g| g.jid.clone())
    }
}

/// Run the poll loop until the shutdown signal fires. Recovery must have
/// completed before this is called.
pub async fn run_poll_loop(router: Arc<Router>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(router.config.poll_interval_ms);
    let mut last_timestamp = load_cursor(&router.store, LAST_TIMESTAMP_KEY);
    let mut was_quiet = router.is_quiet_now();

    info!(
        poll_interval_ms = router.config.poll_interval_ms,
        last_timestamp = last_timestamp.as_str(),
        quiet = was_quiet,
        "message poll loop started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("message poll loop shutting down");
                    return;
                }
            }
        }

        if let Err(e) = poll_once(&router, &mut last_timestamp, &mut was_quiet).await {
            error!(err = %e, "error in message poll");
        }
    }
}

/// Single poll iteration. Extracted for testability.
pub async fn poll_once(
    router: &Router,
    last_timestamp: &mut String,
    was_quiet: &mut bool,
) -> anyhow::Result<()> {
    let quiet = router.is_quiet_now();
    if *was_quiet && !quiet {
        on_quiet_period_end(router).await;
    }
    *was_quiet = quiet;

    let jids: Vec<String> = {
        let groups = router.groups.read().await;
        groups.keys().cloned().collect()
    };
    if jids.is_empty() {
        return Ok(());
    }

    let (messages, new_timestamp) =
        router
            .store
            .get_new_messages(&jids, last_timestamp, &router.config.assistant_name)?;
    if messages.is_empty() {
        return Ok(());
    }

    // Advance the global "seen" cursor immediately, processed or not.
    *last_timestamp = new_timestamp;
    router
        .store
        .set_router_state(LAST_TIMESTAMP_KEY, last_timestamp)?;

    if quiet {
        debug!(count = messages.len(), "quiet hours: messages accumulate");
        return Ok(());
    }

    let mut by_group: HashMap<String, Vec<NewMessage>> = HashMap::new();
    for msg in messages {
        by_group.entry(msg.chat_jid.clone()).or_default().push(msg);
    }

    let groups_snapshot = { router.groups.read().await.clone() };

    for (chat_jid, group_messages) in by_group {
        let Some(group) = groups_snapshot.get(&chat_jid) else {
            continue;
        };
        if !router.channel.owns_jid(&chat_jid) {
            continue;
        }

        let is_main = group.folder == router.config.main_group_folder;
        let needs_trigger = !is_main && group.requires_trigger;

        // Non-trigger messages accumulate; they are pulled as context when a
        // trigger eventually arrives.
        if needs_trigger {
            let re = build_trigger_regex(trigger_name(group, &router.config.assistant_name));
            if !group_messages
                .iter()
                .any(|m| re.is_match(m.content.trim()))
            {
                continue;
            }
        }

        for msg in &group_messages {
            if !msg.is_from_me {
                router
                    .tracker
                    .mark_received(&msg.id, &chat_jid, is_main)
                    .await;
            }
        }

        let mut agent_cursors = load_cursor_map(&router.store, LAST_AGENT_TIMESTAMP_KEY);
        let agent_since = agent_cursors.get(&chat_jid).cloned().unwrap_or_default();

        // Everything pending since the agent cursor, pre-trigger context
        // included.
        let all_pending = router
            .store
            .get_messages_since(&chat_jid, &agent_since, &router.config.assistant_name)
            .unwrap_or_default();
        let batch = if all_pending.is_empty() {
            &group_messages
        } else {
            &all_pending
        };
        let formatted = format_messages(batch);

        if router.queue.send_message(&chat_jid, &formatted).await {
            debug!(
                chat_jid = chat_jid.as_str(),
                count = batch.len(),
                "piped messages to live container"
            );
            for msg in &group_messages {
                if !msg.is_from_me {
                    router.tracker.mark_thinking(&msg.id).await;
                }
            }

            // Remember the pre-pipe cursor once per in-flight batch so a
            // terminal error can roll back to it atomically.
            let mut before_pipe = load_cursor_map(&router.store, CURSOR_BEFORE_PIPE_KEY);
            if !before_pipe.contains_key(&chat_jid) {
                before_pipe.insert(chat_jid.clone(), agent_since.clone());
                save_cursor_map(&router.store, CURSOR_BEFORE_PIPE_KEY, &before_pipe);
            }
            if let Some(last) = batch.last() {
                agent_cursors.insert(chat_jid.clone(), last.timestamp.clone());
                save_cursor_map(&router.store, LAST_AGENT_TIMESTAMP_KEY, &agent_cursors);
            }
            if let Err(e) = router.channel.set_typing(&chat_jid, true).await {
                debug!(err = %e, "set_typing failed (non-fatal)");
            }
        } else {
            router.queue.enqueue_message_check(&chat_jid).await;
        }
    }

    Ok(())
}

/// The quiet→active edge: greet the main group with the per-group backlog
/// and enqueue checks for everything pending.
async fn on_quiet_period_end(router: &Router) {
    info!("quiet period ended, catching up");
    let groups_snapshot = { router.groups.read().await.clone() };
    let agent_cursors = load_cursor_map(&router.store, LAST_AGENT_TIMESTAMP_KEY);

    let mut pending: Vec<(String, usize)> = Vec::new();
    let mut jids_to_check: Vec<String> = Vec::new();
    for (jid, group) in &groups_snapshot {
        let since = agent_cursors.get(jid).cloned().unwrap_or_default();
        match router
            .store
            .get_messages_since(jid, &since, &router.config.assistant_name)
        {
            Ok(msgs) if !msgs.is_empty() => {
                pending.push((group.name.clone(), msgs.len()));
                jids_to_check.push(jid.clone());
            }
            Ok(_) => {}
            Err(e) => warn!(jid, err = %e, "catch-up: failed to count pending messages"),
        }
    }
    pending.sort();

    if let Some(main_jid) = router.main_jid().await {
        let summary = catch_up_summary(&pending);
        if let Err(e) = router.channel.send_message(&main_jid, &summary).await {
            warn!(err = %e, "failed to send catch-up summary");
        }
    }

    for jid in jids_to_check {
        router.queue.enqueue_message_check(&jid).await;
    }
}

/// Greeting plus one bullet per group with a backlog.
pub fn catch_up_summary(pending: &[(String, usize)]) -> String {
    let mut lines = vec!["Back online after quiet hours.".to_string()];
    if !pending.is_empty() {
        for (name, count) in pending {
            lines.push(format!("• {name}: {count} messages"));
        }
        lines.push("Catching up on those now.".to_string());
    }
    lines.join("\n")
}

/// Startup recovery, run before the poll loop starts.
pub async fn recover_at_startup(router: &Router) {
    // 1. Crash-with-in-flight-pipe: roll the agent cursor back to the
    //    pre-pipe point so piped messages are re-processed.
    let mut before_pipe = load_cursor_map(&router.store, CURSOR_BEFORE_PIPE_KEY);
    if !before_pipe.is_empty() {
        let mut agent_cursors = load_cursor_map(&router.store, LAST_AGENT_TIMESTAMP_KEY);
        let jids: Vec<String> = before_pipe.keys().cloned().collect();
        for jid in jids {
            if router.queue.is_active(&jid).await {
                continue;
            }
            if let Some(cursor) = before_pipe.remove(&jid) {
                warn!(
                    jid = jid.as_str(),
                    cursor = cursor.as_str(),
                    "recovery: rolling back in-flight piped cursor"
                );
                agent_cursors.insert(jid, cursor);
            }
        }
        save_cursor_map(&router.store, LAST_AGENT_TIMESTAMP_KEY, &agent_cursors);
        save_cursor_map(&router.store, CURSOR_BEFORE_PIPE_KEY, &before_pipe);
    }

    // 2. Unprocessed backlog: enqueue a check per group with messages past
    //    the agent cursor. The dispatcher applies the trigger gate itself.
    let groups_snapshot = { router.groups.read().await.clone() };
    let agent_cursors = load_cursor_map(&router.store, LAST_AGENT_TIMESTAMP_KEY);
    for (jid, group) in &groups_snapshot {
        let since = agent_cursors.get(jid).cloned().unwrap_or_default();
        match router
            .store
            .get_messages_since(jid, &since, &router.config.assistant_name)
        {
            Ok(msgs) if !msgs.is_empty() => {
                info!(
                    group = group.name.as_str(),
                    pending = msgs.len(),
                    "recovery: enqueuing unprocessed messages"
                );
                router.queue.enqueue_message_check(jid).await;
            }
            Ok(_) => {}
            Err(e) => warn!(jid, err = %e, "recovery: failed to check pending messages"),
        }
    }

    // 3. Reaction state: re-emit the latest emoji per recent record.
    router.tracker.recover().await;
}

/// Pre-quiet notifier: reminds the main group shortly before a quiet window
/// begins.
pub async fn run_quiet_reminder_loop(
    router: Arc<Router>,
    offset: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    const RECHECK: Duration = Duration::from_secs(3600);

    loop {
        let now = chrono::Utc::now();
        let Some(start) = router.quiet.next_window_start(now) else {
            if sleep_or_shutdown(RECHECK, &mut shutdown).await {
                return;
            }
            continue;
        };
        let offset_chrono =
            chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        let remind_at = start - offset_chrono;

        if now < remind_at {
            let wait = (remind_at - now)
                .to_std()
                .unwrap_or(Duration::from_secs(60))
                .min(RECHECK);
            if sleep_or_shutdown(wait, &mut shutdown).await {
                return;
            }
            continue;
        }

        if now < start {
            if let Some(main_jid) = router.main_jid().await {
                let minutes = (start - now).num_minutes().max(1);
                let text = format!(
                    "Heads up — quiet hours begin in {minutes} minutes. \
                     I'll pause processing and catch up afterwards."
                );
                if let Err(e) = router.channel.send_message(&main_jid, &text).await {
                    warn!(err = %e, "failed to send quiet-hours reminder");
                }
            }
            // Sleep past the window start so one window gets one reminder.
            let wait = (start - now)
                .to_std()
                .unwrap_or_default()
                .saturating_add(Duration::from_secs(60));
            if sleep_or_shutdown(wait, &mut shutdown).await {
                return;
            }
        } else if sleep_or_shutdown(Duration::from_secs(60), &mut shutdown).await {
            return;
        }
    }
}

/// Returns true when shutdown fired during the sleep.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

// ---------------------------------------------------------------------------
// Cursor persistence
// ---------------------------------------------------------------------------

pub fn load_cursor(store: &Store, key: &str) -> String {
    match store.get_router_state(key) {
        Ok(Some(v)) => v,
        Ok(None) => String::new(),
        Err(e) => {
            warn!(key, err = %e, "failed to load cursor, starting from empty");
            String::new()
        }
    }
}

/// JSON `map<jid, timestamp>` cursor maps. Corrupted JSON loads as empty
/// with a warning; execution proceeds.
pub fn load_cursor_map(store: &Store, key: &str) -> HashMap<String, String> {
    match store.get_router_state(key) {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(map) => map,
            Err(e) => {
                warn!(key, err = %e, "corrupted cursor map, treating as empty");
                HashMap::new()
            }
        },
        Ok(None) => HashMap::new(),
        Err(e) => {
            warn!(key, err = %e, "failed to load cursor map, starting from empty");
            HashMap::new()
        }
    }
}

pub fn save_cursor_map(store: &Store, key: &str, map: &HashMap<String, String>) {
    let json = serde_json::to_string(map).unwrap_or_else(|_| "{}".into());
    if let Err(e) = store.set_router_state(key, &json) {
        error!(key, err = %e, "failed to save cursor map");
    }
}

// ---------------------------------------------------------------------------
// Trigger and formatting
// ---------------------------------------------------------------------------

/// The name whose `@` mention wakes this group's agent.
pub fn trigger_name<'a>(group: &'a RegisteredGroup, default_name: &'a str) -> &'a str {
    group.assistant_name.as_deref().unwrap_or(default_name)
}

/// Case-insensitive `@Name` mention at the start of the trimmed content.
pub fn build_trigger_regex(assistant_name: &str) -> Regex {
    let escaped = regex::escape(assistant_name);
    Regex::new(&format!(r"(?i)^@{escaped}\b"))
        .unwrap_or_else(|_| Regex::new(r"(?i)^@\b").expect("fallback trigger regex"))
}

/// Format a message batch into the agent prompt.
pub fn format_messages(messages: &[NewMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.sender_name, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_regex_matches_mention() {
        let re = build_trigger_regex("Andy");
        assert!(re.is_match("@Andy hello"));
        assert!(re.is_match("@andy hello"));
        assert!(!re.is_match("hello @Andy"));
        assert!(!re.is_match("@Andyman hello"));
    }

    #[test]
    fn trigger_name_prefers_group_override() {
        let mut group = RegisteredGroup {
            jid: "tg:1".into(),
            name: "Eng".into(),
            folder: "eng".into(),
            added_at: String::new(),
            requires_trigger: true,
            assistant_name: Some("Andy".into()),
        };
        assert_eq!(trigger_name(&group, "Marlow"), "Andy");
        group.assistant_name = None;
        assert_eq!(trigger_name(&group, "Marlow"), "Marlow");
    }

    #[test]
    fn format_messages_basic() {
        let msgs = vec![
            NewMessage {
                id: "1".into(),
                chat_jid: "tg:1".into(),
                sender: "u1".into(),
                sender_name: "Alice".into(),
                content: "Hello".into(),
                timestamp: "2024-01-15T12:00:00.000Z".into(),
                is_from_me: false,
                is_bot_message: false,
            },
            NewMessage {
                id: "2".into(),
                chat_jid: "tg:1".into(),
                sender: "u2".into(),
                sender_name: "Bob".into(),
                content: "Hi".into(),
                timestamp: "2024-01-15T12:01:00.000Z".into(),
                is_from_me: false,
                is_bot_message: false,
            },
        ];
        assert_eq!(format_messages(&msgs), "[Alice]: Hello\n[Bob]: Hi");
        assert!(format_messages(&[]).is_empty());
    }

    #[test]
    fn catch_up_summary_with_and_without_backlog() {
        let empty = catch_up_summary(&[]);
        assert_eq!(empty, "Back online after quiet hours.");

        let summary = catch_up_summary(&[("Engineering".into(), 3), ("Family".into(), 1)]);
        assert!(summary.contains("• Engineering: 3 messages"));
        assert!(summary.contains("• Family: 1 messages"));
        assert!(summary.ends_with("Catching up on those now."));
    }

    #[test]
    fn cursor_map_roundtrip_and_corruption() {
        let store = Store::open_in_memory().unwrap();
        let mut map = HashMap::new();
        map.insert("tg:1".to_string(), "2024-01-15T12:00:00.000Z".to_string());
        save_cursor_map(&store, LAST_AGENT_TIMESTAMP_KEY, &map);
        let loaded = load_cursor_map(&store, LAST_AGENT_TIMESTAMP_KEY);
        assert_eq!(loaded, map);

        store
            .set_router_state(CURSOR_BEFORE_PIPE_KEY, "not json{{")
            .unwrap();
        let loaded = load_cursor_map(&store, CURSOR_BEFORE_PIPE_KEY);
        assert!(loaded.is_empty());
    }
}
