//! Status tracker: visible feedback via channel reactions.
//!
//! Wraps the persisted `message_status` rows with the side effects: each
//! forward transition along the DAG emits the matching reaction emoji, and
//! a failure cluster additionally produces one apologetic chat message.
//! Reaction sends run detached and their failures are swallowed — a flaky
//! channel never propagates into the orchestration path.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{MessageStatus, Store, status_emoji};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::{ChannelDriver, MessageKey};
use crate::queue::GroupQueue;

/// How far back `recover()` re-emits reactions after a restart (hours).
const RECOVERY_WINDOW_HOURS: i64 = 24;

pub struct StatusTracker {
    store: Store,
    channel: Arc<dyn ChannelDriver>,
    sends: Mutex<JoinSet<()>>,
}

impl StatusTracker {
    pub fn new(store: Store, channel: Arc<dyn ChannelDriver>) -> Self {
        Self {
            store,
            channel,
            sends: Mutex::new(JoinSet::new()),
        }
    }

    /// Record a newly observed user message. Idempotent: duplicates are
    /// rejected silently and emit nothing.
    pub async fn mark_received(&self, message_id: &str, chat_jid: &str, is_main: bool) {
        match self.store.insert_status_received(message_id, chat_jid, is_main) {
            Ok(true) => {
                self.emit_reaction(chat_jid, message_id, MessageStatus::Received)
                    .await;
            }
            Ok(false) => {
                debug!(message_id, "duplicate mark_received ignored");
            }
            Err(e) => warn!(message_id, err = %e, "failed to persist received status"),
        }
    }

    pub async fn mark_thinking(&self, message_id: &str) {
        self.advance(message_id, MessageStatus::Thinking).await;
    }

    pub async fn mark_working(&self, message_id: &str) {
        self.advance(message_id, MessageStatus::Working).await;
    }

    async fn advance(&self, message_id: &str, to: MessageStatus) {
        match self.store.advance_status(message_id, to) {
            Ok(Some(record)) => {
                self.emit_reaction(&record.chat_jid, message_id, to).await;
            }
            Ok(None) => {}
            Err(e) => warn!(message_id, state = to.as_str(), err = %e, "status advance failed"),
        }
    }

    /// Transition every non-terminal record of the chat to `done`.
    pub async fn mark_all_done(&self, chat_jid: &str) {
        match self.store.advance_all_for_chat(chat_jid, MessageStatus::Done) {
            Ok(records) => {
                for record in records {
                    self.emit_reaction(chat_jid, &record.message_id, MessageStatus::Done)
                        .await;
                }
            }
            Err(e) => warn!(chat_jid, err = %e, "mark_all_done failed"),
        }
    }

    /// Transition every non-terminal record of the chat to `failed` and send
    /// one apology for the whole cluster.
    pub async fn mark_all_failed(&self, chat_jid: &str, reason: &str) {
        let records = match self
            .store
            .advance_all_for_chat(chat_jid, MessageStatus::Failed)
        {
            Ok(records) => records,
            Err(e) => {
                warn!(chat_jid, err = %e, "mark_all_failed failed");
                return;
            }
        };
        if records.is_empty() {
            return;
        }
        info!(chat_jid, count = records.len(), reason, "marking message cluster failed");
        for record in &records {
            self.emit_reaction(chat_jid, &record.message_id, MessageStatus::Failed)
                .await;
        }
        if let Err(e) = self
            .channel
            .send_message(
                chat_jid,
                "Sorry — I hit a problem handling that. I'll retry shortly.",
            )
            .await
        {
            warn!(chat_jid, err = %e, "failed to send failure notice");
        }
    }

    /// Periodic sweep: a record stuck in thinking/working whose container is
    /// gone transitions to failed (reaction only, no apology).
    pub async fn heartbeat_check(&self, queue: &GroupQueue) {
        let records = match self.store.non_terminal_statuses() {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "heartbeat: failed to load statuses");
                return;
            }
        };
        for record in records {
            if !matches!(
                record.state,
                MessageStatus::Thinking | MessageStatus::Working
            ) {
                continue;
            }
            if queue.is_active(&record.chat_jid).await {
                continue;
            }
            info!(
                message_id = record.message_id.as_str(),
                chat_jid = record.chat_jid.as_str(),
                "heartbeat: container gone, failing stale status"
            );
            self.advance(&record.message_id, MessageStatus::Failed).await;
        }
    }

    /// Re-emit the reaction implied by each recently touched record. Runs
    /// after channels connect so a crash between state change and reaction
    /// send cannot leave the user looking at a stale emoji. The re-emit is
    /// unconditional; a duplicate reaction event is accepted as minor.
    pub async fn recover(&self) {
        let since = (chrono::Utc::now() - chrono::Duration::hours(RECOVERY_WINDOW_HOURS))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let records = match self.store.statuses_updated_since(&since) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "status recovery failed to load records");
                return;
            }
        };
        if records.is_empty() {
            return;
        }
        info!(count = records.len(), "re-emitting reactions after restart");
        for record in records {
            self.emit_reaction(&record.chat_jid, &record.message_id, record.state)
                .await;
        }
    }

    /// Await in-flight reaction sends; errors are swallowed so a
    /// disconnected channel cannot block shutdown.
    pub async fn shutdown(&self) {
        let mut sends = self.sends.lock().await;
        while let Some(result) = sends.join_next().await {
            if let Err(e) = result {
                debug!(err = %e, "reaction send task aborted during shutdown");
            }
        }
    }

    async fn emit_reaction(&self, chat_jid: &str, message_id: &str, status: MessageStatus) {
        let channel = self.channel.clone();
        let key = MessageKey {
            id: message_id.to_string(),
            remote_jid: chat_jid.to_string(),
            from_me: false,
        };
        let jid = chat_jid.to_string();
        let emoji = status_emoji(status);

        let mut sends = self.sends.lock().await;
        // Reap already-finished sends so the set stays small.
        while sends.try_join_next().is_some() {}
        sends.spawn(async move {
            if let Err(e) = channel.send_reaction(&jid, &key, emoji).await {
                warn!(chat_jid = jid.as_str(), message_id = key.id.as_str(), err = %e,
                    "reaction send failed");
            }
        });
    }

    #[cfg(test)]
    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Periodic heartbeat loop; exits on shutdown.
pub async fn run_heartbeat_loop(
    tracker: Arc<StatusTracker>,
    queue: Arc<GroupQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                tracker.heartbeat_check(&queue).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
