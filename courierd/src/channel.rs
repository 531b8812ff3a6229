//! Chat channel drivers.
//!
//! The orchestrator only knows the `ChannelDriver` trait: send text, set a
//! reaction, toggle the typing indicator, disconnect. Reaction and typing
//! support is optional; failures there are logged and never fatal.
//!
//! `TelegramChannel` is the production driver (Bot API over HTTPS).
//! `NullChannel` records calls in memory and backs tests and channel-less
//! boots.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

pub const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Identifies a channel message for reaction targeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub id: String,
    pub remote_jid: String,
    pub from_me: bool,
}

#[async_trait]
pub trait ChannelDriver: Send + Sync {
    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()>;

    async fn send_reaction(&self, jid: &str, key: &MessageKey, emoji: &str) -> anyhow::Result<()>;

    async fn set_typing(&self, jid: &str, on: bool) -> anyhow::Result<()>;

    async fn disconnect(&self);

    /// Whether this driver is responsible for the given chat JID.
    fn owns_jid(&self, jid: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

pub struct TelegramChannel {
    client: Client,
    bot_token: String,
}

#[derive(Debug, Deserialize)]
struct TelegramApiEnvelope {
    ok: bool,
    description: Option<String>,
}

impl TelegramChannel {
    /// Build from the `TELEGRAM_BOT_TOKEN` env var. Returns `None` when the
    /// token is unset, letting the caller fall back to `NullChannel`.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())?;
        Some(Self {
            client: Client::new(),
            bot_token,
        })
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> anyhow::Result<()> {
        let endpoint = format!("{TELEGRAM_API_BASE}/bot{}/{method}", self.bot_token);
        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to call Telegram {method}"))?;

        let envelope: TelegramApiEnvelope = response
            .json()
            .await
            .with_context(|| format!("failed to parse Telegram {method} response"))?;
        if !envelope.ok {
            return Err(anyhow!(envelope
                .description
                .unwrap_or_else(|| format!("Telegram {method} returned ok=false"))));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelDriver for TelegramChannel {
    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        if text.trim().is_empty() {
            return Err(anyhow!("cannot send an empty message"));
        }
        let chat_id = normalize_chat_id(jid);
        for chunk in split_for_channel(text, TELEGRAM_MAX_TEXT_CHARS) {
            self.call(
                "sendMessage",
                serde_json::json!({ "chat_id": chat_id, "text": chunk }),
            )
            .await?;
        }
        Ok(())
    }

    async fn send_reaction(&self, jid: &str, key: &MessageKey, emoji: &str) -> anyhow::Result<()> {
        // Reacting to our own messages is pointless feedback.
        if key.from_me {
            return Ok(());
        }
        let target = if key.remote_jid.is_empty() {
            jid
        } else {
            key.remote_jid.as_str()
        };
        let chat_id = normalize_chat_id(target);
        self.call(
            "setMessageReaction",
            serde_json::json!({
                "chat_id": chat_id,
                "message_id": key.id.parse::<i64>().unwrap_or_default(),
                "reaction": [{ "type": "emoji", "emoji": emoji }],
            }),
        )
        .await
    }

    async fn set_typing(&self, jid: &str, on: bool) -> anyhow::Result<()> {
        // Telegram clears the action by itself; only the "on" edge is sent.
        if !on {
            return Ok(());
        }
        let chat_id = normalize_chat_id(jid);
        self.call(
            "sendChatAction",
            serde_json::json!({ "chat_id": chat_id, "action": "typing" }),
        )
        .await
    }

    async fn disconnect(&self) {
        debug!("telegram channel disconnected");
    }

    fn owns_jid(&self, jid: &str) -> bool {
        jid.starts_with("tg:")
    }
}

/// Strip the channel prefix from a JID to get the Telegram chat id.
fn normalize_chat_id(jid: &str) -> &str {
    jid.strip_prefix("tg:").unwrap_or(jid)
}

/// Split text into chunks within the channel limit, preferring newline
/// boundaries and falling back to a hard character split.
pub fn split_for_channel(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() <= max_chars {
            current.push_str(line);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        // A single line longer than the limit is hard-split.
        let mut rest = line;
        while rest.chars().count() > max_chars {
            let split_at = rest
                .char_indices()
                .nth(max_chars)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            chunks.push(rest[..split_at].to_string());
            rest = &rest[split_at..];
        }
        current.push_str(rest);
    }
    if !current.trim().is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ---------------------------------------------------------------------------
// Null channel
// ---------------------------------------------------------------------------

/// Records every call; used when no channel token is configured and across
/// the test suite.
#[derive(Default)]
pub struct NullChannel {
    pub sent: std::sync::Mutex<Vec<(String, String)>>,
    pub reactions: std::sync::Mutex<Vec<(String, String, String)>>,
    pub typing: std::sync::Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl ChannelDriver for NullChannel {
    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_reaction(&self, jid: &str, key: &MessageKey, emoji: &str) -> anyhow::Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .push((jid.to_string(), key.id.clone(), emoji.to_string()));
        Ok(())
    }

    async fn set_typing(&self, jid: &str, on: bool) -> anyhow::Result<()> {
        self.typing.lock().unwrap().push((jid.to_string(), on));
        Ok(())
    }

    async fn disconnect(&self) {}

    fn owns_jid(&self, _jid: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = split_for_channel("hello world", 4096);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn splits_on_newline_boundaries() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_for_channel(&text, 12);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn hard_splits_oversized_lines() {
        let text = "x".repeat(25);
        let chunks = split_for_channel(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn normalize_strips_prefix() {
        assert_eq!(normalize_chat_id("tg:12345"), "12345");
        assert_eq!(normalize_chat_id("12345"), "12345");
    }

    #[tokio::test]
    async fn null_channel_records_calls() {
        let ch = NullChannel::default();
        ch.send_message("tg:1", "hi").await.unwrap();
        ch.send_reaction(
            "tg:1",
            &MessageKey {
                id: "m1".into(),
                remote_jid: "tg:1".into(),
                from_me: false,
            },
            "✅",
        )
        .await
        .unwrap();
        assert_eq!(ch.sent.lock().unwrap().len(), 1);
        assert_eq!(ch.reactions.lock().unwrap().len(), 1);
    }
}
