//! Message status state machine.
//!
//! Every user message the gateway acts on gets a persisted status row that
//! drives the visible reaction in the chat. Transitions only move forward:
//!
//! ```text
//! received → thinking → working → done
//!                               ↘ failed
//! ```
//!
//! Terminal states absorb; there are no backwards transitions, so replayed
//! or duplicated updates after a crash are harmless.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Thinking,
    Working,
    Done,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Received => "received",
            MessageStatus::Thinking => "thinking",
            MessageStatus::Working => "working",
            MessageStatus::Done => "done",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(MessageStatus::Received),
            "thinking" => Some(MessageStatus::Thinking),
            "working" => Some(MessageStatus::Working),
            "done" => Some(MessageStatus::Done),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Done | MessageStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            MessageStatus::Received => 0,
            MessageStatus::Thinking => 1,
            MessageStatus::Working => 2,
            MessageStatus::Done => 3,
            MessageStatus::Failed => 3,
        }
    }
}

/// Whether a transition `from → to` is allowed by the DAG.
pub fn can_advance(from: MessageStatus, to: MessageStatus) -> bool {
    !from.is_terminal() && to.rank() > from.rank()
}

/// The visible reaction emoji for a status. Pure; the tracker owns the
/// side effects.
pub fn status_emoji(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Received => "\u{1F440}",  // 👀
        MessageStatus::Thinking => "\u{1F4AD}",  // 💭
        MessageStatus::Working => "\u{2699}\u{FE0F}", // ⚙️
        MessageStatus::Done => "\u{2705}",       // ✅
        MessageStatus::Failed => "\u{26A0}\u{FE0F}", // ⚠️
    }
}

/// A persisted status row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub message_id: String,
    pub chat_jid: String,
    pub is_main: bool,
    pub state: MessageStatus,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_allowed() {
        assert!(can_advance(MessageStatus::Received, MessageStatus::Thinking));
        assert!(can_advance(MessageStatus::Thinking, MessageStatus::Working));
        assert!(can_advance(MessageStatus::Working, MessageStatus::Done));
        assert!(can_advance(MessageStatus::Working, MessageStatus::Failed));
        // Skipping ahead is fine (e.g. received → failed on a dead container)
        assert!(can_advance(MessageStatus::Received, MessageStatus::Failed));
    }

    #[test]
    fn backwards_and_terminal_transitions_rejected() {
        assert!(!can_advance(MessageStatus::Working, MessageStatus::Thinking));
        assert!(!can_advance(MessageStatus::Done, MessageStatus::Failed));
        assert!(!can_advance(MessageStatus::Failed, MessageStatus::Done));
        assert!(!can_advance(MessageStatus::Thinking, MessageStatus::Thinking));
    }

    #[test]
    fn emoji_is_total() {
        for s in [
            MessageStatus::Received,
            MessageStatus::Thinking,
            MessageStatus::Working,
            MessageStatus::Done,
            MessageStatus::Failed,
        ] {
            assert!(!status_emoji(s).is_empty());
        }
    }

    #[test]
    fn parse_roundtrip() {
        for s in ["received", "thinking", "working", "done", "failed"] {
            assert_eq!(MessageStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(MessageStatus::parse("queued").is_none());
    }
}
