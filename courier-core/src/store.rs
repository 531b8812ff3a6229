//! Embedded SQLite store.
//!
//! The gateway is a single process, so a single-file SQLite database is the
//! system of record: message log, registered groups, sessions, scheduled
//! tasks and their run log, router cursors, and message status rows.
//!
//! All writes are synchronous; a crash mid-call never leaves a partially
//! written cursor. Connection access is serialized behind one mutex — the
//! store is not a throughput bottleneck next to container runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::status::{MessageStatus, StatusRecord, can_advance};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub added_at: String,
    #[serde(default = "default_true")]
    pub requires_trigger: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    pub created_at: String,
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Current UTC time as the RFC 3339 string format used for every timestamp
/// column. Lexicographic order equals chronological order.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open store at {}", path.as_ref().display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store mutex poisoned"))
    }

    // -----------------------------------------------------------------------
    // Chats and messages
    // -----------------------------------------------------------------------

    pub fn store_chat_metadata(
        &self,
        jid: &str,
        timestamp: &str,
        name: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let display_name = name.unwrap_or(jid);
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (jid) DO UPDATE SET
               name = COALESCE(NULLIF(excluded.name, excluded.jid), chats.name),
               last_message_time = MAX(chats.last_message_time, excluded.last_message_time)",
            params![jid, display_name, timestamp],
        )
        .context("store_chat_metadata")?;
        Ok(())
    }

    pub fn store_message(&self, msg: &NewMessage) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages
               (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id, chat_jid) DO UPDATE SET
               content = excluded.content,
               is_bot_message = excluded.is_bot_message",
            params![
                msg.id,
                msg.chat_jid,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me,
                msg.is_bot_message,
            ],
        )
        .context("store_message")?;
        Ok(())
    }

    /// New user messages across the registered chats since the global cursor.
    /// Returns the messages in timestamp order plus the advanced cursor.
    pub fn get_new_messages(
        &self,
        jids: &[String],
        last_timestamp: &str,
        assistant_name: &str,
    ) -> anyhow::Result<(Vec<NewMessage>, String)> {
        if jids.is_empty() {
            return Ok((Vec::new(), last_timestamp.to_string()));
        }
        let conn = self.lock()?;

        let placeholders: Vec<String> = (0..jids.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "SELECT id, chat_jid, sender, sender_name, content, timestamp, is_from_me
             FROM messages
             WHERE timestamp > ?1 AND is_bot_message = 0
               AND content NOT LIKE ?2
               AND content != ''
               AND chat_jid IN ({})
             ORDER BY timestamp",
            placeholders.join(", "),
        );

        let bot_prefix = format!("{assistant_name}:%");
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(last_timestamp.to_string()), Box::new(bot_prefix)];
        for jid in jids {
            values.push(Box::new(jid.clone()));
        }

        let mut stmt = conn.prepare(&sql).context("get_new_messages prepare")?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                row_to_message,
            )
            .context("get_new_messages")?
            .collect::<Result<Vec<_>, _>>()?;

        let mut new_timestamp = last_timestamp.to_string();
        for msg in &rows {
            if msg.timestamp > new_timestamp {
                new_timestamp = msg.timestamp.clone();
            }
        }
        Ok((rows, new_timestamp))
    }

    /// All pending user messages for one chat after a cursor, in order.
    pub fn get_messages_since(
        &self,
        chat_jid: &str,
        since: &str,
        assistant_name: &str,
    ) -> anyhow::Result<Vec<NewMessage>> {
        let conn = self.lock()?;
        let bot_prefix = format!("{assistant_name}:%");
        let mut stmt = conn
            .prepare(
                "SELECT id, chat_jid, sender, sender_name, content, timestamp, is_from_me
                 FROM messages
                 WHERE chat_jid = ?1 AND timestamp > ?2
                   AND is_bot_message = 0
                   AND content NOT LIKE ?3
                   AND content != ''
                 ORDER BY timestamp",
            )
            .context("get_messages_since prepare")?;
        let rows = stmt
            .query_map(params![chat_jid, since, bot_prefix], row_to_message)
            .context("get_messages_since")?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Router state
    // -----------------------------------------------------------------------

    pub fn get_router_state(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM router_state WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .context("get_router_state")
    }

    pub fn set_router_state(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO router_state (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("set_router_state")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub fn get_session(&self, group_folder: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT session_id FROM sessions WHERE group_folder = ?1",
            params![group_folder],
            |r| r.get(0),
        )
        .optional()
        .context("get_session")
    }

    pub fn set_session(&self, group_folder: &str, session_id: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
             ON CONFLICT (group_folder) DO UPDATE SET session_id = excluded.session_id",
            params![group_folder, session_id],
        )
        .context("set_session")?;
        Ok(())
    }

    pub fn get_all_sessions(&self) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT group_folder, session_id FROM sessions")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .context("get_all_sessions")?;
        let mut result = HashMap::new();
        for row in rows {
            let (folder, session) = row?;
            result.insert(folder, session);
        }
        Ok(result)
    }

    pub fn delete_session(&self, group_folder: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sessions WHERE group_folder = ?1",
            params![group_folder],
        )
        .context("delete_session")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registered groups
    // -----------------------------------------------------------------------

    pub fn get_registered_group(&self, jid: &str) -> anyhow::Result<Option<RegisteredGroup>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT jid, name, folder, added_at, requires_trigger, assistant_name
             FROM registered_groups WHERE jid = ?1",
            params![jid],
            row_to_group,
        )
        .optional()
        .context("get_registered_group")
    }

    pub fn set_registered_group(&self, group: &RegisteredGroup) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO registered_groups
               (jid, name, folder, added_at, requires_trigger, assistant_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (jid) DO UPDATE SET
               name = excluded.name,
               folder = excluded.folder,
               requires_trigger = excluded.requires_trigger,
               assistant_name = excluded.assistant_name",
            params![
                group.jid,
                group.name,
                group.folder,
                group.added_at,
                group.requires_trigger,
                group.assistant_name,
            ],
        )
        .context("set_registered_group")?;
        Ok(())
    }

    pub fn get_all_registered_groups(&self) -> anyhow::Result<HashMap<String, RegisteredGroup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT jid, name, folder, added_at, requires_trigger, assistant_name
             FROM registered_groups",
        )?;
        let rows = stmt
            .query_map([], row_to_group)
            .context("get_all_registered_groups")?;
        let mut result = HashMap::new();
        for row in rows {
            let group = row?;
            result.insert(group.jid.clone(), group);
        }
        Ok(result)
    }

    pub fn delete_registered_group(&self, jid: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM registered_groups WHERE jid = ?1",
            params![jid],
        )
        .context("delete_registered_group")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduled tasks
    // -----------------------------------------------------------------------

    pub fn create_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduled_tasks
               (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                context_mode, next_run, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type,
                task.schedule_value,
                task.context_mode,
                task.next_run,
                task.status,
                task.created_at,
            ],
        )
        .context("create_task")?;
        Ok(())
    }

    pub fn get_task_by_id(&self, id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM scheduled_tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .context("get_task_by_id")
    }

    pub fn get_tasks_for_group(&self, group_folder: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks WHERE group_folder = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![group_folder], row_to_task)
            .context("get_tasks_for_group")?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM scheduled_tasks ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map([], row_to_task)
            .context("get_all_tasks")?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM task_runs WHERE task_id = ?1", params![id])
            .context("delete_task_runs")?;
        conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
            .context("delete_task")?;
        Ok(())
    }

    pub fn set_task_status(&self, id: &str, status: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE scheduled_tasks SET status = ?2 WHERE id = ?1",
            params![id, status],
        )
        .context("set_task_status")?;
        Ok(())
    }

    /// Active tasks whose `next_run` is at or before `now`.
    pub fn get_due_tasks(&self, now: &str) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run",
        )?;
        let rows = stmt
            .query_map(params![now], row_to_task)
            .context("get_due_tasks")?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move `next_run` forward (or to NULL for one-shot tasks). Called by
    /// the scheduler before the task is enqueued so the next tick cannot
    /// rediscover a task that is still running.
    pub fn advance_task_next_run(&self, id: &str, next_run: Option<&str>) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1",
            params![id, next_run],
        )
        .context("advance_task_next_run")?;
        Ok(())
    }

    /// Record the outcome of a run. One-shot tasks complete here.
    pub fn record_task_outcome(
        &self,
        id: &str,
        last_result: &str,
        complete: bool,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE scheduled_tasks
             SET last_run = ?2, last_result = ?3,
                 status = CASE WHEN ?4 THEN 'completed' ELSE status END
             WHERE id = ?1",
            params![id, now_ts(), last_result, complete],
        )
        .context("record_task_outcome")?;
        Ok(())
    }

    pub fn log_task_run(&self, log: &TaskRunLog) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_runs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log.task_id,
                log.run_at,
                log.duration_ms,
                log.status,
                log.result,
                log.error,
            ],
        )
        .context("log_task_run")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Message status
    // -----------------------------------------------------------------------

    /// Insert a fresh `received` row. Idempotent: a second call for the same
    /// message id is rejected silently. Returns whether a row was inserted.
    pub fn insert_status_received(
        &self,
        message_id: &str,
        chat_jid: &str,
        is_main: bool,
    ) -> anyhow::Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO message_status
                   (message_id, chat_jid, is_main, state, updated_at)
                 VALUES (?1, ?2, ?3, 'received', ?4)",
                params![message_id, chat_jid, is_main, now_ts()],
            )
            .context("insert_status_received")?;
        Ok(changed > 0)
    }

    pub fn get_status(&self, message_id: &str) -> anyhow::Result<Option<StatusRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT message_id, chat_jid, is_main, state, updated_at
             FROM message_status WHERE message_id = ?1",
            params![message_id],
            row_to_status,
        )
        .optional()
        .context("get_status")
    }

    /// Advance one record along the DAG. Returns the updated record, or
    /// `None` when the transition is not allowed (or the row is missing).
    pub fn advance_status(
        &self,
        message_id: &str,
        to: MessageStatus,
    ) -> anyhow::Result<Option<StatusRecord>> {
        let conn = self.lock()?;
        let current = conn
            .query_row(
                "SELECT message_id, chat_jid, is_main, state, updated_at
                 FROM message_status WHERE message_id = ?1",
                params![message_id],
                row_to_status,
            )
            .optional()
            .context("advance_status read")?;

        let Some(mut record) = current else {
            return Ok(None);
        };
        if !can_advance(record.state, to) {
            return Ok(None);
        }

        record.state = to;
        record.updated_at = now_ts();
        conn.execute(
            "UPDATE message_status SET state = ?2, updated_at = ?3 WHERE message_id = ?1",
            params![message_id, to.as_str(), record.updated_at],
        )
        .context("advance_status write")?;
        Ok(Some(record))
    }

    /// Advance every non-terminal record of a chat. Returns the records that
    /// actually transitioned.
    pub fn advance_all_for_chat(
        &self,
        chat_jid: &str,
        to: MessageStatus,
    ) -> anyhow::Result<Vec<StatusRecord>> {
        let candidates = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT message_id, chat_jid, is_main, state, updated_at
                 FROM message_status
                 WHERE chat_jid = ?1 AND state NOT IN ('done', 'failed')",
            )?;
            stmt.query_map(params![chat_jid], row_to_status)
                .context("advance_all_for_chat read")?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut advanced = Vec::new();
        for record in candidates {
            if let Some(updated) = self.advance_status(&record.message_id, to)? {
                advanced.push(updated);
            }
        }
        Ok(advanced)
    }

    pub fn non_terminal_statuses(&self) -> anyhow::Result<Vec<StatusRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, chat_jid, is_main, state, updated_at
             FROM message_status WHERE state NOT IN ('done', 'failed')",
        )?;
        let rows = stmt
            .query_map([], row_to_status)
            .context("non_terminal_statuses")?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Records touched after `since`, for post-restart reaction recovery.
    pub fn statuses_updated_since(&self, since: &str) -> anyhow::Result<Vec<StatusRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, chat_jid, is_main, state, updated_at
             FROM message_status WHERE updated_at > ?1 ORDER BY updated_at",
        )?;
        let rows = stmt
            .query_map(params![since], row_to_status)
            .context("statuses_updated_since")?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Schema and row mapping
// ---------------------------------------------------------------------------

fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chats (
           jid TEXT PRIMARY KEY,
           name TEXT,
           last_message_time TEXT
         );

         CREATE TABLE IF NOT EXISTS messages (
           id TEXT NOT NULL,
           chat_jid TEXT NOT NULL,
           sender TEXT,
           sender_name TEXT,
           content TEXT,
           timestamp TEXT NOT NULL,
           is_from_me INTEGER DEFAULT 0,
           is_bot_message INTEGER DEFAULT 0,
           PRIMARY KEY (id, chat_jid)
         );
         CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

         CREATE TABLE IF NOT EXISTS scheduled_tasks (
           id TEXT PRIMARY KEY,
           group_folder TEXT NOT NULL,
           chat_jid TEXT NOT NULL,
           prompt TEXT NOT NULL,
           schedule_type TEXT NOT NULL,
           schedule_value TEXT NOT NULL,
           context_mode TEXT DEFAULT 'isolated',
           next_run TEXT,
           last_run TEXT,
           last_result TEXT,
           status TEXT DEFAULT 'active',
           created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
         CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

         CREATE TABLE IF NOT EXISTS task_runs (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           task_id TEXT NOT NULL,
           run_at TEXT NOT NULL,
           duration_ms INTEGER NOT NULL,
           status TEXT NOT NULL,
           result TEXT,
           error TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_id, run_at);

         CREATE TABLE IF NOT EXISTS router_state (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS sessions (
           group_folder TEXT PRIMARY KEY,
           session_id TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS registered_groups (
           jid TEXT PRIMARY KEY,
           name TEXT NOT NULL,
           folder TEXT NOT NULL UNIQUE,
           added_at TEXT NOT NULL,
           requires_trigger INTEGER DEFAULT 1,
           assistant_name TEXT
         );

         CREATE TABLE IF NOT EXISTS message_status (
           message_id TEXT PRIMARY KEY,
           chat_jid TEXT NOT NULL,
           is_main INTEGER NOT NULL DEFAULT 0,
           state TEXT NOT NULL,
           updated_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_message_status_chat ON message_status(chat_jid, state);",
    )
    .context("failed to create sqlite schema")
}

fn row_to_message(r: &rusqlite::Row<'_>) -> rusqlite::Result<NewMessage> {
    Ok(NewMessage {
        id: r.get("id")?,
        chat_jid: r.get("chat_jid")?,
        sender: r.get::<_, Option<String>>("sender")?.unwrap_or_default(),
        sender_name: r
            .get::<_, Option<String>>("sender_name")?
            .unwrap_or_default(),
        content: r.get::<_, Option<String>>("content")?.unwrap_or_default(),
        timestamp: r.get("timestamp")?,
        is_from_me: r.get::<_, Option<bool>>("is_from_me")?.unwrap_or(false),
        is_bot_message: false,
    })
}

fn row_to_group(r: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredGroup> {
    Ok(RegisteredGroup {
        jid: r.get("jid")?,
        name: r.get("name")?,
        folder: r.get("folder")?,
        added_at: r.get("added_at")?,
        requires_trigger: r
            .get::<_, Option<bool>>("requires_trigger")?
            .unwrap_or(true),
        assistant_name: r.get("assistant_name")?,
    })
}

fn row_to_task(r: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: r.get("id")?,
        group_folder: r.get("group_folder")?,
        chat_jid: r.get("chat_jid")?,
        prompt: r.get("prompt")?,
        schedule_type: r.get("schedule_type")?,
        schedule_value: r.get("schedule_value")?,
        context_mode: r
            .get::<_, Option<String>>("context_mode")?
            .unwrap_or_else(|| "isolated".to_string()),
        next_run: r.get("next_run")?,
        last_run: r.get("last_run")?,
        last_result: r.get("last_result")?,
        status: r
            .get::<_, Option<String>>("status")?
            .unwrap_or_else(|| "active".to_string()),
        created_at: r.get("created_at")?,
    })
}

fn row_to_status(r: &rusqlite::Row<'_>) -> rusqlite::Result<StatusRecord> {
    let state_str: String = r.get("state")?;
    let state = MessageStatus::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown status {state_str:?}").into(),
        )
    })?;
    Ok(StatusRecord {
        message_id: r.get("message_id")?,
        chat_jid: r.get("chat_jid")?,
        is_main: r.get("is_main")?,
        state,
        updated_at: r.get("updated_at")?,
    })
}
