//! Filesystem IPC watcher.
//!
//! Agents talk back to the host by dropping JSON files under
//! `{data}/ipc/{group}/`: `messages/` for outbound chat sends, `tasks/` for
//! task management and group registration. Files are processed atomically
//! (read → act → unlink); parse failures are quarantined under `errors/`.
//!
//! Authorization model:
//! - The main group may send to any chat, manage any task, and is the only
//!   group allowed to register or unregister groups.
//! - Other groups may only send to their own chat and manage their own
//!   tasks.
//!
//! The registry is mutated nowhere else at runtime.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{RegisteredGroup, ScheduledTask, Store, now_ts, validate_folder_name};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelDriver;
use crate::poll_loop::Groups;
use crate::scheduler::calculate_next_run;

#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    pub ipc_base_dir: PathBuf,
    pub poll_interval: Duration,
    pub main_group_folder: String,
    pub timezone: String,
}

impl Default for IpcWatcherConfig {
    fn default() -> Self {
        Self {
            ipc_base_dir: PathBuf::from("data/ipc"),
            poll_interval: Duration::from_secs(1),
            main_group_folder: "main".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpcMessage {
    #[serde(rename = "type")]
    kind: String,
    chat_jid: String,
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum IpcTaskOp {
    Create {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default)]
        context_mode: Option<String>,
        #[serde(default)]
        group_folder: Option<String>,
        #[serde(default)]
        chat_jid: Option<String>,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    Cancel {
        id: String,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default)]
        requires_trigger: Option<bool>,
        #[serde(default)]
        assistant_name: Option<String>,
    },
    UnregisterGroup {
        jid: String,
    },
}

struct GroupContext {
    folder: String,
    is_main: bool,
}

pub struct IpcWatcher {
    config: IpcWatcherConfig,
    store: Store,
    channel: Arc<dyn ChannelDriver>,
    groups: Groups,
}

impl IpcWatcher {
    pub fn new(
        config: IpcWatcherConfig,
        store: Store,
        channel: Arc<dyn ChannelDriver>,
        groups: Groups,
    ) -> Self {
        Self {
            config,
            store,
            channel,
            groups,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        fs::create_dir_all(&self.config.ipc_base_dir).ok();
        info!(dir = %self.config.ipc_base_dir.display(), "IPC watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One polling cycle across all group directories.
    pub async fn poll_once(&self) {
        let group_folders = match fs::read_dir(&self.config.ipc_base_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().is_ok_and(|ft| ft.is_dir()) && entry.file_name() != "errors"
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "IPC base directory not readable");
                return;
            }
        };

        for folder in group_folders {
            let ctx = GroupContext {
                is_main: folder == self.config.main_group_folder,
                folder,
            };
            let group_dir = self.config.ipc_base_dir.join(&ctx.folder);
            self.process_messages(&group_dir, &ctx).await;
            self.process_tasks(&group_dir, &ctx).await;
        }
    }

    /// Outbound sends from `{group}/messages/`.
    async fn process_messages(&self, group_dir: &Path, ctx: &GroupContext) {
        let Some(files) = read_json_files(&group_dir.join("messages")) else {
            return;
        };
        for file_path in files {
            match read_and_parse::<IpcMessage>(&file_path) {
                Ok(msg) => {
                    if msg.kind != "message" || msg.chat_jid.is_empty() || msg.text.is_empty() {
                        warn!(path = %file_path.display(), "invalid IPC message, missing fields");
                        self.quarantine(&file_path, &ctx.folder);
                        continue;
                    }
                    if ctx.is_main || self.own_jid(&ctx.folder).await.as_deref() == Some(&msg.chat_jid)
                    {
                        if let Err(e) = self.channel.send_message(&msg.chat_jid, &msg.text).await {
                            error!(chat_jid = msg.chat_jid.as_str(), err = %e,
                                "IPC message send failed");
                        } else {
                            debug!(
                                chat_jid = msg.chat_jid.as_str(),
                                group = ctx.folder.as_str(),
                                "IPC message dispatched"
                            );
                        }
                    } else {
                        warn!(
                            chat_jid = msg.chat_jid.as_str(),
                            group = ctx.folder.as_str(),
                            "unauthorized IPC message attempt blocked"
                        );
                    }
                    remove_file(&file_path);
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "failed to parse IPC message");
                    self.quarantine(&file_path, &ctx.folder);
                }
            }
        }
    }

    /// Task management and registry ops from `{group}/tasks/`.
    async fn process_tasks(&self, group_dir: &Path, ctx: &GroupContext) {
        let Some(files) = read_json_files(&group_dir.join("tasks")) else {
            return;
        };
        for file_path in files {
            match read_and_parse::<IpcTaskOp>(&file_path) {
                Ok(op) => {
                    self.handle_task_op(op, ctx).await;
                    remove_file(&file_path);
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "failed to parse IPC task op");
                    self.quarantine(&file_path, &ctx.folder);
                }
            }
        }
    }

    async fn handle_task_op(&self, op: IpcTaskOp, ctx: &GroupContext) {
        match op {
            IpcTaskOp::Create {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                group_folder,
                chat_jid,
            } => {
                let folder = group_folder.unwrap_or_else(|| ctx.folder.clone());
                if !ctx.is_main && folder != ctx.folder {
                    warn!(
                        group = ctx.folder.as_str(),
                        target = folder.as_str(),
                        "unauthorized cross-group task create blocked"
                    );
                    return;
                }
                let chat_jid = match chat_jid {
                    Some(jid) => jid,
                    None => match self.jid_for_folder(&folder).await {
                        Some(jid) => jid,
                        None => {
                            warn!(folder = folder.as_str(), "task create for unknown group folder");
                            return;
                        }
                    },
                };
                let next_run = if schedule_type == "once" {
                    Some(schedule_value.clone())
                } else {
                    calculate_next_run(&schedule_type, &schedule_value, &self.config.timezone)
                };
                if next_run.is_none() {
                    warn!(
                        schedule_type = schedule_type.as_str(),
                        schedule_value = schedule_value.as_str(),
                        "task create with unusable schedule, dropped"
                    );
                    return;
                }
                let task = ScheduledTask {
                    id: new_task_id(),
                    group_folder: folder,
                    chat_jid,
                    prompt,
                    schedule_type,
                    schedule_value,
                    context_mode: context_mode.unwrap_or_else(|| "isolated".into()),
                    next_run,
                    last_run: None,
                    last_result: None,
                    status: "active".into(),
                    created_at: now_ts(),
                };
                if let Err(e) = self.store.create_task(&task) {
                    error!(err = %e, "failed to create task from IPC");
                } else {
                    info!(task_id = task.id.as_str(), "task created via IPC");
                }
            }
            IpcTaskOp::Pause { id } => self.set_task_status(&id, "paused", ctx).await,
            IpcTaskOp::Resume { id } => {
                if let Some(task) = self.authorized_task(&id, ctx).await {
                    let next_run = if task.schedule_type == "once" {
                        Some(task.schedule_value.clone())
                    } else {
                        calculate_next_run(
                            &task.schedule_type,
                            &task.schedule_value,
                            &self.config.timezone,
                        )
                    };
                    if let Err(e) = self.store.advance_task_next_run(&id, next_run.as_deref()) {
                        error!(task_id = id.as_str(), err = %e, "failed to reset next_run");
                        return;
                    }
                    if let Err(e) = self.store.set_task_status(&id, "active") {
                        error!(task_id = id.as_str(), err = %e, "failed to resume task");
                    }
                }
            }
            IpcTaskOp::Cancel { id } => self.set_task_status(&id, "cancelled", ctx).await,
            IpcTaskOp::RegisterGroup {
                jid,
                name,
                folder,
                requires_trigger,
                assistant_name,
            } => {
                if !ctx.is_main {
                    warn!(group = ctx.folder.as_str(), "non-main register_group blocked");
                    return;
                }
                if let Err(e) = validate_folder_name(&folder) {
                    warn!(folder = folder.as_str(), err = %e, "register_group with invalid folder rejected");
                    return;
                }
                {
                    // A second group claiming the main folder is a
                    // configuration error, never a silent override.
                    let groups = self.groups.read().await;
                    let main_taken = folder == self.config.main_group_folder
                        && groups
                            .values()
                            .any(|g| g.folder == self.config.main_group_folder && g.jid != jid);
                    if main_taken {
                        warn!(jid = jid.as_str(), "duplicate main group registration rejected");
                        return;
                    }
                    if groups.values().any(|g| g.folder == folder && g.jid != jid) {
                        warn!(folder = folder.as_str(), "folder already registered to another group");
                        return;
                    }
                }
                let group = RegisteredGroup {
                    jid: jid.clone(),
                    name,
                    folder,
                    added_at: now_ts(),
                    requires_trigger: requires_trigger.unwrap_or(true),
                    assistant_name,
                };
                if let Err(e) = self.store.set_registered_group(&group) {
                    error!(jid = jid.as_str(), err = %e, "failed to persist group registration");
                    return;
                }
                self.groups.write().await.insert(jid.clone(), group);
                info!(jid = jid.as_str(), "group registered via IPC");
            }
            IpcTaskOp::UnregisterGroup { jid } => {
                if !ctx.is_main {
                    warn!(group = ctx.folder.as_str(), "non-main unregister_group blocked");
                    return;
                }
                if let Err(e) = self.store.delete_registered_group(&jid) {
                    error!(jid = jid.as_str(), err = %e, "failed to delete group registration");
                    return;
                }
                self.groups.write().await.remove(&jid);
                info!(jid = jid.as_str(), "group unregistered via IPC");
            }
        }
    }

    async fn set_task_status(&self, id: &str, status: &str, ctx: &GroupContext) {
        if self.authorized_task(id, ctx).await.is_some() {
            if let Err(e) = self.store.set_task_status(id, status) {
                error!(task_id = id, status, err = %e, "failed to update task status");
            } else {
                info!(task_id = id, status, "task status updated via IPC");
            }
        }
    }

    /// Load the task and check the caller may manage it.
    async fn authorized_task(&self, id: &str, ctx: &GroupContext) -> Option<ScheduledTask> {
        match self.store.get_task_by_id(id) {
            Ok(Some(task)) => {
                if ctx.is_main || task.group_folder == ctx.folder {
                    Some(task)
                } else {
                    warn!(
                        task_id = id,
                        group = ctx.folder.as_str(),
                        "unauthorized task management attempt blocked"
                    );
                    None
                }
            }
            Ok(None) => {
                debug!(task_id = id, "IPC op for unknown task");
                None
            }
            Err(e) => {
                error!(task_id = id, err = %e, "failed to load task");
                None
            }
        }
    }

    async fn own_jid(&self, folder: &str) -> Option<String> {
        self.jid_for_folder(folder).await
    }

    async fn jid_for_folder(&self, folder: &str) -> Option<String> {
        let groups = self.groups.read().await;
        groups
            .values()
            .find(|g| g.folder == folder)
            .map(|g| g.jid.clone())
    }

    fn quarantine(&self, file_path: &Path, group_folder: &str) {
        let errors_dir = self.config.ipc_base_dir.join("errors");
        fs::create_dir_all(&errors_dir).ok();
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".into());
        let target = errors_dir.join(format!("{group_folder}-{file_name}"));
        if let Err(e) = fs::rename(file_path, &target) {
            warn!(path = %file_path.display(), err = %e, "failed to quarantine IPC file");
            remove_file(file_path);
        }
    }
}

fn new_task_id() -> String {
    format!("task-{}", chrono::Utc::now().timestamp_millis())
}

fn read_json_files(dir: &Path) -> Option<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).ok()?;
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Some(files)
}

fn read_and_parse<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), err = %e, "failed to remove IPC file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NullChannel;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    struct Fixture {
        watcher: IpcWatcher,
        channel: Arc<NullChannel>,
        store: Store,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let channel = Arc::new(NullChannel::default());

        let mut groups = HashMap::new();
        groups.insert(
            "tg:100".to_string(),
            RegisteredGroup {
                jid: "tg:100".into(),
                name: "Main".into(),
                folder: "main".into(),
                added_at: now_ts(),
                requires_trigger: false,
                assistant_name: None,
            },
        );
        groups.insert(
            "tg:200".to_string(),
            RegisteredGroup {
                jid: "tg:200".into(),
                name: "Engineering".into(),
                folder: "team-eng".into(),
                added_at: now_ts(),
                requires_trigger: true,
                assistant_name: None,
            },
        );

        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            store.clone(),
            channel.clone(),
            Arc::new(RwLock::new(groups)),
        );
        Fixture {
            watcher,
            channel,
            store,
            dir,
        }
    }

    fn drop_file(dir: &Path, folder: &str, kind: &str, name: &str, content: &str) {
        let target = dir.join(folder).join(kind);
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn main_group_may_message_any_chat() {
        let f = fixture();
        drop_file(
            f.dir.path(),
            "main",
            "messages",
            "a.json",
            r#"{"type":"message","chat_jid":"tg:200","text":"hello"}"#,
        );
        f.watcher.poll_once().await;
        let sent = f.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tg:200");
    }

    #[tokio::test]
    async fn non_main_group_is_confined_to_own_chat() {
        let f = fixture();
        drop_file(
            f.dir.path(),
            "team-eng",
            "messages",
            "a.json",
            r#"{"type":"message","chat_jid":"tg:100","text":"sneaky"}"#,
        );
        drop_file(
            f.dir.path(),
            "team-eng",
            "messages",
            "b.json",
            r#"{"type":"message","chat_jid":"tg:200","text":"legit"}"#,
        );
        f.watcher.poll_once().await;
        let sent = f.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tg:200");
    }

    #[tokio::test]
    async fn malformed_files_are_quarantined() {
        let f = fixture();
        drop_file(f.dir.path(), "main", "messages", "bad.json", "{nope");
        f.watcher.poll_once().await;
        assert!(f.dir.path().join("errors").join("main-bad.json").exists());
        assert!(!f.dir.path().join("main/messages/bad.json").exists());
    }

    #[tokio::test]
    async fn task_create_and_pause_via_ipc() {
        let f = fixture();
        drop_file(
            f.dir.path(),
            "team-eng",
            "tasks",
            "create.json",
            r#"{"action":"create","prompt":"daily summary","schedule_type":"interval","schedule_value":"60000"}"#,
        );
        f.watcher.poll_once().await;

        let tasks = f.store.get_tasks_for_group("team-eng").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].chat_jid, "tg:200");
        assert!(tasks[0].next_run.is_some());

        drop_file(
            f.dir.path(),
            "team-eng",
            "tasks",
            "pause.json",
            &format!(r#"{{"action":"pause","id":"{}"}}"#, tasks[0].id),
        );
        f.watcher.poll_once().await;
        assert_eq!(
            f.store.get_task_by_id(&tasks[0].id).unwrap().unwrap().status,
            "paused"
        );
    }

    #[tokio::test]
    async fn cross_group_task_create_is_blocked() {
        let f = fixture();
        drop_file(
            f.dir.path(),
            "team-eng",
            "tasks",
            "create.json",
            r#"{"action":"create","prompt":"p","schedule_type":"interval","schedule_value":"60000","group_folder":"main"}"#,
        );
        f.watcher.poll_once().await;
        assert!(f.store.get_tasks_for_group("main").unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_group_is_main_only_and_validated() {
        let f = fixture();
        // Non-main attempt.
        drop_file(
            f.dir.path(),
            "team-eng",
            "tasks",
            "reg.json",
            r#"{"action":"register_group","jid":"tg:300","name":"New","folder":"new-group"}"#,
        );
        // Main attempt with a bad folder.
        drop_file(
            f.dir.path(),
            "main",
            "tasks",
            "reg-bad.json",
            r#"{"action":"register_group","jid":"tg:301","name":"Bad","folder":"../escape"}"#,
        );
        // Main attempt, valid.
        drop_file(
            f.dir.path(),
            "main",
            "tasks",
            "reg-ok.json",
            r#"{"action":"register_group","jid":"tg:302","name":"Ok","folder":"ok-group"}"#,
        );
        f.watcher.poll_once().await;

        let groups = f.store.get_all_registered_groups().unwrap();
        assert!(!groups.contains_key("tg:300"));
        assert!(!groups.contains_key("tg:301"));
        assert!(groups.contains_key("tg:302"));
    }

    #[tokio::test]
    async fn duplicate_main_registration_is_rejected() {
        let f = fixture();
        drop_file(
            f.dir.path(),
            "main",
            "tasks",
            "reg.json",
            r#"{"action":"register_group","jid":"tg:999","name":"Second Main","folder":"main"}"#,
        );
        f.watcher.poll_once().await;
        assert!(!f
            .store
            .get_all_registered_groups()
            .unwrap()
            .contains_key("tg:999"));
    }

    #[tokio::test]
    async fn unregister_group_removes_registry_entry() {
        let f = fixture();
        // Seed the store to mirror the in-memory map.
        let group = {
            let groups = f.watcher.groups.read().await;
            groups.get("tg:200").unwrap().clone()
        };
        f.store.set_registered_group(&group).unwrap();

        drop_file(
            f.dir.path(),
            "main",
            "tasks",
            "unreg.json",
            r#"{"action":"unregister_group","jid":"tg:200"}"#,
        );
        f.watcher.poll_once().await;
        assert!(f.store.get_registered_group("tg:200").unwrap().is_none());
        assert!(!f.watcher.groups.read().await.contains_key("tg:200"));
    }
}
