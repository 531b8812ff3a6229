//! Scheduled-task execution.
//!
//! The scheduler has already advanced `next_run`; this module owns the run
//! itself: folder validation, snapshot writing, container invocation with
//! the single-turn close delay, the run log, and completion of one-shot
//! tasks.

use std::sync::Arc;
use std::time::Instant;

use courier_core::{ContainerStatus, ScheduledTask, TaskRunLog, now_ts, validate_folder_name};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::dispatch::DispatchDeps;
use crate::runner::{AgentSignal, OutputCallback, RunRequest, run_container_agent};
use crate::scheduler::{TaskCallback, result_summary};

/// Build the scheduler's dispatch callback: each due task becomes a queue
/// job serialized behind the group's other work.
pub fn build_task_callback(deps: Arc<DispatchDeps>) -> TaskCallback {
    Box::new(move |task: ScheduledTask| {
        let deps = deps.clone();
        let chat_jid = task.chat_jid.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let queue = deps.queue.clone();
            let run_deps = deps.clone();
            queue
                .enqueue_task(
                    &chat_jid,
                    &task_id,
                    Box::new(move || {
                        Box::pin(async move {
                            run_scheduled_task(&run_deps, task).await;
                        })
                    }),
                )
                .await;
        });
    })
}

/// Execute one scheduled task inside a container and record the outcome.
pub async fn run_scheduled_task(deps: &Arc<DispatchDeps>, task: ScheduledTask) {
    let start = Instant::now();

    // A task that reaches the front of its queue inside quiet hours is
    // re-armed instead of run; the scheduler picks it up again on the first
    // tick after the quiet period ends.
    if deps.is_quiet_now() {
        info!(task_id = task.id.as_str(), "quiet hours: re-arming task without running");
        if let Err(e) = deps.store.advance_task_next_run(&task.id, Some(&now_ts())) {
            warn!(task_id = task.id.as_str(), err = %e, "failed to re-arm task");
        }
        return;
    }

    // Malformed rows (e.g. an out-of-sandbox folder) are paused, not
    // retried: pausing stops the churn without deleting operator data.
    if let Err(e) = validate_folder_name(&task.group_folder) {
        error!(
            task_id = task.id.as_str(),
            group_folder = task.group_folder.as_str(),
            err = %e,
            "task has invalid group folder, pausing"
        );
        if let Err(e) = deps.store.set_task_status(&task.id, "paused") {
            warn!(task_id = task.id.as_str(), err = %e, "failed to pause task");
        }
        record_run(deps, &task, start, None, Some(&format!("invalid group folder: {e}"))).await;
        return;
    }

    // Group-context tasks resume the group's live session; isolated tasks
    // start clean.
    let session_id = if task.context_mode == "group" {
        let sessions = deps.sessions.read().await;
        sessions.get(&task.group_folder).cloned()
    } else {
        None
    };

    let (tasks_snapshot, groups_snapshot) = deps.build_snapshots(&task.group_folder, false).await;

    let request = RunRequest {
        prompt: task.prompt.clone(),
        session_id,
        group_folder: task.group_folder.clone(),
        chat_jid: task.chat_jid.clone(),
        is_main: false,
        is_scheduled_task: true,
        assistant_name: Some(deps.assistant_name.clone()),
        tasks_snapshot,
        groups_snapshot,
    };

    let result_text: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let error_text: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let on_output = build_task_callback_stream(
        deps,
        &task,
        result_text.clone(),
        error_text.clone(),
    );
    let notify = crate::dispatch::notify_fn(deps, &task.chat_jid);

    info!(
        task_id = task.id.as_str(),
        group_folder = task.group_folder.as_str(),
        "running scheduled task"
    );

    let run = run_container_agent(
        &request,
        &deps.runner_config,
        &deps.creds,
        &deps.queue,
        Some(Arc::new(on_output)),
        &notify,
    )
    .await;

    let streamed_result = result_text.lock().await.clone();
    let streamed_error = error_text.lock().await.clone();

    let (final_result, final_error) = match run {
        Ok(run_result) => {
            if let Some(ref sid) = run_result.output.new_session_id {
                deps.save_session(&task.group_folder, sid).await;
            }
            if run_result.output.status == ContainerStatus::Error {
                let err = streamed_error
                    .or(run_result.output.error)
                    .unwrap_or_else(|| "unknown error".into());
                (streamed_result, Some(err))
            } else {
                (streamed_result, None)
            }
        }
        Err(e) => {
            error!(task_id = task.id.as_str(), err = %e, "task container error");
            (streamed_result, Some(e.to_string()))
        }
    };

    if let Some(ref err) = final_error {
        let jid = deps.notify_jid(&task.chat_jid).await;
        let notice = format!("system: scheduled task \"{}\" failed: {err}", task.id);
        if let Err(e) = deps.channel.send_message(&jid, &notice).await {
            warn!(err = %e, "failed to send task failure notice");
        }
    }

    record_run(deps, &task, start, final_result.as_deref(), final_error.as_deref()).await;
}

fn build_task_callback_stream(
    deps: &Arc<DispatchDeps>,
    task: &ScheduledTask,
    result_text: Arc<Mutex<Option<String>>>,
    error_text: Arc<Mutex<Option<String>>>,
) -> OutputCallback {
    let deps = deps.clone();
    let chat_jid = task.chat_jid.clone();
    let group_folder = task.group_folder.clone();

    Box::new(move |signal: AgentSignal| {
        let deps = deps.clone();
        let chat_jid = chat_jid.clone();
        let group_folder = group_folder.clone();
        let result_text = result_text.clone();
        let error_text = error_text.clone();

        Box::pin(async move {
            match signal {
                AgentSignal::Session { session_id } => {
                    deps.save_session(&group_folder, &session_id).await;
                }
                AgentSignal::Result { text } => {
                    if let Err(e) = deps.channel.send_message(&chat_jid, &text).await {
                        error!(err = %e, "failed to deliver task output");
                    }
                    *result_text.lock().await = Some(text);
                }
                AgentSignal::Terminal { status, error } => match status {
                    ContainerStatus::Success => {
                        deps.queue.notify_idle(&chat_jid).await;
                    }
                    ContainerStatus::Error => {
                        *error_text.lock().await =
                            Some(error.unwrap_or_else(|| "unknown error".into()));
                    }
                },
            }
        })
    })
}

/// Run log plus task-row bookkeeping; one-shot tasks complete here.
async fn record_run(
    deps: &Arc<DispatchDeps>,
    task: &ScheduledTask,
    start: Instant,
    result: Option<&str>,
    error: Option<&str>,
) {
    let duration_ms = start.elapsed().as_millis() as i64;
    let status = if error.is_some() { "error" } else { "success" };

    let log = TaskRunLog {
        task_id: task.id.clone(),
        run_at: now_ts(),
        duration_ms,
        status: status.into(),
        result: result.map(|s| s.to_string()),
        error: error.map(|s| s.to_string()),
    };
    if let Err(e) = deps.store.log_task_run(&log) {
        error!(task_id = task.id.as_str(), err = %e, "failed to log task run");
    }

    let summary = result_summary(result, error);
    let complete = task.schedule_type == "once" && error.is_none();
    if let Err(e) = deps.store.record_task_outcome(&task.id, &summary, complete) {
        error!(task_id = task.id.as_str(), err = %e, "failed to record task outcome");
    }

    info!(
        task_id = task.id.as_str(),
        status,
        duration_ms,
        "scheduled task finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NullChannel;
    use crate::credentials::StaticCredentials;
    use crate::queue::GroupQueue;
    use crate::status_tracker::StatusTracker;
    use courier_core::Store;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::RwLock;

    fn deps(store: Store, channel: Arc<NullChannel>) -> Arc<DispatchDeps> {
        let tracker = Arc::new(StatusTracker::new(store.clone(), channel.clone()));
        Arc::new(DispatchDeps {
            store,
            queue: Arc::new(GroupQueue::new(1, "docker".into())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            channel,
            tracker,
            creds: Arc::new(StaticCredentials::new(&[])),
            runner_config: crate::runner::RunnerConfig {
                runtime_bin: "docker".into(),
                image: "courier-agent:latest".into(),
                groups_dir: std::env::temp_dir(),
                data_dir: std::env::temp_dir(),
                timezone: "UTC".into(),
                idle_timeout: Duration::from_secs(60),
                task_close_delay: Duration::from_secs(1),
            },
            assistant_name: "Marlow".into(),
            main_group_folder: "main".into(),
            quiet: Arc::new(courier_core::QuietSchedule::new("UTC", &[])),
            quiet_enabled: false,
        })
    }

    fn bad_folder_task() -> ScheduledTask {
        ScheduledTask {
            id: "t-bad".into(),
            group_folder: "../escape".into(),
            chat_jid: "tg:1".into(),
            prompt: "p".into(),
            schedule_type: "interval".into(),
            schedule_value: "60000".into(),
            context_mode: "isolated".into(),
            next_run: None,
            last_run: None,
            last_result: None,
            status: "active".into(),
            created_at: now_ts(),
        }
    }

    #[tokio::test]
    async fn invalid_folder_pauses_task_and_logs_error_run() {
        let store = Store::open_in_memory().unwrap();
        let channel = Arc::new(NullChannel::default());
        let deps = deps(store.clone(), channel);

        let task = bad_folder_task();
        store.create_task(&task).unwrap();

        run_scheduled_task(&deps, task).await;

        let loaded = store.get_task_by_id("t-bad").unwrap().unwrap();
        assert_eq!(loaded.status, "paused");
        assert!(loaded
            .last_result
            .as_deref()
            .unwrap()
            .starts_with("Error: invalid group folder"));
    }
}
