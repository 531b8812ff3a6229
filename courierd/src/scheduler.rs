//! Task scheduler loop.
//!
//! Surveys persisted tasks every tick and hands each due, still-active task
//! to the group queue exactly once. The crucial ordering: `next_run` is
//! advanced *before* the task is enqueued, so a long-running task cannot be
//! rediscovered by the next tick (which typically fires well before the
//! container finishes).
//!
//! Quiet hours skip whole ticks. Nothing is missed: `next_run` stays in the
//! past and the task fires on the first tick after the quiet period ends.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_core::{QuietSchedule, ScheduledTask, Store, now_ts};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// IANA timezone for cron expressions.
    pub timezone: String,
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            timezone: "UTC".to_string(),
            enabled: false,
        }
    }
}

/// Invoked once per due task; expected to enqueue container execution.
pub type TaskCallback = Box<dyn Fn(ScheduledTask) + Send + Sync>;

/// Next run time after a firing: cron → next occurrence in the configured
/// timezone, interval → now + offset, once → none (task completes).
pub fn calculate_next_run(
    schedule_type: &str,
    schedule_value: &str,
    timezone: &str,
) -> Option<String> {
    match schedule_type {
        "cron" => {
            let schedule = match cron::Schedule::from_str(schedule_value) {
                Ok(s) => s,
                Err(e) => {
                    error!(cron = schedule_value, err = %e, "invalid cron expression");
                    return None;
                }
            };
            let tz: chrono_tz::Tz = match timezone.parse() {
                Ok(t) => t,
                Err(_) => {
                    warn!(tz = timezone, "invalid timezone, falling back to UTC");
                    chrono_tz::Tz::UTC
                }
            };
            let now = Utc::now().with_timezone(&tz);
            schedule
                .after(&now)
                .next()
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        }
        "interval" => {
            let ms: u64 = match schedule_value.parse() {
                Ok(v) => v,
                Err(e) => {
                    error!(value = schedule_value, err = %e, "invalid interval ms");
                    return None;
                }
            };
            let next = Utc::now() + chrono::Duration::milliseconds(ms as i64);
            Some(next.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        }
        "once" => None,
        other => {
            warn!(schedule_type = other, "unknown schedule type");
            None
        }
    }
}

/// Short task-result summary for the `last_result` column.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(e) = error {
        format!("Error: {e}")
    } else if let Some(r) = result {
        if r.chars().count() > 200 {
            r.chars().take(200).collect()
        } else {
            r.to_string()
        }
    } else {
        "Completed".to_string()
    }
}

/// One survey pass: find due tasks, advance their next run, dispatch.
pub async fn sweep_once(
    config: &SchedulerConfig,
    store: &Store,
    on_task: &TaskCallback,
) {
    let due = match store.get_due_tasks(&now_ts()) {
        Ok(tasks) => tasks,
        Err(e) => {
            error!(err = %e, "failed to query due tasks");
            return;
        }
    };
    if due.is_empty() {
        return;
    }
    info!(count = due.len(), "found due tasks");

    for task in due {
        // Re-read: the task may have been paused or cancelled since the
        // query.
        let current = match store.get_task_by_id(&task.id) {
            Ok(Some(t)) if t.status == "active" => t,
            Ok(Some(_)) => {
                debug!(task_id = task.id.as_str(), "task no longer active, skipping");
                continue;
            }
            Ok(None) => {
                debug!(task_id = task.id.as_str(), "task deleted, skipping");
                continue;
            }
            Err(e) => {
                error!(task_id = task.id.as_str(), err = %e, "failed to re-check task");
                continue;
            }
        };

        // Advance before enqueueing — the no-double-fire guarantee.
        let next_run = calculate_next_run(
            &current.schedule_type,
            &current.schedule_value,
            &config.timezone,
        );
        if let Err(e) = store.advance_task_next_run(&current.id, next_run.as_deref()) {
            error!(task_id = current.id.as_str(), err = %e, "failed to advance next_run, skipping dispatch");
            continue;
        }

        debug!(
            task_id = current.id.as_str(),
            group_folder = current.group_folder.as_str(),
            next_run = next_run.as_deref().unwrap_or("none"),
            "dispatching due task"
        );
        on_task(current);
    }
}

/// Run the scheduler loop until shutdown. The first sweep happens
/// immediately, which doubles as the boot-time pending-task sweep.
pub async fn run_scheduler_loop(
    config: SchedulerConfig,
    store: Store,
    quiet: Arc<QuietSchedule>,
    quiet_enabled: bool,
    on_task: TaskCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.enabled {
        info!("scheduler disabled, skipping loop");
        return;
    }
    info!(
        poll_interval_ms = config.poll_interval.as_millis(),
        timezone = config.timezone.as_str(),
        "scheduler loop started"
    );

    let mut first = true;
    loop {
        if !first {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        return;
                    }
                }
            }
        }
        first = false;

        if quiet_enabled && quiet.is_quiet(Utc::now()) {
            debug!("quiet hours: skipping scheduler tick");
            continue;
        }

        sweep_once(&config, &store, &on_task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn seed_task(store: &Store, id: &str, next_run: &str) {
        store
            .create_task(&ScheduledTask {
                id: id.into(),
                group_folder: "main".into(),
                chat_jid: "tg:1".into(),
                prompt: "p".into(),
                schedule_type: "interval".into(),
                schedule_value: "60000".into(),
                context_mode: "isolated".into(),
                next_run: Some(next_run.into()),
                last_run: None,
                last_result: None,
                status: "active".into(),
                created_at: now_ts(),
            })
            .unwrap();
    }

    #[test]
    fn next_run_interval_and_once() {
        let next = calculate_next_run("interval", "60000", "UTC");
        assert!(next.is_some());
        assert!(next.unwrap().contains('T'));
        assert!(calculate_next_run("once", "", "UTC").is_none());
    }

    #[test]
    fn next_run_cron() {
        assert!(calculate_next_run("cron", "0 * * * * *", "UTC").is_some());
        assert!(calculate_next_run("cron", "not a cron", "UTC").is_none());
        assert!(calculate_next_run("weekly", "monday", "UTC").is_none());
        assert!(calculate_next_run("interval", "abc", "UTC").is_none());
    }

    #[test]
    fn result_summary_variants() {
        assert_eq!(
            result_summary(None, Some("connection refused")),
            "Error: connection refused"
        );
        assert_eq!(result_summary(None, None), "Completed");
        assert_eq!(result_summary(Some("short"), None), "short");
        let long = "a".repeat(300);
        assert_eq!(result_summary(Some(&long), None).chars().count(), 200);
    }

    #[tokio::test]
    async fn sweep_advances_next_run_before_dispatch() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, "t1", "2024-01-15T12:00:00.000Z");

        let dispatched: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let dispatched_cb = dispatched.clone();
        let store_cb = store.clone();
        let on_task: TaskCallback = Box::new(move |task| {
            // At dispatch time the task must already be out of the due set.
            let still_due = store_cb.get_due_tasks(&now_ts()).unwrap();
            assert!(still_due.iter().all(|t| t.id != task.id));
            dispatched_cb.lock().unwrap().push(task.id);
        });

        let config = SchedulerConfig {
            enabled: true,
            ..Default::default()
        };
        sweep_once(&config, &store, &on_task).await;
        assert_eq!(*dispatched.lock().unwrap(), vec!["t1".to_string()]);

        // A second sweep finds nothing: next_run is in the future.
        sweep_once(&config, &store, &on_task).await;
        assert_eq!(dispatched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_skips_paused_tasks() {
        let store = Store::open_in_memory().unwrap();
        seed_task(&store, "t1", "2024-01-15T12:00:00.000Z");
        store.set_task_status("t1", "paused").unwrap();

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_cb = count.clone();
        let on_task: TaskCallback = Box::new(move |_task| {
            count_cb.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let config = SchedulerConfig {
            enabled: true,
            ..Default::default()
        };
        sweep_once(&config, &store, &on_task).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn once_task_is_not_rescheduled() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&ScheduledTask {
                id: "t-once".into(),
                group_folder: "main".into(),
                chat_jid: "tg:1".into(),
                prompt: "p".into(),
                schedule_type: "once".into(),
                schedule_value: "2024-01-15T12:00:00.000Z".into(),
                context_mode: "isolated".into(),
                next_run: Some("2024-01-15T12:00:00.000Z".into()),
                last_run: None,
                last_result: None,
                status: "active".into(),
                created_at: now_ts(),
            })
            .unwrap();

        let on_task: TaskCallback = Box::new(|_task| {});
        let config = SchedulerConfig {
            enabled: true,
            ..Default::default()
        };
        sweep_once(&config, &store, &on_task).await;

        let task = store.get_task_by_id("t-once").unwrap().unwrap();
        assert!(task.next_run.is_none());
    }
}
