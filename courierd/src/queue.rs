//! Per-group serialization queue.
//!
//! Guarantees per group: jobs (message checks and scheduled tasks) run
//! strictly one at a time, and at most one in-flight container exists.
//! Across groups everything runs in parallel, bounded by a global
//! concurrency cap.
//!
//! Key semantics:
//! - Duplicate message checks coalesce; a queued check covers later arrivals
//!   because it reads the cursor fresh when it runs.
//! - `send_message` is the pipe fast path: a non-blocking write into the
//!   live container's stdin. A full buffer reads as "not accepting input"
//!   and the caller falls back to enqueueing a new run.
//! - `notify_idle` lets the next job start while the previous container is
//!   still draining its final output. In-flight records carry a job
//!   sequence number so a late exit cannot clobber a successor.
//! - Message-check failures retry with exponential backoff, capped.
//! - Shutdown closes stdin everywhere and kills whatever is left at the
//!   deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::runner::stop_container;

const MAX_RETRIES: u32 = 5;
const BASE_RETRY_MS: u64 = 5000;

/// Callback for processing messages for a group. Returns true on success.
pub type ProcessMessagesFn = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// A queued scheduled-task execution.
pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Commands accepted by a container's stdin pump.
#[derive(Debug)]
pub enum StdinCmd {
    /// One already-encoded line (without trailing newline).
    Line(String),
    /// Close stdin so the agent sees EOF and can exit cleanly.
    Close,
}

enum Job {
    MessageCheck,
    Task { id: String, run: TaskFn },
}

/// The single live container for a group.
struct InFlightWorker {
    container_name: String,
    stdin_tx: mpsc::Sender<StdinCmd>,
    job_seq: u64,
    is_task: bool,
}

#[derive(Default)]
struct GroupState {
    jobs: VecDeque<Job>,
    worker_running: bool,
    check_pending: bool,
    inflight: Option<InFlightWorker>,
    idle: Option<Arc<Notify>>,
    seq: u64,
    retry_count: u32,
}

struct Inner {
    groups: HashMap<String, GroupState>,
    process_messages_fn: Option<ProcessMessagesFn>,
    shutting_down: bool,
}

impl Inner {
    fn get_or_insert(&mut self, jid: &str) -> &mut GroupState {
        self.groups.entry(jid.to_string()).or_default()
    }
}

/// Cheap to clone; all state lives behind the shared inner.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
    permits: Arc<Semaphore>,
    runtime_bin: Arc<str>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, runtime_bin: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                groups: HashMap::new(),
                process_messages_fn: None,
                shutting_down: false,
            })),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            runtime_bin: runtime_bin.into(),
        }
    }

    /// Set the callback invoked to process messages for a group.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    /// Enqueue a message check. Idempotent while one is queued or running.
    pub async fn enqueue_message_check(&self, group_jid: &str) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        let state = inner.get_or_insert(group_jid);
        if state.check_pending {
            debug!(group_jid, "message check already pending, coalescing");
            return;
        }
        state.check_pending = true;
        state.jobs.push_back(Job::MessageCheck);
        self.ensure_worker(&mut inner, group_jid);
    }

    /// Enqueue a scheduled-task execution. Deduplicated by task id; task
    /// jobs FIFO-serialize behind whatever else is queued for the group.
    pub async fn enqueue_task(&self, group_jid: &str, task_id: &str, run: TaskFn) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        let state = inner.get_or_insert(group_jid);
        let duplicate = state
            .jobs
            .iter()
            .any(|j| matches!(j, Job::Task { id, .. } if id == task_id));
        if duplicate {
            debug!(group_jid, task_id, "task already queued, skipping");
            return;
        }
        state.jobs.push_back(Job::Task {
            id: task_id.to_string(),
            run,
        });
        // Nudge a live interactive container toward EOF so the task does
        // not sit behind a long idle window.
        if let Some(worker) = state.inflight.as_ref() {
            if !worker.is_task {
                let _ = worker.stdin_tx.try_send(StdinCmd::Close);
            }
        }
        self.ensure_worker(&mut inner, group_jid);
    }

    fn ensure_worker(&self, inner: &mut Inner, group_jid: &str) {
        let state = inner.get_or_insert(group_jid);
        if state.worker_running {
            return;
        }
        state.worker_running = true;
        let queue = self.clone();
        let jid = group_jid.to_string();
        tokio::spawn(async move {
            queue.run_worker(jid).await;
        });
    }

    /// Drain the group's FIFO. One of these runs per group at a time.
    async fn run_worker(self, group_jid: String) {
        loop {
            let (job, seq, idle, process_fn) = {
                let mut inner = self.inner.lock().await;
                let process_fn = inner.process_messages_fn.clone();
                let state = inner.get_or_insert(&group_jid);
                match state.jobs.pop_front() {
                    Some(job) => {
                        state.seq += 1;
                        let idle = Arc::new(Notify::new());
                        state.idle = Some(idle.clone());
                        (job, state.seq, idle, process_fn)
                    }
                    None => {
                        state.worker_running = false;
                        state.idle = None;
                        return;
                    }
                }
            };

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return, // semaphore closed: shutting down
            };

            match job {
                Job::MessageCheck => {
                    let Some(process_fn) = process_fn else {
                        warn!(
                            group_jid = group_jid.as_str(),
                            "no process_messages_fn set, skipping"
                        );
                        self.finish_check(&group_jid, seq, true).await;
                        drop(permit);
                        continue;
                    };
                    let mut handle = tokio::spawn(process_fn(group_jid.clone()));
                    tokio::select! {
                        res = &mut handle => {
                            let success = res.unwrap_or(false);
                            self.finish_check(&group_jid, seq, success).await;
                            drop(permit);
                        }
                        _ = idle.notified() => {
                            // Streaming reported terminal success; let the
                            // callback finish draining in the background and
                            // start the next job now.
                            debug!(group_jid = group_jid.as_str(), "idle notified, advancing queue");
                            let queue = self.clone();
                            let jid = group_jid.clone();
                            tokio::spawn(async move {
                                let success = handle.await.unwrap_or(false);
                                queue.finish_check(&jid, seq, success).await;
                                drop(permit);
                            });
                        }
                    }
                }
                Job::Task { id, run } => {
                    debug!(
                        group_jid = group_jid.as_str(),
                        task_id = id.as_str(),
                        "running queued task"
                    );
                    let mut handle = tokio::spawn(run());
                    tokio::select! {
                        _ = &mut handle => {
                            self.clear_inflight(&group_jid, seq).await;
                            drop(permit);
                        }
                        _ = idle.notified() => {
                            let queue = self.clone();
                            let jid = group_jid.clone();
                            tokio::spawn(async move {
                                let _ = handle.await;
                                queue.clear_inflight(&jid, seq).await;
                                drop(permit);
                            });
                        }
                    }
                }
            }
        }
    }

    /// Bookkeeping after a message check fully completes.
    async fn finish_check(&self, group_jid: &str, seq: u64, success: bool) {
        let retry = {
            let mut inner = self.inner.lock().await;
            let state = inner.get_or_insert(group_jid);
            state.check_pending = false;
            if state
                .inflight
                .as_ref()
                .is_some_and(|w| w.job_seq == seq)
            {
                state.inflight = None;
            }
            if success {
                state.retry_count = 0;
                None
            } else {
                state.retry_count += 1;
                if state.retry_count <= MAX_RETRIES {
                    Some(state.retry_count)
                } else {
                    error!(
                        group_jid,
                        retry_count = state.retry_count,
                        "max retries exceeded, dropping (next incoming message retries)"
                    );
                    state.retry_count = 0;
                    None
                }
            }
        };

        if let Some(retry_count) = retry {
            let delay_ms = BASE_RETRY_MS * 2u64.pow(retry_count - 1);
            info!(group_jid, retry_count, delay_ms, "scheduling retry with backoff");
            let queue = self.clone();
            let jid = group_jid.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                queue.enqueue_message_check(&jid).await;
            });
        }
    }

    async fn clear_inflight(&self, group_jid: &str, seq: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.groups.get_mut(group_jid) {
            if state.inflight.as_ref().is_some_and(|w| w.job_seq == seq) {
                state.inflight = None;
            }
        }
    }

    /// Install the in-flight record for the group's current job. Called by
    /// the runner right after spawn.
    pub async fn register_process(
        &self,
        group_jid: &str,
        container_name: &str,
        stdin_tx: mpsc::Sender<StdinCmd>,
        is_task: bool,
    ) {
        let mut inner = self.inner.lock().await;
        let state = inner.get_or_insert(group_jid);
        state.inflight = Some(InFlightWorker {
            container_name: container_name.to_string(),
            stdin_tx,
            job_seq: state.seq,
            is_task,
        });
    }

    /// Pipe a payload into the live container's stdin. Never blocks: returns
    /// false when no worker is live, the worker is a single-turn task
    /// container, stdin is closed, or the buffer is full.
    pub async fn send_message(&self, group_jid: &str, text: &str) -> bool {
        let inner = self.inner.lock().await;
        let Some(worker) = inner.groups.get(group_jid).and_then(|s| s.inflight.as_ref()) else {
            return false;
        };
        if worker.is_task {
            return false;
        }
        // One JSON-encoded line per prompt; the pump adds the terminator.
        let line = match serde_json::to_string(text) {
            Ok(l) => l,
            Err(_) => return false,
        };
        worker.stdin_tx.try_send(StdinCmd::Line(line)).is_ok()
    }

    /// Graceful hint: close the live container's stdin so the agent sees EOF.
    pub async fn close_stdin(&self, group_jid: &str) {
        let inner = self.inner.lock().await;
        if let Some(worker) = inner.groups.get(group_jid).and_then(|s| s.inflight.as_ref()) {
            let _ = worker.stdin_tx.try_send(StdinCmd::Close);
        }
    }

    /// Asserted by the streaming callback on terminal success; lets the
    /// worker pick the next job without waiting for container exit.
    pub async fn notify_idle(&self, group_jid: &str) {
        let inner = self.inner.lock().await;
        if let Some(idle) = inner.groups.get(group_jid).and_then(|s| s.idle.clone()) {
            idle.notify_one();
        }
    }

    pub async fn is_active(&self, group_jid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group_jid)
            .map(|s| s.inflight.is_some())
            .unwrap_or(false)
    }

    pub async fn active_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .groups
            .values()
            .filter(|s| s.inflight.is_some())
            .count()
    }

    /// Stop accepting jobs, close stdin everywhere, kill whatever has not
    /// exited by the deadline.
    pub async fn shutdown(&self, timeout: Duration) {
        let jids: Vec<String> = {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            inner
                .groups
                .iter()
                .filter(|(_, s)| s.inflight.is_some())
                .map(|(jid, _)| jid.clone())
                .collect()
        };
        for jid in &jids {
            self.close_stdin(jid).await;
        }
        info!(active = jids.len(), "queue shutting down, stdin closed");

        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let survivors: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .groups
                .values()
                .filter_map(|s| s.inflight.as_ref())
                .map(|w| w.container_name.clone())
                .collect()
        };
        for name in survivors {
            warn!(container = name.as_str(), "deadline reached, killing container");
            stop_container(&self.runtime_bin, &name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> Arc<GroupQueue> {
        Arc::new(GroupQueue::new(3, "docker".into()))
    }

    #[tokio::test]
    async fn new_queue_has_zero_active() {
        let q = queue();
        assert_eq!(q.active_count().await, 0);
        assert!(!q.is_active("tg:unknown").await);
    }

    #[tokio::test]
    async fn shutdown_blocks_enqueue() {
        let q = queue();
        q.shutdown(Duration::from_millis(10)).await;
        q.enqueue_message_check("tg:1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!q.is_active("tg:1").await);
    }

    #[tokio::test]
    async fn message_check_invokes_callback() {
        let q = queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_fn = calls.clone();
        q.set_process_messages_fn(Arc::new(move |_jid| {
            let calls = calls_fn.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            })
        }))
        .await;

        q.enqueue_message_check("tg:1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_checks_coalesce() {
        let q = queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_fn = calls.clone();
        q.set_process_messages_fn(Arc::new(move |_jid| {
            let calls = calls_fn.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                true
            })
        }))
        .await;

        q.enqueue_message_check("tg:1").await;
        q.enqueue_message_check("tg:1").await;
        q.enqueue_message_check("tg:1").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_run_in_fifo_order() {
        let q = queue();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            q.enqueue_task(
                "tg:1",
                &format!("task-{i}"),
                Box::new(move || {
                    Box::pin(async move {
                        order.lock().unwrap().push(i);
                    })
                }),
            )
            .await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn duplicate_task_ids_dedupe() {
        let q = queue();
        let count = Arc::new(AtomicUsize::new(0));

        // Block the worker so the second enqueue happens while the first
        // task is still queued.
        let gate = Arc::new(Notify::new());
        let gate_task = gate.clone();
        q.enqueue_task(
            "tg:1",
            "blocker",
            Box::new(move || {
                Box::pin(async move {
                    gate_task.notified().await;
                })
            }),
        )
        .await;

        for _ in 0..2 {
            let count = count.clone();
            q.enqueue_task(
                "tg:1",
                "task-a",
                Box::new(move || {
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;
        }
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_message_without_worker_returns_false() {
        let q = queue();
        assert!(!q.send_message("tg:1", "hello").await);
    }

    #[tokio::test]
    async fn send_message_pipes_to_registered_process() {
        let q = queue();
        let (tx, mut rx) = mpsc::channel(4);
        q.register_process("tg:1", "courier-test-1", tx, false).await;
        assert!(q.is_active("tg:1").await);
        assert!(q.send_message("tg:1", "hello there").await);

        match rx.recv().await {
            Some(StdinCmd::Line(line)) => {
                assert_eq!(line, "\"hello there\"");
            }
            other => panic!("expected Line, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_message_full_buffer_returns_false() {
        let q = queue();
        let (tx, _rx) = mpsc::channel(1);
        q.register_process("tg:1", "courier-test-1", tx, false).await;
        assert!(q.send_message("tg:1", "first").await);
        // Buffer of 1 is now full and nobody is draining.
        assert!(!q.send_message("tg:1", "second").await);
    }

    #[tokio::test]
    async fn notify_idle_advances_queue_before_job_completes() {
        let q = queue();
        let started = Arc::new(Notify::new());
        let started_fn = started.clone();
        q.set_process_messages_fn(Arc::new(move |_jid| {
            let started = started_fn.clone();
            Box::pin(async move {
                started.notify_one();
                // Simulates a container draining final output.
                tokio::time::sleep(Duration::from_secs(5)).await;
                true
            })
        }))
        .await;

        q.enqueue_message_check("tg:1").await;
        started.notified().await;

        let task_ran = Arc::new(AtomicUsize::new(0));
        let task_ran_fn = task_ran.clone();
        q.enqueue_task(
            "tg:1",
            "task-a",
            Box::new(move || {
                Box::pin(async move {
                    task_ran_fn.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        q.notify_idle("tg:1").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(task_ran.load(Ordering::SeqCst), 1);
    }
}
