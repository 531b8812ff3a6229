mod channel;
mod credentials;
mod dispatch;
mod ipc;
mod poll_loop;
mod queue;
mod runner;
mod scheduler;
mod status_tracker;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use clap::{Parser, Subcommand};
use courier_core::{CourierConfig, NewMessage, QuietSchedule, Store, load_config, now_ts};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use channel::{ChannelDriver, NullChannel, TelegramChannel};
use credentials::{CredentialService, OauthCredentials, StaticCredentials};
use dispatch::DispatchDeps;
use poll_loop::{PollLoopConfig, Router};
use queue::GroupQueue;
use status_tracker::StatusTracker;

#[derive(Parser, Debug)]
#[command(name = "courierd", version, about = "Courier chat-to-agent gateway daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the courierd service.
    Serve(ServeArgs),
    /// Print the effective config as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/courier.toml")]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/courier.toml")]
    config: PathBuf,
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<CourierConfig>,
    store: Store,
    queue: Arc<GroupQueue>,
    groups: poll_loop::Groups,
    quiet: Arc<QuietSchedule>,
    channel_connected: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    orchestrator_enabled: bool,
    scheduler_enabled: bool,
    channel_connected: bool,
    registered_groups: usize,
    active_containers: usize,
    quiet: bool,
}

#[derive(Debug, Deserialize)]
struct IngressRequest {
    #[serde(default)]
    id: Option<String>,
    chat_jid: String,
    #[serde(default)]
    chat_name: Option<String>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    sender_name: Option<String>,
    content: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    is_from_me: bool,
    #[serde(default)]
    is_bot_message: bool,
}

#[derive(Serialize)]
struct IngressResponse {
    ok: bool,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/courier.toml"),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let config = Arc::new(config);

    let store = Store::open(&config.storage.db_path)?;
    let groups_dir = PathBuf::from(&config.storage.groups_dir);
    let data_dir = PathBuf::from(&config.storage.data_dir);
    std::fs::create_dir_all(&groups_dir).ok();
    std::fs::create_dir_all(&data_dir).ok();

    // Registry and sessions come off disk; the registry is only mutated
    // through the IPC watcher from here on.
    let groups_map = store.get_all_registered_groups()?;
    let main_count = groups_map
        .values()
        .filter(|g| g.folder == config.orchestrator.main_group_folder)
        .count();
    if main_count > 1 {
        bail!(
            "configuration error: {main_count} groups share the main folder {:?}",
            config.orchestrator.main_group_folder
        );
    }
    info!(count = groups_map.len(), "loaded registered groups");
    let sessions_map = store.get_all_sessions()?;
    info!(count = sessions_map.len(), "loaded sessions");

    let groups: poll_loop::Groups = Arc::new(RwLock::new(groups_map));
    let sessions: dispatch::Sessions = Arc::new(RwLock::new(sessions_map));

    let telegram = TelegramChannel::from_env();
    let channel_connected = telegram.is_some();
    let channel: Arc<dyn ChannelDriver> = match telegram {
        Some(ch) => {
            info!("telegram channel connected");
            Arc::new(ch)
        }
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set, running with a no-op channel");
            Arc::new(NullChannel::default())
        }
    };

    let creds: Arc<dyn CredentialService> = if config.credentials.enabled {
        Arc::new(OauthCredentials::new(&config.credentials, &data_dir))
    } else {
        Arc::new(StaticCredentials::new(
            &config.credentials.auth_error_patterns,
        ))
    };
    if let Err(e) = creds.ensure_fresh().await {
        warn!(err = %e, "initial credential freshness check failed");
    }

    let queue = Arc::new(GroupQueue::new(
        config.orchestrator.max_concurrent_containers,
        config.container.runtime_bin.clone(),
    ));
    let tracker = Arc::new(StatusTracker::new(store.clone(), channel.clone()));
    let quiet = Arc::new(QuietSchedule::new(
        &config.quiet_hours.timezone,
        &config.quiet_hours.windows,
    ));
    let quiet_enabled = config.quiet_hours.enabled && !quiet.is_empty();

    let runner_config = runner::RunnerConfig {
        runtime_bin: config.container.runtime_bin.clone(),
        image: config.container.image.clone(),
        groups_dir: groups_dir.clone(),
        data_dir: data_dir.clone(),
        timezone: config.scheduler.timezone.clone(),
        idle_timeout: Duration::from_millis(config.orchestrator.idle_timeout_ms),
        task_close_delay: Duration::from_millis(config.orchestrator.task_close_delay_ms),
    };

    let deps = Arc::new(DispatchDeps {
        store: store.clone(),
        queue: queue.clone(),
        groups: groups.clone(),
        sessions: sessions.clone(),
        channel: channel.clone(),
        tracker: tracker.clone(),
        creds: creds.clone(),
        runner_config,
        assistant_name: config.orchestrator.assistant_name.clone(),
        main_group_folder: config.orchestrator.main_group_folder.clone(),
        quiet: quiet.clone(),
        quiet_enabled,
    });
    queue
        .set_process_messages_fn(dispatch::build_process_messages_fn(deps.clone()))
        .await;

    let router = Arc::new(Router {
        config: PollLoopConfig {
            poll_interval_ms: config.orchestrator.poll_interval_ms,
            assistant_name: config.orchestrator.assistant_name.clone(),
            main_group_folder: config.orchestrator.main_group_folder.clone(),
        },
        store: store.clone(),
        queue: queue.clone(),
        groups: groups.clone(),
        channel: channel.clone(),
        tracker: tracker.clone(),
        quiet: quiet.clone(),
        quiet_enabled,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    if config.orchestrator.enabled {
        runner::cleanup_orphans(&config.container.runtime_bin).await;
        poll_loop::recover_at_startup(&router).await;

        let poll_router = router.clone();
        let poll_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            poll_loop::run_poll_loop(poll_router, poll_shutdown).await;
        }));

        let heartbeat_tracker = tracker.clone();
        let heartbeat_queue = queue.clone();
        let heartbeat_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            status_tracker::run_heartbeat_loop(
                heartbeat_tracker,
                heartbeat_queue,
                Duration::from_secs(60),
                heartbeat_shutdown,
            )
            .await;
        }));

        if config.scheduler.enabled {
            let sched_config = scheduler::SchedulerConfig {
                poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
                timezone: config.scheduler.timezone.clone(),
                enabled: true,
            };
            let sched_store = store.clone();
            let sched_quiet = quiet.clone();
            let sched_shutdown = shutdown_rx.clone();
            let on_task = tasks::build_task_callback(deps.clone());
            handles.push(tokio::spawn(async move {
                scheduler::run_scheduler_loop(
                    sched_config,
                    sched_store,
                    sched_quiet,
                    quiet_enabled,
                    on_task,
                    sched_shutdown,
                )
                .await;
            }));
        }

        let ipc_watcher = ipc::IpcWatcher::new(
            ipc::IpcWatcherConfig {
                ipc_base_dir: data_dir.join("ipc"),
                poll_interval: Duration::from_secs(1),
                main_group_folder: config.orchestrator.main_group_folder.clone(),
                timezone: config.scheduler.timezone.clone(),
            },
            store.clone(),
            channel.clone(),
            groups.clone(),
        );
        let ipc_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            ipc_watcher.run(ipc_shutdown).await;
        }));

        if quiet_enabled {
            let reminder_router = router.clone();
            let reminder_shutdown = shutdown_rx.clone();
            let offset =
                Duration::from_secs(config.quiet_hours.reminder_minutes_before * 60);
            handles.push(tokio::spawn(async move {
                poll_loop::run_quiet_reminder_loop(reminder_router, offset, reminder_shutdown)
                    .await;
            }));
        }

        info!("orchestrator enabled: poll loop, queue and scheduler wired");
    } else {
        info!("orchestrator disabled: serving HTTP surface only");
    }

    if config.credentials.enabled {
        let refresh_creds = creds.clone();
        let refresh_channel = channel.clone();
        let main_jid = {
            let groups = groups.read().await;
            groups
                .values()
                .find(|g| g.folder == config.orchestrator.main_group_folder)
                .map(|g| g.jid.clone())
        };
        let refresh_shutdown = shutdown_rx.clone();
        let interval = Duration::from_millis(config.credentials.refresh_interval_ms);
        handles.push(tokio::spawn(async move {
            credentials::run_refresh_loop(
                refresh_creds,
                refresh_channel,
                main_jid,
                interval,
                refresh_shutdown,
            )
            .await;
        }));
    }

    let state = AppState {
        started_at: Instant::now(),
        config: config.clone(),
        store: store.clone(),
        queue: queue.clone(),
        groups: groups.clone(),
        quiet: quiet.clone(),
        channel_connected,
    };

    let app = AxumRouter::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/messages/ingress", post(ingress))
        .with_state(state);

    let bind = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;
    info!(bind = bind.as_str(), "courierd listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly");

    // Orderly teardown: stop loops, close containers, flush reactions.
    let _ = shutdown_tx.send(true);
    queue
        .shutdown(Duration::from_millis(
            config.orchestrator.shutdown_timeout_ms,
        ))
        .await;
    tracker.shutdown().await;
    channel.disconnect().await;
    for handle in handles {
        let _ = handle.await;
    }
    info!("courierd stopped");

    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "courierd",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.config.server.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    let registered_groups = state.groups.read().await.len();
    let active_containers = state.queue.active_count().await;
    Json(ReadyResponse {
        status: "ready",
        orchestrator_enabled: state.config.orchestrator.enabled,
        scheduler_enabled: state.config.scheduler.enabled,
        channel_connected: state.channel_connected,
        registered_groups,
        active_containers,
        quiet: state.config.quiet_hours.enabled && state.quiet.is_quiet(chrono::Utc::now()),
    })
}

/// The channel driver's write path into the message store.
async fn ingress(
    State(state): State<AppState>,
    Json(request): Json<IngressRequest>,
) -> Json<IngressResponse> {
    let timestamp = request.timestamp.unwrap_or_else(now_ts);
    let id = request.id.unwrap_or_else(|| {
        format!("msg-{}", chrono::Utc::now().timestamp_millis())
    });
    let msg = NewMessage {
        id,
        chat_jid: request.chat_jid.clone(),
        sender: request.sender.unwrap_or_default(),
        sender_name: request.sender_name.unwrap_or_default(),
        content: request.content,
        timestamp: timestamp.clone(),
        is_from_me: request.is_from_me,
        is_bot_message: request.is_bot_message,
    };

    if let Err(e) = state.store.store_chat_metadata(
        &request.chat_jid,
        &timestamp,
        request.chat_name.as_deref(),
    ) {
        return Json(IngressResponse {
            ok: false,
            error: Some(e.to_string()),
        });
    }
    match state.store.store_message(&msg) {
        Ok(()) => Json(IngressResponse { ok: true, error: None }),
        Err(e) => Json(IngressResponse {
            ok: false,
            error: Some(e.to_string()),
        }),
    }
}
