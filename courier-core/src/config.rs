use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::quiet::QuietWindowSpec;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CourierConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub container: ContainerConfig,
    pub scheduler: SchedulerConfig,
    pub quiet_hours: QuietHoursConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7450".to_string(),
            request_timeout_ms: 30_000,
            max_body_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the embedded SQLite store.
    pub db_path: String,
    /// Root directory holding one folder per registered group.
    pub groups_dir: String,
    /// Runtime data directory (IPC files, credential cache).
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "store/courier.db".to_string(),
            groups_dir: "groups".to_string(),
            data_dir: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Enable the orchestrator (poll loop, queue, container dispatch).
    pub enabled: bool,
    /// Poll interval for the message loop (milliseconds).
    pub poll_interval_ms: u64,
    /// Idle timeout before closing container stdin (milliseconds).
    pub idle_timeout_ms: u64,
    /// Close delay after the first result of a scheduled task (milliseconds).
    pub task_close_delay_ms: u64,
    /// Deadline for graceful shutdown before containers are killed.
    pub shutdown_timeout_ms: u64,
    /// Maximum concurrent containers across all groups.
    pub max_concurrent_containers: usize,
    /// Folder name for the main group.
    pub main_group_folder: String,
    /// Default assistant name for the `@Name` trigger.
    pub assistant_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 1_000,
            idle_timeout_ms: 1_800_000,
            task_close_delay_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            max_concurrent_containers: 3,
            main_group_folder: "main".to_string(),
            assistant_name: "Marlow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary.
    pub runtime_bin: String,
    /// Agent image to run.
    pub image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "courier-agent:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Enable the task scheduler loop.
    pub enabled: bool,
    /// Poll interval for due tasks (milliseconds).
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: 60_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    pub enabled: bool,
    /// IANA timezone the windows are expressed in.
    pub timezone: String,
    pub windows: Vec<QuietWindowSpec>,
    /// Minutes before a quiet window to send the reminder to the main group.
    pub reminder_minutes_before: u64,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: "UTC".to_string(),
            windows: Vec::new(),
            reminder_minutes_before: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub enabled: bool,
    /// OAuth token endpoint used for refresh.
    pub token_url: String,
    pub client_id: String,
    /// Proactive refresh tick interval (milliseconds).
    pub refresh_interval_ms: u64,
    /// Tokens older than this are refreshed by `ensure_fresh` (seconds).
    pub refresh_margin_secs: u64,
    /// Substrings (lowercased) that identify an auth failure in agent errors.
    pub auth_error_patterns: Vec<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_url: String::new(),
            client_id: String::new(),
            refresh_interval_ms: 1_800_000,
            refresh_margin_secs: 900,
            auth_error_patterns: vec![
                "401".to_string(),
                "unauthorized".to_string(),
                "token expired".to_string(),
                "authentication_error".to_string(),
                "invalid api key".to_string(),
            ],
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<CourierConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(CourierConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: CourierConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl CourierConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("COURIERD_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind;
            }
        }

        if let Ok(path) = std::env::var("COURIER_DB_PATH") {
            if !path.trim().is_empty() {
                self.storage.db_path = path;
            }
        }

        if let Ok(name) = std::env::var("ASSISTANT_NAME") {
            if !name.trim().is_empty() {
                self.orchestrator.assistant_name = name;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CourierConfig::default();
        assert!(!cfg.orchestrator.enabled);
        assert_eq!(cfg.orchestrator.main_group_folder, "main");
        assert_eq!(cfg.scheduler.poll_interval_ms, 60_000);
        assert!(cfg
            .credentials
            .auth_error_patterns
            .iter()
            .any(|p| p == "401"));
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: CourierConfig = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9999"

            [quiet_hours]
            enabled = true
            timezone = "Europe/Berlin"

            [[quiet_hours.windows]]
            day = "fri"
            start = "18:00"
            end = "21:00"
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.server.bind, "127.0.0.1:9999");
        assert_eq!(parsed.orchestrator.poll_interval_ms, 1_000);
        assert!(parsed.quiet_hours.enabled);
        assert_eq!(parsed.quiet_hours.windows.len(), 1);
        assert_eq!(parsed.quiet_hours.windows[0].day, "fri");
    }
}
