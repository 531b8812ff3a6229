pub mod config;
pub mod container;
pub mod folder;
pub mod quiet;
pub mod status;
pub mod store;

pub use config::{
    ContainerConfig, CourierConfig, CredentialsConfig, OrchestratorConfig, QuietHoursConfig,
    SchedulerConfig, ServerConfig, StorageConfig, load_config,
};
pub use container::{
    AgentEvent, ContainerInput, ContainerOutput, ContainerStatus, parse_agent_event,
    render_result, strip_internal_blocks,
};
pub use folder::{FolderError, resolve_group_folder, validate_folder_name};
pub use quiet::{QuietSchedule, QuietWindowSpec};
pub use status::{MessageStatus, StatusRecord, can_advance, status_emoji};
pub use store::{NewMessage, RegisteredGroup, ScheduledTask, Store, TaskRunLog, now_ts};
