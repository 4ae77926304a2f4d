//! Minecraft dedicated-server lifecycle engine.
//!
//! `minesteward` installs, supervises, restarts, and safely updates a
//! dedicated server process. The pieces compose around a single rule: every
//! mutation of the jar or world goes through the [`UpdateOrchestrator`]'s
//! serialized state machine, with backups taken first and modded installs
//! never auto-replaced.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//! use minesteward::{
//!     BackupManager, LaunchSpec, LogSink, ManagerConfig, MojangVersionSource,
//!     ProcessSupervisor, RestartPolicy, Trigger, TriggerTarget, UpdateOrchestrator,
//!     UpdatePoller,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let snapshot = ManagerConfig::default().validate();
//! let config = Arc::new(RwLock::new(snapshot.clone()));
//! let launch = LaunchSpec::new(".", "minecraft_server.jar").with_memory("2G");
//!
//! let supervisor = Arc::new(ProcessSupervisor::new());
//! let orchestrator = Arc::new(UpdateOrchestrator::new(
//!     Arc::new(MojangVersionSource::new()),
//!     supervisor.clone(),
//!     BackupManager::new("world_backups", "jar_backups"),
//!     Arc::new(LogSink),
//!     config.clone(),
//!     launch,
//! ));
//!
//! // The config's enable toggles decide which trigger sources run.
//! let policy = RestartPolicy::from_config(
//!     orchestrator.clone(),
//!     supervisor,
//!     Arc::new(LogSink),
//!     &snapshot,
//! );
//! policy.spawn_crash_watcher();
//! policy.spawn_scheduled_restarts();
//! UpdatePoller::from_config(orchestrator.clone(), &snapshot).spawn();
//!
//! orchestrator.submit(Trigger::ManualCommand).await;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod console;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod policy;
pub mod supervisor;
pub mod version;

pub use backup::{BackupManager, BackupRecord, BackupSource};
pub use config::{Channel, LaunchSpec, LoaderKind, ManagerConfig};
pub use console::{ConsoleLine, LogMeta, StreamSource};
pub use notify::{BroadcastSink, LogSink, Notification, NotificationKind, NotificationSink};
pub use orchestrator::{
    CycleOutcome, OrchestratorState, Trigger, TriggerTarget, UpdateOrchestrator, UpdatePlan,
};
pub use policy::{RestartPolicy, UpdatePoller};
pub use supervisor::{ProcessInfo, ProcessState, ProcessSupervisor, ServerControl};
pub use version::{MojangVersionSource, VersionDescriptor, VersionSource};

/// Installs a `tracing` subscriber reading its filter from `RUST_LOG`,
/// defaulting to `info`. Call once from the embedding binary.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
