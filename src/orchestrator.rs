use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    backup::BackupManager,
    config::{LaunchSpec, LoaderKind, ManagerConfig},
    error::{ProcessError, VersionError},
    notify::{Notification, NotificationKind, NotificationSink},
    supervisor::ServerControl,
    version::{VersionDescriptor, VersionSource},
};

/// An event asking the orchestrator to evaluate or perform a restart/update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The process died unexpectedly; restart it, no update check.
    Crash,
    /// Scheduled maintenance restart; clean stop + start, no update check.
    ScheduledInterval,
    /// Periodic manifest poll; run the full update decision.
    ManifestPoll,
    /// Operator-issued update request (console, bot, UI).
    ManualCommand,
}

/// Where the orchestrator's state machine currently is. `Aborted` is
/// reachable from any mid-cycle step on unrecoverable failure and always
/// resolves back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    CheckingVersion,
    PlanningUpdate,
    BackingUp,
    Stopped,
    Replacing,
    Starting,
    Aborted,
}

/// The step an update cycle failed at, for `UpdateFailed` details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    VersionCheck,
    BackupJar,
    BackupWorld,
    Stop,
    Replace,
    Start,
}

/// What one submitted trigger amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new jar was installed and the server restarted on it.
    Updated,
    /// No mutation happened: up to date, modded install, or manifest noise.
    Skipped,
    /// Restart-only trigger completed.
    Restarted,
    /// The cycle aborted; a notification names the failed step.
    Failed,
    /// The gate was held; the trigger was queued (or coalesced away).
    Queued,
}

/// Decision record for one potential update.
///
/// `allowed` is the Safe Update Protection invariant: it is false for every
/// modded loader regardless of version delta, and false for vanilla when the
/// target id matches the installed one.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub current_id: String,
    pub target: VersionDescriptor,
    pub loader: LoaderKind,
    pub allowed: bool,
}

impl UpdatePlan {
    pub fn build(current_id: &str, loader: LoaderKind, target: VersionDescriptor) -> Self {
        let allowed = !loader.is_modded() && target.id != current_id;
        Self {
            current_id: current_id.to_string(),
            target,
            loader,
            allowed,
        }
    }

    /// A newer version exists but may not be applied automatically.
    pub fn needs_manual_install(&self) -> bool {
        self.loader.is_modded() && self.target.id != self.current_id
    }
}

/// Anything that accepts triggers. The restart policy and external bridges
/// depend on this seam rather than on the orchestrator type.
#[async_trait]
pub trait TriggerTarget: Send + Sync {
    async fn submit(&self, trigger: Trigger) -> CycleOutcome;
}

/// The update/restart state machine.
///
/// A single gate serializes cycles; triggers arriving while the gate is held
/// are queued into a one-slot buffer (duplicates dropped) and drained before
/// the gate is released. Collaborator failures are converted to
/// notifications and an `Aborted → Idle` transition; they never escape.
pub struct UpdateOrchestrator {
    versions: Arc<dyn VersionSource>,
    server: Arc<dyn ServerControl>,
    backups: BackupManager,
    sink: Arc<dyn NotificationSink>,
    config: Arc<RwLock<ManagerConfig>>,
    launch: Arc<RwLock<LaunchSpec>>,
    state: RwLock<OrchestratorState>,
    gate: tokio::sync::Mutex<()>,
    pending: std::sync::Mutex<Option<Trigger>>,
}

impl UpdateOrchestrator {
    pub fn new(
        versions: Arc<dyn VersionSource>,
        server: Arc<dyn ServerControl>,
        backups: BackupManager,
        sink: Arc<dyn NotificationSink>,
        config: Arc<RwLock<ManagerConfig>>,
        launch: LaunchSpec,
    ) -> Self {
        Self {
            versions,
            server,
            backups,
            sink,
            config,
            launch: Arc::new(RwLock::new(launch)),
            state: RwLock::new(OrchestratorState::Idle),
            gate: tokio::sync::Mutex::new(()),
            pending: std::sync::Mutex::new(None),
        }
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    async fn set_state(&self, state: OrchestratorState) {
        *self.state.write().await = state;
    }

    async fn notify(&self, kind: NotificationKind, detail: impl Into<String>) {
        self.sink.notify(Notification::new(kind, detail)).await;
    }

    fn queue(&self, trigger: Trigger) {
        let mut pending = self
            .pending
            .lock()
            .expect("pending trigger slot is never poisoned");
        match pending.as_ref() {
            None => {
                debug!(?trigger, "gate held; trigger queued");
                *pending = Some(trigger);
            }
            Some(existing) if *existing == trigger => {
                debug!(?trigger, "gate held; duplicate trigger dropped");
            }
            Some(existing) => {
                debug!(?trigger, pending = ?existing, "pending slot occupied; trigger dropped");
            }
        }
    }

    fn take_pending(&self) -> Option<Trigger> {
        self.pending
            .lock()
            .expect("pending trigger slot is never poisoned")
            .take()
    }

    async fn run_cycle(&self, trigger: Trigger) -> CycleOutcome {
        info!(?trigger, "cycle started");
        let outcome = match trigger {
            Trigger::Crash => self.restart_cycle(false).await,
            Trigger::ScheduledInterval => self.restart_cycle(true).await,
            Trigger::ManifestPoll | Trigger::ManualCommand => self.update_cycle().await,
        };
        self.set_state(OrchestratorState::Idle).await;
        info!(?trigger, ?outcome, "cycle finished");
        outcome
    }

    /// Stop (optionally) and start without touching the jar. Crash recovery
    /// skips the stop: the process is already gone.
    async fn restart_cycle(&self, stop_first: bool) -> CycleOutcome {
        let stop_timeout = {
            let cfg = self.config.read().await;
            std::time::Duration::from_secs(cfg.stop_timeout_secs)
        };
        let launch = self.launch.read().await.clone();

        if stop_first {
            self.set_state(OrchestratorState::Stopped).await;
            self.notify(NotificationKind::Stopping, "scheduled restart: stopping server")
                .await;
            match self.server.stop_gracefully(stop_timeout).await {
                Ok(()) | Err(ProcessError::NotRunning) => {}
                Err(e) => {
                    // No update in flight; this is a restart casualty.
                    self.notify(
                        NotificationKind::Crashed,
                        format!("scheduled restart could not stop the server: {e}"),
                    )
                    .await;
                    self.set_state(OrchestratorState::Aborted).await;
                    return CycleOutcome::Failed;
                }
            }
            self.notify(NotificationKind::Stopped, "server stopped").await;
        }

        self.set_state(OrchestratorState::Starting).await;
        self.notify(NotificationKind::Starting, "starting server").await;
        match self.server.start(&launch).await {
            Ok(()) => {
                self.notify(NotificationKind::Started, "server started").await;
                CycleOutcome::Restarted
            }
            Err(e) => {
                self.notify(
                    NotificationKind::Crashed,
                    format!("restart attempt failed: {e}"),
                )
                .await;
                self.set_state(OrchestratorState::Aborted).await;
                CycleOutcome::Failed
            }
        }
    }

    async fn update_cycle(&self) -> CycleOutcome {
        // Immutable snapshots for the whole cycle; config edits apply from
        // the next trigger on.
        let cfg = self.config.read().await.clone();
        let launch = self.launch.read().await.clone();
        let stop_timeout = std::time::Duration::from_secs(cfg.stop_timeout_secs);

        self.set_state(OrchestratorState::CheckingVersion).await;
        let target = match self.versions.fetch_latest(cfg.channel()).await {
            Ok(target) => target,
            Err(VersionError::Network(e)) => {
                return self
                    .fail(UpdateStep::VersionCheck, format!("manifest unreachable: {e}"))
                    .await;
            }
            Err(e) => {
                // Malformed manifest data is treated as "no update available",
                // not as a fault.
                self.notify(
                    NotificationKind::UpdateSkipped,
                    format!("version check yielded no usable update: {e}"),
                )
                .await;
                return CycleOutcome::Skipped;
            }
        };

        self.set_state(OrchestratorState::PlanningUpdate).await;
        let plan = UpdatePlan::build(&cfg.installed_version, cfg.loader, target);

        if !plan.allowed {
            if plan.needs_manual_install() {
                self.notify(
                    NotificationKind::UpdateAvailable,
                    format!(
                        "{} {} is available; {:?} installs are never auto-replaced, provide an installer URL to update",
                        match plan.target.kind {
                            crate::config::Channel::Release => "release",
                            crate::config::Channel::Snapshot => "snapshot",
                        },
                        plan.target.id,
                        plan.loader,
                    ),
                )
                .await;
            }
            self.notify(
                NotificationKind::UpdateSkipped,
                format!("no update applied (installed: {})", plan.current_id),
            )
            .await;
            return CycleOutcome::Skipped;
        }

        // Jar first: cheap, and it fails fast before the world archive.
        self.set_state(OrchestratorState::BackingUp).await;
        let jar_path = launch.jar_abs();
        if let Err(e) = self.backups.backup_jar(&jar_path).await {
            self.notify(
                NotificationKind::BackupFailed,
                format!("jar backup failed, update aborted: {e}"),
            )
            .await;
            self.set_state(OrchestratorState::Aborted).await;
            return CycleOutcome::Failed;
        }

        let world_dir = if cfg.world_dir.is_absolute() {
            cfg.world_dir.clone()
        } else {
            launch.working_dir.join(&cfg.world_dir)
        };
        if let Err(e) = self.backups.backup_world(&world_dir).await {
            self.notify(
                NotificationKind::BackupFailed,
                format!("world backup failed, update aborted: {e}"),
            )
            .await;
            self.set_state(OrchestratorState::Aborted).await;
            return CycleOutcome::Failed;
        }
        self.notify(
            NotificationKind::BackupCompleted,
            format!("jar and world archived before update to {}", plan.target.id),
        )
        .await;
        self.backups.enforce_retention(cfg.max_backups).await;

        self.set_state(OrchestratorState::Stopped).await;
        self.notify(NotificationKind::Stopping, "stopping server for update")
            .await;
        match self.server.stop_gracefully(stop_timeout).await {
            // Not running is fine: nothing holds the jar or world files.
            Ok(()) | Err(ProcessError::NotRunning) => {}
            Err(e) => return self.fail(UpdateStep::Stop, e.to_string()).await,
        }
        self.notify(NotificationKind::Stopped, "server stopped").await;

        // Download beside the jar, verify, then atomically rename over it.
        // The old process has released its handles by now.
        self.set_state(OrchestratorState::Replacing).await;
        let staging = jar_path.with_extension("jar.download");
        if let Err(e) = self.versions.download_to(&plan.target, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return self.fail(UpdateStep::Replace, e.to_string()).await;
        }
        if let Err(e) = tokio::fs::rename(&staging, &jar_path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return self.fail(UpdateStep::Replace, e.to_string()).await;
        }

        self.set_state(OrchestratorState::Starting).await;
        self.notify(NotificationKind::Starting, "starting updated server")
            .await;
        if let Err(e) = self.server.start(&launch).await {
            // Deliberately no rollback: the new jar stays in place and the
            // backups are the recovery path. A human diagnoses from there.
            return self
                .fail(
                    UpdateStep::Start,
                    format!("{e}; new jar left in place, backups retained"),
                )
                .await;
        }
        self.notify(NotificationKind::Started, "server started").await;

        self.config.write().await.installed_version = plan.target.id.clone();
        self.notify(
            NotificationKind::UpdateApplied,
            format!("updated {} -> {}", plan.current_id, plan.target.id),
        )
        .await;

        CycleOutcome::Updated
    }

    async fn fail(&self, step: UpdateStep, detail: String) -> CycleOutcome {
        self.notify(
            NotificationKind::UpdateFailed,
            format!("update failed at {step:?}: {detail}"),
        )
        .await;
        self.set_state(OrchestratorState::Aborted).await;
        CycleOutcome::Failed
    }
}

#[async_trait]
impl TriggerTarget for UpdateOrchestrator {
    async fn submit(&self, trigger: Trigger) -> CycleOutcome {
        let _guard = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.queue(trigger);
                return CycleOutcome::Queued;
            }
        };

        let outcome = self.run_cycle(trigger).await;

        // Drain at most the one coalesced follow-up before releasing the
        // gate, so a trigger that arrived mid-cycle is not lost.
        while let Some(next) = self.take_pending() {
            self.run_cycle(next).await;
        }

        outcome
    }
}
