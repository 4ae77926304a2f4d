use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::ManagerConfig,
    notify::{Notification, NotificationKind, NotificationSink},
    orchestrator::{CycleOutcome, Trigger, TriggerTarget},
    supervisor::{ProcessState, ServerControl},
};

/// Background trigger sources: crash detection with a bounded retry budget,
/// and fixed-interval maintenance restarts. Both only ever submit triggers;
/// all actual work happens behind the orchestrator's gate.
pub struct RestartPolicy {
    target: Arc<dyn TriggerTarget>,
    server: Arc<dyn ServerControl>,
    sink: Arc<dyn NotificationSink>,
    probe_interval: Duration,
    retry_delay: Duration,
    retry_limit: u32,
    auto_restart: bool,
    restart_interval: Option<Duration>,
    shutdown: CancellationToken,
}

impl RestartPolicy {
    pub fn new(
        target: Arc<dyn TriggerTarget>,
        server: Arc<dyn ServerControl>,
        sink: Arc<dyn NotificationSink>,
        retry_limit: u32,
    ) -> Self {
        Self {
            target,
            server,
            sink,
            probe_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(10),
            retry_limit,
            auto_restart: true,
            restart_interval: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Builds the policy from a config snapshot: the enable toggles decide
    /// whether each trigger source runs at all, and the retry budget and
    /// restart interval come from the same snapshot.
    pub fn from_config(
        target: Arc<dyn TriggerTarget>,
        server: Arc<dyn ServerControl>,
        sink: Arc<dyn NotificationSink>,
        config: &ManagerConfig,
    ) -> Self {
        let mut policy = Self::new(target, server, sink, config.crash_retry_limit);
        policy.auto_restart = config.enable_auto_restart;
        if config.enable_schedule {
            policy.restart_interval =
                Some(Duration::from_secs_f64(config.restart_interval_hours * 3600.0));
        }
        policy
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_restart_interval(mut self, every: Duration) -> Self {
        self.restart_interval = Some(every);
        self
    }

    /// Token cancelling every task spawned from this policy.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Liveness probe loop. On a detected crash it requests immediate
    /// restarts until one succeeds or the retry budget is spent; exhaustion
    /// emits a single `CrashLoopHalted` and ends the watcher, leaving the
    /// server down for a human. A no-op when auto restart is disabled in the
    /// config.
    pub fn spawn_crash_watcher(&self) -> JoinHandle<()> {
        if !self.auto_restart {
            info!("auto restart disabled; crash watcher not started");
            return tokio::spawn(async {});
        }

        let target = self.target.clone();
        let server = self.server.clone();
        let sink = self.sink.clone();
        let shutdown = self.shutdown.clone();
        let probe_interval = self.probe_interval;
        let retry_delay = self.retry_delay;
        let retry_limit = self.retry_limit.max(1);

        tokio::spawn(async move {
            let mut ticker = time::interval(probe_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let state = server.state().await;
                let crashed = state == ProcessState::Crashed
                    || (state == ProcessState::Running && !server.is_alive().await);
                if !crashed {
                    continue;
                }

                sink.notify(Notification::new(
                    NotificationKind::Crashed,
                    "server process crashed; attempting restart",
                ))
                .await;

                let mut attempts = 0u32;
                loop {
                    match target.submit(Trigger::Crash).await {
                        CycleOutcome::Restarted => {
                            info!(attempts = attempts + 1, "crash recovery succeeded");
                            break;
                        }
                        // Another cycle holds the gate; re-probe next tick
                        // instead of burning a retry.
                        CycleOutcome::Queued => break,
                        _ => {
                            attempts += 1;
                            warn!(attempts, retry_limit, "crash restart attempt failed");
                            if attempts >= retry_limit {
                                sink.notify(Notification::new(
                                    NotificationKind::CrashLoopHalted,
                                    format!(
                                        "{attempts} consecutive restart attempts failed; manual intervention required"
                                    ),
                                ))
                                .await;
                                return;
                            }
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                _ = time::sleep(retry_delay) => {}
                            }
                        }
                    }
                }
            }
        })
    }

    /// Fixed-interval clean stop+start, no update check; keeps long-running
    /// instances from accumulating memory bloat. A no-op unless a restart
    /// interval was configured.
    pub fn spawn_scheduled_restarts(&self) -> JoinHandle<()> {
        let Some(every) = self.restart_interval else {
            info!("scheduled restarts disabled");
            return tokio::spawn(async {});
        };

        let target = self.target.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            // Skip the interval's immediate first tick; the first restart is
            // due one full period after startup.
            let start = time::Instant::now() + every;
            let mut ticker = time::interval_at(start, every);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                info!("scheduled restart due");
                target.submit(Trigger::ScheduledInterval).await;
            }
        })
    }
}

/// Fixed-interval manifest poll feeding `ManifestPoll` triggers into the
/// orchestrator. The orchestrator decides everything else.
pub struct UpdatePoller {
    target: Arc<dyn TriggerTarget>,
    every: Duration,
    enabled: bool,
    shutdown: CancellationToken,
}

impl UpdatePoller {
    pub fn new(target: Arc<dyn TriggerTarget>, every: Duration) -> Self {
        Self {
            target,
            every,
            enabled: true,
            shutdown: CancellationToken::new(),
        }
    }

    /// Poll interval and the update-check toggle come from the config
    /// snapshot; a disabled check yields a poller whose `spawn` is a no-op.
    pub fn from_config(target: Arc<dyn TriggerTarget>, config: &ManagerConfig) -> Self {
        let mut poller = Self::new(target, Duration::from_secs(config.update_poll_secs));
        poller.enabled = config.check_updates;
        poller
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        if !self.enabled {
            info!("update checks disabled; poller not started");
            return tokio::spawn(async {});
        }

        let target = self.target.clone();
        let shutdown = self.shutdown.clone();
        let every = self.every;

        tokio::spawn(async move {
            let start = time::Instant::now() + every;
            let mut ticker = time::interval_at(start, every);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                target.submit(Trigger::ManifestPoll).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        sync::Mutex as StdMutex,
    };

    use async_trait::async_trait;
    use crate::{config::LaunchSpec, error::ProcessError};

    struct ScriptedTarget {
        outcomes: StdMutex<VecDeque<CycleOutcome>>,
        submissions: StdMutex<Vec<Trigger>>,
    }

    impl ScriptedTarget {
        fn new(outcomes: impl IntoIterator<Item = CycleOutcome>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes.into_iter().collect()),
                submissions: StdMutex::new(Vec::new()),
            }
        }

        fn submissions(&self) -> Vec<Trigger> {
            self.submissions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TriggerTarget for ScriptedTarget {
        async fn submit(&self, trigger: Trigger) -> CycleOutcome {
            self.submissions.lock().unwrap().push(trigger);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(CycleOutcome::Restarted)
        }
    }

    struct CrashedServer;

    #[async_trait]
    impl ServerControl for CrashedServer {
        async fn start(&self, _spec: &LaunchSpec) -> Result<(), ProcessError> {
            Ok(())
        }
        async fn stop_gracefully(&self, _grace: Duration) -> Result<(), ProcessError> {
            Ok(())
        }
        async fn is_alive(&self) -> bool {
            false
        }
        async fn state(&self) -> ProcessState {
            ProcessState::Crashed
        }
    }

    #[derive(Default)]
    struct CountingSink {
        fatal: AtomicUsize,
        crashed: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn notify(&self, notification: Notification) {
            match notification.kind {
                NotificationKind::CrashLoopHalted => {
                    self.fatal.fetch_add(1, Ordering::SeqCst);
                }
                NotificationKind::Crashed => {
                    self.crashed.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    fn fast_policy(
        target: Arc<dyn TriggerTarget>,
        sink: Arc<CountingSink>,
        retry_limit: u32,
    ) -> RestartPolicy {
        RestartPolicy::new(target, Arc::new(CrashedServer), sink, retry_limit)
            .with_probe_interval(Duration::from_millis(20))
            .with_retry_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn crash_loop_halts_after_retry_budget() {
        let target = Arc::new(ScriptedTarget::new([
            CycleOutcome::Failed,
            CycleOutcome::Failed,
            CycleOutcome::Failed,
        ]));
        let sink = Arc::new(CountingSink::default());
        let policy = fast_policy(target.clone(), sink.clone(), 3);

        let watcher = policy.spawn_crash_watcher();
        // The watcher exits by itself once the budget is spent.
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should halt")
            .unwrap();

        assert_eq!(target.submissions().len(), 3);
        assert!(target.submissions().iter().all(|t| *t == Trigger::Crash));
        assert_eq!(sink.fatal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_restart_resets_the_budget() {
        let target = Arc::new(ScriptedTarget::new([
            CycleOutcome::Failed,
            CycleOutcome::Failed,
            CycleOutcome::Restarted,
        ]));
        let sink = Arc::new(CountingSink::default());
        let policy = fast_policy(target.clone(), sink.clone(), 3);

        let watcher = policy.spawn_crash_watcher();
        // Give the watcher time to work through the scripted outcomes.
        tokio::time::sleep(Duration::from_millis(300)).await;
        policy.shutdown_token().cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), watcher).await;

        // Two failures then a success: no fatal notification.
        assert_eq!(sink.fatal.load(Ordering::SeqCst), 0);
        assert!(target.submissions().len() >= 3);
    }

    #[tokio::test]
    async fn queued_outcome_does_not_burn_a_retry() {
        let target = Arc::new(ScriptedTarget::new([
            CycleOutcome::Queued,
            CycleOutcome::Queued,
            CycleOutcome::Queued,
            CycleOutcome::Queued,
        ]));
        let sink = Arc::new(CountingSink::default());
        let policy = fast_policy(target.clone(), sink.clone(), 2);

        let watcher = policy.spawn_crash_watcher();
        tokio::time::sleep(Duration::from_millis(200)).await;
        policy.shutdown_token().cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), watcher).await;

        assert_eq!(sink.fatal.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scheduled_restarts_fire_on_the_interval() {
        let target = Arc::new(ScriptedTarget::new([]));
        let sink = Arc::new(CountingSink::default());
        let policy =
            fast_policy(target.clone(), sink, 3).with_restart_interval(Duration::from_millis(30));

        let task = policy.spawn_scheduled_restarts();
        tokio::time::sleep(Duration::from_millis(160)).await;
        policy.shutdown_token().cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;

        let submissions = target.submissions();
        let scheduled: Vec<_> = submissions
            .iter()
            .filter(|t| **t == Trigger::ScheduledInterval)
            .collect();
        assert!(scheduled.len() >= 2, "expected repeated scheduled triggers");
    }

    #[tokio::test]
    async fn disabled_auto_restart_submits_nothing() {
        let target = Arc::new(ScriptedTarget::new([]));
        let sink = Arc::new(CountingSink::default());
        let mut config = ManagerConfig::default();
        config.enable_auto_restart = false;

        // The server reports Crashed throughout, but the toggle wins.
        let policy = RestartPolicy::from_config(
            target.clone(),
            Arc::new(CrashedServer),
            sink.clone(),
            &config,
        )
        .with_probe_interval(Duration::from_millis(20));

        let watcher = policy.spawn_crash_watcher();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The watcher task finished immediately instead of probing.
        assert!(watcher.is_finished());
        assert!(target.submissions().is_empty());
        assert_eq!(sink.crashed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_schedule_submits_nothing() {
        let target = Arc::new(ScriptedTarget::new([]));
        let sink = Arc::new(CountingSink::default());
        let mut config = ManagerConfig::default();
        config.enable_schedule = false;
        config.restart_interval_hours = 0.00001;

        let policy = RestartPolicy::from_config(
            target.clone(),
            Arc::new(CrashedServer),
            sink,
            &config,
        );

        let task = policy.spawn_scheduled_restarts();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(task.is_finished());
        assert!(target.submissions().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_comes_from_the_config() {
        let target = Arc::new(ScriptedTarget::new([
            CycleOutcome::Failed,
            CycleOutcome::Failed,
        ]));
        let sink = Arc::new(CountingSink::default());
        let mut config = ManagerConfig::default();
        config.crash_retry_limit = 2;

        let policy = RestartPolicy::from_config(
            target.clone(),
            Arc::new(CrashedServer),
            sink.clone(),
            &config,
        )
        .with_probe_interval(Duration::from_millis(20))
        .with_retry_delay(Duration::from_millis(5));

        let watcher = policy.spawn_crash_watcher();
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should halt at the configured budget")
            .unwrap();

        assert_eq!(target.submissions().len(), 2);
        assert_eq!(sink.fatal.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_update_checks_submit_nothing() {
        let target = Arc::new(ScriptedTarget::new([]));
        let mut config = ManagerConfig::default();
        config.check_updates = false;
        config.update_poll_secs = 1;

        let poller = UpdatePoller::from_config(target.clone(), &config);
        let task = poller.spawn();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(task.is_finished());
        assert!(target.submissions().is_empty());
    }

    #[tokio::test]
    async fn poller_submits_manifest_polls() {
        let target = Arc::new(ScriptedTarget::new([]));
        let poller = UpdatePoller::new(target.clone(), Duration::from_millis(30));

        let task = poller.spawn();
        tokio::time::sleep(Duration::from_millis(160)).await;
        poller.shutdown_token().cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;

        assert!(target
            .submissions()
            .iter()
            .filter(|t| **t == Trigger::ManifestPoll)
            .count()
            >= 2);
    }
}
