//! Join orchestration
//!
//! One run starts the proxy, points every installation at it, launches the
//! client and watches the process table until the client has joined or given
//! up. Every path that got past proxy start funnels through `unwind` or the
//! success tail, and both restore settings before stopping the proxy.

mod intercept;
mod state;

pub use intercept::InterceptProxy;
pub use state::{FailureReason, OrchestrationState, RunOutcome, StatusUpdate};

use crate::config::{Config, OrchestratorConfig};
use crate::install::{AppInstallation, ConfigOverride, ConfigPatcher};
use crate::launch::{DeepLinkLauncher, JoinTarget, Launcher};
use crate::watcher::{ProcessSignal, ProcessWatcher};
use hopr_proxy::ProxyController;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drives one proxy-patch-launch-restore cycle at a time
pub struct JoinOrchestrator {
    proxy: Mutex<Box<dyn InterceptProxy>>,
    patcher: ConfigPatcher,
    watcher: ProcessWatcher,
    launcher: Option<Box<dyn Launcher>>,
    timings: OrchestratorConfig,
    status: watch::Sender<StatusUpdate>,
    cancel: StdMutex<CancellationToken>,
}

impl JoinOrchestrator {
    pub fn new(
        proxy: Box<dyn InterceptProxy>,
        patcher: ConfigPatcher,
        watcher: ProcessWatcher,
        timings: OrchestratorConfig,
    ) -> Self {
        let (status, _) = watch::channel(StatusUpdate::default());
        Self {
            proxy: Mutex::new(proxy),
            patcher,
            watcher,
            launcher: None,
            timings,
            status,
            cancel: StdMutex::new(CancellationToken::new()),
        }
    }

    /// Real proxy, installations, process table and deep-link launcher
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Box::new(ProxyController::from_config(config.proxy.clone())),
            ConfigPatcher::new(config.install.clone()),
            ProcessWatcher::system(&config.processes),
            config.orchestrator.clone(),
        )
        .with_launcher(Box::new(DeepLinkLauncher))
    }

    pub fn with_launcher(mut self, launcher: Box<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusUpdate> {
        self.status.subscribe()
    }

    pub fn state(&self) -> OrchestrationState {
        self.status.borrow().state
    }

    /// Cancel the run in flight, if any
    ///
    /// The run still restores settings and stops the proxy before it returns
    /// `Failed(Cancelled)`.
    pub fn stop(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    /// Execute one join
    ///
    /// While another run is in flight this changes nothing and reports that
    /// run's current state with `started = false`.
    pub async fn run(&self, target: &JoinTarget) -> RunOutcome {
        let token = CancellationToken::new();
        let mut current = OrchestrationState::Idle;

        let claimed = self.status.send_if_modified(|status| {
            current = status.state;
            if status.state.is_in_flight() {
                return false;
            }
            if let Ok(mut cancel) = self.cancel.lock() {
                *cancel = token.clone();
            }
            *status = StatusUpdate {
                state: OrchestrationState::ProxyStarting,
                join_enabled: status.join_enabled,
                restore_degraded: false,
            };
            true
        });

        if !claimed {
            debug!("Run for {} refused; already {}", target, current);
            return RunOutcome {
                state: current,
                started: false,
                restore_degraded: self.status.borrow().restore_degraded,
            };
        }

        info!("Starting join for {}: {} -> {}", target, current, OrchestrationState::ProxyStarting);
        let state = self.drive(target, &token).await;
        let restore_degraded = self.status.borrow().restore_degraded;

        RunOutcome {
            state,
            started: true,
            restore_degraded,
        }
    }

    async fn drive(&self, target: &JoinTarget, token: &CancellationToken) -> OrchestrationState {
        let mut proxy = self.proxy.lock().await;

        if let Err(e) = proxy.start().await {
            error!("Proxy failed to start: {}", e);
            // Nothing was touched yet
            return self.transition(OrchestrationState::Failed(FailureReason::ProxyStartFailure));
        }

        self.transition(OrchestrationState::AwaitingInterceptReady);
        let ready = tokio::select! {
            _ = token.cancelled() => None,
            ready = proxy.await_ready(self.timings.ca_wait_timeout()) => Some(ready),
        };
        let mut installations = Vec::new();
        match ready {
            Some(true) => {}
            Some(false) => {
                warn!("Proxy CA not ready after {:?}", self.timings.ca_wait_timeout());
                return self
                    .unwind(&mut **proxy, &mut installations, FailureReason::CaWaitTimeout)
                    .await;
            }
            None => {
                return self
                    .unwind(&mut **proxy, &mut installations, FailureReason::Cancelled)
                    .await;
            }
        }

        self.transition(OrchestrationState::Patching);
        if let Err(reason) = self.patch(&**proxy, &mut installations) {
            return self.unwind(&mut **proxy, &mut installations, reason).await;
        }
        if token.is_cancelled() {
            return self
                .unwind(&mut **proxy, &mut installations, FailureReason::Cancelled)
                .await;
        }

        self.transition(OrchestrationState::AwaitingLaunch);
        if let Some(launcher) = &self.launcher {
            if let Err(e) = launcher.launch(target) {
                warn!("Failed to launch client for {}: {}", target, e);
            }
        }

        if let Err(reason) = self.await_launch(token).await {
            return self.unwind(&mut **proxy, &mut installations, reason).await;
        }

        self.transition(OrchestrationState::Active);
        if self.timings.lock_join_while_active {
            self.set_join_enabled(false);
        }

        if let Err(reason) = self.await_join(token).await {
            return self.unwind(&mut **proxy, &mut installations, reason).await;
        }

        info!("Client joined {}", target);
        self.transition(OrchestrationState::Restoring);
        self.restore(&mut installations);

        self.transition(OrchestrationState::AwaitingExit);
        self.await_exit(token).await;

        if let Err(e) = proxy.stop().await {
            warn!("Failed to stop proxy: {}", e);
        }
        self.set_join_enabled(true);
        self.transition(OrchestrationState::Stopped)
    }

    /// Snapshot and patch every installation; on error the patcher has
    /// already rolled back whatever it wrote
    fn patch(
        &self,
        proxy: &dyn InterceptProxy,
        installations: &mut Vec<AppInstallation>,
    ) -> Result<(), FailureReason> {
        let ca_path = proxy.ca_cert_path();
        let ca_pem = std::fs::read_to_string(&ca_path).map_err(|e| {
            error!("Failed to read proxy CA {:?}: {}", ca_path, e);
            FailureReason::ConfigIoFailure
        })?;

        *installations = self.patcher.snapshot(&ca_pem).map_err(|e| {
            error!("Failed to snapshot client settings: {}", e);
            FailureReason::ConfigIoFailure
        })?;

        if installations.is_empty() {
            warn!("No client installations found; continuing without patching");
        }

        let overrides = ConfigOverride::proxy(&proxy.host_and_port());
        self.patcher.patch(installations, &overrides).map_err(|e| {
            error!("Failed to patch client settings: {}", e);
            FailureReason::ConfigIoFailure
        })
    }

    /// Poll until the client shows up, within the launch budget
    async fn await_launch(&self, token: &CancellationToken) -> Result<(), FailureReason> {
        let budget = self.budget(self.timings.launch_timeout());
        debug!("Waiting up to {} polls for the client to start", budget);

        for attempt in 1..=budget {
            if self.watcher.poll_async().await != ProcessSignal::Absent {
                return Ok(());
            }
            if attempt < budget && !self.wait(token, self.timings.poll_interval()).await {
                return Err(FailureReason::Cancelled);
            }
        }

        warn!("Client did not start within {:?}", self.timings.launch_timeout());
        Err(FailureReason::LaunchTimeout)
    }

    /// Poll until the crash handler appears; the target vanishing for the
    /// whole ready budget counts as a crash
    async fn await_join(&self, token: &CancellationToken) -> Result<(), FailureReason> {
        let budget = self.budget(self.timings.ready_timeout());
        let mut misses = 0;

        loop {
            if !self.wait(token, self.timings.poll_interval()).await {
                return Err(FailureReason::Cancelled);
            }

            match self.watcher.poll_async().await {
                ProcessSignal::CrashHandlerRunning => return Ok(()),
                ProcessSignal::TargetRunning => misses = 0,
                ProcessSignal::Absent => {
                    misses += 1;
                    if misses >= budget {
                        warn!("Client gone for {} consecutive polls", misses);
                        return Err(FailureReason::CrashDetected);
                    }
                }
            }
        }
    }

    /// Wait for the client process to exit; cancellation ends the wait early
    async fn await_exit(&self, token: &CancellationToken) {
        while self.watcher.observe_async().await.target_running {
            if !self.wait(token, self.timings.exit_poll_interval()).await {
                debug!("Stopped waiting for client exit");
                return;
            }
        }
    }

    /// Restore, stop the proxy, and report `reason`
    async fn unwind(
        &self,
        proxy: &mut dyn InterceptProxy,
        installations: &mut [AppInstallation],
        reason: FailureReason,
    ) -> OrchestrationState {
        self.transition(OrchestrationState::Restoring);
        self.restore(installations);

        if let Err(e) = proxy.stop().await {
            warn!("Failed to stop proxy: {}", e);
        }
        self.set_join_enabled(true);
        self.transition(OrchestrationState::Failed(reason))
    }

    fn restore(&self, installations: &mut [AppInstallation]) {
        if let Err(e) = self.patcher.restore(installations) {
            warn!("Client settings restore failed: {}", e);
            self.status.send_modify(|status| status.restore_degraded = true);
        }
    }

    /// Sleep for `duration`; false if the run was cancelled first
    async fn wait(&self, token: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Number of poll ticks that fit in `timeout`, at least one
    fn budget(&self, timeout: Duration) -> u32 {
        let interval = self.timings.poll_interval().as_millis().max(1);
        let ticks = timeout.as_millis() / interval;
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }

    fn set_join_enabled(&self, enabled: bool) {
        self.status.send_if_modified(|status| {
            let changed = status.join_enabled != enabled;
            status.join_enabled = enabled;
            changed
        });
    }

    fn transition(&self, next: OrchestrationState) -> OrchestrationState {
        self.status.send_modify(|status| {
            let current = status.state;
            debug_assert!(
                current.can_transition_to(&next),
                "illegal transition {} -> {}",
                current,
                next
            );
            if !current.can_transition_to(&next) {
                warn!("Unexpected transition {} -> {}", current, next);
            }
            info!("{} -> {}", current, next);
            status.state = next;
        });
        next
    }
}
