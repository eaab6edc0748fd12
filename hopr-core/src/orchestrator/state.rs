//! Orchestration phases and the transitions allowed between them

use std::fmt;

/// Why a run ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ProxyStartFailure,
    CaWaitTimeout,
    ConfigIoFailure,
    LaunchTimeout,
    CrashDetected,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ProxyStartFailure => "proxy failed to start",
            Self::CaWaitTimeout => "proxy CA was not ready in time",
            Self::ConfigIoFailure => "client settings could not be patched",
            Self::LaunchTimeout => "client did not start in time",
            Self::CrashDetected => "client exited before joining",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationState {
    Idle,
    ProxyStarting,
    AwaitingInterceptReady,
    Patching,
    AwaitingLaunch,
    Active,
    Restoring,
    AwaitingExit,
    Stopped,
    Failed(FailureReason),
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }

    /// True while a run owns the proxy and the client settings
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }

    /// Whether the machine may move from `self` to `next`
    pub fn can_transition_to(&self, next: &OrchestrationState) -> bool {
        use OrchestrationState::*;

        match (self, next) {
            // A new run may begin from rest
            (Idle | Stopped | Failed(_), ProxyStarting) => true,
            (ProxyStarting, AwaitingInterceptReady) => true,
            (ProxyStarting, Failed(FailureReason::ProxyStartFailure)) => true,
            (AwaitingInterceptReady, Patching) => true,
            (Patching, AwaitingLaunch) => true,
            (AwaitingLaunch, Active) => true,
            // Every in-flight phase after the proxy is up can unwind
            (AwaitingInterceptReady | Patching | AwaitingLaunch | Active, Restoring) => true,
            (Restoring, AwaitingExit) => true,
            (Restoring, Failed(reason)) => *reason != FailureReason::ProxyStartFailure,
            (AwaitingExit, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "Failed({:?})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Published on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: OrchestrationState,
    /// False while the client is active and joins are locked
    pub join_enabled: bool,
    /// Set once a restore reported an error during the current run
    pub restore_degraded: bool,
}

impl Default for StatusUpdate {
    fn default() -> Self {
        Self {
            state: OrchestrationState::Idle,
            join_enabled: true,
            restore_degraded: false,
        }
    }
}

/// What `run` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Terminal state, or the in-flight state when another run was active
    pub state: OrchestrationState,
    /// False when the call was refused because a run was already in flight
    pub started: bool,
    pub restore_degraded: bool,
}

impl RunOutcome {
    /// One-line summary for the user
    pub fn message(&self) -> String {
        if !self.started {
            return format!("A join is already in progress ({})", self.state);
        }

        let base = match self.state {
            OrchestrationState::Stopped => "Joined; proxy stopped cleanly".to_string(),
            OrchestrationState::Failed(reason) => format!("Join failed: {}", reason),
            other => format!("Run ended in {}", other),
        };

        if self.restore_degraded {
            format!("{}, but client settings restore may have failed", base)
        } else {
            base
        }
    }
}
