//! Process table polling

use crate::config::ProcessConfig;
use std::sync::{Arc, Mutex};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Classification of the process table at one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Absent,
    TargetRunning,
    CrashHandlerRunning,
}

/// Which of the watched processes were seen at one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub target_running: bool,
    pub crash_handler_running: bool,
}

impl ProcessSnapshot {
    /// The crash handler takes priority over the target
    pub fn signal(&self) -> ProcessSignal {
        if self.crash_handler_running {
            ProcessSignal::CrashHandlerRunning
        } else if self.target_running {
            ProcessSignal::TargetRunning
        } else {
            ProcessSignal::Absent
        }
    }
}

/// Source of running process names
pub trait ProcessTable: Send + Sync {
    /// Names of every process running right now
    fn process_names(&self) -> Vec<String>;
}

/// Process table backed by the operating system
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn process_names(&self) -> Vec<String> {
        let Ok(mut system) = self.system.lock() else {
            return Vec::new();
        };
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .values()
            .map(|process| process.name().to_string_lossy().into_owned())
            .collect()
    }
}

pub struct ProcessWatcher {
    table: Arc<dyn ProcessTable>,
    target: String,
    crash_handler: String,
}

impl ProcessWatcher {
    pub fn new(table: Box<dyn ProcessTable>, processes: &ProcessConfig) -> Self {
        Self {
            table: Arc::from(table),
            target: processes.target.to_lowercase(),
            crash_handler: processes.crash_handler.to_lowercase(),
        }
    }

    /// Watch the real process table
    pub fn system(processes: &ProcessConfig) -> Self {
        Self::new(Box::new(SystemProcessTable::new()), processes)
    }

    /// Read the process table fresh
    pub fn observe(&self) -> ProcessSnapshot {
        self.classify(self.table.process_names())
    }

    pub fn poll(&self) -> ProcessSignal {
        self.observe().signal()
    }

    /// Read the process table on the blocking pool
    ///
    /// A scan that panics counts as an empty table.
    pub async fn observe_async(&self) -> ProcessSnapshot {
        let table = Arc::clone(&self.table);
        match tokio::task::spawn_blocking(move || table.process_names()).await {
            Ok(names) => self.classify(names),
            Err(e) => {
                warn!("Process scan failed: {}", e);
                self.classify(Vec::new())
            }
        }
    }

    pub async fn poll_async(&self) -> ProcessSignal {
        self.observe_async().await.signal()
    }

    fn classify(&self, names: Vec<String>) -> ProcessSnapshot {
        let mut snapshot = ProcessSnapshot::default();
        for name in names {
            let name = name.to_lowercase();
            if name == self.target {
                snapshot.target_running = true;
            } else if name == self.crash_handler {
                snapshot.crash_handler_running = true;
            }
        }
        debug!("Process poll: {:?}", snapshot);
        snapshot
    }
}
