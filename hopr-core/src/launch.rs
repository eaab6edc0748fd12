//! Launching the client into a place

use std::io;
use std::process::{Command, Stdio};
use tracing::info;

/// The place a run joins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinTarget {
    pub place_id: u64,
}

impl JoinTarget {
    pub fn new(place_id: u64) -> Self {
        Self { place_id }
    }

    /// Deep link that asks the client to join this place
    pub fn deep_link(&self) -> String {
        format!("roblox://experiences/start?placeId={}", self.place_id)
    }
}

impl std::fmt::Display for JoinTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "place {}", self.place_id)
    }
}

/// Starts the client for a target
pub trait Launcher: Send + Sync {
    fn launch(&self, target: &JoinTarget) -> io::Result<()>;
}

/// Hands the deep link to the platform's URL opener
#[derive(Debug, Default, Clone, Copy)]
pub struct DeepLinkLauncher;

impl DeepLinkLauncher {
    fn opener(url: &str) -> Command {
        if cfg!(target_os = "windows") {
            let mut command = Command::new("cmd");
            // Empty title argument, so start does not treat the URL as one
            command.args(["/C", "start", "", url]);
            command
        } else if cfg!(target_os = "macos") {
            let mut command = Command::new("open");
            command.arg(url);
            command
        } else {
            let mut command = Command::new("xdg-open");
            command.arg(url);
            command
        }
    }
}

impl Launcher for DeepLinkLauncher {
    fn launch(&self, target: &JoinTarget) -> io::Result<()> {
        let url = target.deep_link();
        info!("Opening {}", url);
        Self::opener(&url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}
