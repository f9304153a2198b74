//! Upgrade session state

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

/// Steps of an upgrade session
///
/// ```text
/// Init -> Flash -> ChecksumVerify <-> Retry -> RebootRequested
///      -> AwaitingReconnect -> VersionVerify -> Commit -> Complete
/// ```
///
/// `Failed` is reachable from every step; `Timeout` only from
/// `AwaitingReconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStep {
    Init,
    Flash,
    ChecksumVerify,
    Retry,
    RebootRequested,
    AwaitingReconnect,
    VersionVerify,
    Commit,
    Complete,
    Failed,
    Timeout,
}

impl UpgradeStep {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpgradeStep::Complete | UpgradeStep::Failed | UpgradeStep::Timeout
        )
    }
}

impl fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradeStep::Init => "init",
            UpgradeStep::Flash => "flash",
            UpgradeStep::ChecksumVerify => "checksum_verify",
            UpgradeStep::Retry => "retry",
            UpgradeStep::RebootRequested => "reboot_requested",
            UpgradeStep::AwaitingReconnect => "awaiting_reconnect",
            UpgradeStep::VersionVerify => "version_verify",
            UpgradeStep::Commit => "commit",
            UpgradeStep::Complete => "complete",
            UpgradeStep::Failed => "failed",
            UpgradeStep::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one orchestrator run
#[derive(Debug, Clone)]
pub struct UpgradeSession {
    pub id: Uuid,
    step: UpgradeStep,
    /// Upload attempts made so far
    attempt: u32,
    /// Boot slot the new firmware was written to
    boot_selection: Option<String>,
    pub boot_timeout: Duration,
    pub verbose: bool,
}

impl UpgradeSession {
    pub fn new(boot_timeout: Duration, verbose: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            step: UpgradeStep::Init,
            attempt: 0,
            boot_selection: None,
            boot_timeout,
            verbose,
        }
    }

    pub fn step(&self) -> UpgradeStep {
        self.step
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count a new upload attempt and return its number (1-based)
    pub fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn boot_selection(&self) -> Option<&str> {
        self.boot_selection.as_deref()
    }

    pub fn choose_boot_selection(&mut self, slot: impl Into<String>) {
        let slot = slot.into();
        debug!(session = %self.id, slot = %slot, "Boot selection chosen");
        self.boot_selection = Some(slot);
    }

    /// Move to `next`; transitions out of a terminal step are ignored
    pub fn transition(&mut self, next: UpgradeStep) {
        let slot = self.boot_selection.as_deref().unwrap_or("-");
        if self.step.is_terminal() {
            debug!(session = %self.id, from = %self.step, to = %next, "Ignoring transition after end");
            return;
        }
        if self.verbose {
            info!(session = %self.id, from = %self.step, to = %next, attempt = self.attempt, slot, "Upgrade step");
        } else {
            debug!(session = %self.id, from = %self.step, to = %next, attempt = self.attempt, slot, "Upgrade step");
        }
        self.step = next;
    }
}
