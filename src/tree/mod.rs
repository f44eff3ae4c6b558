//! Process-tree tracking: "this process and everything it spawns".
//!
//! Each platform provides one `GroupCapability` implementation, picked at
//! build time:
//! - POSIX: a process group created at spawn (`setpgid`), killed with
//!   `killpg`. No asynchronous notification; emptiness is probed.
//! - Windows: a Job Object bound to an I/O completion port, with a listener
//!   thread forwarding job messages over a channel.
//!
//! `Tracker` wraps the capability and falls back to `Degraded` (kill only the
//! tracked process) whenever the group cannot be created or populated.

#[cfg(windows)]
mod job;
#[cfg(unix)]
mod pgroup;

#[cfg(windows)]
pub use job::JobGroup as PlatformGroup;
#[cfg(unix)]
pub use pgroup::ProcessGroup as PlatformGroup;

use crate::error::{GroupError, KillError};
use std::process::{Child, Command};
use std::time::Duration;

/// Notification about group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    ProcessAdded(u32),
    ProcessExited { pid: u32, abnormal: bool },
    /// No processes remain in the group. The only authoritative completion signal.
    GroupEmpty,
}

/// How hard to hit the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Ask politely (SIGTERM). Platforms without a soft signal treat it as `Hard`.
    Soft,
    /// Force termination (SIGKILL / TerminateJobObject).
    Hard,
}

pub trait GroupCapability: Sized {
    /// Build the group before the target process exists.
    fn create() -> Result<Self, GroupError>;

    /// Configure `command` so the child joins the group before running user code.
    fn prepare(&self, command: &mut Command);

    /// Finish association once the child exists.
    fn associate(&mut self, child: &Child) -> Result<(), GroupError>;

    /// Terminate every member. A no-op for an empty or torn-down group.
    fn kill(&self, mode: KillMode) -> Result<(), KillError>;

    /// Pending membership notifications, oldest first.
    fn drain_events(&mut self) -> Vec<GroupEvent>;

    /// Wait up to `timeout` for the group to become empty.
    fn wait_empty(&mut self, timeout: Duration) -> bool;

    /// Release the group. Later kills are no-ops.
    fn teardown(&mut self);
}

/// The group capability, or its degraded single-process fallback.
#[derive(Debug)]
pub enum Tracker<G = PlatformGroup> {
    Group(G),
    Degraded,
}

impl<G: GroupCapability> Tracker<G> {
    /// Create the group, or degrade if the platform refuses.
    pub fn create() -> Self {
        match G::create() {
            Ok(group) => Tracker::Group(group),
            Err(e) => {
                tracing::warn!(error = %e, "process group unavailable, descendants will not be killed");
                Tracker::Degraded
            }
        }
    }

    /// An explicitly degraded tracker (tree tracking disabled by the caller).
    pub fn disabled() -> Self {
        Tracker::Degraded
    }

    /// True when kills reach descendants.
    pub fn is_tree(&self) -> bool {
        matches!(self, Tracker::Group(_))
    }

    pub fn prepare(&self, command: &mut Command) {
        if let Tracker::Group(group) = self {
            group.prepare(command);
        }
    }

    /// Associate the spawned child, degrading on failure.
    pub fn associate(&mut self, child: &Child) {
        if let Tracker::Group(group) = self {
            if let Err(e) = group.associate(child) {
                tracing::warn!(error = %e, pid = child.id(), "could not track process tree, falling back to single-process kill");
                group.teardown();
                *self = Tracker::Degraded;
            }
        }
    }

    /// Kill the whole group. Returns `Ok(false)` in degraded mode, where the
    /// caller must kill the single process itself.
    pub fn kill(&self, mode: KillMode) -> Result<bool, KillError> {
        match self {
            Tracker::Group(group) => group.kill(mode).map(|()| true),
            Tracker::Degraded => Ok(false),
        }
    }

    /// Log pending membership events; abnormal exits are surfaced as warnings.
    pub fn report_events(&mut self) -> Vec<GroupEvent> {
        let events = match self {
            Tracker::Group(group) => group.drain_events(),
            Tracker::Degraded => Vec::new(),
        };
        for event in &events {
            match event {
                GroupEvent::ProcessExited { pid, abnormal: true } => {
                    tracing::warn!(pid, "process in group exited abnormally");
                }
                other => tracing::debug!(event = ?other, "group event"),
            }
        }
        events
    }

    /// Wait for the group to drain. Degraded trackers have nothing to wait for.
    pub fn wait_empty(&mut self, timeout: Duration) -> bool {
        match self {
            Tracker::Group(group) => group.wait_empty(timeout),
            Tracker::Degraded => true,
        }
    }

    pub fn teardown(&mut self) {
        if let Tracker::Group(group) = self {
            group.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Records calls without touching the OS.
    #[derive(Debug, Default)]
    struct FakeGroup {
        fail_associate: bool,
        kills: Cell<u32>,
        torn_down: bool,
    }

    impl GroupCapability for FakeGroup {
        fn create() -> Result<Self, GroupError> {
            Ok(Self::default())
        }
        fn prepare(&self, _command: &mut Command) {}
        fn associate(&mut self, child: &Child) -> Result<(), GroupError> {
            if self.fail_associate {
                return Err(GroupError::Associate {
                    pid: child.id(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            Ok(())
        }
        fn kill(&self, _mode: KillMode) -> Result<(), KillError> {
            if !self.torn_down {
                self.kills.set(self.kills.get() + 1);
            }
            Ok(())
        }
        fn drain_events(&mut self) -> Vec<GroupEvent> {
            vec![GroupEvent::ProcessExited { pid: 7, abnormal: true }, GroupEvent::GroupEmpty]
        }
        fn wait_empty(&mut self, _timeout: Duration) -> bool {
            true
        }
        fn teardown(&mut self) {
            self.torn_down = true;
        }
    }

    struct FailingGroup;

    impl GroupCapability for FailingGroup {
        fn create() -> Result<Self, GroupError> {
            Err(GroupError::Create {
                source: std::io::Error::from(std::io::ErrorKind::Unsupported),
            })
        }
        fn prepare(&self, _command: &mut Command) {}
        fn associate(&mut self, _child: &Child) -> Result<(), GroupError> {
            Ok(())
        }
        fn kill(&self, _mode: KillMode) -> Result<(), KillError> {
            Ok(())
        }
        fn drain_events(&mut self) -> Vec<GroupEvent> {
            Vec::new()
        }
        fn wait_empty(&mut self, _timeout: Duration) -> bool {
            true
        }
        fn teardown(&mut self) {}
    }

    #[test]
    fn test_creation_failure_degrades() {
        let tracker = Tracker::<FailingGroup>::create();
        assert!(!tracker.is_tree());
        assert!(!tracker.kill(KillMode::Hard).unwrap());
    }

    #[test]
    fn test_group_kill_reports_tree() {
        let tracker = Tracker::<FakeGroup>::create();
        assert!(tracker.is_tree());
        assert!(tracker.kill(KillMode::Soft).unwrap());
        match &tracker {
            Tracker::Group(g) => assert_eq!(g.kills.get(), 1),
            Tracker::Degraded => panic!("expected group"),
        }
    }

    #[test]
    fn test_report_events_passes_through() {
        let mut tracker = Tracker::Group(FakeGroup::default());
        let events = tracker.report_events();
        assert_eq!(events.last(), Some(&GroupEvent::GroupEmpty));
        assert!(Tracker::<FakeGroup>::disabled().report_events().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_associate_failure_degrades() {
        let mut child = Command::new("true").spawn().unwrap();
        let mut tracker = Tracker::Group(FakeGroup {
            fail_associate: true,
            ..Default::default()
        });
        tracker.associate(&child);
        assert!(!tracker.is_tree());
        child.wait().unwrap();
    }
}
