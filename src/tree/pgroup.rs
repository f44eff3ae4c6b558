use super::{GroupCapability, GroupEvent, KillMode};
use crate::error::{GroupError, KillError};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

const EMPTY_PROBE_INTERVAL: Duration = Duration::from_millis(25);

/// A POSIX process group led by the monitored child.
///
/// The child calls `setpgid(0, 0)` between fork and exec (via
/// `process_group(0)`), so every descendant inherits the group unless it
/// explicitly leaves it.
#[derive(Debug, Default)]
pub struct ProcessGroup {
    pgid: Option<Pid>,
    torn_down: bool,
}

impl ProcessGroup {
    fn live_pgid(&self) -> Option<Pid> {
        if self.torn_down {
            None
        } else {
            self.pgid
        }
    }

    /// Signal 0 probe: `ESRCH` means no process is left in the group.
    fn is_empty(&self) -> bool {
        match self.live_pgid() {
            Some(pgid) => matches!(killpg(pgid, None::<Signal>), Err(Errno::ESRCH)),
            None => true,
        }
    }
}

impl GroupCapability for ProcessGroup {
    fn create() -> Result<Self, GroupError> {
        Ok(Self::default())
    }

    fn prepare(&self, command: &mut Command) {
        command.process_group(0);
    }

    fn associate(&mut self, child: &Child) -> Result<(), GroupError> {
        let pid = i32::try_from(child.id()).map_err(|_| GroupError::Associate {
            pid: child.id(),
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;
        self.pgid = Some(Pid::from_raw(pid));
        tracing::debug!(pgid = pid, "tracking process group");
        Ok(())
    }

    fn kill(&self, mode: KillMode) -> Result<(), KillError> {
        let Some(pgid) = self.live_pgid() else {
            return Ok(());
        };
        let signal = match mode {
            KillMode::Soft => Signal::SIGTERM,
            KillMode::Hard => Signal::SIGKILL,
        };
        match killpg(pgid, signal) {
            Ok(()) => {
                tracing::debug!(pgid = pgid.as_raw(), ?signal, "signalled process group");
                Ok(())
            }
            // Everyone already gone.
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(KillError::Group {
                source: std::io::Error::from(e),
            }),
        }
    }

    fn drain_events(&mut self) -> Vec<GroupEvent> {
        if self.pgid.is_some() && self.is_empty() {
            vec![GroupEvent::GroupEmpty]
        } else {
            Vec::new()
        }
    }

    fn wait_empty(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EMPTY_PROBE_INTERVAL);
        }
    }

    fn teardown(&mut self) {
        self.torn_down = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_in_group(group: &mut ProcessGroup, script: &str) -> Child {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        group.prepare(&mut cmd);
        let child = cmd.spawn().unwrap();
        group.associate(&child).unwrap();
        child
    }

    #[test]
    fn test_kill_before_association_is_noop() {
        let group = ProcessGroup::create().unwrap();
        group.kill(KillMode::Hard).unwrap();
    }

    #[test]
    fn test_kill_terminates_group_members() {
        let mut group = ProcessGroup::create().unwrap();
        let mut child = spawn_in_group(&mut group, "sleep 30 & sleep 30; wait");

        group.kill(KillMode::Hard).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_kill_is_idempotent_after_exit() {
        let mut group = ProcessGroup::create().unwrap();
        let mut child = spawn_in_group(&mut group, "exit 0");
        child.wait().unwrap();

        group.kill(KillMode::Hard).unwrap();
        group.kill(KillMode::Hard).unwrap();
        assert!(group.wait_empty(Duration::from_secs(5)));
        assert_eq!(group.drain_events(), vec![GroupEvent::GroupEmpty]);
    }

    #[test]
    fn test_teardown_disables_kill() {
        let mut group = ProcessGroup::create().unwrap();
        let mut child = spawn_in_group(&mut group, "sleep 1");
        group.teardown();
        group.kill(KillMode::Hard).unwrap();
        assert!(child.wait().unwrap().success());
    }
}
