use crate::tree::KillMode;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};

/// Nothing to do: group membership is set up between fork and exec.
pub(super) fn finish_spawn(_child: &Child, _grouped: bool) -> std::io::Result<()> {
    Ok(())
}

/// Signal only the direct child.
pub(super) fn signal_process(child: &mut Child, mode: KillMode) -> std::io::Result<()> {
    match mode {
        KillMode::Hard => child.kill(),
        KillMode::Soft => {
            let pid = i32::try_from(child.id())
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

pub(super) fn exit_signal(status: &ExitStatus) -> Option<i32> {
    status.signal()
}
