//! Process handle: spawn the monitored child with stdout and stderr merged
//! into one pipe, kill it (optionally with its whole tree), and reap it.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use win as sys;

use crate::error::{KillError, LaunchError};
use crate::tree::{KillMode, Tracker};
use std::ffi::{OsStr, OsString};
use std::io::PipeReader;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// How long `Drop` waits for a killed, unreaped process.
const DROP_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, Option<OsString>)>,
    env_clear: bool,
    track_tree: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            env_clear: false,
            track_tree: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set one environment variable for the child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), Some(value.into())));
        self
    }

    /// Remove one inherited environment variable.
    pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
        self.env.push((key.into(), None));
        self
    }

    /// Start from an empty environment instead of inheriting ours.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Track and kill descendants (default). When off, kills reach only the
    /// direct child.
    pub fn track_tree(mut self, enabled: bool) -> Self {
        self.track_tree = enabled;
        self
    }

    pub fn get_program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }

    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        if self.env_clear {
            cmd.env_clear();
        }
        for (key, value) in &self.env {
            match value {
                Some(v) => cmd.env(key, v),
                None => cmd.env_remove(key),
            };
        }
        cmd
    }
}

/// A running (or reaped) monitored process and its tree tracker.
///
/// The native handle is owned here and released once, when the handle is
/// dropped. Dropping a handle that was never reaped kills its tree first.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    tracker: Tracker,
    output: Option<PipeReader>,
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`.
    pub fn start(spec: &LaunchSpec) -> Result<Self, LaunchError> {
        let (reader, writer) = std::io::pipe().map_err(|source| LaunchError::Pipe { source })?;
        let writer_err = writer
            .try_clone()
            .map_err(|source| LaunchError::Pipe { source })?;

        let mut tracker = if spec.track_tree {
            Tracker::create()
        } else {
            Tracker::disabled()
        };

        let mut cmd = spec.build_command();
        cmd.stdout(Stdio::from(writer)).stderr(Stdio::from(writer_err));
        let grouped = tracker.is_tree();
        tracker.prepare(&mut cmd);

        tracing::info!(
            program = %spec.program.display(),
            args = ?spec.args,
            cwd = ?spec.cwd,
            "spawning process"
        );
        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        // Our copies of the write end must go, or the stream never closes.
        drop(cmd);

        tracker.associate(&child);
        let mut handle = Self {
            child,
            tracker,
            output: Some(reader),
            status: None,
        };
        if let Err(source) = sys::finish_spawn(&handle.child, grouped) {
            let _ = handle.kill(true);
            let _ = handle.wait();
            return Err(LaunchError::Spawn {
                program: spec.program.clone(),
                source,
            });
        }

        tracing::info!(
            pid = handle.pid(),
            tree = handle.tracker.is_tree(),
            "process started"
        );
        Ok(handle)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Take the read end of the combined output pipe. Only the first call
    /// returns it.
    pub fn take_output(&mut self) -> Option<PipeReader> {
        self.output.take()
    }

    /// Whether kills reach descendants on this platform and run.
    pub fn tracks_tree(&self) -> bool {
        self.tracker.is_tree()
    }

    pub fn tracker_mut(&mut self) -> &mut Tracker {
        &mut self.tracker
    }

    /// Exit status, once reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Forcefully kill the process, and its descendants if requested.
    ///
    /// Killing an exited or already-killed process is a no-op.
    pub fn kill(&mut self, include_descendants: bool) -> Result<(), KillError> {
        self.signal(KillMode::Hard, include_descendants)
    }

    /// Deliver `mode` to the process or its tree.
    pub fn signal(&mut self, mode: KillMode, include_descendants: bool) -> Result<(), KillError> {
        if self.status.is_some() {
            // Reaped: the pid may already belong to someone else.
            return Ok(());
        }
        if include_descendants && self.tracker.kill(mode)? {
            return Ok(());
        }
        let pid = self.pid();
        match sys::signal_process(&mut self.child, mode) {
            Ok(()) => Ok(()),
            Err(_) if matches!(self.child.try_wait(), Ok(Some(_))) => Ok(()),
            Err(source) => Err(KillError::Process { pid, source }),
        }
    }

    /// Non-blocking reap.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.record_exit(status);
        }
        Ok(status)
    }

    /// Block this thread until the process exits.
    pub fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.record_exit(Some(status));
        Ok(status)
    }

    /// Wait at most `timeout` for the process to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = ChildExt::wait_timeout(&mut self.child, timeout)?;
        self.record_exit(status);
        Ok(status)
    }

    /// Stop the process: soft signal, `grace` to comply, then a hard kill.
    pub fn terminate(&mut self, grace: Duration, include_descendants: bool) -> std::io::Result<ExitStatus> {
        if self.try_wait()?.is_none() {
            if let Err(e) = self.signal(KillMode::Soft, include_descendants) {
                tracing::warn!(error = %e, pid = self.pid(), "soft kill failed");
            }
        }
        self.reap_with_grace(grace, include_descendants)
    }

    /// Reap a process that has already been asked to stop.
    ///
    /// Waits up to `grace`, then escalates to a hard kill. Kill failures are
    /// logged rather than returned so the reap always runs; only a process
    /// that survives the hard kill for another `grace` yields an error.
    pub fn reap_with_grace(&mut self, grace: Duration, include_descendants: bool) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.wait_timeout(grace)? {
            self.sweep(include_descendants);
            return Ok(status);
        }

        tracing::warn!(
            pid = self.pid(),
            grace_ms = grace.as_millis() as u64,
            "process did not exit after soft kill, escalating"
        );
        if let Err(e) = self.signal(KillMode::Hard, include_descendants) {
            tracing::warn!(error = %e, pid = self.pid(), "hard kill failed");
        }
        match self.wait_timeout(grace)? {
            Some(status) => {
                self.sweep(include_descendants);
                Ok(status)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("process {} survived a hard kill", self.pid()),
            )),
        }
    }

    /// After the leader is reaped, hard-kill any stragglers left in its group.
    fn sweep(&mut self, include_descendants: bool) {
        if !include_descendants || !self.tracker.is_tree() {
            return;
        }
        if let Err(e) = self.tracker.kill(KillMode::Hard) {
            tracing::warn!(error = %e, "failed to sweep remaining group members");
        }
    }

    /// Drop the group once the process is reaped. Later kills become no-ops.
    pub fn release_group(&mut self, settle: Duration) {
        if self.tracker.is_tree() && !self.tracker.wait_empty(settle) {
            tracing::debug!(pid = self.pid(), "process group not yet empty at teardown");
        }
        self.tracker.report_events();
        self.tracker.teardown();
    }

    fn record_exit(&mut self, status: Option<ExitStatus>) {
        if let Some(status) = status {
            tracing::debug!(pid = self.pid(), ?status, "process reaped");
            self.status = Some(status);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.kill(true);
            let _ = self.wait_timeout(DROP_REAP_TIMEOUT);
        }
        self.tracker.teardown();
    }
}

/// Signal number that terminated the process, where the platform has one.
pub fn exit_signal(status: &ExitStatus) -> Option<i32> {
    sys::exit_signal(status)
}
