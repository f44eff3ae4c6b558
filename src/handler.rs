//! Lifecycle orchestration for one monitored process: start it, pump its
//! output through the timeout supervisor, kill and reap it, and report.

use crate::cancel::CancelToken;
use crate::error::MonitorError;
use crate::process::{exit_signal, LaunchSpec, ProcessHandle};
use crate::reader::{LineReader, ReadOutcome};
use crate::timeout::{Supervisor, TimeoutCause, TimeoutPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

/// Exit code reported when a killed process left no usable status.
pub const FORCED_EXIT_CODE: i32 = 127;

/// Upper bound on waiting for a killed group to drain before teardown.
const GROUP_SETTLE: Duration = Duration::from_millis(250);

/// Longest blind wait for exit once output has closed; cancellation is
/// noticed between slices.
const CLOSED_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Callbacks invoked synchronously on the monitoring thread.
pub trait OutputObserver {
    /// One line of combined output, without its line terminator.
    fn on_output_line(&mut self, _line: &str) {}

    /// A timeout fired and the process has been signalled.
    fn on_timeout(&mut self, _cause: TimeoutCause) {}

    /// The process has been reaped.
    fn on_finish(&mut self, _report: &ExitReport) {}
}

impl OutputObserver for () {}

/// Adapts a closure into a line-only observer.
pub struct OnLine<F>(pub F);

impl<F: FnMut(&str)> OutputObserver for OnLine<F> {
    fn on_output_line(&mut self, line: &str) {
        (self.0)(line)
    }
}

/// Options for `ProcessHandler::wait_for_finish`.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeouts: TimeoutPolicy,
    /// Keep every line for `captured_output()`.
    pub store_output: bool,
    /// Append every line to this file.
    pub log_file: Option<PathBuf>,
    /// Time a signalled process gets before the hard kill.
    pub kill_grace: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeouts: TimeoutPolicy::default(),
            store_output: true,
            log_file: None,
            kill_grace: Duration::from_secs(3),
        }
    }
}

/// Aggregate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    /// Output closed on its own.
    Finished,
    /// Stopped by a total or idle timeout.
    TimedOut,
    /// Stopped by cancellation.
    Killed,
    Reaped,
}

/// Final status of a monitored run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub pid: u32,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, on platforms that have them.
    pub signal: Option<i32>,
    /// Why the run was stopped early, if it was.
    pub cause: Option<TimeoutCause>,
    pub timed_out: bool,
    /// Lines delivered to observers (stored or not).
    pub lines: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    /// Whether descendants were tracked and killable.
    pub tree_tracked: bool,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.cause.is_none() && self.exit_code == Some(0)
    }

    /// A single integer status: the exit code, `128 + signal`, or
    /// `FORCED_EXIT_CODE` when nothing meaningful could be recovered.
    pub fn status_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => FORCED_EXIT_CODE,
        }
    }
}

/// Drives one process from launch to reap.
///
/// ```no_run
/// use procwatch::{LaunchSpec, ProcessHandler, TimeoutPolicy, WaitOptions};
/// use std::time::Duration;
///
/// let mut handler = ProcessHandler::new(LaunchSpec::new("make").arg("test"));
/// handler.run()?;
/// let options = WaitOptions {
///     timeouts: TimeoutPolicy::new(Some(Duration::from_secs(600)), Some(Duration::from_secs(60))),
///     ..Default::default()
/// };
/// let report = handler.wait_for_finish(&options, &mut ())?;
/// println!("exit {:?}, timed out: {}", report.exit_code, handler.is_timed_out());
/// # Ok::<(), procwatch::MonitorError>(())
/// ```
#[derive(Debug)]
pub struct ProcessHandler {
    spec: LaunchSpec,
    handle: Option<ProcessHandle>,
    state: RunState,
    output: Vec<String>,
    cause: Option<TimeoutCause>,
    started: Option<(Instant, DateTime<Utc>)>,
    report: Option<ExitReport>,
    cancel: CancelToken,
}

impl ProcessHandler {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            handle: None,
            state: RunState::NotStarted,
            output: Vec::new(),
            cause: None,
            started: None,
            report: None,
            cancel: CancelToken::new(),
        }
    }

    /// Start the process. `wait_for_finish` must be called to let it complete.
    ///
    /// May be called again once a previous run has been reaped; the
    /// captured output, timeout flag and report are reset.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        if matches!(
            self.state,
            RunState::Running | RunState::Finished | RunState::TimedOut | RunState::Killed
        ) {
            return Err(crate::error::LaunchError::AlreadyRunning.into());
        }
        // A cancel before the first run stops it as soon as it starts; only a
        // token consumed by an earlier, reaped run is replaced.
        if self.state == RunState::Reaped && self.cancel.is_cancelled() {
            self.cancel = CancelToken::new();
        }
        self.output.clear();
        self.cause = None;
        self.report = None;

        let handle = ProcessHandle::start(&self.spec)?;
        self.started = Some((Instant::now(), Utc::now()));
        self.handle = Some(handle);
        self.state = RunState::Running;
        Ok(())
    }

    /// Token that stops the current run from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Kill the process immediately, and its descendants if requested.
    /// Saves nothing and changes no state; a no-op once the process is gone.
    pub fn kill(&mut self, include_descendants: bool) -> Result<(), MonitorError> {
        let handle = self.handle.as_mut().ok_or(MonitorError::NotStarted)?;
        handle.kill(include_descendants)?;
        Ok(())
    }

    /// Kill the process and every descendant.
    pub fn kill_tree(&mut self) -> Result<(), MonitorError> {
        self.kill(true)
    }

    /// True if the last run was stopped by a total or idle timeout.
    pub fn is_timed_out(&self) -> bool {
        self.cause.is_some_and(TimeoutCause::is_timeout)
    }

    pub fn stop_cause(&self) -> Option<TimeoutCause> {
        self.cause
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }

    /// Lines captured by the last `wait_for_finish` (empty if storage was off).
    pub fn captured_output(&self) -> &[String] {
        &self.output
    }

    pub fn into_output(self) -> Vec<String> {
        self.output
    }

    /// Handle output until the process exits or a timeout fires, then reap.
    ///
    /// Calling it again after the run is reaped returns the same report.
    pub fn wait_for_finish<O: OutputObserver>(
        &mut self,
        options: &WaitOptions,
        observer: &mut O,
    ) -> Result<ExitReport, MonitorError> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }
        let (start, started_at) = self.started.ok_or(MonitorError::NotStarted)?;
        let handle = self.handle.as_mut().ok_or(MonitorError::NotStarted)?;

        let mut log = match &options.log_file {
            Some(path) => Some(open_log(path)?),
            None => None,
        };

        let mut supervisor = Supervisor::new(options.timeouts, start);
        let mut lines = 0usize;
        let mut stop = match handle.take_output() {
            Some(pipe) => {
                let mut reader = LineReader::new(pipe);
                loop {
                    if self.cancel.is_cancelled() {
                        break Some(TimeoutCause::Cancelled);
                    }
                    let now = Instant::now();
                    if let Some(cause) = supervisor.expired(now) {
                        break Some(cause);
                    }
                    let wait = supervisor.next_deadline(now);
                    tracing::trace!(?wait, "reading next line");

                    match reader.read_line(wait, &self.cancel) {
                        Ok(ReadOutcome::Line(line)) => {
                            supervisor.record_output(Instant::now());
                            lines += 1;
                            if let Some(log) = log.as_mut() {
                                if let Err(e) = writeln!(log, "{line}") {
                                    tracing::warn!(error = %e, "failed to append to log file");
                                }
                            }
                            observer.on_output_line(&line);
                            if options.store_output {
                                self.output.push(line);
                            }
                        }
                        Ok(ReadOutcome::TimedOut) | Ok(ReadOutcome::Cancelled) => continue,
                        Ok(ReadOutcome::Closed) => break None,
                        Err(e) => {
                            tracing::warn!(error = %e, pid = handle.pid(), "output stream failed, treating as closed");
                            break None;
                        }
                    }
                }
            }
            None => None,
        };
        if let Some(log) = log.as_mut() {
            let _ = log.flush();
        }

        // Output closed: the process may still be running, so deadlines and
        // cancellation keep applying until it exits.
        let mut exited = None;
        if stop.is_none() {
            self.state = RunState::Finished;
            stop = loop {
                if self.cancel.is_cancelled() {
                    break Some(TimeoutCause::Cancelled);
                }
                let now = Instant::now();
                if let Some(cause) = supervisor.expired(now) {
                    tracing::debug!(pid = handle.pid(), %cause, "output closed but process still running");
                    break Some(cause);
                }
                let slice = supervisor
                    .next_deadline(now)
                    .map_or(CLOSED_WAIT_SLICE, |d| d.min(CLOSED_WAIT_SLICE));
                if let Some(status) = handle
                    .wait_timeout(slice)
                    .map_err(|source| MonitorError::Wait { source })?
                {
                    exited = Some(status);
                    break None;
                }
            };
        }

        let status = match stop {
            Some(cause) => {
                self.state = if cause.is_timeout() {
                    RunState::TimedOut
                } else {
                    RunState::Killed
                };
                self.cause = Some(cause);
                stop_and_reap(handle, cause, &supervisor, options, observer)
            }
            None => exited,
        };

        let settle = if self.cause.is_some() {
            options.kill_grace.min(GROUP_SETTLE)
        } else {
            Duration::ZERO
        };
        handle.release_group(settle);

        let report = ExitReport {
            pid: handle.pid(),
            exit_code: status.and_then(|s| s.code()),
            signal: status.as_ref().and_then(exit_signal),
            cause: self.cause,
            timed_out: self.cause.is_some_and(TimeoutCause::is_timeout),
            lines,
            duration_ms: start.elapsed().as_millis() as u64,
            started_at,
            tree_tracked: handle.tracks_tree(),
        };
        self.state = RunState::Reaped;
        tracing::info!(
            pid = report.pid,
            exit_code = ?report.exit_code,
            signal = ?report.signal,
            cause = ?report.cause,
            lines = report.lines,
            duration_ms = report.duration_ms,
            "process finished"
        );
        observer.on_finish(&report);
        self.report = Some(report.clone());
        Ok(report)
    }
}

/// Kill path shared by timeouts and cancellation. Returns `None` when the
/// process could not be reaped even after a hard kill.
fn stop_and_reap<O: OutputObserver>(
    handle: &mut ProcessHandle,
    cause: TimeoutCause,
    supervisor: &Supervisor,
    options: &WaitOptions,
    observer: &mut O,
) -> Option<ExitStatus> {
    let policy = supervisor.policy();
    tracing::warn!(
        pid = handle.pid(),
        %cause,
        total_secs = ?policy.total.map(|d| d.as_secs_f64()),
        idle_secs = ?policy.idle.map(|d| d.as_secs_f64()),
        tree = handle.tracks_tree(),
        "stopping process"
    );
    if let Err(e) = handle.signal(crate::tree::KillMode::Soft, true) {
        tracing::warn!(error = %e, pid = handle.pid(), "kill failed, reaping anyway");
    }
    if cause.is_timeout() {
        observer.on_timeout(cause);
    }
    match handle.reap_with_grace(options.kill_grace, true) {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!(error = %e, pid = handle.pid(), "could not reap killed process");
            None
        }
    }
}

fn open_log(path: &Path) -> Result<LineWriter<File>, MonitorError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(LineWriter::new)
        .map_err(|source| MonitorError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Result of a run driven on tokio's blocking pool.
#[derive(Debug)]
pub struct MonitorOutcome {
    pub report: ExitReport,
    pub output: Vec<String>,
}

/// A monitor running in the background; cancel it or await its outcome.
#[derive(Debug)]
pub struct MonitorTask {
    cancel: CancelToken,
    join: tokio::task::JoinHandle<Result<MonitorOutcome, MonitorError>>,
}

impl MonitorTask {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<MonitorOutcome, MonitorError> {
        self.join
            .await
            .map_err(|e| MonitorError::Join(e.to_string()))?
    }
}

/// Launch and supervise `spec` on its own blocking thread, so many
/// processes can be monitored concurrently. Must be called inside a tokio
/// runtime.
pub fn spawn_monitor<O>(spec: LaunchSpec, options: WaitOptions, mut observer: O) -> MonitorTask
where
    O: OutputObserver + Send + 'static,
{
    let mut handler = ProcessHandler::new(spec);
    let cancel = handler.cancel_token();
    let join = tokio::task::spawn_blocking(move || {
        handler.run()?;
        let report = handler.wait_for_finish(&options, &mut observer)?;
        Ok(MonitorOutcome {
            report,
            output: handler.into_output(),
        })
    });
    MonitorTask { cancel, join }
}
