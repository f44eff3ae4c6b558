//! Error types for launching, reading from, and terminating monitored processes.

use std::path::PathBuf;

/// Failure to launch the child process. Always fatal for the run.
#[derive(Debug)]
pub enum LaunchError {
    /// The combined stdout/stderr pipe could not be created.
    Pipe { source: std::io::Error },
    /// The OS refused to create the process (missing binary, permissions, ...).
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// A handler was asked to start while a process was still running.
    AlreadyRunning,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Pipe { source } => {
                write!(f, "failed to create output pipe: {}", source)
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program.display(), source)
            }
            LaunchError::AlreadyRunning => write!(f, "process is already running"),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Pipe { source } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::AlreadyRunning => None,
        }
    }
}

/// Failure while reading the combined output stream.
#[derive(Debug)]
pub struct ReadError {
    pub source: std::io::Error,
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to read process output: {}", self.source)
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<std::io::Error> for ReadError {
    fn from(source: std::io::Error) -> Self {
        ReadError { source }
    }
}

/// Failure of a platform kill primitive. "Already exited" never produces one.
#[derive(Debug)]
pub enum KillError {
    /// Signalling or terminating a single process failed.
    Process { pid: u32, source: std::io::Error },
    /// Terminating the process group / job failed.
    Group { source: std::io::Error },
}

impl std::fmt::Display for KillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillError::Process { pid, source } => {
                write!(f, "failed to kill process {}: {}", pid, source)
            }
            KillError::Group { source } => {
                write!(f, "failed to kill process group: {}", source)
            }
        }
    }
}

impl std::error::Error for KillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KillError::Process { source, .. } => Some(source),
            KillError::Group { source } => Some(source),
        }
    }
}

/// Failure to create or populate a process group. Never fatal: the tracker
/// degrades to single-process kill.
#[derive(Debug)]
pub enum GroupError {
    Create { source: std::io::Error },
    Associate { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupError::Create { source } => {
                write!(f, "failed to create process group: {}", source)
            }
            GroupError::Associate { pid, source } => {
                write!(f, "failed to add process {} to group: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for GroupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GroupError::Create { source } => Some(source),
            GroupError::Associate { source, .. } => Some(source),
        }
    }
}

/// Errors surfaced by the lifecycle orchestrator.
#[derive(Debug)]
pub enum MonitorError {
    /// `wait_for_finish` or `kill` was called before `run`.
    NotStarted,
    Launch(LaunchError),
    /// The configured log file could not be opened for appending.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Waiting for the process exit status failed.
    Wait { source: std::io::Error },
    Kill(KillError),
    /// The background monitor task panicked or was aborted.
    Join(String),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::NotStarted => write!(f, "process has not been started"),
            MonitorError::Launch(e) => write!(f, "{}", e),
            MonitorError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            MonitorError::Wait { source } => {
                write!(f, "failed to wait for process exit: {}", source)
            }
            MonitorError::Kill(e) => write!(f, "{}", e),
            MonitorError::Join(msg) => write!(f, "monitor task failed: {}", msg),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Launch(e) => Some(e),
            MonitorError::LogFile { source, .. } => Some(source),
            MonitorError::Wait { source } => Some(source),
            MonitorError::Kill(e) => Some(e),
            MonitorError::NotStarted | MonitorError::Join(_) => None,
        }
    }
}

impl From<LaunchError> for MonitorError {
    fn from(e: LaunchError) -> Self {
        MonitorError::Launch(e)
    }
}

impl From<KillError> for MonitorError {
    fn from(e: KillError) -> Self {
        MonitorError::Kill(e)
    }
}
