//! Cross-platform process execution monitor.
//!
//! Launch a command with stdout and stderr merged into one stream, deliver
//! its output line by line, enforce a total and an idle timeout, and on
//! timeout or cancellation kill the process together with everything it
//! spawned before reporting how it ended.

pub mod cancel;
pub mod config;
pub mod error;
pub mod handler;
pub mod process;
pub mod reader;
pub mod signals;
pub mod timeout;
pub mod tree;

pub use cancel::CancelToken;
pub use config::{load_config, ConfigError, MonitorConfig};
pub use error::{GroupError, KillError, LaunchError, MonitorError, ReadError};
pub use handler::{
    spawn_monitor, ExitReport, MonitorOutcome, MonitorTask, OnLine, OutputObserver,
    ProcessHandler, RunState, WaitOptions,
};
pub use process::{LaunchSpec, ProcessHandle};
pub use reader::{LineReader, ReadOutcome};
pub use timeout::{TimeoutCause, TimeoutPolicy};
pub use tree::{GroupEvent, KillMode, Tracker};
