use super::{GroupCapability, GroupEvent, KillMode};
use crate::error::{GroupError, KillError};
use std::ffi::c_void;
use std::os::windows::io::AsRawHandle;
use std::os::windows::process::CommandExt;
use std::process::{Child, Command};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectAssociateCompletionPortInformation,
    SetInformationJobObject, TerminateJobObject, JOBOBJECT_ASSOCIATE_COMPLETION_PORT,
};
use windows::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_SUSPENDED, INFINITE};

/// Completion keys posted to the port.
const COMPKEY_JOB: usize = 1;
const COMPKEY_TERMINATE: usize = 2;

/// Job object message ids delivered through the completion port.
const MSG_ACTIVE_PROCESS_ZERO: u32 = 4;
const MSG_NEW_PROCESS: u32 = 6;
const MSG_EXIT_PROCESS: u32 = 7;
const MSG_ABNORMAL_EXIT_PROCESS: u32 = 8;

/// Exit code given to every process in the job when it is terminated.
pub const KILLED_EXIT_CODE: u32 = 127;

/// Raw kernel handle that can cross threads.
#[derive(Debug, Clone, Copy)]
struct SendHandle(HANDLE);

// SAFETY: Windows HANDLEs are opaque kernel object references usable from any thread.
unsafe impl Send for SendHandle {}

/// A Job Object with an attached I/O completion port.
///
/// Processes are created suspended, assigned to the job, then resumed, so
/// nothing the child spawns can escape. A listener thread drains the port
/// and forwards `GroupEvent`s over a channel; it stops on `GroupEmpty`, on a
/// port error, or when the job is torn down.
#[derive(Debug)]
pub struct JobGroup {
    job: SendHandle,
    port: SendHandle,
    events: Option<Receiver<GroupEvent>>,
    listener: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl JobGroup {
    fn spawn_listener(&mut self) {
        let (tx, rx) = mpsc::channel();
        let port = self.port;
        let spawned = std::thread::Builder::new()
            .name("procwatch-job-listener".to_string())
            .spawn(move || listen(port, tx));
        match spawned {
            Ok(handle) => {
                self.listener = Some(handle);
                self.events = Some(rx);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to start job listener, group events unavailable");
            }
        }
    }
}

fn listen(port: SendHandle, tx: Sender<GroupEvent>) {
    loop {
        let mut message = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        // SAFETY: all out-pointers reference live locals; the port stays open
        // until teardown joins this thread.
        let status = unsafe {
            GetQueuedCompletionStatus(port.0, &mut message, &mut key, &mut overlapped, INFINITE)
        };
        if let Err(e) = status {
            if overlapped.is_null() {
                tracing::warn!(error = %e, "job completion port failed, stopping listener");
                break;
            }
            continue;
        }
        if key == COMPKEY_TERMINATE {
            break;
        }
        if key != COMPKEY_JOB {
            continue;
        }

        // For job messages the overlapped slot carries the process id. Only
        // used for diagnostics; `GroupEmpty` is what callers act on.
        let pid = overlapped as usize as u32;
        let event = match message {
            MSG_ACTIVE_PROCESS_ZERO => GroupEvent::GroupEmpty,
            MSG_NEW_PROCESS => GroupEvent::ProcessAdded(pid),
            MSG_EXIT_PROCESS => GroupEvent::ProcessExited {
                pid,
                abnormal: false,
            },
            MSG_ABNORMAL_EXIT_PROCESS => GroupEvent::ProcessExited {
                pid,
                abnormal: true,
            },
            _ => continue,
        };
        let empty = event == GroupEvent::GroupEmpty;
        if tx.send(event).is_err() || empty {
            break;
        }
    }
    tracing::debug!("job listener exiting");
}

impl GroupCapability for JobGroup {
    fn create() -> Result<Self, GroupError> {
        // SAFETY: plain handle-creating calls; every handle is closed on the
        // error paths below or in teardown.
        unsafe {
            let job = CreateJobObjectW(None, PCWSTR::null())
                .map_err(|e| GroupError::Create { source: std::io::Error::other(e) })?;
            let port = match CreateIoCompletionPort(INVALID_HANDLE_VALUE, None, 0, 1) {
                Ok(port) => port,
                Err(e) => {
                    let _ = CloseHandle(job);
                    return Err(GroupError::Create { source: std::io::Error::other(e) });
                }
            };
            let association = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
                CompletionKey: COMPKEY_JOB as *mut c_void,
                CompletionPort: port,
            };
            if let Err(e) = SetInformationJobObject(
                job,
                JobObjectAssociateCompletionPortInformation,
                (&raw const association).cast(),
                std::mem::size_of::<JOBOBJECT_ASSOCIATE_COMPLETION_PORT>() as u32,
            ) {
                let _ = CloseHandle(port);
                let _ = CloseHandle(job);
                return Err(GroupError::Create { source: std::io::Error::other(e) });
            }
            Ok(Self {
                job: SendHandle(job),
                port: SendHandle(port),
                events: None,
                listener: None,
                torn_down: false,
            })
        }
    }

    fn prepare(&self, command: &mut Command) {
        command.creation_flags(CREATE_SUSPENDED.0 | CREATE_NEW_PROCESS_GROUP.0);
    }

    fn associate(&mut self, child: &Child) -> Result<(), GroupError> {
        // SAFETY: the child's handle is owned by `child` and outlives this call.
        unsafe { AssignProcessToJobObject(self.job.0, HANDLE(child.as_raw_handle())) }.map_err(
            |e| GroupError::Associate {
                pid: child.id(),
                source: std::io::Error::other(e),
            },
        )?;
        self.spawn_listener();
        tracing::debug!(pid = child.id(), "process assigned to job object");
        Ok(())
    }

    fn kill(&self, _mode: KillMode) -> Result<(), KillError> {
        if self.torn_down {
            return Ok(());
        }
        // SAFETY: the job handle is open until teardown. Terminating an empty
        // job succeeds.
        unsafe { TerminateJobObject(self.job.0, KILLED_EXIT_CODE) }
            .map_err(|e| KillError::Group { source: std::io::Error::other(e) })
    }

    fn drain_events(&mut self) -> Vec<GroupEvent> {
        match &self.events {
            Some(rx) => rx.try_iter().collect(),
            None => Vec::new(),
        }
    }

    fn wait_empty(&mut self, timeout: Duration) -> bool {
        let Some(rx) = &self.events else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(GroupEvent::GroupEmpty) => return true,
                Ok(GroupEvent::ProcessExited { pid, abnormal: true }) => {
                    tracing::warn!(pid, "process in job exited abnormally");
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return false,
                // Listener gone: it has already reported GroupEmpty or failed.
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(listener) = self.listener.take() {
            // SAFETY: the port is still open; the listener exits on this key.
            let posted = unsafe { PostQueuedCompletionStatus(self.port.0, 0, COMPKEY_TERMINATE, None) };
            if posted.is_ok() {
                let _ = listener.join();
            }
        }
        self.events = None;
        // SAFETY: both handles were created in `create` and are closed exactly once here.
        unsafe {
            let _ = CloseHandle(self.port.0);
            let _ = CloseHandle(self.job.0);
        }
    }
}

impl Drop for JobGroup {
    fn drop(&mut self) {
        self.teardown();
    }
}
