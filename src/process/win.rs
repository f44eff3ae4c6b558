use crate::tree::KillMode;
use std::process::{Child, ExitStatus};
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{OpenThread, ResumeThread, THREAD_SUSPEND_RESUME};

/// Resume a child created suspended so it could join its job first.
///
/// `Command` does not expose the primary thread handle, so the child's
/// threads are found through a Toolhelp snapshot.
pub(super) fn finish_spawn(child: &Child, grouped: bool) -> std::io::Result<()> {
    if !grouped {
        return Ok(());
    }
    let pid = child.id();
    let mut resumed = 0u32;
    // SAFETY: the snapshot and thread handles are closed before returning;
    // `entry` is a properly sized THREADENTRY32.
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0).map_err(std::io::Error::other)?;
        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        let mut more = Thread32First(snapshot, &mut entry).is_ok();
        while more {
            if entry.th32OwnerProcessID == pid {
                if let Ok(thread) = OpenThread(THREAD_SUSPEND_RESUME, false, entry.th32ThreadID) {
                    let _ = ResumeThread(thread);
                    let _ = CloseHandle(thread);
                    resumed += 1;
                }
            }
            more = Thread32Next(snapshot, &mut entry).is_ok();
        }
        let _ = CloseHandle(snapshot);
    }
    if resumed == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no threads found to resume for process {pid}"),
        ));
    }
    Ok(())
}

/// Windows has no soft signal for arbitrary console processes; both modes terminate.
pub(super) fn signal_process(child: &mut Child, _mode: KillMode) -> std::io::Result<()> {
    child.kill()
}

pub(super) fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
