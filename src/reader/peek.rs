use super::{Readiness, WaitReadable};
use crate::cancel::CancelToken;
use std::io::PipeReader;
use std::os::windows::io::AsRawHandle;
use std::time::{Duration, Instant};
use windows::Win32::Foundation::{ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, HANDLE};
use windows::Win32::System::Pipes::PeekNamedPipe;

/// Anonymous pipes have no readiness notification, so the pending byte count
/// is polled at this interval.
const PEEK_INTERVAL: Duration = Duration::from_millis(10);

/// Windows readiness: poll `PeekNamedPipe` until bytes are pending, the pipe
/// is broken, or the wait runs out.
#[derive(Debug, Default)]
pub struct PeekWaiter;

impl WaitReadable for PeekWaiter {
    fn wait_readable(
        &mut self,
        pipe: &PipeReader,
        wait: Option<Duration>,
        cancel: &CancelToken,
    ) -> std::io::Result<Readiness> {
        let deadline = wait.map(|w| Instant::now() + w);
        let handle = HANDLE(pipe.as_raw_handle());
        loop {
            if cancel.is_cancelled() {
                return Ok(Readiness::Cancelled);
            }

            let mut available = 0u32;
            // SAFETY: `handle` is the live read end owned by `pipe`; no buffer
            // is passed, only the available byte count is written.
            let peeked = unsafe {
                PeekNamedPipe(handle, None, 0, None, Some(&mut available as *mut u32), None)
            };
            match peeked {
                Ok(()) if available > 0 => return Ok(Readiness::Readable),
                Ok(()) => {}
                Err(e)
                    if e.code() == ERROR_BROKEN_PIPE.to_hresult()
                        || e.code() == ERROR_HANDLE_EOF.to_hresult() =>
                {
                    // The next read reports end of stream.
                    return Ok(Readiness::Readable);
                }
                Err(e) => {
                    return Err(std::io::Error::other(e));
                }
            }

            let nap = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(Readiness::TimedOut);
                    }
                    left.min(PEEK_INTERVAL)
                }
                None => PEEK_INTERVAL,
            };
            std::thread::sleep(nap);
        }
    }
}
