//! Bounded-wait line reading from the combined output pipe.
//!
//! `LineReader` owns the read end of the pipe plus any partial line read so
//! far. Waiting for readiness is delegated to a platform strategy:
//! `poll(2)` on POSIX, `PeekNamedPipe` polling on Windows. Everything else
//! (buffering, line splitting, EOF handling) is shared.

#[cfg(windows)]
mod peek;
#[cfg(unix)]
mod poll;

#[cfg(windows)]
pub use peek::PeekWaiter as PlatformWaiter;
#[cfg(unix)]
pub use poll::PollWaiter as PlatformWaiter;

use crate::cancel::CancelToken;
use crate::error::ReadError;
use std::io::{PipeReader, Read};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 8192;

/// Result of one `read_line` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line, without its trailing `\n` / `\r\n`.
    Line(String),
    /// No complete line arrived within the allowed wait.
    TimedOut,
    /// The cancel token fired while waiting.
    Cancelled,
    /// End of stream: every writer has closed the pipe.
    Closed,
}

/// Readiness for the pipe, as reported by a platform waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data (or end-of-stream) is available; a read will not block.
    Readable,
    TimedOut,
    Cancelled,
}

/// Platform strategy for waiting until the pipe can be read without blocking.
pub trait WaitReadable {
    /// Wait at most `wait` (forever if `None`).
    fn wait_readable(
        &mut self,
        pipe: &PipeReader,
        wait: Option<Duration>,
        cancel: &CancelToken,
    ) -> std::io::Result<Readiness>;
}

pub struct LineReader<W = PlatformWaiter> {
    pipe: PipeReader,
    waiter: W,
    pending: Vec<u8>,
    /// Bytes of `pending` already known not to contain a newline.
    scanned: usize,
    eof: bool,
}

impl LineReader<PlatformWaiter> {
    pub fn new(pipe: PipeReader) -> Self {
        Self::with_waiter(pipe, PlatformWaiter::default())
    }
}

impl<W: WaitReadable> LineReader<W> {
    pub fn with_waiter(pipe: PipeReader, waiter: W) -> Self {
        Self {
            pipe,
            waiter,
            pending: Vec::new(),
            scanned: 0,
            eof: false,
        }
    }

    /// Read one line, waiting at most `wait` for it to complete.
    ///
    /// Partial data stays buffered on `TimedOut`/`Cancelled` and is returned
    /// with the rest of its line later. A final unterminated line is returned
    /// before `Closed`.
    pub fn read_line(
        &mut self,
        wait: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ReadOutcome, ReadError> {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            if let Some(line) = self.take_line() {
                return Ok(ReadOutcome::Line(line));
            }
            if self.eof {
                return Ok(self.take_remainder());
            }
            if cancel.is_cancelled() {
                return Ok(ReadOutcome::Cancelled);
            }

            let remaining = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(ReadOutcome::TimedOut);
                    }
                    Some(left)
                }
                None => None,
            };

            match self.waiter.wait_readable(&self.pipe, remaining, cancel)? {
                Readiness::Readable => self.fill()?,
                Readiness::Cancelled => return Ok(ReadOutcome::Cancelled),
                // Re-check the deadline; waiters may wake early.
                Readiness::TimedOut => continue,
            }
        }
    }

    fn fill(&mut self) -> Result<(), ReadError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.pipe.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    self.eof = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let offset = self.pending[self.scanned..].iter().position(|&b| b == b'\n');
        match offset {
            Some(i) => {
                let end = self.scanned + i;
                let rest = self.pending.split_off(end + 1);
                let mut line = std::mem::replace(&mut self.pending, rest);
                line.truncate(end);
                self.scanned = 0;
                Some(decode(line))
            }
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }

    fn take_remainder(&mut self) -> ReadOutcome {
        if self.pending.is_empty() {
            return ReadOutcome::Closed;
        }
        self.scanned = 0;
        ReadOutcome::Line(decode(std::mem::take(&mut self.pending)))
    }
}

fn decode(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
