use super::{Readiness, WaitReadable};
use crate::cancel::CancelToken;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::PipeReader;
use std::os::fd::AsFd;
use std::time::Duration;

/// Without a wake pipe, cancellation is only noticed between slices.
const UNWOKEN_SLICE: Duration = Duration::from_millis(50);

/// POSIX readiness: block in `poll(2)` on the output pipe and the cancel
/// token's wake pipe.
#[derive(Debug, Default)]
pub struct PollWaiter;

fn poll_timeout(wait: Option<Duration>) -> PollTimeout {
    match wait {
        None => PollTimeout::NONE,
        Some(w) => {
            // Round up so a sub-millisecond remainder does not spin at 0ms.
            let ms = w.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

impl WaitReadable for PollWaiter {
    fn wait_readable(
        &mut self,
        pipe: &PipeReader,
        wait: Option<Duration>,
        cancel: &CancelToken,
    ) -> std::io::Result<Readiness> {
        let wake = cancel.wake_fd();
        let wait = match (wake.is_some(), wait) {
            (true, w) => w,
            (false, None) => Some(UNWOKEN_SLICE),
            (false, Some(w)) => Some(w.min(UNWOKEN_SLICE)),
        };

        let mut fds = vec![PollFd::new(pipe.as_fd(), PollFlags::POLLIN)];
        if let Some(fd) = wake {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }

        match poll(&mut fds, poll_timeout(wait)) {
            Ok(0) => return Ok(Readiness::TimedOut),
            Ok(_) => {}
            // Interrupted: let the caller re-check its deadline.
            Err(Errno::EINTR) => return Ok(Readiness::TimedOut),
            Err(e) => return Err(e.into()),
        }

        let woken = fds
            .get(1)
            .and_then(|fd| fd.revents())
            .is_some_and(|r| r.intersects(PollFlags::POLLIN));
        if woken {
            return Ok(Readiness::Cancelled);
        }

        // POLLIN, POLLHUP and POLLERR all mean a read will not block.
        let ready = fds[0].revents().is_some_and(|r| !r.is_empty());
        Ok(if ready {
            Readiness::Readable
        } else {
            Readiness::TimedOut
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(
            poll_timeout(Some(Duration::from_micros(1))),
            PollTimeout::try_from(1).unwrap()
        );
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
    }

    #[test]
    fn test_readable_after_write() {
        let (reader, mut writer) = std::io::pipe().unwrap();
        writer.write_all(b"x").unwrap();
        let readiness = PollWaiter
            .wait_readable(&reader, Some(Duration::from_secs(1)), &CancelToken::new())
            .unwrap();
        assert_eq!(readiness, Readiness::Readable);
    }

    #[test]
    fn test_readable_on_hangup() {
        let (reader, writer) = std::io::pipe().unwrap();
        drop(writer);
        let readiness = PollWaiter
            .wait_readable(&reader, Some(Duration::from_secs(1)), &CancelToken::new())
            .unwrap();
        assert_eq!(readiness, Readiness::Readable);
    }

    #[test]
    fn test_cancelled_token_wins() {
        let (reader, _writer) = std::io::pipe().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let readiness = PollWaiter.wait_readable(&reader, None, &cancel).unwrap();
        assert_eq!(readiness, Readiness::Cancelled);
    }
}
