//! Self-pipe used to force a blocked kernel poll call to return.
//!
//! Ported from `PipeWrapper`: a pipe pair whose read end is registered with
//! the reactor's kernel poller and whose write end any thread can write a
//! single byte to in order to interrupt `poll`/`epoll_wait`. The read end
//! is non-blocking and must be fully drained on each wakeup (loop until
//! `EAGAIN`) since edge-triggered pollers only report the transition. On
//! EOF or any non-retryable read error, the pipe pair itself is assumed
//! broken and is recreated in place rather than leaving the reactor with a
//! dead wakeup path for the rest of its life.
use std::cell::Cell;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{close, pipe, read, write};
use snafu::{ResultExt, Snafu};

use crate::error::{CoreError, ErrorCode};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create wakeup pipe: {}", source))]
    Create { source: nix::Error },
    #[snafu(display("failed to set pipe flags: {}", source))]
    SetFlags { source: nix::Error },
    #[snafu(display("failed to write to wakeup pipe: {}", source))]
    Write { source: nix::Error },
}

impl CoreError for Error {
    fn code(&self) -> ErrorCode {
        ErrorCode::Creation
    }
}

/// Outcome of a [`WakeupChannel::drain`] call. `Recreated` carries the old
/// and new read fd so the caller can re-register the new one with its
/// poller and drop the stale registration for the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    Recreated { old_read_fd: RawFd, new_read_fd: RawFd },
}

/// A duplex wakeup channel. `read_fd()` is attached to the reactor's
/// poller; `notify()` may be called from any thread.
pub struct WakeupChannel {
    read_fd: Cell<RawFd>,
    write_fd: Cell<RawFd>,
}

impl WakeupChannel {
    pub fn new() -> Result<Self, Error> {
        let (read_fd, write_fd) = Self::make_pipe()?;
        Ok(WakeupChannel {
            read_fd: Cell::new(read_fd),
            write_fd: Cell::new(write_fd),
        })
    }

    fn make_pipe() -> Result<(RawFd, RawFd), Error> {
        let (read_fd, write_fd) = pipe().context(CreateSnafu)?;
        set_nonblocking(read_fd)?;
        Ok((read_fd, write_fd))
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd.get()
    }

    /// Wakes up whatever is blocked in a `wait()` call on this channel's
    /// read end. Safe to call many times without an intervening drain;
    /// excess bytes are simply coalesced by the next `drain()`.
    pub fn notify(&self) -> Result<(), Error> {
        loop {
            match write(self.write_fd.get(), &[1u8]) {
                Ok(_) => return Ok(()),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                // The pipe is a pure event source; if the kernel buffer is
                // already full, a wakeup is already pending.
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(()),
                Err(e) => return Err(Error::Write { source: e }),
            }
        }
    }

    /// Drains every byte currently buffered on the read end. Call this
    /// once the poller reports the read end as readable, before consuming
    /// the task queue, so a `notify()` racing with the drain is never
    /// lost (it will simply produce one more readable byte next time).
    ///
    /// On EOF or a non-retryable read error the pipe pair is recreated in
    /// place; the caller must re-register the returned new fd with its
    /// poller and drop the old one.
    pub fn drain(&self) -> DrainOutcome {
        let mut buf = [0u8; 256];
        loop {
            match read(self.read_fd.get(), &mut buf) {
                Ok(0) => return self.recreate(),
                Ok(_) => continue,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => return DrainOutcome::Drained,
                Err(e) => {
                    warn!(error = %e, "wakeup channel read failed, recreating pipe");
                    return self.recreate();
                }
            }
        }
    }

    fn recreate(&self) -> DrainOutcome {
        let old_read_fd = self.read_fd.get();
        let old_write_fd = self.write_fd.get();
        match Self::make_pipe() {
            Ok((new_read_fd, new_write_fd)) => {
                self.read_fd.set(new_read_fd);
                self.write_fd.set(new_write_fd);
                let _ = close(old_read_fd);
                let _ = close(old_write_fd);
                DrainOutcome::Recreated {
                    old_read_fd,
                    new_read_fd,
                }
            }
            Err(e) => {
                error!(error = %e, "failed to recreate wakeup pipe, reactor wakeup may be lost");
                DrainOutcome::Drained
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context(SetFlagsSnafu)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).context(SetFlagsSnafu)?;
    Ok(())
}

impl Drop for WakeupChannel {
    fn drop(&mut self) {
        let _ = close(self.read_fd.get());
        let _ = close(self.write_fd.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_drain_is_idempotent() {
        let chan = WakeupChannel::new().unwrap();
        chan.notify().unwrap();
        chan.notify().unwrap();
        assert_eq!(chan.drain(), DrainOutcome::Drained);
        assert_eq!(chan.drain(), DrainOutcome::Drained);
    }

    #[test]
    fn drain_recreates_pipe_on_eof() {
        let chan = WakeupChannel::new().unwrap();
        let old_read_fd = chan.read_fd();
        // Closing the write end ourselves starves the read end: the next
        // read returns EOF, simulating the peer-closed condition drain()
        // must recover from.
        close(chan.write_fd.get()).unwrap();
        match chan.drain() {
            DrainOutcome::Recreated {
                old_read_fd: reported_old,
                new_read_fd,
            } => {
                assert_eq!(reported_old, old_read_fd);
                assert_ne!(new_read_fd, old_read_fd);
                assert_eq!(chan.read_fd(), new_read_fd);
            }
            DrainOutcome::Drained => panic!("expected pipe recreation on EOF"),
        }
        // The recreated channel is fully functional.
        chan.notify().unwrap();
        assert_eq!(chan.drain(), DrainOutcome::Drained);
    }
}
