//! Kernel readiness multiplexer.
//!
//! Ported from `EventPoller`'s `#if HAS_EPOLL` branch: on Linux we drive
//! `epoll` directly; everywhere else we fall back to a `select`-based scan
//! bounded by `FD_SETSIZE`, matching the original's non-Linux behavior
//! (Windows additionally wraps `epoll` via `wepoll`, which is out of scope
//! here -- this crate targets POSIX platforms).
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use snafu::{ResultExt, Snafu};

use crate::error::{CoreError, ErrorCode};

bitflags! {
    /// Readiness bits, independent of the underlying kernel API's own
    /// constants.
    pub struct Events: u32 {
        const READ  = 0b001;
        const WRITE = 0b010;
        const ERROR = 0b100;
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create kernel poller: {}", source))]
    Create { source: nix::Error },
    #[snafu(display("failed to register fd {} with poller: {}", fd, source))]
    Add { fd: RawFd, source: nix::Error },
    #[snafu(display("failed to modify fd {} registration: {}", fd, source))]
    Modify { fd: RawFd, source: nix::Error },
    #[snafu(display("failed to deregister fd {} from poller: {}", fd, source))]
    Remove { fd: RawFd, source: nix::Error },
    #[snafu(display("poll wait failed: {}", source))]
    Wait { source: nix::Error },
}

impl CoreError for Error {
    fn code(&self) -> ErrorCode {
        ErrorCode::Io
    }
}

/// One fd's readiness result from a `wait()` call.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub events: Events,
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use nix::sys::epoll::{
        epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
    };
    use nix::unistd::close;

    pub struct KernelPoller {
        epfd: RawFd,
    }

    impl KernelPoller {
        pub fn new() -> Result<Self, Error> {
            let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).context(CreateSnafu)?;
            Ok(KernelPoller { epfd })
        }

        pub fn add(&self, fd: RawFd, events: Events) -> Result<(), Error> {
            let mut ev = EpollEvent::new(to_epoll_flags(events), fd as u64);
            epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, Some(&mut ev))
                .context(AddSnafu { fd })
        }

        pub fn modify(&self, fd: RawFd, events: Events) -> Result<(), Error> {
            let mut ev = EpollEvent::new(to_epoll_flags(events), fd as u64);
            epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, Some(&mut ev))
                .context(ModifySnafu { fd })
        }

        pub fn remove(&self, fd: RawFd) -> Result<(), Error> {
            match epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None) {
                Ok(()) => Ok(()),
                // Already gone (e.g. the fd was closed); removal is
                // idempotent from the caller's point of view.
                Err(nix::Error::Sys(nix::errno::Errno::ENOENT))
                | Err(nix::Error::Sys(nix::errno::Errno::EBADF)) => Ok(()),
                Err(e) => Err(Error::Remove { fd, source: e }),
            }
        }

        /// `timeout_ms < 0` blocks indefinitely.
        pub fn wait(&self, batch: &mut Vec<EpollEvent>, timeout_ms: isize) -> Result<Vec<Readiness>, Error> {
            let n = loop {
                match epoll_wait(self.epfd, batch.as_mut_slice(), timeout_ms as isize) {
                    Ok(n) => break n,
                    Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                    Err(e) => return Err(Error::Wait { source: e }),
                }
            };
            Ok(batch[..n]
                .iter()
                .map(|ev| Readiness {
                    fd: ev.data() as RawFd,
                    events: from_epoll_flags(ev.events()),
                })
                .collect())
        }
    }

    impl Drop for KernelPoller {
        fn drop(&mut self) {
            let _ = close(self.epfd);
        }
    }

    fn to_epoll_flags(events: Events) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if events.contains(Events::READ) {
            flags.insert(EpollFlags::EPOLLIN);
        }
        if events.contains(Events::WRITE) {
            flags.insert(EpollFlags::EPOLLOUT);
        }
        flags.insert(EpollFlags::EPOLLERR);
        flags.insert(EpollFlags::EPOLLHUP);
        flags
    }

    fn from_epoll_flags(flags: EpollFlags) -> Events {
        let mut events = Events::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            events.insert(Events::READ);
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            events.insert(Events::WRITE);
        }
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            events.insert(Events::ERROR);
        }
        events
    }

    pub fn new_event_batch(capacity: usize) -> Vec<EpollEvent> {
        vec![EpollEvent::empty(); capacity]
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use nix::sys::select::{select, FdSet};
    use nix::sys::time::{TimeVal, TimeValLike};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// `select`-based fallback; bounded by `FD_SETSIZE` registered fds, as
    /// the original's non-epoll branch is.
    pub struct KernelPoller {
        registered: Mutex<HashMap<RawFd, Events>>,
    }

    impl KernelPoller {
        pub fn new() -> Result<Self, Error> {
            Ok(KernelPoller {
                registered: Mutex::new(HashMap::new()),
            })
        }

        pub fn add(&self, fd: RawFd, events: Events) -> Result<(), Error> {
            self.registered.lock().insert(fd, events);
            Ok(())
        }

        pub fn modify(&self, fd: RawFd, events: Events) -> Result<(), Error> {
            self.registered.lock().insert(fd, events);
            Ok(())
        }

        pub fn remove(&self, fd: RawFd) -> Result<(), Error> {
            self.registered.lock().remove(&fd);
            Ok(())
        }

        pub fn wait(&self, _batch: &mut Vec<()>, timeout_ms: isize) -> Result<Vec<Readiness>, Error> {
            let registered = self.registered.lock().clone();
            let mut read_set = FdSet::new();
            let mut write_set = FdSet::new();
            let mut err_set = FdSet::new();
            let mut max_fd = -1;
            for (&fd, events) in registered.iter() {
                if events.contains(Events::READ) {
                    read_set.insert(fd);
                }
                if events.contains(Events::WRITE) {
                    write_set.insert(fd);
                }
                err_set.insert(fd);
                max_fd = max_fd.max(fd);
            }
            let mut timeout = if timeout_ms < 0 {
                None
            } else {
                Some(TimeVal::milliseconds(timeout_ms as i64))
            };
            let n = loop {
                match select(
                    max_fd + 1,
                    Some(&mut read_set),
                    Some(&mut write_set),
                    Some(&mut err_set),
                    timeout.as_mut(),
                ) {
                    Ok(n) => break n,
                    Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                    Err(e) => return Err(Error::Wait { source: e }),
                }
            };
            if n == 0 {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            for (&fd, _) in registered.iter() {
                let mut ev = Events::empty();
                if read_set.contains(fd) {
                    ev.insert(Events::READ);
                }
                if write_set.contains(fd) {
                    ev.insert(Events::WRITE);
                }
                if err_set.contains(fd) {
                    ev.insert(Events::ERROR);
                }
                if !ev.is_empty() {
                    out.push(Readiness { fd, events: ev });
                }
            }
            Ok(out)
        }
    }

    pub fn new_event_batch(_capacity: usize) -> Vec<()> {
        Vec::new()
    }
}

pub use imp::{new_event_batch, KernelPoller};

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn add_modify_remove_roundtrip() {
        let poller = KernelPoller::new().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        poller.add(r, Events::READ).unwrap();
        poller.modify(r, Events::READ | Events::ERROR).unwrap();
        nix::unistd::write(w, b"x").unwrap();
        let mut batch = new_event_batch(8);
        let ready = poller.wait(&mut batch, 1000).unwrap();
        assert!(ready.iter().any(|r2| r2.fd == r && r2.events.contains(Events::READ)));
        poller.remove(r).unwrap();
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }
}
