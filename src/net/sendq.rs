//! Ordered send-side staging and the per-socket-kind transmit strategy.
//!
//! Ported from `BufferSock`/`BufferList`/`BufferSendTo`/`BufferSendMsg`:
//! outbound data is batched into a "packet" (an ordered run of buffers,
//! each optionally carrying its own destination for datagram sends) and
//! handed to a transmit strategy that knows how to drain it across
//! partial/non-blocking writes while preserving per-buffer offset state
//! between calls.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::socket::{sendto, MsgFlags, SockAddr};
use nix::sys::uio::{writev, IoVec};
use snafu::Snafu;

use crate::error::{CoreError, ErrorCode};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "buffer offset window [{}, {}) exceeds backing size {}",
        offset,
        offset + size,
        max_size
    ))]
    OffsetOutOfRange {
        offset: usize,
        size: usize,
        max_size: usize,
    },
    #[snafu(display("send failed: {}", source))]
    Send { source: nix::Error },
}

impl CoreError for Error {
    fn code(&self) -> ErrorCode {
        match self {
            Error::OffsetOutOfRange { .. } => ErrorCode::InvalidArgument,
            Error::Send { .. } => ErrorCode::Io,
        }
    }
}

/// A window into a backing buffer.
///
/// The original's `BufferOffset<C>::setup` rejects `offset + size >=
/// max_size`; that forbids the legal case where the window exactly reaches
/// the end of the backing buffer. This implementation rejects only
/// `offset + size > max_size`.
#[derive(Debug, Clone)]
pub struct BufferOffset {
    data: Bytes,
    offset: usize,
    size: usize,
}

impl BufferOffset {
    pub fn new(data: Bytes, offset: usize, size: usize) -> Result<Self, Error> {
        let max_size = data.len();
        if offset + size > max_size {
            return Err(Error::OffsetOutOfRange {
                offset,
                size,
                max_size,
            });
        }
        Ok(BufferOffset { data, offset, size })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// One outbound unit: a byte payload plus an optional per-entry
/// destination (used for `sendto` on unconnected UDP sockets).
#[derive(Debug, Clone)]
pub struct OutBuffer {
    data: Bytes,
    addr: Option<SocketAddr>,
    /// Bytes of `data` already transmitted in a prior partial send.
    progress: usize,
}

impl OutBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        OutBuffer {
            data: data.into(),
            addr: None,
            progress: 0,
        }
    }

    pub fn with_addr(data: impl Into<Bytes>, addr: SocketAddr) -> Self {
        OutBuffer {
            data: data.into(),
            addr: Some(addr),
            progress: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.progress..]
    }

    fn is_fully_sent(&self) -> bool {
        self.progress >= self.data.len()
    }
}

/// Result of attempting to drain some or all of a `BufferList`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every queued buffer was fully transmitted.
    Drained,
    /// The socket would block; some bytes (possibly zero) were sent before
    /// that, and at least one buffer remains (partially or wholly) queued.
    WouldBlock { sent: usize },
}

/// Batched outbound data plus the strategy used to drain it onto a socket.
pub trait BufferList: Send {
    fn count(&self) -> usize;
    fn empty(&self) -> bool {
        self.count() == 0
    }
    /// Attempts to transmit as much of the batch as the kernel will accept
    /// without blocking. `EINTR` is retried internally; `EAGAIN` and
    /// partial writes surface as `SendOutcome::WouldBlock`.
    fn send(&mut self, fd: RawFd) -> Result<SendOutcome, Error>;
}

/// Datagram transmit strategy: sends one buffer at a time via `sendto`,
/// using each entry's own destination when present. Preserves partial-send
/// offset across calls so a short write never drops or reorders bytes.
pub struct DatagramBufferList {
    queue: VecDeque<OutBuffer>,
}

impl DatagramBufferList {
    pub fn new(queue: VecDeque<OutBuffer>) -> Self {
        DatagramBufferList { queue }
    }
}

impl BufferList for DatagramBufferList {
    fn count(&self) -> usize {
        self.queue.len()
    }

    fn send(&mut self, fd: RawFd) -> Result<SendOutcome, Error> {
        let mut sent_total = 0usize;
        while let Some(front) = self.queue.front_mut() {
            let remaining = front.remaining();
            if remaining.is_empty() {
                self.queue.pop_front();
                continue;
            }
            let addr = front.addr.map(to_nix_sockaddr);
            let result = match &addr {
                Some(addr) => sendto(fd, remaining, addr, MsgFlags::empty()),
                None => nix::sys::socket::send(fd, remaining, MsgFlags::empty()),
            };
            match result {
                Ok(n) => {
                    sent_total += n;
                    let front = self.queue.front_mut().unwrap();
                    front.progress += n;
                    if front.is_fully_sent() {
                        self.queue.pop_front();
                    }
                }
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => {
                    return Ok(SendOutcome::WouldBlock { sent: sent_total });
                }
                Err(e) => return Err(Error::Send { source: e }),
            }
        }
        if self.queue.is_empty() {
            Ok(SendOutcome::Drained)
        } else {
            Ok(SendOutcome::WouldBlock { sent: sent_total })
        }
    }
}

/// Stream transmit strategy: coalesces the whole batch into one scatter-
/// gather `writev(2)` call per attempt rather than issuing one `send` per
/// buffer. The original stubs this path outside Windows (it only
/// implements the `WSASend`-based scatter-gather under `#if
/// defined(WIN32)`); this is the real POSIX implementation the spec calls
/// for.
pub struct StreamBufferList {
    queue: VecDeque<OutBuffer>,
}

impl StreamBufferList {
    pub fn new(queue: VecDeque<OutBuffer>) -> Self {
        StreamBufferList { queue }
    }
}

impl BufferList for StreamBufferList {
    fn count(&self) -> usize {
        self.queue.len()
    }

    fn send(&mut self, fd: RawFd) -> Result<SendOutcome, Error> {
        let mut sent_total = 0usize;
        loop {
            if self.queue.is_empty() {
                return Ok(SendOutcome::Drained);
            }

            let iovecs: Vec<IoVec<&[u8]>> = self
                .queue
                .iter()
                .map(|b| IoVec::from_slice(b.remaining()))
                .collect();

            match writev(fd, &iovecs) {
                Ok(mut n) => {
                    sent_total += n;
                    while n > 0 {
                        let front = match self.queue.front_mut() {
                            Some(f) => f,
                            None => break,
                        };
                        let remaining_in_front = front.size() - front.progress;
                        if n >= remaining_in_front {
                            n -= remaining_in_front;
                            self.queue.pop_front();
                        } else {
                            front.progress += n;
                            n = 0;
                        }
                    }
                    if self.queue.is_empty() {
                        return Ok(SendOutcome::Drained);
                    }
                    // Short write: the kernel buffer is full for now.
                    return Ok(SendOutcome::WouldBlock { sent: sent_total });
                }
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => {
                    return Ok(SendOutcome::WouldBlock { sent: sent_total });
                }
                Err(e) => return Err(Error::Send { source: e }),
            }
        }
    }
}

fn to_nix_sockaddr(addr: SocketAddr) -> SockAddr {
    SockAddr::new_inet(nix::sys::socket::InetAddr::from_std(&addr))
}

/// Builds the transmit strategy appropriate for the socket kind, matching
/// `BufferList::create(data, sendResult, isUdp)`.
pub fn build(queue: VecDeque<OutBuffer>, is_datagram: bool) -> Box<dyn BufferList> {
    if is_datagram {
        Box::new(DatagramBufferList::new(queue))
    } else {
        Box::new(StreamBufferList::new(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_window_reaching_exact_end_is_accepted() {
        let data = Bytes::from_static(b"0123456789");
        assert!(BufferOffset::new(data, 5, 5).is_ok());
    }

    #[test]
    fn offset_window_past_end_is_rejected() {
        let data = Bytes::from_static(b"0123456789");
        assert!(BufferOffset::new(data, 6, 5).is_err());
    }

    #[test]
    fn datagram_list_reports_drained_once_empty() {
        let mut queue = VecDeque::new();
        queue.push_back(OutBuffer::new(&b""[..]));
        let list = DatagramBufferList::new(queue);
        assert_eq!(list.count(), 1);
    }
}
