//! Non-blocking async socket: lifecycle, read dispatch, and the two-stage
//! write path.
//!
//! Ported from `Socket`: one fd, one reactor, a read callback, and two
//! staged send queues (`waiting`, `sending`) that together preserve
//! submission order across any interleaving of partial/non-blocking
//! writes. The `sendable` flag and the writable-event registration are
//! kept in lock-step by construction: `sendable == true` iff the writable
//! event is not armed (§3 invariant 2).
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use nix::sys::socket::{
    bind, setsockopt, socket, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag, SockType,
};
use snafu::{ResultExt, Snafu};

use crate::core::poller::Events;
use crate::core::reactor::ReactorHandle;
use crate::net::sendq::{self, BufferList, OutBuffer, SendOutcome};
use crate::error::{CoreError, ErrorCode};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create socket: {}", source))]
    Create { source: nix::Error },
    #[snafu(display("failed to set socket option: {}", source))]
    SetOpt { source: nix::Error },
    #[snafu(display("failed to bind socket: {}", source))]
    Bind { source: nix::Error },
    #[snafu(display("invalid bind address {}: {}", addr, source))]
    InvalidAddr {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[snafu(display("reactor registration failed: {}", source))]
    Reactor { source: crate::core::reactor::Error },
    #[snafu(display("send failed: {}", source))]
    Send { source: sendq::Error },
    #[snafu(display("recv failed: {}", source))]
    Recv { source: nix::Error },
    #[snafu(display("peer closed the connection"))]
    ConnectionClosed,
}

impl CoreError for Error {
    fn code(&self) -> ErrorCode {
        match self {
            Error::Create { .. } | Error::Bind { .. } | Error::SetOpt { .. } => ErrorCode::Creation,
            Error::InvalidAddr { .. } => ErrorCode::InvalidArgument,
            Error::ConnectionClosed => ErrorCode::ConnectionClosed,
            Error::Reactor { .. } | Error::Send { .. } | Error::Recv { .. } => ErrorCode::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockKind {
    Udp,
    Tcp,
    TcpServer,
}

type ReadCallback = Box<dyn FnMut(&[u8], Option<SocketAddr>) + Send>;
type ErrorCallback = Box<dyn FnMut(&Error) + Send>;
type FlushedCallback = Box<dyn FnMut() + Send>;

/// A non-blocking socket registered with one [`crate::core::reactor::Reactor`].
pub struct AsyncSocket {
    reactor: ReactorHandle,
    fd: AtomicI32,
    sock_type: SockKind,
    self_weak: Weak<AsyncSocket>,
    on_read: Mutex<Option<ReadCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_flushed: Mutex<Option<FlushedCallback>>,
    udp_default_dst: Mutex<Option<SocketAddr>>,
    enable_recv: AtomicBool,
    /// `true` iff the writable event is currently *not* armed (§3
    /// invariant 2). Maintained only by `start_writable_event` /
    /// `stop_writable_event`.
    sendable: AtomicBool,
    waiting: Mutex<VecDeque<OutBuffer>>,
    sending: Mutex<VecDeque<Box<dyn BufferList>>>,
}

impl AsyncSocket {
    /// Creates and binds a non-blocking UDP socket, registering it with
    /// `reactor` for read and error events.
    pub fn bind_udp(
        reactor: ReactorHandle,
        port: u16,
        ip: &str,
        reuse_addr: bool,
    ) -> Result<Arc<Self>, Error> {
        let ip: IpAddr = if ip.is_empty() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            ip.parse().context(InvalidAddrSnafu { addr: ip })?
        };
        let family = if ip.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        let fd = socket(
            family,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context(CreateSnafu)?;

        if reuse_addr {
            setsockopt(fd, sockopt::ReuseAddr, &true).context(SetOptSnafu)?;
        }
        let sock_addr = SockAddr::new_inet(InetAddr::new(ip, port));
        bind(fd, &sock_addr).context(BindSnafu)?;

        Self::from_fd(reactor, fd, SockKind::Udp)
    }

    fn from_fd(reactor: ReactorHandle, fd: RawFd, sock_type: SockKind) -> Result<Arc<Self>, Error> {
        let socket = Arc::new_cyclic(|weak| AsyncSocket {
            reactor: reactor.clone(),
            fd: AtomicI32::new(fd),
            sock_type,
            self_weak: weak.clone(),
            on_read: Mutex::new(None),
            on_error: Mutex::new(None),
            on_flushed: Mutex::new(None),
            udp_default_dst: Mutex::new(None),
            enable_recv: AtomicBool::new(true),
            // A freshly connected/bound fd is writable immediately, so the
            // writable event starts armed (`sendable == false`) until that
            // first readiness fires and `flush_data` finds nothing queued,
            // at which point it disarms itself and flips `sendable` true.
            sendable: AtomicBool::new(false),
            waiting: Mutex::new(VecDeque::new()),
            sending: Mutex::new(VecDeque::new()),
        });

        let weak = socket.self_weak.clone();
        reactor
            .attach(
                fd,
                Events::READ | Events::WRITE | Events::ERROR,
                move |events| {
                    if let Some(socket) = weak.upgrade() {
                        socket.on_event(events);
                    }
                },
            )
            .context(ReactorSnafu)?;

        Ok(socket)
    }

    pub fn set_on_read<F>(&self, cb: F)
    where
        F: FnMut(&[u8], Option<SocketAddr>) + Send + 'static,
    {
        *self.on_read.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_on_error<F>(&self, cb: F)
    where
        F: FnMut(&Error) + Send + 'static,
    {
        *self.on_error.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_on_flushed<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.on_flushed.lock().unwrap() = Some(Box::new(cb));
    }

    /// Sets the implicit destination used when `send` is called without an
    /// explicit address (UDP "connected" convenience).
    pub fn set_default_dst(&self, addr: SocketAddr) {
        *self.udp_default_dst.lock().unwrap() = Some(addr);
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        use nix::sys::socket::{getsockname, SockAddr};
        let fd = self.fd.load(Ordering::Acquire);
        match getsockname(fd).context(CreateSnafu)? {
            SockAddr::Inet(inet) => Ok(inet.to_std()),
            _ => Err(Error::Create {
                source: nix::Error::InvalidPath,
            }),
        }
    }

    /// Enqueues `payload` for transmission, optionally to `addr` (falling
    /// back to the default destination for UDP sockets), and flushes
    /// immediately unless `try_flush` is `false`. Returns the number of
    /// bytes enqueued (`0` for an empty payload).
    pub fn send(
        &self,
        payload: impl Into<Bytes>,
        addr: Option<SocketAddr>,
        try_flush: bool,
    ) -> Result<usize, Error> {
        self.send_range(payload, 0, None, addr, try_flush)
    }

    /// Like [`AsyncSocket::send`] but only enqueues the window
    /// `[offset, offset + len)` of `payload` (`len: None` means "to the end
    /// of the buffer"). Lets a caller hand over a borrowed byte range out of
    /// a larger owned buffer without an extra copy.
    pub fn send_range(
        &self,
        payload: impl Into<Bytes>,
        offset: usize,
        len: Option<usize>,
        addr: Option<SocketAddr>,
        try_flush: bool,
    ) -> Result<usize, Error> {
        let data: Bytes = payload.into();
        let len = len.unwrap_or_else(|| data.len().saturating_sub(offset));
        let window = sendq::BufferOffset::new(data.clone(), offset, len).context(SendSnafu)?;
        if window.size() == 0 {
            return Ok(0);
        }
        let data = data.slice(offset..offset + len);
        let size = data.len();
        let dest = addr.or_else(|| *self.udp_default_dst.lock().unwrap());
        let entry = match dest {
            Some(a) if self.sock_type == SockKind::Udp => OutBuffer::with_addr(data, a),
            _ => OutBuffer::new(data),
        };
        self.waiting.lock().unwrap().push_back(entry);
        if try_flush {
            self.flush_all();
        }
        Ok(size)
    }

    /// Attempts to drain queued sends if the writable event is not
    /// currently armed. Callable from any thread.
    pub fn flush_all(&self) {
        if self.sendable.load(Ordering::Acquire) {
            if let Err(e) = self.flush_data(false) {
                warn!(error = %e, "flush_all failed");
            }
        }
    }

    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            let _ = self.reactor.detach(fd);
            let _ = nix::unistd::close(fd);
        }
    }

    fn on_event(&self, events: Events) {
        if events.contains(Events::ERROR) {
            self.emit_error(Error::ConnectionClosed);
            return;
        }
        if events.contains(Events::READ) {
            self.on_readable();
        }
        if events.contains(Events::WRITE) {
            if let Err(e) = self.flush_data(true) {
                warn!(error = %e, "flush_data on writable event failed");
            }
        }
    }

    fn on_readable(&self) {
        while self.enable_recv.load(Ordering::Acquire) {
            let fd = self.fd.load(Ordering::Acquire);
            if fd < 0 {
                return;
            }

            enum Outcome {
                Continue,
                WouldBlock,
                Eof,
                Error(nix::Error),
            }

            let outcome = self.reactor.with_shared_buffer(|buf| match recv_once(fd, buf) {
                RecvOutcome::Data(n, peer) => {
                    if let Some(cb) = self.on_read.lock().unwrap().as_mut() {
                        cb(&buf[..n], peer);
                    }
                    Outcome::Continue
                }
                RecvOutcome::WouldBlock => Outcome::WouldBlock,
                RecvOutcome::Eof => Outcome::Eof,
                RecvOutcome::Error(e) => Outcome::Error(e),
            });

            match outcome {
                Outcome::Continue => continue,
                Outcome::WouldBlock => return,
                Outcome::Eof => {
                    if self.sock_type != SockKind::Udp {
                        self.emit_error(Error::ConnectionClosed);
                    }
                    return;
                }
                Outcome::Error(e) => {
                    if self.sock_type == SockKind::Udp {
                        warn!(error = %e, "udp recv error, ignoring");
                        return;
                    }
                    self.emit_error(Error::Recv { source: e });
                    return;
                }
            }
        }
    }

    fn emit_error(&self, err: Error) {
        if let Some(cb) = self.on_error.lock().unwrap().as_mut() {
            cb(&err);
        } else {
            warn!(error = %err, "socket error with no handler installed");
        }
        self.close();
    }

    /// Drives the `waiting` -> `sending` handoff and the transmit
    /// strategy. `is_reactor_thread` distinguishes a caller-thread flush
    /// (which may need to arm the writable event) from a reactor-thread
    /// flush driven by a writable-readiness callback (where the event, by
    /// construction, is already armed).
    fn flush_data(&self, is_reactor_thread: bool) -> Result<(), Error> {
        loop {
            let mut sending = self.sending.lock().unwrap();
            if sending.is_empty() {
                drop(sending);
                let batch: VecDeque<OutBuffer> = {
                    let mut waiting = self.waiting.lock().unwrap();
                    waiting.drain(..).collect()
                };
                if batch.is_empty() {
                    if is_reactor_thread {
                        self.stop_writable_event()?;
                        if let Some(cb) = self.on_flushed.lock().unwrap().as_mut() {
                            cb();
                        }
                    }
                    return Ok(());
                }
                let packet = sendq::build(batch, self.sock_type == SockKind::Udp);
                self.sending.lock().unwrap().push_back(packet);
                continue;
            }

            let fd = self.fd.load(Ordering::Acquire);
            if fd < 0 {
                return Ok(());
            }
            let front = sending.front_mut().unwrap();
            match front.send(fd) {
                Ok(SendOutcome::Drained) => {
                    sending.pop_front();
                    continue;
                }
                Ok(SendOutcome::WouldBlock { .. }) => {
                    drop(sending);
                    if !is_reactor_thread {
                        self.start_writable_event()?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    drop(sending);
                    let err = Error::Send { source: e };
                    if let Some(cb) = self.on_error.lock().unwrap().as_mut() {
                        cb(&err);
                    }
                    self.close();
                    return Err(err);
                }
            }
        }
    }

    fn start_writable_event(&self) -> Result<(), Error> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Ok(());
        }
        self.reactor
            .modify(fd, self.wanted_events(true))
            .context(ReactorSnafu)?;
        self.sendable.store(false, Ordering::Release);
        Ok(())
    }

    fn stop_writable_event(&self) -> Result<(), Error> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Ok(());
        }
        self.reactor
            .modify(fd, self.wanted_events(false))
            .context(ReactorSnafu)?;
        self.sendable.store(true, Ordering::Release);
        Ok(())
    }

    fn wanted_events(&self, want_write: bool) -> Events {
        let mut events = Events::ERROR;
        if self.enable_recv.load(Ordering::Acquire) {
            events |= Events::READ;
        }
        if want_write {
            events |= Events::WRITE;
        }
        events
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        self.close();
    }
}

enum RecvOutcome {
    Data(usize, Option<SocketAddr>),
    WouldBlock,
    Eof,
    Error(nix::Error),
}

fn recv_once(fd: RawFd, buf: &mut [u8]) -> RecvOutcome {
    use nix::errno::Errno;
    use nix::sys::socket::recvfrom;

    loop {
        match recvfrom(fd, buf) {
            Ok((0, _)) => return RecvOutcome::Eof,
            Ok((n, from)) => {
                let peer = from.as_ref().and_then(nix_sockaddr_to_std);
                return RecvOutcome::Data(n, peer);
            }
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return RecvOutcome::WouldBlock,
            Err(e) => return RecvOutcome::Error(e),
        }
    }
}

fn nix_sockaddr_to_std(addr: &nix::sys::socket::SockAddr) -> Option<SocketAddr> {
    match addr {
        nix::sys::socket::SockAddr::Inet(inet) => Some(inet.to_std()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RuntimeConfig;
    use crate::core::reactor::Reactor;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn udp_echo_roundtrip() {
        let reactor = Reactor::new("socket-test", RuntimeConfig::default()).unwrap();
        reactor.run_loop(false);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();

        let server = AsyncSocket::bind_udp(reactor.clone(), 0, "127.0.0.1", true).unwrap();
        server.set_on_read(move |data, _from| {
            received2.lock().unwrap().extend_from_slice(data);
        });

        let server_port = local_port(&server);
        let client = AsyncSocket::bind_udp(reactor.clone(), 0, "127.0.0.1", true).unwrap();
        let dest: SocketAddr = format!("127.0.0.1:{}", server_port).parse().unwrap();
        client.send(&b"42"[..], Some(dest), true).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(&received.lock().unwrap()[..], b"42");

        reactor.shutdown_and_join();
    }

    #[test]
    fn send_range_enqueues_only_the_requested_window() {
        let reactor = Reactor::new("socket-test-range", RuntimeConfig::default()).unwrap();
        reactor.run_loop(false);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let server = AsyncSocket::bind_udp(reactor.clone(), 0, "127.0.0.1", true).unwrap();
        server.set_on_read(move |data, _from| {
            received2.lock().unwrap().extend_from_slice(data);
        });

        let server_port = local_port(&server);
        let client = AsyncSocket::bind_udp(reactor.clone(), 0, "127.0.0.1", true).unwrap();
        let dest: SocketAddr = format!("127.0.0.1:{}", server_port).parse().unwrap();
        let n = client
            .send_range(&b"hello world"[..], 6, Some(5), Some(dest), true)
            .unwrap();
        assert_eq!(n, 5);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(&received.lock().unwrap()[..], b"world");

        reactor.shutdown_and_join();
    }

    #[test]
    fn send_range_rejects_window_past_end() {
        let reactor = Reactor::new("socket-test-range-oob", RuntimeConfig::default()).unwrap();
        reactor.run_loop(false);
        let socket = AsyncSocket::bind_udp(reactor.clone(), 0, "127.0.0.1", true).unwrap();
        let err = socket
            .send_range(&b"short"[..], 2, Some(10), None, true)
            .unwrap_err();
        assert!(matches!(err, Error::Send { .. }));
        reactor.shutdown_and_join();
    }

    #[test]
    fn send_empty_payload_is_noop() {
        let reactor = Reactor::new("socket-test-empty", RuntimeConfig::default()).unwrap();
        reactor.run_loop(false);
        let socket = AsyncSocket::bind_udp(reactor.clone(), 0, "127.0.0.1", true).unwrap();
        let n = socket.send(&b""[..], None, true).unwrap();
        assert_eq!(n, 0);
        reactor.shutdown_and_join();
    }

    fn local_port(socket: &AsyncSocket) -> u16 {
        socket.local_addr().unwrap().port()
    }
}
