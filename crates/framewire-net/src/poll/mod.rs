//! Readiness poller with a selectable backend device, grounded in
//! `trunk/inetbase.c`'s `IPOLL_DRIVER` vtable and `ipoll_list`/`ipoll_init`.
//!
//! The original picks among compiled-in drivers (select/poll/epoll/kqueue/...)
//! by an explicit tag or by each driver's static `performance` rank. This
//! module keeps that shape as a Rust trait object instead of a function
//! pointer table: [`Poller::new`] with [`Device::Auto`] picks epoll on Linux,
//! kqueue on BSD/macOS, and falls back to `poll(2)` elsewhere, matching §11's
//! ranking (epoll/kqueue highest, poll next, select lowest — select is never
//! chosen by `Auto`, only by explicit request, since it's O(n) per wait call
//! and capped by `FD_SETSIZE` on some platforms).

mod poll_backend;
mod select_backend;

#[cfg(target_os = "linux")]
mod epoll_backend;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
mod kqueue_backend;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness interest for a registered file descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Self = Self { readable: true, writable: false };
    pub const WRITABLE: Self = Self { readable: false, writable: true };

    #[inline]
    pub const fn both() -> Self {
        Self { readable: true, writable: true }
    }

    #[inline]
    pub const fn or(self, other: Self) -> Self {
        Self { readable: self.readable || other.readable, writable: self.writable || other.writable }
    }
}

/// A readiness notification for one registered fd.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Backend selection. `Auto` resolves to the highest-ranked device compiled
/// in for the target platform (§11); the others force a specific backend,
/// mainly for tests that need to exercise every code path on one machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Auto,
    Select,
    Poll,
    #[cfg(target_os = "linux")]
    Epoll,
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
    Kqueue,
}

trait Backend {
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;
    fn reregister(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize>;
}

/// A readiness poller over one concrete OS backend.
pub struct Poller {
    backend: Box<dyn Backend + Send>,
    device: Device,
}

impl Poller {
    pub fn new(device: Device) -> io::Result<Self> {
        let resolved = Self::resolve(device);
        let backend: Box<dyn Backend + Send> = match resolved {
            Device::Select => Box::new(select_backend::SelectBackend::new()),
            Device::Poll => Box::new(poll_backend::PollBackend::new()),
            #[cfg(target_os = "linux")]
            Device::Epoll => Box::new(epoll_backend::EpollBackend::new()?),
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
            Device::Kqueue => Box::new(kqueue_backend::KqueueBackend::new()?),
            Device::Auto => unreachable!("resolve() never returns Auto"),
        };
        Ok(Self { backend, device: resolved })
    }

    fn resolve(device: Device) -> Device {
        if device != Device::Auto {
            return device;
        }
        #[cfg(target_os = "linux")]
        {
            Device::Epoll
        }
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
        {
            Device::Kqueue
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )))]
        {
            Device::Poll
        }
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.backend.register(fd, token, interest)
    }

    pub fn reregister(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.backend.reregister(fd, token, interest)
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.backend.deregister(fd)
    }

    /// Blocks up to `timeout` (or indefinitely if `None`) for readiness,
    /// appending ready events to `out`. Returns the number appended.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        self.backend.wait(timeout, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn readable_poller_sees_connect(device: Device) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut poller = Poller::new(device).unwrap();
        poller.register(listener.as_raw_fd(), 1, Interest::READABLE).unwrap();

        let _client = TcpStream::connect(addr).unwrap();

        let mut events = Vec::new();
        let mut got = 0;
        for _ in 0..50 {
            events.clear();
            got = poller.wait(Some(Duration::from_millis(50)), &mut events).unwrap();
            if got > 0 {
                break;
            }
        }
        assert_eq!(got, 1);
        assert_eq!(events[0].token, 1);
        assert!(events[0].readable);
    }

    #[test]
    fn select_backend_detects_readability() {
        readable_poller_sees_connect(Device::Select);
    }

    #[test]
    fn poll_backend_detects_readability() {
        readable_poller_sees_connect(Device::Poll);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn epoll_backend_detects_readability() {
        readable_poller_sees_connect(Device::Epoll);
    }

    #[test]
    fn auto_resolves_to_a_concrete_device() {
        let poller = Poller::new(Device::Auto).unwrap();
        assert_ne!(poller.device(), Device::Auto);
    }
}
