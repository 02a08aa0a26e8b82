//! Linux `epoll(2)` backend. Highest-ranked device under `Device::Auto`
//! (§11).

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Backend, Event, Interest};

pub struct EpollBackend {
    epfd: RawFd,
    tokens: HashMap<RawFd, u64>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd, tokens: HashMap::new() })
    }

    fn events_for(interest: Interest) -> u32 {
        let mut ev = 0u32;
        if interest.readable {
            ev |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }

    fn ctl(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: Self::events_for(interest), u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)?;
        self.tokens.insert(fd, token);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        self.tokens.remove(&fd);
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.tokens.len().max(16)];
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for ev in &events[..n as usize] {
            out.push(Event {
                token: ev.u64,
                readable: ev.events & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32) != 0,
                writable: ev.events & libc::EPOLLOUT as u32 != 0,
                error: ev.events & libc::EPOLLERR as u32 != 0,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
