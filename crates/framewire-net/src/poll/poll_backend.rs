//! `poll(2)` backend. Portable, ranked below epoll/kqueue in [`super::Device`]
//! resolution since it's O(n) in the number of registered fds per wait call.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Backend, Event, Interest};

pub struct PollBackend {
    fds: Vec<libc::pollfd>,
    tokens: HashMap<RawFd, u64>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self { fds: Vec::new(), tokens: HashMap::new() }
    }

    fn events_for(interest: Interest) -> i16 {
        let mut ev = 0;
        if interest.readable {
            ev |= libc::POLLIN;
        }
        if interest.writable {
            ev |= libc::POLLOUT;
        }
        ev as i16
    }
}

impl Backend for PollBackend {
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.tokens.insert(fd, token);
        self.fds.push(libc::pollfd { fd, events: Self::events_for(interest), revents: 0 });
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, _token: u64, interest: Interest) -> io::Result<()> {
        match self.fds.iter_mut().find(|p| p.fd == fd) {
            Some(p) => {
                p.events = Self::events_for(interest);
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|p| p.fd != fd);
        self.tokens.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut appended = 0;
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let Some(&token) = self.tokens.get(&pfd.fd) else { continue };
            out.push(Event {
                token,
                readable: pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
            appended += 1;
        }
        Ok(appended)
    }
}
