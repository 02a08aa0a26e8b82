//! `select(2)` backend. Ranked lowest in [`super::Device`] resolution: O(n)
//! per wait call like `poll(2)`, plus an `FD_SETSIZE`-bounded fd space on
//! most platforms. Kept mainly so `Device::Select` can be forced explicitly
//! (tests, or a platform with nothing better).
//!
//! `trunk/inetbase.c`'s `IPOLLFV` grows its tracked-fd vector geometrically
//! (doubling) rather than one slot at a time; this backend does the same for
//! its registration table, even though the actual `fd_set` bitmaps are
//! rebuilt fresh on every `wait` call from that table.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Backend, Event, Interest};

struct Registration {
    fd: RawFd,
    token: u64,
    interest: Interest,
}

pub struct SelectBackend {
    regs: Vec<Registration>,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self { regs: Vec::with_capacity(16) }
    }

    fn grow_if_needed(&mut self) {
        if self.regs.len() == self.regs.capacity() {
            self.regs.reserve(self.regs.capacity().max(16));
        }
    }
}

impl Backend for SelectBackend {
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.grow_if_needed();
        self.regs.push(Registration { fd, token, interest });
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, _token: u64, interest: Interest) -> io::Result<()> {
        match self.regs.iter_mut().find(|r| r.fd == fd) {
            Some(r) => {
                r.interest = interest;
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.regs.retain(|r| r.fd != fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        if self.regs.iter().any(|r| r.fd >= libc::FD_SETSIZE as RawFd) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "fd exceeds FD_SETSIZE"));
        }

        let mut readfds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut writefds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut errorfds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut errorfds);
        }

        let mut max_fd: RawFd = -1;
        for r in &self.regs {
            if r.interest.readable {
                unsafe { libc::FD_SET(r.fd, &mut readfds) };
            }
            if r.interest.writable {
                unsafe { libc::FD_SET(r.fd, &mut writefds) };
            }
            unsafe { libc::FD_SET(r.fd, &mut errorfds) };
            max_fd = max_fd.max(r.fd);
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => std::ptr::null_mut(),
        };

        let n = unsafe {
            libc::select(max_fd + 1, &mut readfds, &mut writefds, &mut errorfds, tv_ptr)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut appended = 0;
        for r in &self.regs {
            let readable = unsafe { libc::FD_ISSET(r.fd, &readfds) };
            let writable = unsafe { libc::FD_ISSET(r.fd, &writefds) };
            let error = unsafe { libc::FD_ISSET(r.fd, &errorfds) };
            if readable || writable || error {
                out.push(Event { token: r.token, readable, writable, error });
                appended += 1;
            }
        }
        Ok(appended)
    }
}
