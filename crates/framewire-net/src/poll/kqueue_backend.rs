//! BSD/macOS `kqueue(2)` backend. Highest-ranked device under `Device::Auto`
//! on these platforms (§11), on par with epoll on Linux.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Backend, Event, Interest};

pub struct KqueueBackend {
    kq: RawFd,
    interests: HashMap<RawFd, (u64, Interest)>,
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { kq, interests: HashMap::new() })
    }

    fn apply(&self, fd: RawFd, token: u64, old: Interest, new: Interest) -> io::Result<()> {
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);

        if old.readable != new.readable {
            changes.push(Self::change(fd, libc::EVFILT_READ, new.readable, token));
        }
        if old.writable != new.writable {
            changes.push(Self::change(fd, libc::EVFILT_WRITE, new.writable, token));
        }
        if changes.is_empty() {
            return Ok(());
        }

        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn change(fd: RawFd, filter: i16, enable: bool, token: u64) -> libc::kevent {
        libc::kevent {
            ident: fd as usize,
            filter,
            flags: if enable { libc::EV_ADD | libc::EV_ENABLE } else { libc::EV_DELETE },
            fflags: 0,
            data: 0,
            udata: token as *mut libc::c_void,
        }
    }
}

impl Backend for KqueueBackend {
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.apply(fd, token, Interest::default(), interest)?;
        self.interests.insert(fd, (token, interest));
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let old = self.interests.get(&fd).map(|(_, i)| *i).unwrap_or_default();
        self.apply(fd, token, old, interest)?;
        self.interests.insert(fd, (token, interest));
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some((token, old)) = self.interests.remove(&fd) {
            self.apply(fd, token, old, Interest::default())?;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as i64,
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const _);

        let mut events = vec![unsafe { std::mem::zeroed::<libc::kevent>() }; self.interests.len().max(16)];
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as i32,
                ts_ptr,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for ev in &events[..n as usize] {
            let token = ev.udata as u64;
            let readable = ev.filter == libc::EVFILT_READ;
            let writable = ev.filter == libc::EVFILT_WRITE;
            let error = ev.flags & libc::EV_ERROR != 0;
            out.push(Event { token, readable, writable, error });
        }
        Ok(n as usize)
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
