//! Non-blocking, framed TCP endpoint — one half of a connection, used both
//! for outbound connections and for sockets accepted by
//! [`crate::tcp::host::Host`].
//!
//! Structurally this follows `flux-network/src/tcp/stream.rs`'s
//! `TcpStream`: a small read state machine (header vs. payload), a send
//! backlog queue that only allocates once a write would block, and a
//! `writable_armed` invariant tracking whether the poller currently watches
//! for writability. It differs from the teacher in three ways the spec
//! requires: framing width/order is one of 13 configurable
//! [`HeaderMode`]s rather than a fixed 4-byte LE length, each direction can
//! carry an independent [`Rc4`] cipher, and registration goes through this
//! crate's own [`Poller`] instead of `mio::Registry`. Per §3's Client record
//! ("send MemStream, recv MemStream"), both the outbound backlog and the
//! inbound reassembly buffer are [`MemStream`]s rather than a growable
//! `Vec`/`VecDeque`, so a connection's buffered footprint tracks its actual
//! backlog rather than its high-water mark.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use framewire_utils::safe_assert;
use thiserror::Error;
use tracing::{debug, warn};

use crate::framing::{self, HeaderMode};
use crate::mem_stream::MemStream;
use crate::poll::{Event, Interest, Poller};
use crate::rc4::Rc4;

const DEFAULT_HEADER_MODE: HeaderMode = HeaderMode::EDwordLsb;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const STREAM_PAGE_SIZE: usize = 4096;
const RECV_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation would block")]
    WouldBlock,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("operation invalid in state {state:?}")]
    WrongState { state: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Connecting,
    Established,
}

/// One framed, optionally-encrypted TCP connection.
pub struct Client {
    stream: Option<StdTcpStream>,
    state: State,
    peer_addr: Option<SocketAddr>,
    mode: HeaderMode,
    send_rc4: Rc4,
    recv_rc4: Rc4,
    recv_stream: MemStream,
    send_stream: MemStream,
    writable_armed: bool,
    nodelay: bool,
}

impl Client {
    /// Begins a non-blocking connect to `addr`. The caller must register
    /// [`Self::raw_fd`] for write-readiness and call
    /// [`Self::poll_connect_complete`] once it fires.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = StdTcpStream::connect(addr);
        let stream = match stream {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        stream.set_nonblocking(true)?;
        Ok(Self::from_parts(stream, Some(addr), State::Connecting))
    }

    /// Wraps an already-connected (or just-accepted) socket, e.g. from
    /// [`crate::tcp::host::Host`]'s listener.
    pub fn from_accepted(stream: StdTcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_parts(stream, Some(peer_addr), State::Established))
    }

    fn from_parts(stream: StdTcpStream, peer_addr: Option<SocketAddr>, state: State) -> Self {
        Self {
            stream: Some(stream),
            state,
            peer_addr,
            mode: DEFAULT_HEADER_MODE,
            send_rc4: Rc4::disabled(),
            recv_rc4: Rc4::disabled(),
            recv_stream: MemStream::new(STREAM_PAGE_SIZE),
            send_stream: MemStream::new(STREAM_PAGE_SIZE),
            writable_armed: false,
            nodelay: true,
        }
    }

    pub fn with_header_mode(mut self, mode: HeaderMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        if let Some(stream) = &self.stream {
            let _ = stream.set_nodelay(nodelay);
        }
        self
    }

    /// Sets `TCP_NODELAY` on the underlying socket, if still open.
    pub fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        self.nodelay = nodelay;
        match &self.stream {
            Some(stream) => stream.set_nodelay(nodelay),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    pub fn set_send_rc4(&mut self, cipher: Rc4) {
        self.send_rc4 = cipher;
    }

    pub fn set_recv_rc4(&mut self, cipher: Rc4) {
        self.recv_rc4 = cipher;
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    #[inline]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Returns the bytes buffered but not yet assembled into a full frame.
    #[inline]
    pub fn available(&self) -> usize {
        self.recv_stream.len()
    }

    pub fn register(&self, poller: &mut Poller, token: u64) -> io::Result<()> {
        let fd = self.raw_fd().expect("register called on a closed client");
        let interest = if self.state == State::Connecting { Interest::WRITABLE } else { Interest::READABLE };
        poller.register(fd, token, interest)
    }

    /// Call once the poller reports writability while `state() ==
    /// Connecting`. Resolves `SO_ERROR` to decide whether the connect
    /// succeeded.
    pub fn poll_connect_complete(&mut self, poller: &mut Poller, token: u64) -> Result<bool, Error> {
        safe_assert!(self.state == State::Connecting, "poll_connect_complete in non-Connecting state");
        let fd = self.raw_fd().ok_or(Error::WrongState { state: "Closed" })?;

        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if err != 0 {
            warn!(err, "tcp: connect failed");
            self.state = State::Closed;
            return Err(Error::Io(io::Error::from_raw_os_error(err)));
        }

        self.state = State::Established;
        if self.nodelay {
            let _ = self.stream.as_ref().unwrap().set_nodelay(true);
        }
        poller.reregister(fd, token, Interest::READABLE)?;
        Ok(true)
    }

    /// Sends one length-framed message, `mask` carried in mode 12's top
    /// header byte (ignored by every other mode). Queues it if the socket
    /// would block; previously queued data is always flushed first so
    /// ordering is preserved.
    pub fn send(&mut self, payload: &[u8], mask: u8, poller: &mut Poller, token: u64) -> Result<(), Error> {
        self.vsend(&[payload], mask, poller, token)
    }

    /// Like [`Self::send`], but assembles the payload from several slices
    /// without requiring the caller to concatenate them first (§5's
    /// scatter-gather send).
    pub fn vsend(&mut self, slices: &[&[u8]], mask: u8, poller: &mut Poller, token: u64) -> Result<(), Error> {
        if self.state != State::Established {
            return Err(Error::WrongState { state: "not Established" });
        }
        let payload_len: usize = slices.iter().map(|s| s.len()).sum();
        if payload_len as u64 > framing::max_payload_len(self.mode) {
            return Err(Error::FrameTooLarge { len: payload_len, max: framing::max_payload_len(self.mode) as usize });
        }

        let header = framing::encode_header(payload_len as u32, self.mode, mask);
        let mut frame = Vec::with_capacity(header.as_slice().len() + payload_len);
        frame.extend_from_slice(header.as_slice());
        for slice in slices {
            frame.extend_from_slice(slice);
        }
        // The whole frame is ciphered, header included (§4.6) — the peer's
        // recv_rc4 must decrypt raw bytes off the wire before it can even
        // see a length field.
        self.send_rc4.crypt(&mut frame);

        if !self.send_stream.is_empty() {
            self.send_stream.write(&frame);
            return self.arm_writable(poller, token);
        }

        let stream = self.stream.as_mut().expect("Established state implies a live stream");
        match stream.write(&frame) {
            Ok(0) => {
                warn!("tcp: write returned 0, treating as closed");
                self.state = State::Closed;
                Err(Error::PeerClosed)
            }
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => {
                self.send_stream.write(&frame[n..]);
                self.arm_writable(poller, token)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.send_stream.write(&frame);
                self.arm_writable(poller, token)
            }
            Err(e) => {
                warn!(?e, "tcp: write failed");
                self.state = State::Closed;
                Err(Error::Io(e))
            }
        }
    }

    fn arm_writable(&mut self, poller: &mut Poller, token: u64) -> Result<(), Error> {
        if !self.writable_armed {
            let fd = self.raw_fd().expect("arm_writable requires a live stream");
            poller.reregister(fd, token, Interest::both())?;
            self.writable_armed = true;
        }
        Ok(())
    }

    /// Flushes the send backlog. Call when the poller reports writability.
    pub fn drain_backlog(&mut self, poller: &mut Poller, token: u64) -> Result<(), Error> {
        let stream = self.stream.as_mut().ok_or(Error::WrongState { state: "Closed" })?;
        loop {
            let window = self.send_stream.flat();
            if window.is_empty() {
                break;
            }
            match stream.write(window) {
                Ok(0) => {
                    self.state = State::Closed;
                    return Err(Error::PeerClosed);
                }
                Ok(n) => {
                    let full = n == window.len();
                    self.send_stream.drop_front(n);
                    if !full {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(?e, "tcp: drain backlog write");
                    self.state = State::Closed;
                    return Err(Error::Io(e));
                }
            }
        }

        if self.send_stream.is_empty() && self.writable_armed {
            let fd = self.raw_fd().expect("writable_armed implies a live stream");
            poller.reregister(fd, token, Interest::READABLE)?;
            self.writable_armed = false;
        }
        Ok(())
    }

    /// Reads and decrypts as many frames as are currently available,
    /// invoking `on_msg` with each payload and its mode-12 mask (`0` for
    /// every other mode) in order. Stops at `WouldBlock`; the peer closing
    /// is reported as `Err(PeerClosed)` (the caller already has every frame
    /// that had fully arrived).
    pub fn recv_all<F: FnMut(&[u8], u8)>(&mut self, mut on_msg: F) -> Result<(), Error> {
        let fill_err = self.fill_recv_stream().err();

        loop {
            match self.try_decode_frame() {
                Ok(Some((payload, mask))) => on_msg(&payload, mask),
                Ok(None) => break,
                Err(e) => {
                    self.state = State::Closed;
                    return Err(e);
                }
            }
        }

        match fill_err {
            None => Ok(()),
            Some(e) => {
                self.state = State::Closed;
                Err(e)
            }
        }
    }

    /// Pulls raw bytes off the socket, decrypting them in place as they
    /// arrive so the keystream advances in wire order regardless of how the
    /// reads are chunked, and buffers the plaintext into `recv_stream`.
    /// Returns `Ok(())` once the socket would block.
    fn fill_recv_stream(&mut self) -> Result<(), Error> {
        let mut scratch = [0u8; RECV_CHUNK];
        loop {
            let stream = self.stream.as_mut().ok_or(Error::WrongState { state: "Closed" })?;
            match stream.read(&mut scratch) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => {
                    self.recv_rc4.crypt(&mut scratch[..n]);
                    self.recv_stream.write(&scratch[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Pulls one full frame out of `recv_stream`, if one has fully
    /// buffered. Returns `Ok(None)` if more bytes are still needed.
    fn try_decode_frame(&mut self) -> Result<Option<(Vec<u8>, u8)>, Error> {
        let header_len = self.mode.header_len();
        let mut header_buf = vec![0u8; header_len];
        if self.recv_stream.peek(&mut header_buf) < header_len {
            return Ok(None);
        }
        let (total_len, mask) = framing::decode_available(&header_buf, self.mode)
            .expect("header_len bytes buffered implies decode_available succeeds");
        let payload_len = total_len - header_len;
        if payload_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge { len: payload_len, max: MAX_FRAME_LEN });
        }
        if self.recv_stream.len() < total_len {
            return Ok(None);
        }

        let mut frame = vec![0u8; total_len];
        self.recv_stream.peek(&mut frame);
        self.recv_stream.drop_front(total_len);
        Ok(Some((frame.split_off(header_len), mask)))
    }

    /// Blocks up to `millis` for readiness, draining any pending send
    /// backlog and dispatching every frame that arrives to `on_msg` (§4.8).
    /// A convenience wrapper around [`Poller::wait`] for callers driving a
    /// single client outside a [`crate::tcp::host::Host`].
    pub fn wait<F: FnMut(&[u8], u8)>(
        &mut self,
        millis: u64,
        poller: &mut Poller,
        token: u64,
        on_msg: F,
    ) -> Result<(), Error> {
        let mut events: Vec<Event> = Vec::new();
        poller.wait(Some(Duration::from_millis(millis)), &mut events)?;

        let mut saw_our_token = false;
        let mut writable = false;
        let mut readable = false;
        for event in &events {
            if event.token != token {
                continue;
            }
            saw_our_token = true;
            writable |= event.writable;
            readable |= event.error || event.readable;
        }
        if !saw_our_token {
            return Ok(());
        }

        if self.state == State::Connecting && writable {
            self.poll_connect_complete(poller, token)?;
            return Ok(());
        }
        if writable {
            self.drain_backlog(poller, token)?;
        }
        if readable {
            self.recv_all(on_msg)?;
        }
        Ok(())
    }

    pub fn close(&mut self, poller: &mut Poller) {
        if let Some(stream) = self.stream.take() {
            let fd = stream.as_raw_fd();
            let _ = poller.deregister(fd);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = State::Closed;
        self.send_stream.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connect_then_framed_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (sock, peer) = listener.accept().unwrap();
            let mut client = Client::from_accepted(sock, peer).unwrap();
            let mut received = None;
            while received.is_none() {
                client.recv_all(|msg, _mask| received = Some(msg.to_vec())).unwrap();
            }
            let mut poller = Poller::new(crate::poll::Device::Poll).unwrap();
            client.send(&received.unwrap(), 0, &mut poller, 0).unwrap();
        });

        // Give the listener a moment without relying on a poller for this
        // simple directed test.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let stream = StdTcpStream::connect(addr).unwrap();
        let mut client = Client::from_parts(stream, Some(addr), State::Established);
        let mut poller = Poller::new(crate::poll::Device::Poll).unwrap();
        client.send(b"ping", 0, &mut poller, 0).unwrap();

        let mut got = None;
        while got.is_none() {
            client.recv_all(|msg, _mask| got = Some(msg.to_vec())).unwrap();
        }
        assert_eq!(got.unwrap(), b"ping");
        server.join().unwrap();
    }

    #[test]
    fn rejects_oversized_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = StdTcpStream::connect(addr).unwrap();
        let mut client = Client::from_parts(stream, Some(addr), State::Established)
            .with_header_mode(HeaderMode::ByteLsb);
        let mut poller = Poller::new(crate::poll::Device::Poll).unwrap();
        let payload = vec![0u8; 300];
        let err = client.send(&payload, 0, &mut poller, 0).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[test]
    fn mask_round_trips_through_mode_12() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (sock, peer) = listener.accept().unwrap();
            let mut client = Client::from_accepted(sock, peer).unwrap().with_header_mode(HeaderMode::DwordMask);
            let mut seen_mask = None;
            while seen_mask.is_none() {
                client.recv_all(|_msg, mask| seen_mask = Some(mask)).unwrap();
            }
            seen_mask.unwrap()
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        let stream = StdTcpStream::connect(addr).unwrap();
        let mut client =
            Client::from_parts(stream, Some(addr), State::Established).with_header_mode(HeaderMode::DwordMask);
        let mut poller = Poller::new(crate::poll::Device::Poll).unwrap();
        client.send(b"tagged", 0x42, &mut poller, 0).unwrap();

        assert_eq!(server.join().unwrap(), 0x42);
    }

    #[test]
    fn vsend_concatenates_slices_into_one_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (sock, peer) = listener.accept().unwrap();
            let mut client = Client::from_accepted(sock, peer).unwrap();
            let mut received = None;
            while received.is_none() {
                client.recv_all(|msg, _mask| received = Some(msg.to_vec())).unwrap();
            }
            received.unwrap()
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        let stream = StdTcpStream::connect(addr).unwrap();
        let mut client = Client::from_parts(stream, Some(addr), State::Established);
        let mut poller = Poller::new(crate::poll::Device::Poll).unwrap();
        client.vsend(&[b"hello, ", b"world"], 0, &mut poller, 0).unwrap();

        assert_eq!(server.join().unwrap(), b"hello, world");
    }
}
