//! End-to-end socket scenarios for [`framewire_net::tcp::host::Host`],
//! following `flux-network/tests/tcp_roundtrip.rs`'s thread-based
//! client/server pattern: one thread drives the `Host`'s poll loop, the
//! other drives a bare `TcpStream` speaking the same wire framing directly.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use framewire_net::framing::{self, HeaderMode};
use framewire_net::poll::Device;
use framewire_net::rc4::Rc4;
use framewire_net::tcp::host::{Host, HostEvent};

fn run_until<F: FnMut(&mut Host) -> bool>(host: &mut Host, mut done: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        host.process(Some(Duration::from_millis(50))).unwrap();
        if done(host) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
    }
}

fn send_frame(stream: &mut TcpStream, mode: HeaderMode, payload: &[u8]) {
    let header = framing::encode_header(payload.len() as u32, mode, 0);
    stream.write_all(header.as_slice()).unwrap();
    stream.write_all(payload).unwrap();
}

fn recv_frame(stream: &mut TcpStream, mode: HeaderMode) -> Vec<u8> {
    let hlen = mode.header_len();
    let mut header = vec![0u8; hlen];
    stream.read_exact(&mut header).unwrap();
    let (total, _) = framing::decode_available(&header, mode).unwrap();
    let mut payload = vec![0u8; total - hlen];
    stream.read_exact(&mut payload).unwrap();
    payload
}

#[test]
fn echoes_framed_messages_to_and_from_multiple_clients() {
    let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), Device::Poll).unwrap();
    let addr = host.local_addr().unwrap();

    let clients = std::thread::spawn(move || {
        let mut results = Vec::new();
        for i in 0..3u8 {
            let mut stream = TcpStream::connect(addr).unwrap();
            let payload = vec![i; 16];
            send_frame(&mut stream, HeaderMode::EDwordLsb, &payload);
            let echoed = recv_frame(&mut stream, HeaderMode::EDwordLsb);
            results.push(echoed == payload);
        }
        results
    });

    let mut echoed_count = 0;
    run_until(&mut host, |host| {
        while let Some(event) = host.next() {
            if let HostEvent::Data { handle, payload } = event {
                host.send(handle, &payload).unwrap();
                echoed_count += 1;
            }
        }
        echoed_count >= 3
    });

    let results = clients.join().unwrap();
    assert!(results.into_iter().all(|ok| ok));
}

#[test]
fn rc4_ciphers_are_independent_per_direction() {
    let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), Device::Poll).unwrap();
    let addr = host.local_addr().unwrap();
    let key = b"shared-secret-key";

    let client_thread = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut send_cipher = Rc4::new(key);
        let mut recv_cipher = Rc4::new(key);

        let mut payload = b"top secret payload".to_vec();
        send_cipher.crypt(&mut payload);
        send_frame(&mut stream, HeaderMode::EDwordLsb, &payload);

        let mut echoed = recv_frame(&mut stream, HeaderMode::EDwordLsb);
        recv_cipher.crypt(&mut echoed);
        echoed
    });

    let mut echoed = false;
    run_until(&mut host, |host| {
        while let Some(event) = host.next() {
            match event {
                HostEvent::Join { handle: h, .. } => {
                    host.set_client_cipher(h, Rc4::new(key), Rc4::new(key));
                }
                HostEvent::Data { handle: h, payload } => {
                    host.send(h, &payload).unwrap();
                    echoed = true;
                }
                HostEvent::Leave { .. } => {}
            }
        }
        echoed
    });

    let plaintext = client_thread.join().unwrap();
    assert_eq!(plaintext, b"top secret payload");
}

#[test]
fn idle_connections_are_swept() {
    let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), Device::Poll).unwrap();
    let addr = host.local_addr().unwrap();
    host = host.with_idle_timeout(Duration::from_millis(100));

    let _stream = TcpStream::connect(addr).unwrap();

    let mut left = false;
    run_until(&mut host, |host| {
        while let Some(event) = host.next() {
            if matches!(event, HostEvent::Leave { .. }) {
                left = true;
            }
        }
        left
    });
    assert!(left);
}

#[test]
fn stale_handle_after_disconnect_is_rejected() {
    let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), Device::Poll).unwrap();
    let addr = host.local_addr().unwrap();

    let mut first_handle = None;
    {
        let stream = TcpStream::connect(addr).unwrap();
        run_until(&mut host, |host| {
            while let Some(event) = host.next() {
                if let HostEvent::Join { handle, .. } = event {
                    first_handle = Some(handle);
                }
            }
            first_handle.is_some()
        });
        drop(stream);
    }

    let handle = first_handle.unwrap();
    // Drain the disconnect event and give the slot a chance to be reused.
    run_until(&mut host, |host| {
        let mut saw_leave = false;
        while let Some(event) = host.next() {
            if matches!(event, HostEvent::Leave { .. }) {
                saw_leave = true;
            }
        }
        saw_leave
    });

    assert!(host.send(handle, b"too late").is_err());
}
