// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The visibility datagram source.
//!
//! A background thread drains the UDP socket into a bounded ring so that
//! the cycle-level logic never blocks the kernel buffers. The ring is
//! SPSC: the receive thread produces, the source task consumes. When the
//! ring fills, datagrams are dropped and counted; late or lost data is
//! flagged downstream, never retransmitted.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, warn};

use super::datagram::{VisDatagram, DATAGRAM_SIZE};

/// Bounded, timed-blocking access to the datagram stream of one rank.
pub trait VisSource: Send {
    /// The next datagram, or `None` if the timeout expires first. A
    /// timeout must not be treated as an error; the source task
    /// interprets repeated empties as an idle stream.
    fn next(&mut self, timeout: Duration) -> Option<Box<VisDatagram>>;

    /// Current (occupancy, capacity) of the receive ring.
    fn buffer_usage(&self) -> (usize, usize);
}

/// UDP-backed implementation.
pub struct UdpVisSource {
    rx: Receiver<Box<VisDatagram>>,
    capacity: usize,
    local_addr: std::net::SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl UdpVisSource {
    /// Bind `addr` and start the receive loop. `rcvbuf_bytes` is passed
    /// to SO_RCVBUF; the high datagram rate needs far more than the
    /// kernel default.
    pub fn new(addr: &str, capacity: usize, rcvbuf_bytes: usize) -> std::io::Result<UdpVisSource> {
        let socket = UdpSocket::bind(addr)?;
        {
            let raw = socket2::SockRef::from(&socket);
            if let Err(e) = raw.set_recv_buffer_size(rcvbuf_bytes) {
                warn!("Could not set SO_RCVBUF to {rcvbuf_bytes}: {e}");
            }
        }
        // The receive loop must notice the stop flag even with no
        // traffic.
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = bounded(capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("vis-recv".to_string())
            .spawn(move || receive_loop(socket, tx, thread_stop))
            .expect("spawning the receive thread");
        Ok(UdpVisSource {
            rx,
            capacity,
            local_addr,
            stop,
            handle: Some(handle),
        })
    }

    /// The address the receive socket is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

fn receive_loop(socket: UdpSocket, tx: Sender<Box<VisDatagram>>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 65_536];
    let mut dropped: u64 = 0;
    let mut malformed: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                error!("Datagram receive error: {e}");
                continue;
            }
        };
        if n != DATAGRAM_SIZE {
            malformed += 1;
            if malformed.is_power_of_two() {
                warn!("Received {n}-byte datagram, expected {DATAGRAM_SIZE} ({malformed} so far)");
            }
            continue;
        }
        let dg = match VisDatagram::decode(&buf[..n]) {
            Ok(dg) => dg,
            Err(e) => {
                malformed += 1;
                if malformed.is_power_of_two() {
                    warn!("Undecodable datagram: {e} ({malformed} so far)");
                }
                continue;
            }
        };
        match tx.try_send(Box::new(dg)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    error!("Receive ring full; dropped {dropped} datagram(s) so far");
                }
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    debug!("Datagram receive loop finishing");
}

impl VisSource for UdpVisSource {
    fn next(&mut self, timeout: Duration) -> Option<Box<VisDatagram>> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn buffer_usage(&self) -> (usize, usize) {
        (self.rx.len(), self.capacity)
    }
}

impl Drop for UdpVisSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Channel-backed implementation for tests and mock runs: whatever is
/// pushed on the sender comes out of `next`.
pub struct QueueVisSource {
    rx: Receiver<Box<VisDatagram>>,
    capacity: usize,
}

impl QueueVisSource {
    pub fn new(capacity: usize) -> (Sender<Box<VisDatagram>>, QueueVisSource) {
        let (tx, rx) = bounded(capacity);
        (tx, QueueVisSource { rx, capacity })
    }
}

impl VisSource for QueueVisSource {
    fn next(&mut self, timeout: Duration) -> Option<Box<VisDatagram>> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn buffer_usage(&self) -> (usize, usize) {
        (self.rx.len(), self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_source_delivers_and_times_out() {
        let (tx, mut source) = QueueVisSource::new(8);
        let dg = VisDatagram {
            timestamp: 42,
            ..VisDatagram::default()
        };
        tx.send(Box::new(dg)).unwrap();
        assert_eq!(source.buffer_usage(), (1, 8));
        let out = source.next(Duration::from_millis(10)).unwrap();
        assert_eq!(out.timestamp, 42);
        // Empty buffer: a timeout yields None without crashing.
        assert!(source.next(Duration::from_millis(5)).is_none());
        assert_eq!(source.buffer_usage(), (0, 8));
    }

    #[test]
    fn udp_source_round_trip() {
        let mut source = UdpVisSource::new("127.0.0.1:0", 16, 1 << 20).unwrap();
        let dest = source.local_addr();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dg = VisDatagram {
            timestamp: 77,
            product: 5,
            ..VisDatagram::default()
        };
        sender.send_to(&dg.encode(), dest).unwrap();
        // A malformed runt datagram must be skipped, not delivered.
        sender.send_to(&[1, 2, 3], dest).unwrap();

        let got = source.next(Duration::from_secs(5)).expect("datagram");
        assert_eq!(got.timestamp, 77);
        assert_eq!(got.product, 5);
        assert!(source.next(Duration::from_millis(200)).is_none());
    }
}
