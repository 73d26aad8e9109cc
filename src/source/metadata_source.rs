// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sources of per-integration metadata records.
//!
//! In multi-rank mode a single rank subscribes to the actual topic and
//! the [ParallelMetadataSource] adapter broadcasts every record to its
//! peers over the fabric, so that all receiving ranks share one time
//! base.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, warn};

use super::metadata::TosMetadata;
use crate::comms::{Communicator, TransportError};

/// One metadata record per integration cycle, timed-blocking.
pub trait MetadataSource: Send {
    fn next(&mut self, timeout: Duration) -> Option<TosMetadata>;
}

/// Channel-backed implementation for tests and fabricated streams.
pub struct QueueMetadataSource {
    rx: Receiver<TosMetadata>,
}

impl QueueMetadataSource {
    pub fn new(capacity: usize) -> (Sender<TosMetadata>, QueueMetadataSource) {
        let (tx, rx) = bounded(capacity);
        (tx, QueueMetadataSource { rx })
    }
}

impl MetadataSource for QueueMetadataSource {
    fn next(&mut self, timeout: Duration) -> Option<TosMetadata> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Subscriber reading length-prefixed metadata records from a TCP
/// endpoint. A background thread owns the connection and reconnects with
/// backoff; decoded records queue in a small ring (metadata is one record
/// per cycle, so depth is tiny).
pub struct TcpMetadataSource {
    rx: Receiver<TosMetadata>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TcpMetadataSource {
    pub fn new(endpoint: &str) -> TcpMetadataSource {
        let (tx, rx) = bounded(12);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let endpoint = endpoint.to_string();
        let handle = std::thread::Builder::new()
            .name("metadata-sub".to_string())
            .spawn(move || subscribe_loop(&endpoint, tx, thread_stop))
            .expect("spawning the metadata subscriber thread");
        TcpMetadataSource {
            rx,
            stop,
            handle: Some(handle),
        }
    }
}

fn subscribe_loop(endpoint: &str, tx: Sender<TosMetadata>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        let mut stream = match TcpStream::connect(endpoint) {
            Ok(s) => s,
            Err(e) => {
                debug!("Metadata endpoint {endpoint} not reachable: {e}");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
        debug!("Subscribed to metadata endpoint {endpoint}");
        'connection: while !stop.load(Ordering::Relaxed) {
            let mut header = [0u8; 4];
            match read_fully(&mut stream, &mut header) {
                ReadOutcome::Ok => {}
                ReadOutcome::TimedOut => continue,
                ReadOutcome::Gone => break 'connection,
            }
            let len = LittleEndian::read_u32(&header) as usize;
            let mut body = vec![0u8; len];
            match read_fully(&mut stream, &mut body) {
                ReadOutcome::Ok => {}
                ReadOutcome::TimedOut | ReadOutcome::Gone => break 'connection,
            }
            match TosMetadata::decode(&body) {
                Ok(record) => match tx.try_send(record) {
                    Ok(()) | Err(TrySendError::Full(_)) => {
                        // A full ring means the consumer fell behind by
                        // many cycles; the newest record is the one that
                        // matters, but dropping the incoming one keeps
                        // the stream aligned with the vis stream clock.
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                },
                Err(e) => warn!("Undecodable metadata record: {e}"),
            }
        }
        warn!("Metadata connection lost, reconnecting");
    }
}

enum ReadOutcome {
    Ok,
    TimedOut,
    Gone,
}

fn read_fully(stream: &mut TcpStream, buf: &mut [u8]) -> ReadOutcome {
    let mut done = 0;
    let mut stalls = 0;
    while done < buf.len() {
        match stream.read(&mut buf[done..]) {
            Ok(0) => return ReadOutcome::Gone,
            Ok(n) => done += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if done == 0 {
                    return ReadOutcome::TimedOut;
                }
                // Mid-record timeout: keep accumulating, but give up on
                // a publisher that stalls for a minute.
                stalls += 1;
                if stalls > 120 {
                    return ReadOutcome::Gone;
                }
            }
            Err(_) => return ReadOutcome::Gone,
        }
    }
    ReadOutcome::Ok
}

impl MetadataSource for TcpMetadataSource {
    fn next(&mut self, timeout: Duration) -> Option<TosMetadata> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for TcpMetadataSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Adapter sharing one subscription across all ranks: rank 0 reads the
/// real source and broadcasts each outcome (including timeouts) so every
/// rank's cycle clock stays aligned.
pub struct ParallelMetadataSource {
    inner: Option<Box<dyn MetadataSource>>,
    comm: Arc<dyn Communicator>,
}

impl ParallelMetadataSource {
    /// `inner` must be `Some` exactly on rank 0 of `comm`.
    pub fn new(
        inner: Option<Box<dyn MetadataSource>>,
        comm: Arc<dyn Communicator>,
    ) -> ParallelMetadataSource {
        assert_eq!(inner.is_some(), comm.rank() == 0);
        ParallelMetadataSource { inner, comm }
    }

    fn broadcast_round(&mut self, timeout: Duration) -> Result<Option<TosMetadata>, TransportError> {
        if let Some(inner) = self.inner.as_mut() {
            let record = inner.next(timeout);
            let payload = match &record {
                Some(r) => {
                    let mut buf = vec![1u8];
                    buf.extend_from_slice(&r.encode());
                    buf
                }
                None => vec![0u8],
            };
            self.comm.broadcast(0, Some(payload))?;
            Ok(record)
        } else {
            let payload = self.comm.broadcast(0, None)?;
            match payload.split_first() {
                Some((1, body)) => Ok(TosMetadata::decode(body)
                    .map_err(|e| TransportError::Malformed(e.to_string()))
                    .map(Some)?),
                Some((0, _)) => Ok(None),
                _ => Err(TransportError::Malformed(
                    "metadata broadcast payload".to_string(),
                )),
            }
        }
    }
}

impl MetadataSource for ParallelMetadataSource {
    fn next(&mut self, timeout: Duration) -> Option<TosMetadata> {
        match self.broadcast_round(timeout) {
            Ok(record) => record,
            Err(e) => {
                warn!("Metadata broadcast failed: {e}");
                None
            }
        }
    }
}
