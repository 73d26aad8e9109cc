// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Adapter running a terminal task in a background thread.
//!
//! The first cycle runs the child synchronously so it can settle the
//! data distribution (sinks discover active ranks on their first call).
//! Afterwards each chunk is deep-copied into a bounded ring drained by a
//! worker thread; backpressure is expressed by the ring, not by blocking
//! the ingest loop indefinitely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, error, warn};

use super::{Task, TaskError, TaskFactory};
use crate::chunk::VisChunk;
use crate::config::Configuration;
use crate::parset::Parset;

pub struct BufferedTask {
    lossless: bool,
    max_wait_s: u32,
    capacity: usize,
    child_name: String,
    /// Present until the worker thread takes ownership.
    child: Option<Box<dyn Task>>,
    child_active_for_all_ranks: bool,
    first_cycle: bool,
    tx: Option<Sender<VisChunk>>,
    stop: Arc<AtomicBool>,
    /// Set by the worker when the child fails; surfaced on the next call.
    child_failed: Arc<AtomicCell<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl BufferedTask {
    pub fn new(
        params: &Parset,
        config: &Configuration,
        factory: &TaskFactory,
    ) -> Result<BufferedTask, TaskError> {
        let lossless = params
            .bool_or("lossless", true)
            .map_err(crate::config::ConfigError::from)?;
        let max_wait_s = params
            .u32_or("maxwait", 30)
            .map_err(crate::config::ConfigError::from)?;
        let capacity = params
            .u32_or("size", 1)
            .map_err(crate::config::ConfigError::from)? as usize;
        let child_name = params
            .string("child")
            .map_err(crate::config::ConfigError::from)?;
        debug!("Buffered adapter around '{child_name}', buffer size {capacity}");

        let child = factory.create(&config.task_by_name(&child_name)?)?;
        let child_active_for_all_ranks = child.is_always_active();
        Ok(BufferedTask {
            lossless,
            max_wait_s,
            capacity,
            child_name,
            child: Some(child),
            child_active_for_all_ranks,
            first_cycle: true,
            tx: None,
            stop: Arc::new(AtomicBool::new(false)),
            child_failed: Arc::new(AtomicCell::new(false)),
            handle: None,
        })
    }

    fn start_worker(&mut self) {
        let (tx, rx) = bounded(self.capacity);
        self.tx = Some(tx);
        let mut child = self.child.take().expect("child still owned by the adapter");
        let stop = Arc::clone(&self.stop);
        let failed = Arc::clone(&self.child_failed);
        let child_name = self.child_name.clone();
        let handle = std::thread::Builder::new()
            .name("buffered-task".to_string())
            .spawn(move || worker_loop(&mut *child, &rx, &stop, &failed, &child_name))
            .expect("spawning the buffered worker");
        self.handle = Some(handle);
    }

    fn enqueue(&mut self, copy: VisChunk) -> Result<(), TaskError> {
        let tx = self.tx.as_ref().expect("worker running");
        let mut pending = match tx.try_send(copy) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(copy)) => copy,
            Err(TrySendError::Disconnected(_)) => {
                return Err(TaskError::Inconsistent(
                    "buffered worker thread is gone".to_string(),
                ))
            }
        };
        // Ring is full: wait in one-second slots up to the limit.
        for attempt in 0..self.max_wait_s {
            match tx.send_timeout(pending, Duration::from_secs(1)) {
                Ok(()) => {
                    if attempt > 0 {
                        debug!("Successfully queued data chunk after {} attempts", attempt + 1);
                    }
                    return Ok(());
                }
                Err(crossbeam_channel::SendTimeoutError::Timeout(copy)) => pending = copy,
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                    return Err(TaskError::Inconsistent(
                        "buffered worker thread is gone".to_string(),
                    ))
                }
            }
        }
        if self.lossless {
            return Err(TaskError::BufferOverflow(self.max_wait_s));
        }
        error!(
            "Timeout of {} seconds waiting to queue a data chunk for buffered processing - \
             some data lost",
            self.max_wait_s
        );
        Ok(())
    }
}

fn worker_loop(
    child: &mut dyn Task,
    rx: &Receiver<VisChunk>,
    stop: &AtomicBool,
    failed: &AtomicCell<bool>,
    child_name: &str,
) {
    debug!("Buffered worker thread running for child '{child_name}'");
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(chunk) => {
                let mut holder = Some(chunk);
                if let Err(e) = child.process(&mut holder) {
                    error!("Child task '{child_name}' failed in the buffered worker: {e}");
                    failed.store(true);
                }
                if holder.is_none() {
                    warn!(
                        "Child task of the buffered adapter attempted to change the data \
                         distribution - not supported"
                    );
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Buffered worker thread finishing for child '{child_name}'");
}

impl Task for BufferedTask {
    fn name(&self) -> &str {
        "BufferedTask"
    }

    fn is_always_active(&self) -> bool {
        self.child_active_for_all_ranks
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        if self.child_failed.load() {
            return Err(TaskError::Inconsistent(format!(
                "child task '{}' failed in the buffered worker",
                self.child_name
            )));
        }
        if self.first_cycle {
            self.first_cycle = false;
            // First cycle in the calling thread: locks in the data
            // distribution pattern.
            debug!(
                "Buffered task adapter (child: '{}') - first cycle, processing in the main thread",
                self.child_name
            );
            let child = self.child.as_mut().expect("child owned until worker start");
            child.process(chunk)?;
            self.child_active_for_all_ranks = child.is_always_active();
            if self.child_active_for_all_ranks {
                return Err(TaskError::Inconsistent(
                    "tasks which are active for all ranks beyond the first cycle are not \
                     supported by the buffered adapter"
                        .to_string(),
                ));
            }
            if chunk.is_some() {
                debug!(
                    "Buffered task adapter (child: '{}') - this rank has data, starting the \
                     worker thread",
                    self.child_name
                );
                self.start_worker();
            } else {
                debug!(
                    "Buffered task adapter (child: '{}') - this rank is permanently deactivated \
                     for the child",
                    self.child_name
                );
            }
            return Ok(());
        }

        let chunk = chunk
            .as_ref()
            .ok_or(TaskError::UnexpectedIdleRank("BufferedTask"))?;
        if self.tx.is_none() {
            // The child never ran on this rank; nothing consumes copies.
            return Err(TaskError::Inconsistent(
                "buffered adapter received data on a rank deactivated on the first cycle"
                    .to_string(),
            ));
        }
        self.enqueue(chunk.clone())
    }
}

impl Drop for BufferedTask {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the sender lets the worker drain and exit.
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Child task recording what it processed, with a controllable stall.
    struct RecordingChild {
        seen: Arc<Mutex<Vec<f64>>>,
        delay: Duration,
    }

    impl Task for RecordingChild {
        fn name(&self) -> &str {
            "RecordingChild"
        }

        fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
            std::thread::sleep(self.delay);
            if let Some(c) = chunk {
                self.seen.lock().unwrap().push(c.time);
            }
            Ok(())
        }
    }

    fn adapter(child: Box<dyn Task>, lossless: bool, capacity: usize) -> BufferedTask {
        BufferedTask {
            lossless,
            max_wait_s: 1,
            capacity,
            child_name: "RecordingChild".to_string(),
            child: Some(child),
            child_active_for_all_ranks: false,
            first_cycle: true,
            tx: None,
            stop: Arc::new(AtomicBool::new(false)),
            child_failed: Arc::new(AtomicCell::new(false)),
            handle: None,
        }
    }

    fn chunk(time: f64) -> VisChunk {
        let mut chunk = VisChunk::new(1, 2, 1, 1);
        chunk.time = time;
        chunk
    }

    #[test]
    fn first_cycle_runs_synchronously_then_queues() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let child = Box::new(RecordingChild {
            seen: Arc::clone(&seen),
            delay: Duration::ZERO,
        });
        let mut task = adapter(child, true, 4);

        let mut holder = Some(chunk(1.0));
        task.process(&mut holder).unwrap();
        // Synchronous on the first cycle.
        assert_eq!(seen.lock().unwrap().as_slice(), &[1.0]);

        let mut holder = Some(chunk(2.0));
        task.process(&mut holder).unwrap();
        let mut holder = Some(chunk(3.0));
        task.process(&mut holder).unwrap();
        // The worker drains asynchronously.
        for _ in 0..100 {
            if seen.lock().unwrap().len() == 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(seen.lock().unwrap().as_slice(), &[1.0, 2.0, 3.0]);
        // The caller's chunk is untouched by queueing.
        assert!(holder.is_some());
    }

    #[test]
    fn lossless_overflow_is_fatal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        // The child stalls far longer than maxwait.
        let child = Box::new(RecordingChild {
            seen,
            delay: Duration::from_secs(10),
        });
        let mut task = adapter(child, true, 1);
        let mut holder = Some(chunk(1.0));
        task.process(&mut holder).unwrap();
        // Fill the ring (the worker is stalled in the child).
        let mut holder = Some(chunk(2.0));
        task.process(&mut holder).unwrap();
        let mut overflow = false;
        for time in 3..6 {
            let mut holder = Some(chunk(time as f64));
            if matches!(
                task.process(&mut holder),
                Err(TaskError::BufferOverflow(_))
            ) {
                overflow = true;
                break;
            }
        }
        assert!(overflow, "lossless adapter must fail on overflow");
        // Detach rather than join the stalled worker on teardown.
        drop(task.handle.take());
    }

    #[test]
    fn lossy_overflow_drops_without_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let child = Box::new(RecordingChild {
            seen,
            delay: Duration::from_secs(10),
        });
        let mut task = adapter(child, false, 1);
        let mut holder = Some(chunk(1.0));
        task.process(&mut holder).unwrap();
        for time in 2..6 {
            let mut holder = Some(chunk(time as f64));
            assert!(task.process(&mut holder).is_ok());
        }
        drop(task.handle.take());
    }
}
