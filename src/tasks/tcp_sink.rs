// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Terminal task publishing serialised chunks over TCP.
//!
//! Best-effort: if the receiver is away or slow, the cycle's chunk is
//! dropped with an error log and the connection is retried next cycle.
//! Stalling the ingest loop on a monitoring consumer is never worth it.

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, error};

use super::{Task, TaskError};
use crate::chunk::wire;
use crate::chunk::VisChunk;
use crate::config::Configuration;
use crate::monitoring;
use crate::parset::Parset;

pub struct TCPSink {
    endpoint: String,
    stream: Option<TcpStream>,
    chunks_sent: u64,
    chunks_dropped: u64,
}

impl TCPSink {
    pub fn new(params: &Parset, _config: &Configuration) -> Result<TCPSink, TaskError> {
        let hostname = params
            .string("dest.hostname")
            .map_err(crate::config::ConfigError::from)?;
        let port = params
            .u32("dest.port")
            .map_err(crate::config::ConfigError::from)?;
        Ok(TCPSink {
            endpoint: format!("{hostname}:{port}"),
            stream: None,
            chunks_sent: 0,
            chunks_dropped: 0,
        })
    }

    fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        match TcpStream::connect(&self.endpoint) {
            Ok(stream) => {
                let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
                debug!("Connected to downstream consumer at {}", self.endpoint);
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                error!("Cannot connect to {}: {e}; dropping this cycle", self.endpoint);
                false
            }
        }
    }
}

impl Task for TCPSink {
    fn name(&self) -> &str {
        "TCPSink"
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let chunk = chunk
            .as_ref()
            .ok_or(TaskError::UnexpectedIdleRank("TCPSink"))?;
        if !self.ensure_connected() {
            self.chunks_dropped += 1;
            monitoring::update("TCPSinkChunksDropped", self.chunks_dropped as f64);
            return Ok(());
        }
        let payload = wire::encode_chunk(chunk);
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame
            .write_u32::<LittleEndian>(payload.len() as u32)
            .expect("vec write");
        frame.extend_from_slice(&payload);

        let stream = self.stream.as_mut().expect("connected above");
        match stream.write_all(&frame) {
            Ok(()) => {
                self.chunks_sent += 1;
                monitoring::update("TCPSinkChunksSent", self.chunks_sent as f64);
            }
            Err(e) => {
                error!("Failed to publish chunk to {}: {e}; will reconnect", self.endpoint);
                self.stream = None;
                self.chunks_dropped += 1;
                monitoring::update("TCPSinkChunksDropped", self.chunks_dropped as f64);
            }
        }
        Ok(())
    }
}
