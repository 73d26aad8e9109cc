// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Real-time ingest pipeline for a radio-interferometry correlator
//! back-end.
//!
//! Two concurrent network streams - a low-rate telescope metadata stream
//! and a high-rate visibility datagram stream - are fused into
//! cycle-aligned visibility chunks, pushed through a configurable task
//! chain (UVW recomputation, flagging, channel merging across ranks,
//! beam scattering, averaging) and written to a measurement set or
//! forwarded over TCP.

pub mod chunk;
pub mod comms;
pub mod config;
pub mod constants;
pub mod coord;
mod error;
pub mod monitoring;
pub mod parset;
pub mod pipeline;
pub mod source;
pub mod stokes;
pub mod tasks;
pub(crate) mod time;

// Re-exports.
pub use chunk::{c32, ChunkError, VisChunk};
pub use comms::{Communicator, LocalFabric};
pub use config::Configuration;
pub use error::IngestError;
pub use parset::Parset;
pub use pipeline::IngestPipeline;
pub use stokes::Stokes;
