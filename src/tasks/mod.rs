// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The task chain: everything downstream of the source.
//!
//! Each task is invoked once per cycle with a mutable handle to the
//! chunk. A task may mutate the chunk, replace it, or take it (leaving
//! `None` means this rank produces no output this tick); redistribution
//! tasks may instead put a chunk into a handle that arrived empty. Tasks
//! that participate in collective communication or may activate a rank
//! report `is_always_active`, which makes the driver call them even with
//! an empty handle.

mod beam_scatter;
mod buffered;
mod calc_uvw;
mod chan_avg;
mod chan_merge;
mod flag;
mod fringe_rotation;
mod ms_sink;
mod quack;
mod shadow_flag;
mod tcp_sink;

pub use beam_scatter::BeamScatterTask;
pub use buffered::BufferedTask;
pub use calc_uvw::CalcUVWTask;
pub use chan_avg::ChannelAvgTask;
pub use chan_merge::ChannelMergeTask;
pub use flag::FlagTask;
pub use fringe_rotation::FringeRotationTask;
pub use ms_sink::MSSink;
pub use quack::QuackTask;
pub use shadow_flag::ShadowFlagTask;
pub use tcp_sink::TCPSink;

use std::sync::Arc;

use thiserror::Error;

use crate::chunk::wire::WireError;
use crate::chunk::{ChunkError, VisChunk};
use crate::comms::{Communicator, TransportError};
use crate::config::{ConfigError, Configuration, TaskDesc, TaskKind};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{0}")]
    Chunk(#[from] ChunkError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Number of channels ({n_chan}) is not a multiple of the averaging factor ({averaging})")]
    AveragingMismatch { n_chan: usize, averaging: u32 },

    #[error(
        "Data corresponding to beam {beam} spread across non-contiguous blocks of rows \
         (row {row}); not supported"
    )]
    BeamsNotContiguous { beam: u32, row: usize },

    #[error("Timeout of {0} seconds waiting to queue a data chunk for buffered processing")]
    BufferOverflow(u32),

    #[error("Task '{0}' did not expect an empty chunk handle on this rank")]
    UnexpectedIdleRank(&'static str),

    #[error("Inconsistent pipeline state: {0}")]
    Inconsistent(String),

    #[error("{0}")]
    Wire(#[from] WireError),

    #[error("Sink IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A pipeline task. `process` sees the state the previous task left.
pub trait Task: Send {
    fn name(&self) -> &str;

    /// Whether `process` must be invoked even when this rank holds no
    /// chunk this tick.
    fn is_always_active(&self) -> bool {
        false
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError>;
}

/// Instantiates tasks from their descriptors.
pub struct TaskFactory {
    config: Configuration,
    comm: Arc<dyn Communicator>,
}

impl TaskFactory {
    pub fn new(config: Configuration, comm: Arc<dyn Communicator>) -> TaskFactory {
        TaskFactory { config, comm }
    }

    /// Create a (non-source) task. Source kinds are built by the
    /// pipeline driver, which owns the stream plumbing they need.
    pub fn create(&self, desc: &TaskDesc) -> Result<Box<dyn Task>, TaskError> {
        let params = &desc.params;
        let task: Box<dyn Task> = match desc.kind {
            TaskKind::ChannelAvg => Box::new(ChannelAvgTask::new(params)?),
            TaskKind::ChannelMerge => Box::new(ChannelMergeTask::new(
                params,
                &self.config,
                Arc::clone(&self.comm),
            )?),
            TaskKind::BeamScatter => Box::new(BeamScatterTask::new(
                params,
                &self.config,
                Arc::clone(&self.comm),
            )?),
            TaskKind::CalcUVW => Box::new(CalcUVWTask::new(params, &self.config)?),
            TaskKind::FringeRotation => Box::new(FringeRotationTask::new(params, &self.config)?),
            TaskKind::Flag => Box::new(FlagTask::new(params)?),
            TaskKind::Quack => Box::new(QuackTask::new(params, &self.config)?),
            TaskKind::ShadowFlag => Box::new(ShadowFlagTask::new(params, &self.config)?),
            TaskKind::MSSink => Box::new(MSSink::new(params, &self.config, Arc::clone(&self.comm))?),
            TaskKind::TCPSink => Box::new(TCPSink::new(params, &self.config)?),
            TaskKind::Buffered => Box::new(BufferedTask::new(params, &self.config, self)?),
            TaskKind::MergedSource | TaskKind::NoMetadataSource => {
                return Err(TaskError::Config(ConfigError::UnknownTaskKind(format!(
                    "'{}' is a source and cannot appear mid-chain",
                    desc.name
                ))))
            }
        };
        Ok(task)
    }
}
