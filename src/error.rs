// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all ingest-related errors. This should be the *only*
//! error enum the binary has to handle; it also decides the process exit
//! code.

use thiserror::Error;

use crate::chunk::ChunkError;
use crate::comms::TransportError;
use crate::config::ConfigError;
use crate::parset::ParsetError;
use crate::source::SourceError;
use crate::tasks::TaskError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("No pipeline tasks specified")]
    NoTasks,

    #[error("First task should be a source; '{0}' is not")]
    FirstTaskNotASource(String),

    #[error("A source task cannot run on a service rank")]
    SourceOnServiceRank,

    #[error("Cannot bind the visibility datagram socket: {0}")]
    VisSourceBind(std::io::Error),

    #[error("Rank {0} panicked")]
    RankPanicked(usize),

    #[error("{0}")]
    Parset(#[from] ParsetError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Task(#[from] TaskError),

    #[error("{0}")]
    Chunk(#[from] ChunkError),

    #[error("{0}")]
    Transport(#[from] TransportError),
}

impl IngestError {
    /// Process exit code: 1 for configuration errors, 2 for runtime
    /// errors (0 is success and 3 a signal-triggered stop, both decided
    /// by the binary).
    pub fn exit_code(&self) -> i32 {
        match self {
            IngestError::NoTasks
            | IngestError::FirstTaskNotASource(_)
            | IngestError::SourceOnServiceRank
            | IngestError::Parset(_)
            | IngestError::Config(_) => 1,
            IngestError::Source(SourceError::Config(_)) => 1,
            IngestError::Task(TaskError::Config(_)) => 1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_config_from_runtime() {
        assert_eq!(IngestError::NoTasks.exit_code(), 1);
        let config_err: IngestError =
            ConfigError::UnknownCorrelatorMode("zoom".to_string()).into();
        assert_eq!(config_err.exit_code(), 1);
        let runtime_err: IngestError = SourceError::DuplicateTimestamp(42).into();
        assert_eq!(runtime_err.exit_code(), 2);
    }
}
