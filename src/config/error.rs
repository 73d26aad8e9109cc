// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::parset::ParsetError;

/// Errors raised while building the immutable configuration snapshot. All
/// of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Parset(#[from] ParsetError),

    #[error("Duplicated element was found in service_ranks field: {0}")]
    DuplicateServiceRank(u32),

    #[error("Number of processes is expected to be 1 in the serial case; you have {0}")]
    SerialWithMultipleProcs(i32),

    #[error("Service ranks are not supported in the serial case")]
    SerialWithServiceRanks,

    #[error("Rank {rank} should not exceed the number of processes = {nprocs}")]
    RankOutOfRange { rank: i32, nprocs: i32 },

    #[error("Correlator mode '{0}' not found")]
    UnknownCorrelatorMode(String),

    #[error("Antenna '{0}' is listed but has no ITRF position defined")]
    AntennaWithoutPosition(String),

    #[error("Expected exactly 3 elements for antenna '{name}' position, got {len}")]
    BadAntennaPosition { name: String, len: usize },

    #[error("Stokes configuration error: {0}")]
    BadStokes(String),

    #[error("Unknown task type '{0}'")]
    UnknownTaskKind(String),

    #[error("Task '{0}' is listed in tasklist but has no definition")]
    UndefinedTask(String),

    #[error(
        "The baseline map has to be either defined explicitly via the baselineids keyword \
         or via name, you have both"
    )]
    BaselineMapOverspecified,

    #[error("Only the 'standard' implicit baseline map is supported; you have '{0}'")]
    UnknownBaselineMapName(String),

    #[error("Baseline mapping for id {0} is missing or malformed")]
    BadBaselineEntry(i32),

    #[error("Antenna indices passed to slice are expected to be strictly increasing")]
    SliceIndicesNotIncreasing,

    #[error("Slice antenna index {index} exceeds the largest antenna in the map ({largest})")]
    SliceIndexOutOfRange { index: u32, largest: u32 },

    #[error("Taking a slice rejected all correlation products in the map")]
    SliceRejectedEverything,

    #[error("Feed configuration error: {0}")]
    BadFeedConfig(String),

    #[error("Frequency quantity '{0}' is malformed")]
    BadFrequency(String),
}
