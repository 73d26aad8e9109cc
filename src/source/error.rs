// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::chunk::ChunkError;
use crate::comms::TransportError;
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Invalid ScanID: {0}")]
    InvalidScan(i32),

    #[error("Metadata streaming ceased, unable to recover after {0} attempts")]
    MetadataStreamCeased(u32),

    #[error("Consecutive VisChunks have the same timestamp (BAT 0x{0:x})")]
    DuplicateTimestamp(u64),

    #[error(
        "Reached maximum number of retries for id={receiver_id}, the correlator does not \
         seem to send data to this rank. Reached the limit of {retries} retry attempts"
    )]
    NoDataForStream { receiver_id: i32, retries: u32 },

    #[error(
        "The length of the uvw vector for row={row} (antennas: {ant1} {ant2}, beam: {beam}) \
         is more than 1mm different from the baseline length expected from the array layout \
         ({uvw_length} m vs. {layout_length} m). Junk metadata are suspected; this is \
         {cycles} consecutive cycle(s) failing the check"
    )]
    BadUvw {
        row: usize,
        ant1: u32,
        ant2: u32,
        beam: u32,
        uvw_length: f64,
        layout_length: f64,
        cycles: u32,
    },

    #[error("NaN encountered in UVW received in metadata for antenna '{0}'")]
    NanAntennaUvw(String),

    #[error(
        "Received NaN as one of the baseline spacings for row={row} (antennas: {ant1} {ant2}) \
         coordinate={coord} beam={beam}"
    )]
    NanBaselineUvw {
        row: usize,
        ant1: u32,
        ant2: u32,
        coord: usize,
        beam: u32,
    },

    #[error(
        "Junk per-antenna UVW in metadata for antenna '{antenna}' and (1-based) beam {beam}: {reason}"
    )]
    JunkAntennaUvw {
        antenna: String,
        beam: usize,
        reason: &'static str,
    },

    #[error(
        "The uvw vector in the metadata changes size from antenna to antenna; offending \
         antenna '{0}'"
    )]
    UvwShapeChanged(String),

    #[error("Expect UVW metadata length to be an integral multiple of 3, got {0}")]
    UvwShapeNotTriples(usize),

    #[error("Cross-beam correlations are not supported (row={0})")]
    CrossBeamCorrelation(usize),

    #[error("Metadata record carries no block for antenna '{0}'")]
    MetadataMissingAntenna(String),

    #[error(
        "Correlator mode '{mode}' has {n_chan} channels which is not a multiple of the \
         {per_slice}-channel datagram slice"
    )]
    BadModeShape {
        mode: String,
        n_chan: usize,
        per_slice: usize,
    },

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("{0}")]
    Parset(#[from] crate::parset::ParsetError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Chunk(#[from] ChunkError),

    #[error("{0}")]
    Transport(#[from] TransportError),
}
