// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Source tasks and the stream plumbing feeding them.

mod channel_manager;
mod datagram;
mod error;
mod merged;
mod metadata;
mod metadata_source;
mod no_metadata;
mod scan_manager;
mod vis_converter;
mod vis_source;

pub use channel_manager::ChannelManager;
pub use datagram::{DatagramError, VisDatagram, DATAGRAM_SIZE, DATAGRAM_VERSION};
pub use error::SourceError;
pub use merged::MergedSource;
pub use metadata::{
    AntennaMetadata, MetadataError, TosMetadata, SCANID_IDLE, SCANID_OBS_COMPLETE,
};
pub use metadata_source::{
    MetadataSource, ParallelMetadataSource, QueueMetadataSource, TcpMetadataSource,
};
pub use no_metadata::NoMetadataSource;
pub use scan_manager::ScanManager;
pub use vis_converter::{map_channel, VisConverter};
pub use vis_source::{QueueVisSource, UdpVisSource, VisSource};

use crate::chunk::VisChunk;

/// The first task of the pipeline: produces one chunk per integration
/// cycle. `Ok(None)` means end of observation; the driver shuts down.
pub trait Source: Send {
    fn next(&mut self) -> Result<Option<VisChunk>, SourceError>;
}
