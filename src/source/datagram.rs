// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The fixed-layout visibility datagram the correlator hardware emits.
//!
//! Each datagram carries one correlator product of one beam for one slice
//! of channels within a card. All integers are little-endian on the wire.
//! The identity key for duplicate detection is `(beam, block, card,
//! channel, slice)` together with the product id carried in the payload.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::chunk::c32;
use crate::constants::CHANNELS_PER_SLICE;

/// Wire format version stamped into every datagram.
pub const DATAGRAM_VERSION: u32 = 1;

/// Encoded size: 7 x u32, u64 timestamp, samples and flag bytes.
pub const DATAGRAM_SIZE: usize = 7 * 4 + 8 + CHANNELS_PER_SLICE * (2 * 4) + CHANNELS_PER_SLICE;

#[derive(Error, Debug)]
pub enum DatagramError {
    #[error("Datagram has version {0}, expected {DATAGRAM_VERSION}")]
    WrongVersion(u32),

    #[error("Datagram has {0} bytes, expected {DATAGRAM_SIZE}")]
    WrongSize(usize),

    #[error("Datagram truncated: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct VisDatagram {
    /// BAT of the integration this datagram belongs to \[us\].
    pub timestamp: u64,
    /// Data slice index within the card.
    pub slice: u32,
    /// Correlator block index.
    pub block: u32,
    /// Correlator card index within the block.
    pub card: u32,
    /// First hardware channel (within the card) of this slice.
    pub channel: u32,
    /// Beam index (0-based).
    pub beam: u32,
    /// Correlator product id (1-based).
    pub product: u32,
    /// Complex samples for the slice's channels, hardware channel order.
    pub vis: [c32; CHANNELS_PER_SLICE],
    /// Per-sample flags; true means the hardware flagged the sample.
    pub flags: [bool; CHANNELS_PER_SLICE],
}

impl Default for VisDatagram {
    fn default() -> Self {
        VisDatagram {
            timestamp: 0,
            slice: 0,
            block: 0,
            card: 0,
            channel: 0,
            beam: 0,
            product: 0,
            vis: [c32::new(0.0, 0.0); CHANNELS_PER_SLICE],
            flags: [false; CHANNELS_PER_SLICE],
        }
    }
}

impl VisDatagram {
    /// The tuple identifying this datagram within one integration.
    pub fn identity(&self) -> (u32, u32, u32, u32, u32, u32) {
        (
            self.beam,
            self.block,
            self.card,
            self.channel,
            self.slice,
            self.product,
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATAGRAM_SIZE);
        buf.write_u32::<LittleEndian>(DATAGRAM_VERSION).unwrap();
        buf.write_u64::<LittleEndian>(self.timestamp).unwrap();
        buf.write_u32::<LittleEndian>(self.slice).unwrap();
        buf.write_u32::<LittleEndian>(self.block).unwrap();
        buf.write_u32::<LittleEndian>(self.card).unwrap();
        buf.write_u32::<LittleEndian>(self.channel).unwrap();
        buf.write_u32::<LittleEndian>(self.beam).unwrap();
        buf.write_u32::<LittleEndian>(self.product).unwrap();
        for v in &self.vis {
            buf.write_f32::<LittleEndian>(v.re).unwrap();
            buf.write_f32::<LittleEndian>(v.im).unwrap();
        }
        for &f in &self.flags {
            buf.push(f as u8);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<VisDatagram, DatagramError> {
        if bytes.len() != DATAGRAM_SIZE {
            return Err(DatagramError::WrongSize(bytes.len()));
        }
        let mut cur = Cursor::new(bytes);
        let version = cur.read_u32::<LittleEndian>()?;
        if version != DATAGRAM_VERSION {
            return Err(DatagramError::WrongVersion(version));
        }
        let mut dg = VisDatagram {
            timestamp: cur.read_u64::<LittleEndian>()?,
            slice: cur.read_u32::<LittleEndian>()?,
            block: cur.read_u32::<LittleEndian>()?,
            card: cur.read_u32::<LittleEndian>()?,
            channel: cur.read_u32::<LittleEndian>()?,
            beam: cur.read_u32::<LittleEndian>()?,
            product: cur.read_u32::<LittleEndian>()?,
            ..VisDatagram::default()
        };
        for v in &mut dg.vis {
            let re = cur.read_f32::<LittleEndian>()?;
            let im = cur.read_f32::<LittleEndian>()?;
            *v = c32::new(re, im);
        }
        let mut flags = [0u8; CHANNELS_PER_SLICE];
        cur.read_exact(&mut flags)?;
        for (out, raw) in dg.flags.iter_mut().zip(flags) {
            *out = raw != 0;
        }
        Ok(dg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut dg = VisDatagram {
            timestamp: 0x1234_5678_9abc_def0,
            slice: 2,
            block: 1,
            card: 7,
            channel: 108,
            beam: 5,
            product: 2628,
            ..VisDatagram::default()
        };
        dg.vis[0] = c32::new(1.0, -1.0);
        dg.vis[53] = c32::new(-3.25, 0.5);
        dg.flags[17] = true;

        let bytes = dg.encode();
        assert_eq!(bytes.len(), DATAGRAM_SIZE);
        let back = VisDatagram::decode(&bytes).unwrap();
        assert_eq!(back.timestamp, dg.timestamp);
        assert_eq!(back.identity(), dg.identity());
        assert_eq!(back.product, 2628);
        assert_eq!(back.vis[53], c32::new(-3.25, 0.5));
        assert!(back.flags[17]);
        assert!(!back.flags[16]);
    }

    #[test]
    fn wrong_size_rejected() {
        assert!(matches!(
            VisDatagram::decode(&[0u8; 10]),
            Err(DatagramError::WrongSize(10))
        ));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = VisDatagram::default().encode();
        bytes[0] = 99;
        assert!(matches!(
            VisDatagram::decode(&bytes),
            Err(DatagramError::WrongVersion(99))
        ));
    }
}
