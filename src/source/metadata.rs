// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-integration telescope metadata record.
//!
//! One record arrives per integration over the metadata topic. The binary
//! encoding here is what the parallel adapter broadcasts between ranks and
//! what the TCP subscriber reads off the wire.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array2;
use thiserror::Error;

use crate::coord::{DirectionFrame, RADec};

/// Scan id indicating the telescope is between scans; cycles are skipped
/// without advancing the scan counter.
pub const SCANID_IDLE: i32 = -1;

/// Scan id indicating the observation is complete; the pipeline shuts
/// down cleanly when it sees this.
pub const SCANID_OBS_COMPLETE: i32 = -2;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Serialised metadata record is truncated or corrupt: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown direction frame tag {0} in metadata record")]
    BadFrame(u8),
}

/// Per-antenna block of the metadata record.
#[derive(Clone, Debug)]
pub struct AntennaMetadata {
    pub name: String,
    /// Actual dish pointing.
    pub actual_radec: RADec,
    /// Actual azimuth \[deg\].
    pub actual_az_deg: f64,
    /// Actual elevation \[deg\].
    pub actual_el_deg: f64,
    /// Actual polarisation axis angle \[rad\].
    pub actual_pol_angle: f64,
    pub flagged: bool,
    pub on_source: bool,
    /// Per-beam UVW of this antenna, length 3 x nBeam \[m\].
    pub uvw: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct TosMetadata {
    pub sbid: u32,
    pub scan_id: i32,
    /// BAT of the integration \[us\].
    pub timestamp: u64,
    /// Name of the correlator mode in effect.
    pub corr_mode: String,
    pub target_name: String,
    /// Phase direction; frame given by `direction_frame`.
    pub phase_direction: RADec,
    pub target_direction: RADec,
    pub direction_frame: DirectionFrame,
    /// Sky frequency at the band centre \[Hz\].
    pub centre_freq_hz: f64,
    /// Global flag: when set, every antenna's data is bad this cycle.
    pub flagged: bool,
    pub antennas: Vec<AntennaMetadata>,
    /// Beam offsets `(2, n_beam)` \[rad\]; may be empty.
    pub beam_offsets: Array2<f64>,
}

impl TosMetadata {
    pub fn antenna(&self, name: &str) -> Option<&AntennaMetadata> {
        self.antennas.iter().find(|a| a.name == name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(self.sbid).unwrap();
        buf.write_i32::<LittleEndian>(self.scan_id).unwrap();
        buf.write_u64::<LittleEndian>(self.timestamp).unwrap();
        write_string(&mut buf, &self.corr_mode);
        write_string(&mut buf, &self.target_name);
        buf.write_f64::<LittleEndian>(self.phase_direction.ra).unwrap();
        buf.write_f64::<LittleEndian>(self.phase_direction.dec)
            .unwrap();
        buf.write_f64::<LittleEndian>(self.target_direction.ra)
            .unwrap();
        buf.write_f64::<LittleEndian>(self.target_direction.dec)
            .unwrap();
        buf.push(match self.direction_frame {
            DirectionFrame::J2000 => 0,
            DirectionFrame::AzEl => 1,
        });
        buf.write_f64::<LittleEndian>(self.centre_freq_hz).unwrap();
        buf.push(self.flagged as u8);
        buf.write_u32::<LittleEndian>(self.antennas.len() as u32)
            .unwrap();
        for ant in &self.antennas {
            write_string(&mut buf, &ant.name);
            buf.write_f64::<LittleEndian>(ant.actual_radec.ra).unwrap();
            buf.write_f64::<LittleEndian>(ant.actual_radec.dec).unwrap();
            buf.write_f64::<LittleEndian>(ant.actual_az_deg).unwrap();
            buf.write_f64::<LittleEndian>(ant.actual_el_deg).unwrap();
            buf.write_f64::<LittleEndian>(ant.actual_pol_angle).unwrap();
            buf.push(ant.flagged as u8);
            buf.push(ant.on_source as u8);
            buf.write_u32::<LittleEndian>(ant.uvw.len() as u32).unwrap();
            for &v in &ant.uvw {
                buf.write_f64::<LittleEndian>(v).unwrap();
            }
        }
        let n_beam = self.beam_offsets.ncols();
        buf.write_u32::<LittleEndian>(n_beam as u32).unwrap();
        for beam in 0..n_beam {
            buf.write_f64::<LittleEndian>(self.beam_offsets[(0, beam)])
                .unwrap();
            buf.write_f64::<LittleEndian>(self.beam_offsets[(1, beam)])
                .unwrap();
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<TosMetadata, MetadataError> {
        let mut cur = Cursor::new(bytes);
        let sbid = cur.read_u32::<LittleEndian>()?;
        let scan_id = cur.read_i32::<LittleEndian>()?;
        let timestamp = cur.read_u64::<LittleEndian>()?;
        let corr_mode = read_string(&mut cur)?;
        let target_name = read_string(&mut cur)?;
        let phase_direction = RADec::new(
            cur.read_f64::<LittleEndian>()?,
            cur.read_f64::<LittleEndian>()?,
        );
        let target_direction = RADec::new(
            cur.read_f64::<LittleEndian>()?,
            cur.read_f64::<LittleEndian>()?,
        );
        let direction_frame = match cur.read_u8()? {
            0 => DirectionFrame::J2000,
            1 => DirectionFrame::AzEl,
            other => return Err(MetadataError::BadFrame(other)),
        };
        let centre_freq_hz = cur.read_f64::<LittleEndian>()?;
        let flagged = cur.read_u8()? != 0;
        let n_ant = cur.read_u32::<LittleEndian>()? as usize;
        let mut antennas = Vec::with_capacity(n_ant);
        for _ in 0..n_ant {
            let name = read_string(&mut cur)?;
            let actual_radec = RADec::new(
                cur.read_f64::<LittleEndian>()?,
                cur.read_f64::<LittleEndian>()?,
            );
            let actual_az_deg = cur.read_f64::<LittleEndian>()?;
            let actual_el_deg = cur.read_f64::<LittleEndian>()?;
            let actual_pol_angle = cur.read_f64::<LittleEndian>()?;
            let flagged = cur.read_u8()? != 0;
            let on_source = cur.read_u8()? != 0;
            let n_uvw = cur.read_u32::<LittleEndian>()? as usize;
            let mut uvw = Vec::with_capacity(n_uvw);
            for _ in 0..n_uvw {
                uvw.push(cur.read_f64::<LittleEndian>()?);
            }
            antennas.push(AntennaMetadata {
                name,
                actual_radec,
                actual_az_deg,
                actual_el_deg,
                actual_pol_angle,
                flagged,
                on_source,
                uvw,
            });
        }
        let n_beam = cur.read_u32::<LittleEndian>()? as usize;
        let mut beam_offsets = Array2::zeros((2, n_beam));
        for beam in 0..n_beam {
            beam_offsets[(0, beam)] = cur.read_f64::<LittleEndian>()?;
            beam_offsets[(1, beam)] = cur.read_f64::<LittleEndian>()?;
        }
        Ok(TosMetadata {
            sbid,
            scan_id,
            timestamp,
            corr_mode,
            target_name,
            phase_direction,
            target_direction,
            direction_frame,
            centre_freq_hz,
            flagged,
            antennas,
            beam_offsets,
        })
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_u32::<LittleEndian>(s.len() as u32).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String, MetadataError> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| {
        MetadataError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "metadata string is not UTF-8",
        ))
    })
}
