// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Versioned binary encoding of [VisChunk] contents.
//!
//! Three layers of framing are provided so that the collective tasks can
//! move exactly the fields they need: row-independent fields, row-aligned
//! blocks, and antenna-aligned fields. [encode_chunk] composes all of them
//! plus the cubes, and is what the TCP sink writes. All integers are
//! little-endian.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array2, Array3};
use thiserror::Error;

use super::{c32, VisChunk};
use crate::coord::{DirectionFrame, RADec};
use crate::stokes::Stokes;

/// Magic bytes leading a serialised chunk.
pub const CHUNK_MAGIC: &[u8; 4] = b"VCNK";

/// Version of the chunk encoding. Receivers sharing the schema check this.
pub const CHUNK_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Bad magic bytes; not a serialised visibility chunk")]
    BadMagic,

    #[error("Unsupported chunk format version {0}")]
    BadVersion(u32),

    #[error("Unknown Stokes tag {0} in serialised chunk")]
    BadStokes(u8),

    #[error("Unknown direction frame tag {0} in serialised chunk")]
    BadFrame(u8),

    #[error("Serialised chunk is truncated or corrupt: {0}")]
    Io(#[from] std::io::Error),
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_u32::<LittleEndian>(s.len() as u32).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String, WireError> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "utf8")))
}

/// Row-independent fields: time, target, interval, scan, channel width,
/// frequency axis, Stokes axis and direction frame.
pub fn encode_row_independent(chunk: &VisChunk) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_f64::<LittleEndian>(chunk.time).unwrap();
    write_string(&mut buf, &chunk.target_name);
    buf.write_f64::<LittleEndian>(chunk.interval).unwrap();
    buf.write_u32::<LittleEndian>(chunk.scan).unwrap();
    buf.write_f64::<LittleEndian>(chunk.channel_width).unwrap();
    buf.write_u32::<LittleEndian>(chunk.frequency.len() as u32)
        .unwrap();
    for &f in &chunk.frequency {
        buf.write_f64::<LittleEndian>(f).unwrap();
    }
    buf.write_u32::<LittleEndian>(chunk.stokes.len() as u32)
        .unwrap();
    for s in &chunk.stokes {
        buf.push(s.to_wire());
    }
    buf.push(match chunk.direction_frame {
        DirectionFrame::J2000 => 0,
        DirectionFrame::AzEl => 1,
    });
    buf
}

/// Apply a row-independent block to a chunk. The frequency axis is only
/// assigned when its length matches the chunk's channel count; receivers
/// of a merged/scattered chunk always satisfy this.
pub fn apply_row_independent(chunk: &mut VisChunk, bytes: &[u8]) -> Result<(), WireError> {
    let mut cur = Cursor::new(bytes);
    chunk.time = cur.read_f64::<LittleEndian>()?;
    chunk.target_name = read_string(&mut cur)?;
    chunk.interval = cur.read_f64::<LittleEndian>()?;
    chunk.scan = cur.read_u32::<LittleEndian>()?;
    chunk.channel_width = cur.read_f64::<LittleEndian>()?;
    let n_freq = cur.read_u32::<LittleEndian>()? as usize;
    let mut freq = Vec::with_capacity(n_freq);
    for _ in 0..n_freq {
        freq.push(cur.read_f64::<LittleEndian>()?);
    }
    if freq.len() == chunk.n_channel() {
        chunk.frequency = freq;
    }
    let n_stokes = cur.read_u32::<LittleEndian>()? as usize;
    let mut stokes = Vec::with_capacity(n_stokes);
    for _ in 0..n_stokes {
        let tag = cur.read_u8()?;
        stokes.push(Stokes::from_wire(tag).ok_or(WireError::BadStokes(tag))?);
    }
    chunk.stokes = stokes;
    let frame_tag = cur.read_u8()?;
    chunk.direction_frame = match frame_tag {
        0 => DirectionFrame::J2000,
        1 => DirectionFrame::AzEl,
        other => return Err(WireError::BadFrame(other)),
    };
    Ok(())
}

/// Row-aligned vectors for a contiguous row range `[first, first + count)`.
pub fn encode_row_block(chunk: &VisChunk, first: usize, count: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(count as u32).unwrap();
    for row in first..first + count {
        buf.write_u32::<LittleEndian>(chunk.antenna1[row]).unwrap();
        buf.write_u32::<LittleEndian>(chunk.antenna2[row]).unwrap();
        buf.write_u32::<LittleEndian>(chunk.beam1[row]).unwrap();
        buf.write_u32::<LittleEndian>(chunk.beam2[row]).unwrap();
        buf.write_f32::<LittleEndian>(chunk.beam1_pa[row]).unwrap();
        buf.write_f32::<LittleEndian>(chunk.beam2_pa[row]).unwrap();
        buf.write_f64::<LittleEndian>(chunk.phase_centre[row].ra)
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.phase_centre[row].dec)
            .unwrap();
        for coord in chunk.uvw[row] {
            buf.write_f64::<LittleEndian>(coord).unwrap();
        }
    }
    buf
}

/// Apply a row block to rows `[0, count)` of the chunk. The chunk must
/// have exactly `count` rows.
pub fn apply_row_block(chunk: &mut VisChunk, bytes: &[u8]) -> Result<(), WireError> {
    let mut cur = Cursor::new(bytes);
    let count = cur.read_u32::<LittleEndian>()? as usize;
    debug_assert_eq!(count, chunk.n_row());
    for row in 0..count {
        chunk.antenna1[row] = cur.read_u32::<LittleEndian>()?;
        chunk.antenna2[row] = cur.read_u32::<LittleEndian>()?;
        chunk.beam1[row] = cur.read_u32::<LittleEndian>()?;
        chunk.beam2[row] = cur.read_u32::<LittleEndian>()?;
        chunk.beam1_pa[row] = cur.read_f32::<LittleEndian>()?;
        chunk.beam2_pa[row] = cur.read_f32::<LittleEndian>()?;
        let ra = cur.read_f64::<LittleEndian>()?;
        let dec = cur.read_f64::<LittleEndian>()?;
        chunk.phase_centre[row] = RADec::new(ra, dec);
        for coord in &mut chunk.uvw[row] {
            *coord = cur.read_f64::<LittleEndian>()?;
        }
    }
    Ok(())
}

/// Antenna-aligned vectors and the beam-offset matrix.
pub fn encode_antenna_fields(chunk: &VisChunk) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(chunk.n_antenna() as u32)
        .unwrap();
    for ant in 0..chunk.n_antenna() {
        buf.write_f64::<LittleEndian>(chunk.target_pointing_centre[ant].ra)
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.target_pointing_centre[ant].dec)
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.actual_pointing_centre[ant].ra)
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.actual_pointing_centre[ant].dec)
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.actual_pol_angle[ant])
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.actual_azimuth[ant])
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.actual_elevation[ant])
            .unwrap();
        buf.push(chunk.on_source_flag[ant] as u8);
    }
    let n_beam = chunk.beam_offsets.ncols();
    buf.write_u32::<LittleEndian>(n_beam as u32).unwrap();
    for beam in 0..n_beam {
        buf.write_f64::<LittleEndian>(chunk.beam_offsets[(0, beam)])
            .unwrap();
        buf.write_f64::<LittleEndian>(chunk.beam_offsets[(1, beam)])
            .unwrap();
    }
    buf
}

pub fn apply_antenna_fields(chunk: &mut VisChunk, bytes: &[u8]) -> Result<(), WireError> {
    let mut cur = Cursor::new(bytes);
    let n_antenna = cur.read_u32::<LittleEndian>()? as usize;
    debug_assert_eq!(n_antenna, chunk.n_antenna());
    for ant in 0..n_antenna {
        let ra = cur.read_f64::<LittleEndian>()?;
        let dec = cur.read_f64::<LittleEndian>()?;
        chunk.target_pointing_centre[ant] = RADec::new(ra, dec);
        let ra = cur.read_f64::<LittleEndian>()?;
        let dec = cur.read_f64::<LittleEndian>()?;
        chunk.actual_pointing_centre[ant] = RADec::new(ra, dec);
        chunk.actual_pol_angle[ant] = cur.read_f64::<LittleEndian>()?;
        chunk.actual_azimuth[ant] = cur.read_f64::<LittleEndian>()?;
        chunk.actual_elevation[ant] = cur.read_f64::<LittleEndian>()?;
        chunk.on_source_flag[ant] = cur.read_u8()? != 0;
    }
    let n_beam = cur.read_u32::<LittleEndian>()? as usize;
    let mut offsets = Array2::zeros((2, n_beam));
    for beam in 0..n_beam {
        offsets[(0, beam)] = cur.read_f64::<LittleEndian>()?;
        offsets[(1, beam)] = cur.read_f64::<LittleEndian>()?;
    }
    chunk.beam_offsets = offsets;
    Ok(())
}

/// Serialise an entire chunk: header, dimensions, all field groups and
/// both cubes.
pub fn encode_chunk(chunk: &VisChunk) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(CHUNK_MAGIC);
    buf.write_u32::<LittleEndian>(CHUNK_FORMAT_VERSION).unwrap();
    buf.write_u64::<LittleEndian>(chunk.n_row() as u64).unwrap();
    buf.write_u64::<LittleEndian>(chunk.n_channel() as u64)
        .unwrap();
    buf.write_u64::<LittleEndian>(chunk.n_pol() as u64).unwrap();
    buf.write_u64::<LittleEndian>(chunk.n_antenna() as u64)
        .unwrap();

    for block in [
        encode_row_independent(chunk),
        encode_row_block(chunk, 0, chunk.n_row()),
        encode_antenna_fields(chunk),
    ] {
        buf.write_u64::<LittleEndian>(block.len() as u64).unwrap();
        buf.extend_from_slice(&block);
    }

    // ndarray's default iteration order is row-major, matching the
    // (row, channel, pol) layout contract.
    for v in chunk.visibility.iter() {
        buf.write_f32::<LittleEndian>(v.re).unwrap();
        buf.write_f32::<LittleEndian>(v.im).unwrap();
    }
    for &f in chunk.flag.iter() {
        buf.push(f as u8);
    }
    buf
}

pub fn decode_chunk(bytes: &[u8]) -> Result<VisChunk, WireError> {
    let mut cur = Cursor::new(bytes);
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)?;
    if &magic != CHUNK_MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = cur.read_u32::<LittleEndian>()?;
    if version != CHUNK_FORMAT_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let n_row = cur.read_u64::<LittleEndian>()? as usize;
    let n_channel = cur.read_u64::<LittleEndian>()? as usize;
    let n_pol = cur.read_u64::<LittleEndian>()? as usize;
    let n_antenna = cur.read_u64::<LittleEndian>()? as usize;
    let mut chunk = VisChunk::new(n_row, n_channel, n_pol, n_antenna);

    let mut blocks = Vec::with_capacity(3);
    for _ in 0..3 {
        let len = cur.read_u64::<LittleEndian>()? as usize;
        let mut block = vec![0u8; len];
        cur.read_exact(&mut block)?;
        blocks.push(block);
    }
    apply_row_independent(&mut chunk, &blocks[0])?;
    apply_row_block(&mut chunk, &blocks[1])?;
    apply_antenna_fields(&mut chunk, &blocks[2])?;

    let mut vis = Vec::with_capacity(n_row * n_channel * n_pol);
    for _ in 0..n_row * n_channel * n_pol {
        let re = cur.read_f32::<LittleEndian>()?;
        let im = cur.read_f32::<LittleEndian>()?;
        vis.push(c32::new(re, im));
    }
    chunk.visibility = Array3::from_shape_vec((n_row, n_channel, n_pol), vis)
        .expect("shape computed from the same dims");
    let mut flags = Vec::with_capacity(n_row * n_channel * n_pol);
    for _ in 0..n_row * n_channel * n_pol {
        flags.push(cur.read_u8()? != 0);
    }
    chunk.flag = Array3::from_shape_vec((n_row, n_channel, n_pol), flags)
        .expect("shape computed from the same dims");
    Ok(chunk)
}
