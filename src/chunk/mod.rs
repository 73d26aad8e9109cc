// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-cycle visibility container.
//!
//! One [VisChunk] is produced per correlator integration per active rank.
//! Every task in the pipeline consumes and preserves its shape invariants:
//! the visibility and flag cubes share the exact shape `(n_row, n_channel,
//! n_pol)`, row-aligned vectors share `n_row`, antenna-aligned vectors
//! share `n_antenna`, and the frequency axis has `n_channel` entries.
//!
//! Chunks never share storage: `Clone` is a deep copy and there is no
//! other way to duplicate one.

pub mod wire;

use ndarray::{Array2, Array3};
use num_complex::Complex;
use thiserror::Error;

use crate::coord::{DirectionFrame, RADec};
use crate::stokes::Stokes;

/// Single-precision complex visibility sample.
#[allow(non_camel_case_types)]
pub type c32 = Complex<f32>;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error(
        "Shape mismatch: replacement cubes are {rows}x{chans}x{pols} (rows x chans x pols), \
         expected {expected_rows} rows and {expected_pols} polarisations"
    )]
    ShapeMismatch {
        rows: usize,
        chans: usize,
        pols: usize,
        expected_rows: usize,
        expected_pols: usize,
    },

    #[error("Frequency axis has {freqs} entries but the cubes have {chans} channels")]
    FrequencyAxisMismatch { freqs: usize, chans: usize },
}

#[derive(Clone, Debug)]
pub struct VisChunk {
    n_row: usize,
    n_channel: usize,
    n_pol: usize,
    n_antenna: usize,

    /// Integration midpoint, seconds since MJD 0 (double precision).
    pub time: f64,

    /// Target (field/source) name.
    pub target_name: String,

    /// Data sampling interval \[s\].
    pub interval: f64,

    /// Scan index number (zero based).
    pub scan: u32,

    /// First antenna IDs for all rows (zero based).
    pub antenna1: Vec<u32>,

    /// Second antenna IDs for all rows (zero based).
    pub antenna2: Vec<u32>,

    /// First beam IDs for all rows (zero based).
    pub beam1: Vec<u32>,

    /// Second beam IDs for all rows. Cross-beam correlations are not
    /// supported: beam1 == beam2 throughout.
    pub beam2: Vec<u32>,

    /// Position angles of the first beam for all rows \[rad\].
    pub beam1_pa: Vec<f32>,

    /// Position angles of the second beam for all rows \[rad\].
    pub beam2_pa: Vec<f32>,

    /// Phase centre direction for each row.
    pub phase_centre: Vec<RADec>,

    /// Target dish pointing direction for each antenna.
    pub target_pointing_centre: Vec<RADec>,

    /// Actual dish pointing direction for each antenna.
    pub actual_pointing_centre: Vec<RADec>,

    /// Actual polarisation axis angle for each antenna \[rad\].
    pub actual_pol_angle: Vec<f64>,

    /// Actual azimuth for each antenna \[deg\].
    pub actual_azimuth: Vec<f64>,

    /// Actual elevation for each antenna \[deg\].
    pub actual_elevation: Vec<f64>,

    /// True for each antenna which was on-source.
    pub on_source_flag: Vec<bool>,

    /// Visibility cube, shape `(n_row, n_channel, n_pol)`.
    pub visibility: Array3<c32>,

    /// Flag cube of the same shape; `true` means flagged.
    pub flag: Array3<bool>,

    /// Per-row UVW \[m\].
    pub uvw: Vec<[f64; 3]>,

    /// Frequency of each spectral channel \[Hz\].
    pub frequency: Vec<f64>,

    /// Channel width \[Hz\]; signed (negative for inverted spectra).
    pub channel_width: f64,

    /// Polarisation type of each product along the cube's pol axis.
    pub stokes: Vec<Stokes>,

    /// Reference frame of every direction in this chunk.
    pub direction_frame: DirectionFrame,

    /// Beam offsets, `(2, n_beam)` \[rad\]; empty when static offsets are
    /// in use.
    pub beam_offsets: Array2<f64>,
}

impl VisChunk {
    /// Construct a chunk with all containers sized for the given
    /// dimensions. Cube samples start zeroed and flagged; callers deposit
    /// data and clear flags as datagrams arrive.
    pub fn new(n_row: usize, n_channel: usize, n_pol: usize, n_antenna: usize) -> VisChunk {
        VisChunk {
            n_row,
            n_channel,
            n_pol,
            n_antenna,
            time: 0.0,
            target_name: String::new(),
            interval: 0.0,
            scan: 0,
            antenna1: vec![0; n_row],
            antenna2: vec![0; n_row],
            beam1: vec![0; n_row],
            beam2: vec![0; n_row],
            beam1_pa: vec![0.0; n_row],
            beam2_pa: vec![0.0; n_row],
            phase_centre: vec![RADec::new(0.0, 0.0); n_row],
            target_pointing_centre: vec![RADec::new(0.0, 0.0); n_antenna],
            actual_pointing_centre: vec![RADec::new(0.0, 0.0); n_antenna],
            actual_pol_angle: vec![0.0; n_antenna],
            actual_azimuth: vec![0.0; n_antenna],
            actual_elevation: vec![0.0; n_antenna],
            on_source_flag: vec![false; n_antenna],
            visibility: Array3::zeros((n_row, n_channel, n_pol)),
            flag: Array3::from_elem((n_row, n_channel, n_pol), true),
            uvw: vec![[0.0; 3]; n_row],
            frequency: vec![0.0; n_channel],
            channel_width: 0.0,
            stokes: Vec::new(),
            direction_frame: DirectionFrame::J2000,
            beam_offsets: Array2::zeros((2, 0)),
        }
    }

    /// The number of rows in this chunk.
    pub fn n_row(&self) -> usize {
        self.n_row
    }

    /// The number of spectral channels (equal for all rows).
    pub fn n_channel(&self) -> usize {
        self.n_channel
    }

    /// The number of polarisation products (can be 1, 2 or 4).
    pub fn n_pol(&self) -> usize {
        self.n_pol
    }

    /// The number of antennas.
    pub fn n_antenna(&self) -> usize {
        self.n_antenna
    }

    /// Replace the channel axis with new visibility and flag cubes and a
    /// new frequency vector. Row and polarisation counts must match the
    /// existing cubes; this exists to support channel averaging and
    /// channel merging, which only change the channel dimension.
    pub fn resize(
        &mut self,
        visibility: Array3<c32>,
        flag: Array3<bool>,
        frequency: Vec<f64>,
    ) -> Result<(), ChunkError> {
        let (rows, chans, pols) = visibility.dim();
        if flag.dim() != (rows, chans, pols) || rows != self.n_row || pols != self.n_pol {
            let (frows, fchans, fpols) = flag.dim();
            return Err(ChunkError::ShapeMismatch {
                rows: rows.max(frows),
                chans: chans.max(fchans),
                pols: pols.max(fpols),
                expected_rows: self.n_row,
                expected_pols: self.n_pol,
            });
        }
        if frequency.len() != chans {
            return Err(ChunkError::FrequencyAxisMismatch {
                freqs: frequency.len(),
                chans,
            });
        }
        self.visibility = visibility;
        self.flag = flag;
        self.frequency = frequency;
        self.n_channel = chans;
        Ok(())
    }

    /// Set every flag in the chunk.
    pub fn flag_all(&mut self) {
        self.flag.fill(true);
    }

    /// Flag every sample of one row.
    pub fn flag_row(&mut self, row: usize) {
        self.flag
            .index_axis_mut(ndarray::Axis(0), row)
            .fill(true);
    }

    /// The fraction of samples currently flagged. Monitoring only.
    pub fn flagged_fraction(&self) -> f64 {
        if self.flag.is_empty() {
            return 1.0;
        }
        let flagged = self.flag.iter().filter(|&&f| f).count();
        flagged as f64 / self.flag.len() as f64
    }
}
