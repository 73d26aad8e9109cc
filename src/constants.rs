// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision. The ingest pipeline should do as
many calculations as possible in double precision before converting to a
lower precision, if it is ever required.
 */

pub use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Speed of light \[m/s\]
pub const VEL_C: f64 = 299_792_458.0;

/// Tolerance on the difference between a row's UVW length and the ITRF
/// baseline length before the row is declared bad \[m\].
pub const UVW_LENGTH_TOLERANCE: f64 = 1e-3;

/// Tolerance when checking that a frequency axis is contiguous \[Hz\].
pub const FREQ_CONTIGUITY_TOLERANCE: f64 = 1e3;

/// Squared UVW vector length above which a per-antenna UVW cannot lie on
/// the Earth's surface \[m^2\]. Junk metadata detector.
pub const MAX_ANTENNA_UVW_NORM2: f64 = 4.07044e13;

/// Number of channels handled by one correlator card.
pub const CHANNELS_PER_CARD: usize = 216;

/// Number of channels carried by a single visibility datagram.
pub const CHANNELS_PER_SLICE: usize = 54;

/// Number of antennas assumed by the standard correlator product map.
pub const STANDARD_MAP_ANTENNAS: usize = 36;

/// Default capacity of the datagram receive ring.
pub const DEFAULT_VIS_BUFFER_CAPACITY: usize = 445_000;
