// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Coordinate types and reference-frame conversions.
//!
//! Everything here is a pure function on immutable inputs; the source task
//! and the UVW tasks call these once per antenna or per row.

mod frames;
mod radec;
mod uvw;

pub use frames::{
    azel_to_hadec, hadec_to_azel, itrf_to_lat_lon, lst_rad, precess_from_j2000, precess_to_j2000,
};
pub use radec::{AzEl, HADec, RADec};
pub use uvw::{uvw_basis, uvw_to_j2000, xyz_to_uvw_rotation};

/// Reference frame tag carried by directions in metadata and chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionFrame {
    J2000,
    AzEl,
}

impl DirectionFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectionFrame::J2000 => "J2000",
            DirectionFrame::AzEl => "AZEL",
        }
    }
}

impl std::str::FromStr for DirectionFrame {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "J2000" => Ok(DirectionFrame::J2000),
            "AZEL" => Ok(DirectionFrame::AzEl),
            other => Err(format!("Unknown direction frame '{other}'")),
        }
    }
}
