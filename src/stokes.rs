// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Polarisation product labels.

use thiserror::Error;

#[derive(Error, Debug)]
#[error("Unknown Stokes label '{0}'")]
pub struct UnknownStokes(pub String);

/// A linear polarisation product as produced by the correlator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stokes {
    XX,
    XY,
    YX,
    YY,
}

impl Stokes {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stokes::XX => "XX",
            Stokes::XY => "XY",
            Stokes::YX => "YX",
            Stokes::YY => "YY",
        }
    }

    /// The product with receptors swapped; what a conjugated visibility
    /// corresponds to when a baseline is flipped.
    pub fn transposed(&self) -> Stokes {
        match self {
            Stokes::XY => Stokes::YX,
            Stokes::YX => Stokes::XY,
            other => *other,
        }
    }

    /// Stable numeric tag used by the wire codecs.
    pub fn to_wire(&self) -> u8 {
        match self {
            Stokes::XX => 0,
            Stokes::XY => 1,
            Stokes::YX => 2,
            Stokes::YY => 3,
        }
    }

    pub fn from_wire(tag: u8) -> Option<Stokes> {
        match tag {
            0 => Some(Stokes::XX),
            1 => Some(Stokes::XY),
            2 => Some(Stokes::YX),
            3 => Some(Stokes::YY),
            _ => None,
        }
    }
}

impl std::str::FromStr for Stokes {
    type Err = UnknownStokes;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "XX" => Ok(Stokes::XX),
            "XY" => Ok(Stokes::XY),
            "YX" => Ok(Stokes::YX),
            "YY" => Ok(Stokes::YY),
            other => Err(UnknownStokes(other.to_string())),
        }
    }
}

impl std::fmt::Display for Stokes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_transpose() {
        assert_eq!("xy".parse::<Stokes>().unwrap(), Stokes::XY);
        assert_eq!(Stokes::XY.transposed(), Stokes::YX);
        assert_eq!(Stokes::XX.transposed(), Stokes::XX);
        assert!("I".parse::<Stokes>().is_err());
    }

    #[test]
    fn wire_round_trip() {
        for s in [Stokes::XX, Stokes::XY, Stokes::YX, Stokes::YY] {
            assert_eq!(Stokes::from_wire(s.to_wire()), Some(s));
        }
        assert_eq!(Stokes::from_wire(9), None);
    }
}
