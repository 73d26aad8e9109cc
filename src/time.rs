// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions around time.
//!
//! The correlator hardware stamps datagrams with BAT (binary atomic time):
//! microseconds of TAI since MJD 0. The chunk data model carries the
//! integration midpoint as seconds since MJD 0, double precision. These
//! helpers convert between the two and render BATs for log messages.

use hifitime::Epoch;

/// Days between MJD 0 and the TAI reference epoch of 1900-01-01.
const MJD_TO_TAI_DAYS: f64 = 15_020.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Convert a wire BAT to seconds since MJD 0.
pub fn bat_to_mjd_seconds(bat: u64) -> f64 {
    bat as f64 / 1e6
}

/// Convert seconds since MJD 0 back to a wire BAT, rounding to the
/// microsecond grid.
pub fn mjd_seconds_to_bat(mjd_s: f64) -> u64 {
    (mjd_s * 1e6).round() as u64
}

/// An [Epoch] for log rendering of a wire BAT.
pub fn bat_to_epoch(bat: u64) -> Epoch {
    let tai_days = bat as f64 / 1e6 / SECONDS_PER_DAY - MJD_TO_TAI_DAYS;
    Epoch::from_tai_days(tai_days)
}

/// Some timestamps may be read in ever so slightly off from their true
/// values because of float errors. If the supplied MJD-seconds value is
/// really close to a neat value in the hundredths, round it.
pub fn round_hundredths_of_a_second(mjd_s: f64) -> f64 {
    let scaled = mjd_s * 100.0;
    if (scaled.round() - scaled).abs() < 0.1 {
        scaled.round() / 100.0
    } else {
        mjd_s
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn bat_round_trip() {
        let bat = 4_500_000_000_000_000u64;
        assert_eq!(mjd_seconds_to_bat(bat_to_mjd_seconds(bat)), bat);
    }

    #[test]
    fn bat_renders_as_epoch() {
        // One second of BAT is one second of epoch time.
        let e1 = bat_to_epoch(5_000_000_000_000_000);
        let e2 = bat_to_epoch(5_000_000_001_000_000);
        assert!(e2 > e1);
        assert_abs_diff_eq!((e2 - e1).in_seconds(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_round_seconds() {
        assert_abs_diff_eq!(round_hundredths_of_a_second(4_924_799.999_999), 4_924_800.0);
        assert_abs_diff_eq!(round_hundredths_of_a_second(4_924_800.251), 4_924_800.25);
        // No rounding.
        assert_abs_diff_eq!(round_hundredths_of_a_second(4_924_800.26), 4_924_800.26);
    }
}
