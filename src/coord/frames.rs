// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sidereal time, site geometry and precession.
//!
//! The precision target here is set by what the pipeline does with the
//! results: pointing-direction registration in output tables and the
//! rotation of recomputed UVWs to J2000. The 1 mm UVW length cross-check
//! is invariant under these rotations, so arcsecond-level frame accuracy
//! is sufficient.

use std::f64::consts::TAU;

use super::radec::{AzEl, HADec};

/// Greenwich mean sidereal time for the given time, expressed as seconds
/// since MJD 0, returned in radians.
fn gmst_rad(mjd_seconds: f64) -> f64 {
    let mjd = mjd_seconds / 86_400.0;
    let d = mjd - 51_544.5;
    let t = d / 36_525.0;
    let gmst_deg = 280.460_618_37 + 360.985_647_366_29 * d + 3.879_33e-4 * t * t;
    gmst_deg.to_radians().rem_euclid(TAU)
}

/// Local sidereal time \[radians\] at the given east longitude.
pub fn lst_rad(mjd_seconds: f64, longitude_rad: f64) -> f64 {
    (gmst_rad(mjd_seconds) + longitude_rad).rem_euclid(TAU)
}

/// Geodetic latitude and east longitude \[radians\] of an ITRF position.
/// Bowring's one-shot approximation on the WGS84 ellipsoid.
pub fn itrf_to_lat_lon(itrf: [f64; 3]) -> (f64, f64) {
    const A: f64 = 6_378_137.0;
    const F: f64 = 1.0 / 298.257_223_563;
    let b = A * (1.0 - F);
    let e2 = F * (2.0 - F);
    let ep2 = e2 / (1.0 - e2);

    let [x, y, z] = itrf;
    let lon = y.atan2(x);
    let p = (x * x + y * y).sqrt();
    let theta = (z * A).atan2(p * b);
    let (s_t, c_t) = theta.sin_cos();
    let lat = (z + ep2 * b * s_t * s_t * s_t).atan2(p - e2 * A * c_t * c_t * c_t);
    (lat, lon)
}

/// Convert an azimuth/elevation direction to hour angle/declination at the
/// given geodetic latitude.
pub fn azel_to_hadec(azel: AzEl, latitude_rad: f64) -> HADec {
    let (s_az, c_az) = azel.az.sin_cos();
    let (s_el, c_el) = azel.el.sin_cos();
    let (s_lat, c_lat) = latitude_rad.sin_cos();
    let s_dec = s_el * s_lat + c_el * c_lat * c_az;
    let dec = s_dec.asin();
    let ha = (-s_az * c_el).atan2(s_el * c_lat - c_el * s_lat * c_az);
    HADec::new(ha, dec)
}

/// The inverse of [azel_to_hadec].
pub fn hadec_to_azel(hadec: HADec, latitude_rad: f64) -> AzEl {
    let (s_ha, c_ha) = hadec.ha.sin_cos();
    let (s_dec, c_dec) = hadec.dec.sin_cos();
    let (s_lat, c_lat) = latitude_rad.sin_cos();
    let s_el = s_dec * s_lat + c_dec * c_lat * c_ha;
    let el = s_el.asin();
    let az = (-s_ha * c_dec).atan2(s_dec * c_lat - c_dec * s_lat * c_ha);
    AzEl::new(az.rem_euclid(TAU), el)
}

fn rot_z(angle: f64, v: [f64; 3]) -> [f64; 3] {
    let (s, c) = angle.sin_cos();
    [c * v[0] - s * v[1], s * v[0] + c * v[1], v[2]]
}

fn rot_y(angle: f64, v: [f64; 3]) -> [f64; 3] {
    let (s, c) = angle.sin_cos();
    [c * v[0] + s * v[2], v[1], -s * v[0] + c * v[2]]
}

fn precession_angles(mjd_seconds: f64) -> (f64, f64, f64) {
    const ARCSEC: f64 = TAU / (360.0 * 3600.0);
    let t = (mjd_seconds / 86_400.0 - 51_544.5) / 36_525.0;
    let zeta = (2306.2181 * t + 0.30188 * t * t + 0.017998 * t * t * t) * ARCSEC;
    let z = (2306.2181 * t + 1.09468 * t * t + 0.018203 * t * t * t) * ARCSEC;
    let theta = (2004.3109 * t - 0.42665 * t * t - 0.041833 * t * t * t) * ARCSEC;
    (zeta, z, theta)
}

/// Rotate an equatorial cartesian vector from the mean equinox of date to
/// J2000 (IAU 1976 precession angles).
pub fn precess_to_j2000(mjd_seconds: f64, v: [f64; 3]) -> [f64; 3] {
    let (zeta, z, theta) = precession_angles(mjd_seconds);
    // Mean-of-date = Rz(-z) Ry(theta) Rz(-zeta) applied to J2000; invert.
    rot_z(zeta, rot_y(-theta, rot_z(z, v)))
}

/// The inverse of [precess_to_j2000]: J2000 to the mean equinox of date.
pub fn precess_from_j2000(mjd_seconds: f64, v: [f64; 3]) -> [f64; 3] {
    let (zeta, z, theta) = precession_angles(mjd_seconds);
    rot_z(-z, rot_y(theta, rot_z(-zeta, v)))
}
