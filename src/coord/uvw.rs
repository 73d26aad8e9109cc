// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! UVW geometry.
//!
//! Derived using "Coordinate transformations" on page 388 of Synthesis
//! Imaging in Radio Astronomy II.

use super::frames::precess_to_j2000;
use super::radec::{HADec, RADec};

/// The rotation taking an ITRF baseline difference (ant2 − ant1) to UVW
/// for a phase centre at the given hour angle and declination. Returns the
/// 3x3 matrix rows.
pub fn xyz_to_uvw_rotation(hadec: HADec) -> [[f64; 3]; 3] {
    let (s_h, c_h) = hadec.ha.sin_cos();
    let (s_d, c_d) = hadec.dec.sin_cos();
    [
        [-s_h, -c_h, 0.0],
        [s_d * c_h, -s_d * s_h, -c_d],
        [-c_d * c_h, c_d * s_h, -s_d],
    ]
}

/// Orthonormal (e_u, e_v, e_w) basis of the UVW frame for a direction, in
/// the equatorial cartesian frame the direction is expressed in.
pub fn uvw_basis(dir: RADec) -> [[f64; 3]; 3] {
    let (s_ra, c_ra) = dir.ra.sin_cos();
    let (s_dec, c_dec) = dir.dec.sin_cos();
    [
        [-s_ra, c_ra, 0.0],
        [-s_dec * c_ra, -s_dec * s_ra, c_dec],
        [c_dec * c_ra, c_dec * s_ra, s_dec],
    ]
}

fn mat_vec(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Re-express a UVW vector computed against an apparent (frame-of-date)
/// phase centre in the UVW frame of the corresponding J2000 phase centre.
///
/// This is the frame-rotation step of the classic UVW machine: rebuild the
/// cartesian baseline from the apparent basis, precess it, and project it
/// onto the J2000 basis.
pub fn uvw_to_j2000(
    uvw: [f64; 3],
    apparent_centre: RADec,
    j2000_centre: RADec,
    mjd_seconds: f64,
) -> [f64; 3] {
    let date_basis = uvw_basis(apparent_centre);
    let cartesian_date = [
        uvw[0] * date_basis[0][0] + uvw[1] * date_basis[1][0] + uvw[2] * date_basis[2][0],
        uvw[0] * date_basis[0][1] + uvw[1] * date_basis[1][1] + uvw[2] * date_basis[2][1],
        uvw[0] * date_basis[0][2] + uvw[1] * date_basis[1][2] + uvw[2] * date_basis[2][2],
    ];
    let cartesian_j2000 = precess_to_j2000(mjd_seconds, cartesian_date);
    let j2000_basis = uvw_basis(j2000_centre);
    mat_vec(&j2000_basis, cartesian_j2000)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn norm(v: [f64; 3]) -> f64 {
        v.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    #[test]
    fn test_rotation_preserves_length() {
        let rot = xyz_to_uvw_rotation(HADec::new(0.3, -0.8));
        let baseline = [120.0, -45.0, 310.0];
        let uvw = mat_vec(&rot, baseline);
        assert_abs_diff_eq!(norm(uvw), norm(baseline), epsilon = 1e-9);
    }

    #[test]
    fn test_zenith_baseline_w() {
        // For a source at the pole (dec = -90 in the south), w tracks the
        // z-coordinate of the baseline with our sign convention.
        let rot = xyz_to_uvw_rotation(HADec::new(0.0, -std::f64::consts::FRAC_PI_2));
        let uvw = mat_vec(&rot, [0.0, 0.0, 100.0]);
        assert_abs_diff_eq!(uvw[2], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_j2000_frame_rotation_preserves_length() {
        let apparent = RADec::new_degrees(83.7, 22.05);
        let j2000 = RADec::new_degrees(83.6, 22.0);
        let uvw = [512.0, -203.0, 77.0];
        let out = uvw_to_j2000(uvw, apparent, j2000, 58_650.0 * 86_400.0);
        assert_abs_diff_eq!(norm(out), norm(uvw), epsilon = 1e-9);
        // The rotation is small; components should not move far.
        assert_abs_diff_eq!(out[0], uvw[0], epsilon = 15.0);
    }
}
