// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-row UVW recomputation from the array geometry.
//!
//! For every row: shift the phase centre by the row's beam offset in the
//! dish frame, express it as hour angle and declination in the frame of
//! date at the array reference antenna, rotate the ITRF baseline into
//! that frame, then rotate the result into the J2000 UVW frame of the
//! phase centre.

use log::{debug, info};
use ndarray::Array2;

use super::{Task, TaskError};
use crate::chunk::VisChunk;
use crate::config::Configuration;
use crate::coord::{
    lst_rad, precess_from_j2000, uvw_to_j2000, xyz_to_uvw_rotation, HADec, RADec,
};
use crate::parset::Parset;

pub struct CalcUVWTask {
    /// ITRF positions, one per antenna.
    ant_xyz: Vec<[f64; 3]>,
    /// Tangent-plane beam offsets \[rad\].
    beam_offsets: Vec<[f64; 2]>,
    /// Site east longitude of the reference antenna \[rad\].
    site_longitude: f64,
}

impl CalcUVWTask {
    pub fn new(_params: &Parset, config: &Configuration) -> Result<CalcUVWTask, TaskError> {
        let ant_xyz: Vec<[f64; 3]> = config.antennas().iter().map(|a| a.position).collect();
        if ant_xyz.is_empty() {
            return Err(TaskError::Inconsistent(
                "UVW calculation needs at least one antenna".to_string(),
            ));
        }
        let (_, site_longitude) = crate::coord::itrf_to_lat_lon(ant_xyz[0]);

        let beam_offsets = match config.feed() {
            Some(feeds) => {
                info!("Using static beam offset information in favour of the dynamic one");
                (0..feeds.n_feeds()).map(|f| feeds.offset(f)).collect()
            }
            None => vec![[0.0, 0.0]],
        };
        Ok(CalcUVWTask {
            ant_xyz,
            beam_offsets,
            site_longitude,
        })
    }

    /// Adopt per-cycle beam offsets delivered with the data.
    fn setup_beam_offsets(&mut self, offsets: &Array2<f64>) {
        if self.beam_offsets.len() != offsets.ncols() {
            self.beam_offsets = (0..offsets.ncols())
                .map(|beam| [offsets[(0, beam)], offsets[(1, beam)]])
                .collect();
        }
    }

    /// Phase centre of an (off-axis) beam: the dish pointing shifted by
    /// the beam offset in the dish frame.
    fn phase_centre(&self, dish_pointing: RADec, beam: u32) -> Result<RADec, TaskError> {
        let offset = self
            .beam_offsets
            .get(beam as usize)
            .ok_or_else(|| TaskError::Inconsistent(format!("beam index {beam} is invalid")))?;
        Ok(dish_pointing.shifted(-offset[0], offset[1]))
    }

    fn calc_for_row(&self, chunk: &mut VisChunk, row: usize) -> Result<(), TaskError> {
        let ant1 = chunk.antenna1[row] as usize;
        let ant2 = chunk.antenna2[row] as usize;
        let n_ant = self.ant_xyz.len();
        if ant1 >= n_ant || ant2 >= n_ant {
            return Err(TaskError::Inconsistent(format!(
                "antenna index ({}) is invalid",
                ant1.max(ant2)
            )));
        }

        let fpc = self.phase_centre(chunk.phase_centre[row], chunk.beam1[row])?;
        // Apparent direction in the frame of date gives the hour angle.
        let apparent = RADec::from_cartesian(precess_from_j2000(chunk.time, fpc.to_cartesian()));
        let lst = lst_rad(chunk.time, self.site_longitude);
        let hadec = HADec::new(lst - apparent.ra, apparent.dec);

        let rotation = xyz_to_uvw_rotation(hadec);
        let baseline = [
            self.ant_xyz[ant2][0] - self.ant_xyz[ant1][0],
            self.ant_xyz[ant2][1] - self.ant_xyz[ant1][1],
            self.ant_xyz[ant2][2] - self.ant_xyz[ant1][2],
        ];
        let mut uvw = [0.0f64; 3];
        for (i, row_coeffs) in rotation.iter().enumerate() {
            uvw[i] = row_coeffs[0] * baseline[0]
                + row_coeffs[1] * baseline[1]
                + row_coeffs[2] * baseline[2];
        }
        chunk.uvw[row] = uvw_to_j2000(uvw, apparent, fpc, chunk.time);
        Ok(())
    }

    pub(super) fn recompute(&mut self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        if !chunk.beam_offsets.is_empty() {
            debug!("Using dynamic beam offset information, overriding any existing arrangement");
            let offsets = chunk.beam_offsets.clone();
            self.setup_beam_offsets(&offsets);
        }
        for row in 0..chunk.n_row() {
            self.calc_for_row(chunk, row)?;
        }
        Ok(())
    }
}

impl Task for CalcUVWTask {
    fn name(&self) -> &str {
        "CalcUVWTask"
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let chunk = chunk
            .as_mut()
            .ok_or(TaskError::UnexpectedIdleRank("CalcUVWTask"))?;
        self.recompute(chunk)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn config() -> Configuration {
        let text = "antennas = [a, b]\n\
             antenna.ant.diameter = 12\n\
             antenna.ant.mount = equatorial\n\
             antenna.a.location.itrf = [-2556109.976, 5097388.7, -2848440.12]\n\
             antenna.b.location.itrf = [-2556087.396082, 5097423.589662, -2848396.867933]\n\
             baselinemap.name = standard\n";
        Configuration::new(Parset::from_str(text).unwrap(), 0, 1).unwrap()
    }

    fn chunk() -> VisChunk {
        let mut chunk = VisChunk::new(3, 4, 1, 2);
        chunk.time = 58_650.25 * 86_400.0;
        chunk.antenna1 = vec![0, 0, 1];
        chunk.antenna2 = vec![0, 1, 1];
        for row in 0..3 {
            chunk.phase_centre[row] = RADec::new_degrees(187.5, -45.0);
        }
        chunk.flag.fill(false);
        chunk
    }

    fn baseline_length(config: &Configuration) -> f64 {
        let a = config.antennas()[0].position;
        let b = config.antennas()[1].position;
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
    }

    #[test]
    fn uvw_length_matches_baseline() {
        let config = config();
        let mut task = CalcUVWTask::new(&Parset::new(), &config).unwrap();
        let mut holder = Some(chunk());
        task.process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        let uvw = chunk.uvw[1];
        let length = (uvw[0] * uvw[0] + uvw[1] * uvw[1] + uvw[2] * uvw[2]).sqrt();
        // A rotation can't change the baseline length.
        assert_abs_diff_eq!(length, baseline_length(&config), epsilon = 1e-6);
        // Autocorrelations stay at zero.
        assert_abs_diff_eq!(chunk.uvw[0][0], 0.0);
        assert_abs_diff_eq!(chunk.uvw[2][2], 0.0);
    }

    #[test]
    fn uvw_changes_with_time() {
        let config = config();
        let mut task = CalcUVWTask::new(&Parset::new(), &config).unwrap();
        let mut holder = Some(chunk());
        task.process(&mut holder).unwrap();
        let early = holder.as_ref().unwrap().uvw[1];

        let mut later_chunk = chunk();
        later_chunk.time += 3600.0;
        let mut holder2 = Some(later_chunk);
        task.process(&mut holder2).unwrap();
        let later = holder2.unwrap().uvw[1];

        // The Earth turned; u and v must have moved.
        assert!((early[0] - later[0]).abs() > 1.0 || (early[1] - later[1]).abs() > 1.0);
    }

    #[test]
    fn dynamic_beam_offsets_shift_the_phase_centre() {
        let config = config();
        let mut task = CalcUVWTask::new(&Parset::new(), &config).unwrap();

        let mut plain = Some(chunk());
        task.process(&mut plain).unwrap();
        let without_offset = plain.unwrap().uvw[1];

        let mut task2 = CalcUVWTask::new(&Parset::new(), &config).unwrap();
        let mut offset_chunk = chunk();
        offset_chunk.beam_offsets =
            Array2::from_shape_vec((2, 1), vec![0.05, -0.03]).unwrap();
        let mut holder = Some(offset_chunk);
        task2.process(&mut holder).unwrap();
        let with_offset = holder.unwrap().uvw[1];

        let delta: f64 = without_offset
            .iter()
            .zip(with_offset)
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(delta > 1e-3, "offset had no effect: {delta}");
    }

    #[test]
    fn invalid_beam_index_is_fatal() {
        let config = config();
        let mut task = CalcUVWTask::new(&Parset::new(), &config).unwrap();
        let mut bad = chunk();
        bad.beam1 = vec![7, 7, 7];
        let mut holder = Some(bad);
        assert!(matches!(
            task.process(&mut holder),
            Err(TaskError::Inconsistent(_))
        ));
    }
}
