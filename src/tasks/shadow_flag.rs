// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Flagging of geometrically shadowed antennas.
//!
//! An antenna is shadowed when some baseline's projection onto the
//! aperture plane is shorter than a dish diameter; the dish further from
//! the source (positive w towards the source means antenna 2 is in
//! front) takes the hit. Shadowed antennas keep all their baselines
//! flagged until they emerge.

use std::collections::BTreeSet;

use log::{debug, warn};

use super::{Task, TaskError};
use crate::chunk::VisChunk;
use crate::config::Configuration;
use crate::parset::Parset;

pub struct ShadowFlagTask {
    dish_diameter: f64,
    dry_run: bool,
    antenna_names: Vec<String>,
    shadowed_antennas: BTreeSet<u32>,
    number_of_beams: Option<usize>,
}

impl ShadowFlagTask {
    pub fn new(params: &Parset, config: &Configuration) -> Result<ShadowFlagTask, TaskError> {
        let dish_diameter = params
            .f64_or("dish_diameter", 12.0)
            .map_err(crate::config::ConfigError::from)?;
        let dry_run = params
            .bool_or("dry_run", false)
            .map_err(crate::config::ConfigError::from)?;
        Ok(ShadowFlagTask {
            dish_diameter,
            dry_run,
            antenna_names: config.antennas().iter().map(|a| a.name.clone()).collect(),
            shadowed_antennas: BTreeSet::new(),
            number_of_beams: None,
        })
    }
}

impl Task for ShadowFlagTask {
    fn name(&self) -> &str {
        "ShadowFlagTask"
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let chunk = chunk
            .as_mut()
            .ok_or(TaskError::UnexpectedIdleRank("ShadowFlagTask"))?;
        if self.number_of_beams.is_none() {
            let beams: BTreeSet<u32> = chunk.beam1.iter().copied().collect();
            if beams.is_empty() {
                return Err(TaskError::Inconsistent(
                    "data chunk received on the first iteration seems to be empty".to_string(),
                ));
            }
            self.number_of_beams = Some(beams.len());
        }

        let mut shadowed_this_cycle: BTreeSet<u32> = BTreeSet::new();
        for row in 0..chunk.n_row() {
            let ant1 = chunk.antenna1[row];
            let ant2 = chunk.antenna2[row];
            if ant1 == ant2 {
                continue;
            }
            let uvw = chunk.uvw[row];
            let projected_separation = (uvw[0] * uvw[0] + uvw[1] * uvw[1]).sqrt();
            let baseline_length =
                (uvw[2] * uvw[2] + projected_separation * projected_separation).sqrt();
            if baseline_length < 1e-6 {
                // UVWs computed upstream are zero for completely flagged
                // baselines; verify that this baseline really is flagged.
                let any_unflagged = chunk
                    .flag
                    .index_axis(ndarray::Axis(0), row)
                    .iter()
                    .any(|&f| !f);
                if any_unflagged {
                    return Err(TaskError::Inconsistent(format!(
                        "uvw missing or zero for unflagged baseline {ant1} - {ant2}"
                    )));
                }
                continue;
            }
            if projected_separation < self.dish_diameter {
                if uvw[2] < 0.0 {
                    // Antenna 1 is behind antenna 2 (second-to-first
                    // notation).
                    shadowed_this_cycle.insert(ant1);
                } else {
                    shadowed_this_cycle.insert(ant2);
                }
            }
        }

        // Report changes relative to the previous cycle.
        let many_beams = self.number_of_beams.unwrap_or(0) > 1
            || chunk.beam1.first().map_or(false, |&b| b == 0);
        for &ant in &shadowed_this_cycle {
            if !self.shadowed_antennas.contains(&ant) {
                let name = &self.antenna_names[ant as usize];
                let msg = format!(
                    "Antenna {name} (id={ant}) is now shadowed, corresponding baselines will \
                     be flagged until further notice"
                );
                if many_beams {
                    warn!("{msg}");
                } else {
                    debug!("{msg}");
                }
            }
        }
        for &ant in &self.shadowed_antennas {
            if !shadowed_this_cycle.contains(&ant) {
                let name = &self.antenna_names[ant as usize];
                if many_beams {
                    warn!("Antenna {name} (id={ant}) is no longer shadowed");
                } else {
                    debug!("Antenna {name} (id={ant}) is no longer shadowed");
                }
            }
        }
        self.shadowed_antennas = shadowed_this_cycle;

        if !self.dry_run && !self.shadowed_antennas.is_empty() {
            let mut flagged_rows = 0;
            for row in 0..chunk.n_row() {
                if self.shadowed_antennas.contains(&chunk.antenna1[row])
                    || self.shadowed_antennas.contains(&chunk.antenna2[row])
                {
                    chunk.flag_row(row);
                    flagged_rows += 1;
                }
            }
            crate::monitoring::update("ShadowedBaselinesCount", flagged_rows as i32);
        } else {
            crate::monitoring::update("ShadowedBaselinesCount", 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Configuration {
        let text = "antennas = [a, b, c]\n\
             antenna.ant.diameter = 12\n\
             antenna.ant.mount = equatorial\n\
             antenna.a.location.itrf = [-2556109.976, 5097388.7, -2848440.12]\n\
             antenna.b.location.itrf = [-2556087.396082, 5097423.589662, -2848396.867933]\n\
             antenna.c.location.itrf = [-2556028.607336, 5097451.468188, -2848399.83113]\n\
             baselinemap.name = standard\n";
        Configuration::new(Parset::from_str(text).unwrap(), 0, 1).unwrap()
    }

    fn task(dry_run: bool) -> ShadowFlagTask {
        let mut params = Parset::new();
        params.add("dish_diameter", "12");
        params.add("dry_run", &dry_run.to_string());
        ShadowFlagTask::new(&params, &config()).unwrap()
    }

    /// Three antennas, one beam; antenna 2 shadowed by antenna 1 on the
    /// (1, 2) baseline.
    fn chunk_with_shadow() -> VisChunk {
        let mut chunk = VisChunk::new(6, 4, 1, 3);
        let rows = [(0u32, 0u32), (0, 1), (0, 2), (1, 1), (1, 2), (2, 2)];
        for (row, (a1, a2)) in rows.iter().enumerate() {
            chunk.antenna1[row] = *a1;
            chunk.antenna2[row] = *a2;
        }
        chunk.flag.fill(false);
        // Long, healthy baselines except (1, 2).
        chunk.uvw[1] = [500.0, 0.0, 3.0];
        chunk.uvw[2] = [400.0, 120.0, -2.0];
        // Projected separation 5 m < 12 m; w > 0 puts antenna 2 behind.
        chunk.uvw[4] = [3.0, 4.0, 200.0];
        chunk
    }

    fn row_flagged(chunk: &VisChunk, row: usize) -> bool {
        chunk
            .flag
            .index_axis(ndarray::Axis(0), row)
            .iter()
            .all(|&f| f)
    }

    #[test]
    fn shadowed_antenna_baselines_are_flagged() {
        let mut task = task(false);
        let mut holder = Some(chunk_with_shadow());
        task.process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        // Antenna 2 is shadowed: rows (0,2), (1,2), (2,2) flagged.
        assert!(row_flagged(&chunk, 2));
        assert!(row_flagged(&chunk, 4));
        assert!(row_flagged(&chunk, 5));
        // Others untouched.
        assert!(!row_flagged(&chunk, 0));
        assert!(!row_flagged(&chunk, 1));
        assert!(!row_flagged(&chunk, 3));
    }

    #[test]
    fn dry_run_reports_without_flagging() {
        let mut task = task(true);
        let mut holder = Some(chunk_with_shadow());
        task.process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        assert!(!chunk.flag.iter().any(|&f| f));
    }

    #[test]
    fn negative_w_shadows_antenna_one() {
        let mut task = task(false);
        let mut chunk = chunk_with_shadow();
        chunk.uvw[4] = [3.0, 4.0, -200.0];
        let mut holder = Some(chunk);
        task.process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        // Now antenna 1 takes the hit: rows (0,1), (1,1), (1,2).
        assert!(row_flagged(&chunk, 1));
        assert!(row_flagged(&chunk, 3));
        assert!(row_flagged(&chunk, 4));
        assert!(!row_flagged(&chunk, 2));
    }

    #[test]
    fn zero_uvw_on_flagged_baseline_is_tolerated() {
        let mut task = task(false);
        let mut chunk = chunk_with_shadow();
        chunk.uvw[2] = [0.0, 0.0, 0.0];
        for pol in 0..1 {
            for chan in 0..4 {
                chunk.flag[(2, chan, pol)] = true;
            }
        }
        let mut holder = Some(chunk);
        assert!(task.process(&mut holder).is_ok());
    }

    #[test]
    fn zero_uvw_on_unflagged_baseline_is_fatal() {
        let mut task = task(false);
        let mut chunk = chunk_with_shadow();
        chunk.uvw[2] = [0.0, 0.0, 0.0];
        let mut holder = Some(chunk);
        assert!(matches!(
            task.process(&mut holder),
            Err(TaskError::Inconsistent(_))
        ));
    }
}
