// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fringe rotation: residual delay correction on the visibilities.
//!
//! The task computes a per-antenna delay model (geometric w-delay plus
//! fixed instrumental delays) and hands it to a pluggable approach that
//! applies the correction. The software approach rotates each sample's
//! phase; hardware-assisted approaches would also publish delay and rate
//! commands, which is outside this crate's scope.

use log::{debug, info};

use super::calc_uvw::CalcUVWTask;
use super::{Task, TaskError};
use crate::chunk::VisChunk;
use crate::config::Configuration;
use crate::constants::VEL_C;
use crate::parset::Parset;

/// Strategy applying a delay model to a chunk.
pub trait FrtApproach: Send {
    fn name(&self) -> &str;

    /// Apply corrections given per-antenna delays \[s\].
    fn process(&mut self, chunk: &mut VisChunk, delays_s: &[f64]) -> Result<(), TaskError>;
}

/// Pure software approach: rotate each sample by the residual delay
/// phase at its channel frequency.
struct SwDelays;

impl FrtApproach for SwDelays {
    fn name(&self) -> &str {
        "swdelays"
    }

    fn process(&mut self, chunk: &mut VisChunk, delays_s: &[f64]) -> Result<(), TaskError> {
        for row in 0..chunk.n_row() {
            let ant1 = chunk.antenna1[row] as usize;
            let ant2 = chunk.antenna2[row] as usize;
            if ant1 >= delays_s.len() || ant2 >= delays_s.len() {
                return Err(TaskError::Inconsistent(format!(
                    "delay model has {} antennas, row {row} references {}",
                    delays_s.len(),
                    ant1.max(ant2)
                )));
            }
            let tau = delays_s[ant1] - delays_s[ant2];
            if tau == 0.0 {
                continue;
            }
            for chan in 0..chunk.n_channel() {
                let phase = -std::f64::consts::TAU * chunk.frequency[chan] * tau;
                let rotation = crate::chunk::c32::new(phase.cos() as f32, phase.sin() as f32);
                for pol in 0..chunk.n_pol() {
                    chunk.visibility[(row, chan, pol)] *= rotation;
                }
            }
        }
        Ok(())
    }
}

pub struct FringeRotationTask {
    uvw: CalcUVWTask,
    method: Box<dyn FrtApproach>,
    /// Fixed delay component per antenna \[ns\]; zero length disables.
    fixed_delays_ns: Vec<f64>,
    calc_uvw: bool,
}

impl FringeRotationTask {
    pub fn new(params: &Parset, config: &Configuration) -> Result<FringeRotationTask, TaskError> {
        let method = fringe_rotation_method(params)?;
        info!("Fringe rotation method: {}", method.name());
        let fixed_delays_ns: Vec<f64> = if params.is_defined("fixeddelays") {
            params
                .f64_vector("fixeddelays")
                .map_err(crate::config::ConfigError::from)?
        } else {
            config.antennas().iter().map(|a| a.delay_ns).collect()
        };
        if !fixed_delays_ns.is_empty() {
            debug!("Fixed delays (ns): {fixed_delays_ns:?}");
        }
        let calc_uvw = params
            .bool_or("calcuvw", true)
            .map_err(crate::config::ConfigError::from)?;
        Ok(FringeRotationTask {
            uvw: CalcUVWTask::new(params, config)?,
            method,
            fixed_delays_ns,
            calc_uvw,
        })
    }

    /// Geometric delay per antenna from the per-row w terms, plus fixed
    /// delays. Works off the autocorrelation-free rows of beam 0.
    fn delay_model(&self, chunk: &VisChunk) -> Vec<f64> {
        let n_ant = chunk.n_antenna();
        let mut delays = vec![0.0f64; n_ant];
        // w of a baseline is w(ant1) - w(ant2) up to the sign convention
        // of the rotation; accumulate per-antenna w using antenna 0 of
        // each row pair as reference.
        let mut have = vec![false; n_ant];
        if n_ant > 0 {
            have[0] = true;
        }
        for row in 0..chunk.n_row() {
            if chunk.beam1[row] != 0 {
                break;
            }
            let ant1 = chunk.antenna1[row] as usize;
            let ant2 = chunk.antenna2[row] as usize;
            if ant1 == ant2 || ant1 >= n_ant || ant2 >= n_ant {
                continue;
            }
            if have[ant1] && !have[ant2] {
                delays[ant2] = delays[ant1] - chunk.uvw[row][2] / VEL_C;
                have[ant2] = true;
            } else if have[ant2] && !have[ant1] {
                delays[ant1] = delays[ant2] + chunk.uvw[row][2] / VEL_C;
                have[ant1] = true;
            }
        }
        for (ant, delay) in delays.iter_mut().enumerate() {
            if let Some(fixed) = self.fixed_delays_ns.get(ant) {
                *delay += fixed * 1e-9;
            }
        }
        delays
    }
}

impl Task for FringeRotationTask {
    fn name(&self) -> &str {
        "FringeRotationTask"
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let chunk = chunk
            .as_mut()
            .ok_or(TaskError::UnexpectedIdleRank("FringeRotationTask"))?;
        if self.calc_uvw {
            self.uvw.recompute(chunk)?;
        }
        let delays = self.delay_model(chunk);
        self.method.process(chunk, &delays)
    }
}

/// Factory for the fringe rotation approach classes.
fn fringe_rotation_method(params: &Parset) -> Result<Box<dyn FrtApproach>, TaskError> {
    match params.string_or("method", "swdelays").as_str() {
        "swdelays" => Ok(Box::new(SwDelays)),
        other => Err(TaskError::Config(
            crate::config::ConfigError::UnknownTaskKind(format!(
                "unknown fringe rotation method '{other}'"
            )),
        )),
    }
}
