// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Static policy flagging: autocorrelations, named antennas, beams.

use log::debug;

use super::{Task, TaskError};
use crate::chunk::VisChunk;
use crate::config::ConfigError;
use crate::parset::Parset;

pub struct FlagTask {
    flag_autocorr: bool,
    antennas: Vec<u32>,
    beams: Vec<u32>,
}

impl FlagTask {
    pub fn new(params: &Parset) -> Result<FlagTask, TaskError> {
        let flag_autocorr = params
            .bool_or("autocorr", false)
            .map_err(ConfigError::from)?;
        let antennas = params
            .u32_vector_or_empty("antennas")
            .map_err(ConfigError::from)?;
        let beams = params
            .u32_vector_or_empty("beams")
            .map_err(ConfigError::from)?;
        debug!(
            "Static flagging policy: autocorr={flag_autocorr}, antennas={antennas:?}, beams={beams:?}"
        );
        Ok(FlagTask {
            flag_autocorr,
            antennas,
            beams,
        })
    }
}

impl Task for FlagTask {
    fn name(&self) -> &str {
        "FlagTask"
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let chunk = chunk
            .as_mut()
            .ok_or(TaskError::UnexpectedIdleRank("FlagTask"))?;
        for row in 0..chunk.n_row() {
            let ant1 = chunk.antenna1[row];
            let ant2 = chunk.antenna2[row];
            let beam = chunk.beam1[row];
            let hit = (self.flag_autocorr && ant1 == ant2)
                || self.antennas.contains(&ant1)
                || self.antennas.contains(&ant2)
                || self.beams.contains(&beam);
            if hit {
                chunk.flag_row(row);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> VisChunk {
        let mut chunk = VisChunk::new(3, 4, 2, 2);
        // Rows: (0,0) auto, (0,1) cross, (1,1) auto; all beam 0.
        chunk.antenna1 = vec![0, 0, 1];
        chunk.antenna2 = vec![0, 1, 1];
        chunk.flag.fill(false);
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
    fn flags_autocorrelations() {
        let mut params = Parset::new();
        params.add("autocorr", "true");
        let mut task = FlagTask::new(&params).unwrap();
        let mut holder = Some(chunk());
        task.process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        assert!(row_flagged(&chunk, 0));
        assert!(!row_flagged(&chunk, 1));
        assert!(row_flagged(&chunk, 2));
    }

    #[test]
    fn flags_listed_antennas() {
        let mut params = Parset::new();
        params.add("antennas", "[1]");
        let mut task = FlagTask::new(&params).unwrap();
        let mut holder = Some(chunk());
        task.process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        assert!(!row_flagged(&chunk, 0));
        assert!(row_flagged(&chunk, 1));
        assert!(row_flagged(&chunk, 2));
    }
}
