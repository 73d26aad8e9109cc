// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Flag the first cycles of every scan while the hardware settles.

use log::{debug, warn};

use super::{Task, TaskError};
use crate::chunk::VisChunk;
use crate::config::Configuration;
use crate::parset::Parset;

pub struct QuackTask {
    n_cycles: u32,
    n_cycles_this_scan: u32,
    counted_scan_number: u32,
    first_chunk: bool,
    /// Only one receiver reports at warning level, to keep the log sane.
    verbose_rank: bool,
}

impl QuackTask {
    pub fn new(params: &Parset, config: &Configuration) -> Result<QuackTask, TaskError> {
        let n_cycles = params
            .u32_or("ncycles", 2)
            .map_err(crate::config::ConfigError::from)?;
        let verbose_rank = config.receiver_id() == 0;
        if n_cycles == 0 {
            debug!("QuackTask is executed but set up not to drop any cycles - essentially no operation");
        } else if verbose_rank {
            warn!("Will flag {n_cycles} cycle(s) following a scan number change");
        } else {
            debug!("Will flag {n_cycles} cycle(s) following a scan number change");
        }
        Ok(QuackTask {
            n_cycles,
            n_cycles_this_scan: 0,
            counted_scan_number: 0,
            first_chunk: true,
            verbose_rank,
        })
    }
}

impl Task for QuackTask {
    fn name(&self) -> &str {
        "QuackTask"
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let chunk = chunk
            .as_mut()
            .ok_or(TaskError::UnexpectedIdleRank("QuackTask"))?;
        if self.first_chunk || chunk.scan != self.counted_scan_number {
            self.first_chunk = false;
            self.counted_scan_number = chunk.scan;
            self.n_cycles_this_scan = 0;
            debug!("Scan change detected, new scan id: {}", chunk.scan);
        } else {
            self.n_cycles_this_scan += 1;
        }
        if self.n_cycles_this_scan < self.n_cycles {
            let msg = format!(
                "Cycle {} of scan {} - flagging all the data",
                self.n_cycles_this_scan + 1,
                self.counted_scan_number
            );
            if self.verbose_rank {
                warn!("{msg}");
            } else {
                debug!("{msg}");
            }
            chunk.flag_all();
        } else if self.n_cycles != 0 && self.n_cycles_this_scan == self.n_cycles {
            // Not flagging is all it takes to "unflag" here.
            let msg = format!(
                "Scan {} got more than {} cycles, passing data through",
                self.counted_scan_number, self.n_cycles
            );
            if self.verbose_rank {
                warn!("{msg}");
            } else {
                debug!("{msg}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Configuration {
        let text = "antennas = [a]\n\
             antenna.a.location.itrf = [-2556109.976, 5097388.7, -2848440.12]\n\
             baselinemap.baselineids = [1]\n\
             baselinemap.1 = [0, 0, XX]\n";
        Configuration::new(Parset::from_str(text).unwrap(), 0, 1).unwrap()
    }

    fn quack(n_cycles: u32) -> QuackTask {
        let mut params = Parset::new();
        params.add("ncycles", &n_cycles.to_string());
        QuackTask::new(&params, &config()).unwrap()
    }

    fn clean_chunk(scan: u32) -> Option<VisChunk> {
        let mut chunk = VisChunk::new(2, 8, 4, 1);
        chunk.scan = scan;
        chunk.flag.fill(false);
        Some(chunk)
    }

    fn fully_flagged(chunk: &Option<VisChunk>) -> bool {
        chunk.as_ref().unwrap().flag.iter().all(|&f| f)
    }

    #[test]
    fn flags_two_cycles_after_scan_change() {
        let mut task = quack(2);

        // Scan 0: first two cycles flagged, third passes.
        let mut c = clean_chunk(0);
        task.process(&mut c).unwrap();
        assert!(fully_flagged(&c));
        let mut c = clean_chunk(0);
        task.process(&mut c).unwrap();
        assert!(fully_flagged(&c));
        let mut c = clean_chunk(0);
        task.process(&mut c).unwrap();
        assert!(!fully_flagged(&c));

        // Scan change restarts the countdown.
        let mut c = clean_chunk(1);
        task.process(&mut c).unwrap();
        assert!(fully_flagged(&c));
        let mut c = clean_chunk(1);
        task.process(&mut c).unwrap();
        assert!(fully_flagged(&c));
        let mut c = clean_chunk(1);
        task.process(&mut c).unwrap();
        assert!(!fully_flagged(&c));
    }

    #[test]
    fn zero_cycles_is_a_no_op() {
        let mut task = quack(0);
        let mut c = clean_chunk(0);
        task.process(&mut c).unwrap();
        assert!(!fully_flagged(&c));
    }
}
