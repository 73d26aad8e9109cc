// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Local N-to-1 channel averaging with a flag-aware mean.

use log::debug;
use ndarray::Array3;

use super::{Task, TaskError};
use crate::chunk::{c32, VisChunk};
use crate::parset::Parset;

pub struct ChannelAvgTask {
    averaging: u32,
}

impl ChannelAvgTask {
    pub fn new(params: &Parset) -> Result<ChannelAvgTask, TaskError> {
        let averaging = params.u32("averaging").map_err(crate::config::ConfigError::from)?;
        debug!("Channel averaging factor: {averaging}");
        Ok(ChannelAvgTask { averaging })
    }
}

impl Task for ChannelAvgTask {
    fn name(&self) -> &str {
        "ChannelAvgTask"
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let chunk = chunk
            .as_mut()
            .ok_or(TaskError::UnexpectedIdleRank("ChannelAvgTask"))?;
        if self.averaging < 2 {
            // No averaging required for 0 or 1.
            return Ok(());
        }
        let averaging = self.averaging as usize;

        let n_chan_original = chunk.n_channel();
        if n_chan_original % averaging != 0 {
            return Err(TaskError::AveragingMismatch {
                n_chan: n_chan_original,
                averaging: self.averaging,
            });
        }
        let n_chan_new = n_chan_original / averaging;
        let n_row = chunk.n_row();
        let n_pol = chunk.n_pol();

        let new_freq: Vec<f64> = (0..n_chan_new)
            .map(|new_idx| {
                chunk.frequency[new_idx * averaging..(new_idx + 1) * averaging]
                    .iter()
                    .sum::<f64>()
                    / averaging as f64
            })
            .collect();

        chunk.channel_width *= averaging as f64;

        let mut new_vis = Array3::zeros((n_row, n_chan_new, n_pol));
        let mut new_flag = Array3::from_elem((n_row, n_chan_new, n_pol), false);
        for row in 0..n_row {
            for new_idx in 0..n_chan_new {
                for pol in 0..n_pol {
                    // Flagged input samples do not contribute.
                    let mut sum = c32::new(0.0, 0.0);
                    let mut good_samples = 0u32;
                    for i in 0..averaging {
                        let orig_idx = averaging * new_idx + i;
                        if !chunk.flag[(row, orig_idx, pol)] {
                            sum += chunk.visibility[(row, orig_idx, pol)];
                            good_samples += 1;
                        }
                    }
                    if good_samples > 0 {
                        new_vis[(row, new_idx, pol)] = sum / good_samples as f32;
                    } else {
                        new_flag[(row, new_idx, pol)] = true;
                    }
                }
            }
        }

        chunk.resize(new_vis, new_flag, new_freq)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::stokes::Stokes;

    fn task(averaging: u32) -> ChannelAvgTask {
        let mut params = Parset::new();
        params.add("averaging", &averaging.to_string());
        ChannelAvgTask::new(&params).unwrap()
    }

    fn chunk_216() -> VisChunk {
        let mut chunk = VisChunk::new(4, 216, 4, 3);
        chunk.channel_width = 18_518.518;
        chunk.frequency = (0..216).map(|i| 1.2e9 + i as f64 * 18_518.518).collect();
        chunk.stokes = vec![Stokes::XX, Stokes::XY, Stokes::YX, Stokes::YY];
        for ((_, chan, _), v) in chunk.visibility.indexed_iter_mut() {
            *v = c32::new(chan as f32, 1.0);
        }
        chunk.flag.fill(false);
        chunk
    }

    #[test]
    fn averages_216_channels_by_54() {
        let mut holder = Some(chunk_216());
        task(54).process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        assert_eq!(chunk.n_channel(), 4);
        assert_abs_diff_eq!(chunk.channel_width, 1.0000000e6, epsilon = 0.1);
        assert_eq!(chunk.frequency.len(), 4);
        // Output channel 0 is the mean of inputs 0..54.
        let expected_mean = (0..54).sum::<usize>() as f32 / 54.0;
        assert_abs_diff_eq!(chunk.visibility[(2, 0, 1)].re, expected_mean, epsilon = 1e-3);
        assert_abs_diff_eq!(chunk.visibility[(2, 0, 1)].im, 1.0, epsilon = 1e-6);
        assert!(!chunk.flag[(2, 0, 1)]);
        // Frequency of bin 0 is the mean of the first 54 centres.
        let f_expected: f64 = (0..54).map(|i| 1.2e9 + i as f64 * 18_518.518).sum::<f64>() / 54.0;
        assert_abs_diff_eq!(chunk.frequency[0], f_expected, epsilon = 1e-3);
    }

    #[test]
    fn fully_flagged_bin_yields_zero_and_flag() {
        let mut chunk = chunk_216();
        for i in 54..108 {
            chunk.flag[(1, i, 2)] = true;
        }
        let mut holder = Some(chunk);
        task(54).process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        assert_eq!(chunk.visibility[(1, 1, 2)], c32::new(0.0, 0.0));
        assert!(chunk.flag[(1, 1, 2)]);
        // Neighbouring bins are untouched.
        assert!(!chunk.flag[(1, 0, 2)]);
    }

    #[test]
    fn partial_flags_average_survivors_only() {
        let mut chunk = chunk_216();
        // Flag all but one sample of the first bin.
        for i in 1..54 {
            chunk.flag[(0, i, 0)] = true;
        }
        let mut holder = Some(chunk);
        task(54).process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        assert_abs_diff_eq!(chunk.visibility[(0, 0, 0)].re, 0.0);
        assert!(!chunk.flag[(0, 0, 0)]);
    }

    #[test]
    fn averaging_factor_one_is_a_no_op() {
        let original = chunk_216();
        let mut holder = Some(original.clone());
        task(1).process(&mut holder).unwrap();
        let chunk = holder.unwrap();
        assert_eq!(chunk.n_channel(), original.n_channel());
        assert_eq!(chunk.visibility, original.visibility);
        assert_abs_diff_eq!(chunk.channel_width, original.channel_width);
    }

    #[test]
    fn non_dividing_factor_is_fatal() {
        let mut holder = Some(chunk_216());
        assert!(matches!(
            task(5).process(&mut holder),
            Err(TaskError::AveragingMismatch { .. })
        ));
    }
}
