// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Collective gather of channel-split chunks into one wider chunk.
//!
//! Groups of adjacent active ranks hand their channel slices to a root
//! rank, which assembles them side by side along the channel axis; the
//! other ranks of the group deactivate downstream. With `spare_ranks`
//! enabled, a previously idle service rank is co-opted as the root of
//! each group so every receiving rank stays free for the next cycle's
//! corner turn.

use std::sync::Arc;

use log::{debug, error, info, warn};
use ndarray::Array3;

use super::{Task, TaskError};
use crate::chunk::wire;
use crate::chunk::{c32, VisChunk};
use crate::comms::{
    decode_bools, decode_f32s, decode_f64s, decode_u32s, encode_bools, encode_f32s, encode_f64s,
    encode_u32s, Communicator,
};
use crate::config::Configuration;
use crate::constants::FREQ_CONTIGUITY_TOLERANCE;
use crate::monitoring;
use crate::parset::Parset;

/// Two chunk times count as the same integration within this \[s\].
const TIME_MATCH_TOLERANCE: f64 = 5e-7;

pub struct ChannelMergeTask {
    config: Configuration,
    world: Arc<dyn Communicator>,
    comm: Option<Arc<dyn Communicator>>,
    /// `None` means merge all active ranks (resolved on first call).
    ranks_to_merge_param: Option<usize>,
    ranks_to_merge: usize,
    rank_in_use: bool,
    group_with_activated_rank: bool,
    use_inactive_ranks: bool,
}

impl ChannelMergeTask {
    pub fn new(
        params: &Parset,
        config: &Configuration,
        world: Arc<dyn Communicator>,
    ) -> Result<ChannelMergeTask, TaskError> {
        if config.nprocs() <= 1 {
            return Err(TaskError::Inconsistent(
                "ChannelMergeTask is intended to be used in parallel mode only".to_string(),
            ));
        }
        let ranks_to_merge_param = params
            .get_u32("ranks2merge")
            .map_err(crate::config::ConfigError::from)?
            .map(|r| r as usize);
        let use_inactive_ranks = params
            .bool_or("spare_ranks", false)
            .map_err(crate::config::ConfigError::from)?;
        Ok(ChannelMergeTask {
            config: config.clone(),
            world,
            comm: None,
            ranks_to_merge_param,
            ranks_to_merge: 0,
            rank_in_use: false,
            // True before the first call so that every rank enters
            // process() and the collective setup can run.
            group_with_activated_rank: true,
            use_inactive_ranks,
        })
    }

    fn comm(&self) -> &Arc<dyn Communicator> {
        self.comm.as_ref().expect("communicator configured")
    }

    /// First-iteration setup: learn which ranks carry data, partition
    /// them into merge groups and split off a communicator per group.
    fn configure_ranks(&mut self, is_active: bool) -> Result<(), TaskError> {
        debug!(
            "Initialising merge task for the given data distribution; this rank has {} input",
            if is_active { "active" } else { "inactive" }
        );
        let nprocs = self.world.size();
        let my_rank = self.world.rank();
        let mut activity = vec![0i64; nprocs];
        if is_active {
            activity[my_rank] = 1;
        }
        let activity = self.world.allreduce_sum(&activity)?;
        let num_inputs: usize = activity.iter().sum::<i64>() as usize;
        if num_inputs == 0 {
            return Err(TaskError::Inconsistent(
                "merge task receives no data in this ingest configuration".to_string(),
            ));
        }
        // 0-based sequence number of this receiving rank.
        let seq_number: usize = activity[..my_rank].iter().sum::<i64>() as usize;

        self.ranks_to_merge = match self.ranks_to_merge_param {
            Some(r) if r <= nprocs => r,
            // Default: merge all available inputs.
            _ => num_inputs,
        };
        info!(
            "Will aggregate data handled by {} consecutive active ranks",
            self.ranks_to_merge
        );
        if self.ranks_to_merge < 2 {
            return Err(TaskError::Inconsistent(
                "number of aggregated data chunks should be more than 1".to_string(),
            ));
        }
        if num_inputs % self.ranks_to_merge != 0 {
            return Err(TaskError::Inconsistent(format!(
                "total number of ranks with data ({num_inputs}) should be an integral multiple \
                 of the selected number of ranks to merge ({})",
                self.ranks_to_merge
            )));
        }
        let num_spare = nprocs - num_inputs;

        // The colour nprocs is never a real group, so it marks ranks
        // sitting this task out.
        let (colour, key) = if self.use_inactive_ranks {
            let num_groups = num_inputs / self.ranks_to_merge;
            if my_rank == 0 {
                debug!(
                    "Inactive ranks ({num_spare} available) will be used as much as possible \
                     for the output"
                );
                if num_groups > num_spare {
                    warn!(
                        "Unbalanced configuration - number of output streams ({num_groups}) \
                         exceeds the number of spare ranks available ({num_spare})"
                    );
                }
            }
            self.rank_in_use = is_active;
            self.group_with_activated_rank = false;
            let mut colour = if is_active {
                seq_number / self.ranks_to_merge
            } else {
                nprocs
            };
            if is_active {
                if colour < num_spare {
                    self.group_with_activated_rank = true;
                }
            } else {
                // Which group can this spare rank serve, if any?
                let group = activity[..my_rank].iter().filter(|&&a| a == 0).count();
                if group < num_groups {
                    debug!("Rank {my_rank} will handle output stream {} (1-based)", group + 1);
                    self.group_with_activated_rank = true;
                    self.rank_in_use = true;
                    colour = group;
                } else {
                    debug!("Rank {my_rank} will be deactivated");
                }
            }
            // The rank handling the output sorts first in its group.
            let key = if is_active == self.rank_in_use {
                my_rank + 1
            } else {
                0
            };
            (colour, key)
        } else {
            self.rank_in_use = is_active;
            self.group_with_activated_rank = false;
            let colour = if is_active {
                seq_number / self.ranks_to_merge
            } else {
                nprocs
            };
            (colour, my_rank)
        };

        self.comm = Some(self.world.split(colour as u32, key as u32)?);
        self.check_ranks_to_merge(is_active != self.rank_in_use)?;
        Ok(())
    }

    /// Consistency checks on the freshly split communicator: group sizes
    /// match the configuration and exactly one rank is activated per
    /// group when spare ranks are in use.
    fn check_ranks_to_merge(&self, being_activated: bool) -> Result<(), TaskError> {
        let comm = self.comm();
        let nprocs = comm.size();
        if !self.rank_in_use {
            debug!(
                "Rank {} is unused (total number of unused ranks: {nprocs})",
                self.config.rank()
            );
            return Ok(());
        }
        let mut flags = vec![0i64; 3];
        flags[0] = being_activated as i64;
        flags[1] = self.group_with_activated_rank as i64;
        flags[2] = self.rank_in_use as i64;
        let sums = comm.allreduce_sum(&flags)?;
        let (num_activated, num_new_rank_flags, num_in_use) =
            (sums[0] as usize, sums[1] as usize, sums[2] as usize);
        if num_in_use != nprocs {
            return Err(TaskError::Inconsistent(format!(
                "{num_in_use} of {nprocs} ranks of a merge group consider themselves in use"
            )));
        }
        if num_new_rank_flags != 0 && num_new_rank_flags != nprocs {
            return Err(TaskError::Inconsistent(
                "merge group disagrees about spare-rank activation".to_string(),
            ));
        }
        if self.group_with_activated_rank {
            if nprocs != self.ranks_to_merge + 1 {
                return Err(TaskError::Inconsistent(format!(
                    "number of ranks in the group ({nprocs}) doesn't match the chosen number \
                     of ranks to merge ({}) plus one",
                    self.ranks_to_merge
                )));
            }
            if num_activated != 1 {
                return Err(TaskError::Inconsistent(format!(
                    "exactly one service rank is expected to be activated, got {num_activated}"
                )));
            }
            if being_activated && comm.rank() != 0 {
                return Err(TaskError::Inconsistent(
                    "the rank handling the output is expected to become rank 0 of its group"
                        .to_string(),
                ));
            }
        } else {
            if nprocs != self.ranks_to_merge {
                return Err(TaskError::Inconsistent(format!(
                    "number of ranks in the group ({nprocs}) doesn't match the chosen number \
                     of ranks to merge ({})",
                    self.ranks_to_merge
                )));
            }
            if num_activated != 0 {
                return Err(TaskError::Inconsistent(format!(
                    "no ranks are expected to be activated, got {num_activated}"
                )));
            }
        }
        Ok(())
    }

    /// Verify that all participating chunks have matching shapes, and on
    /// an activated spare root build the output chunk (including the row
    /// metadata handed over point-to-point from local rank 1).
    fn check_chunk_or_create_new(
        &self,
        chunk: &mut Option<VisChunk>,
    ) -> Result<(), TaskError> {
        let comm = Arc::clone(self.comm());
        let local_rank = comm.rank();
        let spare_root = self.group_with_activated_rank && local_rank == 0;
        if self.group_with_activated_rank {
            if chunk.is_some() != (local_rank != 0) {
                return Err(TaskError::Inconsistent(
                    "expect an idle input for local rank 0 and data for the others".to_string(),
                ));
            }
        } else if chunk.is_none() {
            return Err(TaskError::Inconsistent(
                "expect no idle input streams within a merge group".to_string(),
            ));
        }

        let shape = match chunk {
            Some(c) => [
                c.n_row() as u32,
                c.n_channel() as u32,
                c.n_pol() as u32,
                c.n_antenna() as u32,
            ],
            None => [0; 4],
        };
        let all_shapes = comm.allgather(&encode_u32s(&shape))?;

        if spare_root {
            let template = decode_u32s(&all_shapes[1])?;
            if template.len() != 4 {
                return Err(TaskError::Inconsistent("shape exchange".to_string()));
            }
            let mut new_chunk = VisChunk::new(
                template[0] as usize,
                template[1] as usize * self.ranks_to_merge,
                template[2] as usize,
                template[3] as usize,
            );
            // Row metadata and scalar fields come from the first rank
            // with valid input.
            wire::apply_row_block(&mut new_chunk, &comm.recv(1)?)?;
            wire::apply_antenna_fields(&mut new_chunk, &comm.recv(1)?)?;
            wire::apply_row_independent(&mut new_chunk, &comm.recv(1)?)?;
            *chunk = Some(new_chunk);
        } else {
            let own = chunk.as_ref().expect("checked above");
            let start = if self.group_with_activated_rank { 1 } else { 0 };
            for (rank, bytes) in all_shapes.iter().enumerate().skip(start) {
                let other = decode_u32s(bytes)?;
                if other != shape {
                    return Err(TaskError::Inconsistent(format!(
                        "chunk dimensions {shape:?} differ from rank {rank}'s {other:?}"
                    )));
                }
            }
            if self.group_with_activated_rank && local_rank == 1 {
                comm.send(0, &wire::encode_row_block(own, 0, own.n_row()))?;
                comm.send(0, &wire::encode_antenna_fields(own))?;
                comm.send(0, &wire::encode_row_independent(own))?;
            }
        }
        Ok(())
    }

    /// The non-root side: contribute this rank's slice to the gathers.
    fn send_vis_chunk(&self, chunk: &VisChunk) -> Result<(), TaskError> {
        let comm = self.comm();
        comm.gather(0, &encode_f64s(&[chunk.time]))?;
        comm.gather(0, &encode_f64s(&chunk.frequency))?;
        let mut vis = Vec::with_capacity(chunk.visibility.len() * 2);
        for v in chunk.visibility.iter() {
            vis.push(v.re);
            vis.push(v.im);
        }
        comm.gather(0, &encode_f32s(&vis))?;
        let flags: Vec<bool> = chunk.flag.iter().copied().collect();
        comm.gather(0, &encode_bools(&flags))?;
        Ok(())
    }

    /// The root side: run the gathers, pick the majority time, merge the
    /// axes and cubes, flag slabs from misaligned ranks.
    fn receive_vis_chunks(&self, chunk: &mut VisChunk) -> Result<(), TaskError> {
        let comm = self.comm();
        let rank_offset = if self.group_with_activated_rank { 1 } else { 0 };
        let n_chan_original = if self.group_with_activated_rank {
            chunk.n_channel() / self.ranks_to_merge
        } else {
            chunk.n_channel()
        };

        // 1) Times from all ranks; older data will be flagged.
        let time_bufs = comm
            .gather(0, &encode_f64s(&[chunk.time]))?
            .expect("root side of the gather");
        let times: Vec<f64> = time_bufs
            .iter()
            .skip(rank_offset)
            .map(|b| decode_f64s(b).map(|v| v[0]))
            .collect::<Result<_, _>>()?;

        // 2) The time with the most matches wins the majority vote.
        let mut time_with_most_data = 0.0;
        let mut largest_number_of_chunks = 0;
        for &candidate in &times {
            let matches = times
                .iter()
                .filter(|&&t| (t - candidate).abs() < TIME_MATCH_TOLERANCE)
                .count();
            if matches > largest_number_of_chunks {
                largest_number_of_chunks = matches;
                time_with_most_data = candidate;
            }
        }
        debug_assert!(largest_number_of_chunks > 0);
        if time_with_most_data.abs() < TIME_MATCH_TOLERANCE {
            error!(
                "The majority ({largest_number_of_chunks}) of the data streams are likely to \
                 be idle, check the correlator"
            );
        }
        if self.group_with_activated_rank {
            chunk.time = time_with_most_data;
        }

        // Invalid-slab flags per contributing rank; empty means all
        // chunks share the winning time.
        let mut invalid_flags: Vec<bool> = Vec::new();
        if largest_number_of_chunks != self.ranks_to_merge {
            debug!(
                "Chunks being merged correspond to different times, keeping time with most \
                 data = {time_with_most_data}"
            );
            invalid_flags = times
                .iter()
                .map(|&t| (t - time_with_most_data).abs() >= TIME_MATCH_TOLERANCE)
                .collect();
            let kept = invalid_flags.iter().filter(|&&inv| !inv).count();
            debug!("      - keeping {kept} chunks out of {} merged", self.ranks_to_merge);
            let misaligned = (self.ranks_to_merge - kept) as i32;
            monitoring::update("MisalignedStreamsCount", misaligned);
            monitoring::update(
                "MisalignedStreamsPercent",
                misaligned as f32 / self.ranks_to_merge as f32 * 100.0,
            );
        } else {
            monitoring::update("MisalignedStreamsCount", 0);
            monitoring::update("MisalignedStreamsPercent", 0.0f32);
        }
        let rank_invalid =
            |rank: usize| -> bool { invalid_flags.get(rank).copied().unwrap_or(false) };

        // 3) Frequency axes merge side by side whether or not the data
        // are valid.
        let freq_bufs = comm
            .gather(0, &encode_f64s(&chunk.frequency))?
            .expect("root side of the gather");
        let mut new_freq = vec![0.0f64; n_chan_original * self.ranks_to_merge];
        for rank in 0..self.ranks_to_merge {
            let axis = decode_f64s(&freq_bufs[rank + rank_offset])?;
            if axis.len() != n_chan_original {
                return Err(TaskError::Inconsistent(format!(
                    "rank {rank} contributed a {}-channel axis, expected {n_chan_original}",
                    axis.len()
                )));
            }
            new_freq[rank * n_chan_original..(rank + 1) * n_chan_original]
                .copy_from_slice(&axis);
        }

        let n_row = chunk.n_row();
        let n_pol = chunk.n_pol();
        let wide_chans = n_chan_original * self.ranks_to_merge;

        // 4) Visibility slabs. Invalid ranks stay zeroed and flagged.
        let own_vis: Vec<f32> = if self.group_with_activated_rank {
            Vec::new()
        } else {
            let mut v = Vec::with_capacity(chunk.visibility.len() * 2);
            for sample in chunk.visibility.iter() {
                v.push(sample.re);
                v.push(sample.im);
            }
            v
        };
        let vis_bufs = comm
            .gather(0, &encode_f32s(&own_vis))?
            .expect("root side of the gather");
        let mut new_vis: Array3<c32> = Array3::zeros((n_row, wide_chans, n_pol));
        let mut new_flag: Array3<bool> = Array3::from_elem((n_row, wide_chans, n_pol), true);
        for rank in 0..self.ranks_to_merge {
            if rank_invalid(rank) {
                continue;
            }
            let samples = decode_f32s(&vis_bufs[rank + rank_offset])?;
            if samples.len() != n_row * n_chan_original * n_pol * 2 {
                return Err(TaskError::Inconsistent(format!(
                    "rank {rank} contributed {} floats of visibility data",
                    samples.len()
                )));
            }
            let mut it = samples.chunks_exact(2);
            for row in 0..n_row {
                for chan in 0..n_chan_original {
                    for pol in 0..n_pol {
                        let pair = it.next().expect("length checked above");
                        new_vis[(row, rank * n_chan_original + chan, pol)] =
                            c32::new(pair[0], pair[1]);
                    }
                }
            }
        }

        // 5) Flag slabs, analogously.
        let own_flags: Vec<bool> = if self.group_with_activated_rank {
            Vec::new()
        } else {
            chunk.flag.iter().copied().collect()
        };
        let flag_bufs = comm
            .gather(0, &encode_bools(&own_flags))?
            .expect("root side of the gather");
        for rank in 0..self.ranks_to_merge {
            if rank_invalid(rank) {
                continue;
            }
            let flags = decode_bools(&flag_bufs[rank + rank_offset]);
            if flags.len() != n_row * n_chan_original * n_pol {
                return Err(TaskError::Inconsistent(format!(
                    "rank {rank} contributed {} flags",
                    flags.len()
                )));
            }
            let mut it = flags.into_iter();
            for row in 0..n_row {
                for chan in 0..n_chan_original {
                    for pol in 0..n_pol {
                        new_flag[(row, rank * n_chan_original + chan, pol)] =
                            it.next().expect("length checked above");
                    }
                }
            }
        }

        // 6) Install the merged axes and check contiguity.
        check_frequency_contiguity(&new_freq);
        chunk.resize(new_vis, new_flag, new_freq)?;
        Ok(())
    }
}

/// Warn if a merged frequency axis is not contiguous within tolerance.
fn check_frequency_contiguity(freq: &[f64]) {
    if freq.len() < 2 {
        return;
    }
    let resolution = (freq[freq.len() - 1] - freq[0]) / (freq.len() - 1) as f64;
    for (chan, &f) in freq.iter().enumerate() {
        let expected = freq[0] + resolution * chan as f64;
        if (expected - f).abs() > FREQ_CONTIGUITY_TOLERANCE {
            warn!(
                "Frequencies in the merged chunks seem to be non-contiguous: for resulting \
                 channel = {chan} got {} MHz, expected {} MHz, estimated resolution {} kHz",
                f / 1e6,
                expected / 1e6,
                resolution / 1e3
            );
            break;
        }
    }
}

impl Task for ChannelMergeTask {
    fn name(&self) -> &str {
        "ChannelMergeTask"
    }

    /// Always active on the first iteration (all ranks must join the
    /// setup collectives); afterwards only for groups that had a rank
    /// activated.
    fn is_always_active(&self) -> bool {
        self.group_with_activated_rank
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        if self.comm.is_none() {
            self.configure_ranks(chunk.is_some())?;
            if !self.rank_in_use {
                *chunk = None;
                return Ok(());
            }
        } else {
            debug_assert!(self.rank_in_use);
        }

        self.check_chunk_or_create_new(chunk)?;

        if self.comm().rank() > 0 {
            // These ranks hand their chunk to the root and go inactive.
            let own = chunk.take().expect("checked for consistency above");
            self.send_vis_chunk(&own)?;
        } else {
            let own = chunk.as_mut().expect("root holds a chunk");
            self.receive_vis_chunks(own)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::comms::LocalFabric;
    use crate::stokes::Stokes;

    fn config(rank: i32, nprocs: i32, extra: &str) -> Configuration {
        let text = format!(
            "antennas = [a]\n\
             antenna.a.location.itrf = [-2556109.976, 5097388.7, -2848440.12]\n\
             baselinemap.baselineids = [1]\n\
             baselinemap.1 = [0, 0, XX]\n\
             {extra}"
        );
        Configuration::new(Parset::from_str(&text).unwrap(), rank, nprocs).unwrap()
    }

    fn slice_chunk(rank: usize, time: f64) -> VisChunk {
        let mut chunk = VisChunk::new(2, 4, 1, 1);
        chunk.time = time;
        chunk.interval = 5.0;
        chunk.scan = 1;
        chunk.target_name = "merge_me".into();
        chunk.stokes = vec![Stokes::XX];
        chunk.channel_width = 1e6;
        chunk.frequency = (0..4).map(|c| 1e9 + (rank * 4 + c) as f64 * 1e6).collect();
        for ((_, chan, _), v) in chunk.visibility.indexed_iter_mut() {
            *v = c32::new(rank as f32, chan as f32);
        }
        chunk.flag.fill(false);
        chunk
    }

    fn run_merge(
        nprocs: usize,
        params: &str,
        chunks: Vec<Option<VisChunk>>,
    ) -> Vec<Option<VisChunk>> {
        let world = LocalFabric::new_world(nprocs);
        let params = params.to_string();
        let handles: Vec<_> = world
            .into_iter()
            .zip(chunks)
            .map(|(comm, chunk)| {
                let params = params.clone();
                thread::spawn(move || {
                    let rank = comm.rank() as i32;
                    let config = config(rank, comm.size() as i32, "");
                    let mut task = ChannelMergeTask::new(
                        &Parset::from_str(&params).unwrap(),
                        &config,
                        comm,
                    )
                    .unwrap();
                    let mut holder = chunk;
                    if holder.is_some() || task.is_always_active() {
                        task.process(&mut holder).unwrap();
                    }
                    holder
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn merges_two_ranks_into_one() {
        let out = run_merge(
            2,
            "ranks2merge = 2\n",
            vec![Some(slice_chunk(0, 100.0)), Some(slice_chunk(1, 100.0))],
        );
        // Rank 1 deactivated, rank 0 holds the merged chunk.
        assert!(out[1].is_none());
        let merged = out[0].as_ref().expect("merged chunk on the root");
        assert_eq!(merged.n_channel(), 8);
        assert_eq!(merged.frequency.len(), 8);
        // Frequency axis is the concatenation of the inputs.
        assert_abs_diff_eq!(merged.frequency[0], 1e9);
        assert_abs_diff_eq!(merged.frequency[7], 1e9 + 7e6);
        // Rank 1's slab sits in channels 4..8.
        assert_eq!(merged.visibility[(0, 2, 0)], c32::new(0.0, 2.0));
        assert_eq!(merged.visibility[(0, 6, 0)], c32::new(1.0, 2.0));
        assert!(!merged.flag[(1, 5, 0)]);
    }

    #[test]
    fn misaligned_rank_slab_is_flagged() {
        // Three ranks; rank 2 is one cycle behind.
        let out = run_merge(
            3,
            "ranks2merge = 3\n",
            vec![
                Some(slice_chunk(0, 200.0)),
                Some(slice_chunk(1, 200.0)),
                Some(slice_chunk(2, 195.0)),
            ],
        );
        let merged = out[0].as_ref().expect("merged chunk on the root");
        assert_eq!(merged.n_channel(), 12);
        // Majority slabs carry data.
        assert!(!merged.flag[(0, 1, 0)]);
        assert!(!merged.flag[(0, 5, 0)]);
        // The stale rank's slab is flagged and zeroed.
        assert!(merged.flag[(0, 9, 0)]);
        assert_eq!(merged.visibility[(0, 9, 0)], c32::new(0.0, 0.0));
        // The frequency axis still covers all twelve channels.
        assert_abs_diff_eq!(merged.frequency[11], 1e9 + 11e6);
    }

    #[test]
    fn spare_rank_becomes_the_root() {
        // Ranks 0 and 1 are active, rank 2 idle; with spare_ranks the
        // idle one is activated as the output handler.
        let out = run_merge(
            3,
            "ranks2merge = 2\nspare_ranks = true\n",
            vec![
                Some(slice_chunk(0, 300.0)),
                Some(slice_chunk(1, 300.0)),
                None,
            ],
        );
        assert!(out[0].is_none());
        assert!(out[1].is_none());
        let merged = out[2].as_ref().expect("spare rank holds the output");
        assert_eq!(merged.n_channel(), 8);
        assert_eq!(merged.target_name, "merge_me");
        assert_eq!(merged.scan, 1);
        assert_abs_diff_eq!(merged.time, 300.0);
        assert_eq!(merged.visibility[(1, 6, 0)], c32::new(1.0, 2.0));
        assert!(!merged.flag[(1, 6, 0)]);
    }

    #[test]
    fn group_size_mismatch_is_fatal() {
        // Three active ranks cannot merge in groups of two.
        let world = LocalFabric::new_world(3);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank() as i32;
                    let config = config(rank, 3, "");
                    let mut task = ChannelMergeTask::new(
                        &Parset::from_str("ranks2merge = 2\n").unwrap(),
                        &config,
                        comm,
                    )
                    .unwrap();
                    let mut holder = Some(slice_chunk(rank as usize, 1.0));
                    task.process(&mut holder).is_err()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
