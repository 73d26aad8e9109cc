// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Collective scatter of row subsets by beam.
//!
//! The inverse of the channel merge: one active rank holds all beams'
//! rows; previously idle ranks of its group are activated and each
//! receives a disjoint, contiguous block of beams. Rows of one beam must
//! be contiguous in the layout; the partition is fixed on the first
//! cycle and only data moves afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use ndarray::Array3;

use super::{Task, TaskError};
use crate::chunk::wire;
use crate::chunk::{c32, VisChunk};
use crate::comms::{decode_bools, decode_f32s, encode_bools, encode_f32s, encode_u32s, Communicator};
use crate::config::Configuration;
use crate::parset::Parset;

pub struct BeamScatterTask {
    world: Arc<dyn Communicator>,
    comm: Option<Arc<dyn Communicator>>,
    n_streams: usize,
    /// Stream handled by this rank, or -1 when the rank sits out.
    stream_number: i32,
    /// Inclusive row range of this stream within the upstream chunk.
    handled_rows: Option<(u32, u32)>,
    /// Root only: per-stream row counts and offsets.
    row_counts: Vec<usize>,
    row_offsets: Vec<usize>,
    /// Root only: upstream row layout for per-cycle consistency checks.
    cached_antenna1: Vec<u32>,
    cached_antenna2: Vec<u32>,
    cached_beam: Vec<u32>,
}

impl BeamScatterTask {
    pub fn new(
        params: &Parset,
        config: &Configuration,
        world: Arc<dyn Communicator>,
    ) -> Result<BeamScatterTask, TaskError> {
        if config.nprocs() <= 1 {
            return Err(TaskError::Inconsistent(
                "BeamScatterTask is intended to be used in parallel mode only".to_string(),
            ));
        }
        let n_streams = params
            .u32_or("nstreams", config.nprocs() as u32)
            .map_err(crate::config::ConfigError::from)? as usize;
        if n_streams < 2 {
            return Err(TaskError::Inconsistent(
                "beam scatter doesn't make sense for a single output data stream".to_string(),
            ));
        }
        info!("Will split beam space into {n_streams} data streams");
        Ok(BeamScatterTask {
            world,
            comm: None,
            n_streams,
            stream_number: -1,
            handled_rows: None,
            row_counts: Vec::new(),
            row_offsets: Vec::new(),
            cached_antenna1: Vec::new(),
            cached_antenna2: Vec::new(),
            cached_beam: Vec::new(),
        })
    }

    fn comm(&self) -> &Arc<dyn Communicator> {
        self.comm.as_ref().expect("communicator configured")
    }

    /// Count active ranks, form a group per `(1 active, k inactive)`
    /// block and pick evenly spaced inactive ranks to activate. Returns
    /// the stream number of this rank, or -1.
    fn count_active_ranks(&mut self, is_active: bool) -> Result<i32, TaskError> {
        let nprocs = self.world.size();
        let my_rank = self.world.rank();
        let mut activity = vec![0i64; nprocs];
        if is_active {
            activity[my_rank] = 1;
        }
        let activity = self.world.allreduce_sum(&activity)?;
        if activity[0] != 1 {
            return Err(TaskError::Inconsistent(
                "expect rank zero to be active, which doesn't seem to be the case".to_string(),
            ));
        }

        // The active rank always leads its block of trailing idle ranks.
        let mut groups = vec![-1i64; nprocs];
        let mut start_ranks: BTreeMap<i64, usize> = BTreeMap::new();
        let mut start_rank: i64 = -2;
        let mut group: i64 = -1;
        for (rank, &flag) in activity.iter().enumerate() {
            if flag > 1 || flag < 0 {
                return Err(TaskError::Inconsistent(
                    "activity exchange out of range".to_string(),
                ));
            }
            if flag == 1 {
                group += 1;
                if group > 0 && rank as i64 - start_rank <= 1 {
                    return Err(TaskError::Inconsistent(format!(
                        "there seem to be no idle streams available before rank {rank}"
                    )));
                }
                start_rank = rank as i64;
                start_ranks.insert(group, rank);
            }
            groups[rank] = group;
        }
        if group < 0 {
            return Err(TaskError::Inconsistent(
                "beam scatter has no active input streams".to_string(),
            ));
        }
        let n_groups = (group + 1) as usize;
        let this_rank_group = groups[my_rank];

        // The marker colour for unused ranks; never a real group.
        let unused = nprocs as i64;
        for grp in 0..n_groups as i64 {
            let start = start_ranks[&grp];
            let stop = start_ranks
                .get(&(grp + 1))
                .map(|&r| r - 1)
                .unwrap_or(nprocs - 1);
            let n_ranks_this_group = stop - start + 1;
            if this_rank_group == grp {
                debug!(
                    "This rank belongs to initial group {grp} (ranks from {start} to {stop}, \
                     inclusive); {n_ranks_this_group} available"
                );
            }
            if self.n_streams > n_ranks_this_group {
                return Err(TaskError::Inconsistent(format!(
                    "number of streams requested ({}) exceeds the number of ranks available \
                     ({n_ranks_this_group})",
                    self.n_streams
                )));
            }
            // Space the active ranks out as much as possible.
            let max_stride = (n_ranks_this_group - 1) / (self.n_streams - 1);
            let kept = (n_ranks_this_group - 1) / max_stride + 1;
            if kept != self.n_streams {
                return Err(TaskError::Inconsistent(format!(
                    "cannot spread {} streams evenly over {n_ranks_this_group} ranks",
                    self.n_streams
                )));
            }
            for rank_offset in 0..n_ranks_this_group {
                let rank = start + rank_offset;
                if rank_offset % max_stride == 0 {
                    if this_rank_group == grp && rank_offset != 0 {
                        info!("    - rank {rank} will be activated");
                    }
                } else {
                    if this_rank_group == grp {
                        debug!("    - rank {rank} will be kept deactivated");
                    }
                    groups[rank] = unused;
                }
            }
        }

        let actual_group = groups[my_rank];
        let comm = self.world.split(actual_group as u32, my_rank as u32)?;
        let stream = if actual_group < unused {
            let stream = comm.rank() as i32;
            info!("This rank corresponds to stream {stream} of group {actual_group}");
            stream
        } else {
            info!("This rank will not be used");
            -1
        };
        self.comm = Some(comm);
        Ok(stream)
    }

    /// Build the beam-contiguous row partition on the root and scatter
    /// each stream's inclusive row range.
    fn initialise_split(&mut self, chunk: &Option<VisChunk>) -> Result<(), TaskError> {
        if self.stream_number < 0 {
            return Ok(());
        }
        let comm = Arc::clone(self.comm());
        debug_assert_eq!(self.stream_number, comm.rank() as i32);
        if comm.rank() == 0 {
            // Any failure here still has to release the peers blocked on
            // the scatter, so a failed partition scatters markers first.
            let partition = chunk
                .as_ref()
                .ok_or(TaskError::UnexpectedIdleRank("BeamScatterTask"))
                .and_then(|c| self.build_partition(c));
            let stream_row_map = match partition {
                Ok(map) => map,
                Err(e) => {
                    let markers = vec![encode_u32s(&[u32::MAX, u32::MAX]); self.n_streams];
                    let _ = comm.scatterv(0, Some(markers));
                    return Err(e);
                }
            };

            let parts: Vec<Vec<u8>> = stream_row_map
                .iter()
                .map(|&(first, last)| encode_u32s(&[first, last]))
                .collect();
            let own = comm.scatterv(0, Some(parts))?;
            self.handled_rows = Some(decode_range(&own)?);

            self.row_counts = stream_row_map
                .iter()
                .map(|&(first, last)| (last - first + 1) as usize)
                .collect();
            self.row_offsets = stream_row_map.iter().map(|&(first, _)| first as usize).collect();

            let chunk = chunk.as_ref().expect("partition succeeded above");
            self.cached_antenna1 = chunk.antenna1.clone();
            self.cached_antenna2 = chunk.antenna2.clone();
            self.cached_beam = chunk.beam1.clone();
        } else {
            let own = comm.scatterv(0, None)?;
            let range = decode_range(&own)?;
            debug!(
                "   slave rank, handling rows from {} to {}, inclusive",
                range.0, range.1
            );
            self.handled_rows = Some(range);
        }
        Ok(())
    }

    /// Root side of the first-cycle setup: group rows by beam (rows of
    /// one beam must be contiguous) and assign contiguous beam blocks to
    /// streams.
    fn build_partition(&self, chunk: &VisChunk) -> Result<Vec<(u32, u32)>, TaskError> {
        // Beam id -> (first row, last row).
        let mut beam_row_map: BTreeMap<u32, (u32, u32)> = BTreeMap::new();
        for row in 0..chunk.n_row() {
            let beam = chunk.beam1[row];
            if chunk.beam2[row] != beam {
                return Err(TaskError::Inconsistent(format!(
                    "correlations between different beams are not supported (row={row})"
                )));
            }
            match beam_row_map.get_mut(&beam) {
                None => {
                    beam_row_map.insert(beam, (row as u32, row as u32));
                }
                Some(range) => {
                    if row as u32 != range.1 + 1 {
                        return Err(TaskError::BeamsNotContiguous { beam, row });
                    }
                    range.1 = row as u32;
                }
            }
        }
        info!(
            "Found {} beams in this group of data streams",
            beam_row_map.len()
        );

        // There can be gaps in beam space, so partition by count.
        let n_beams = beam_row_map.len();
        let beams_per_stream = if n_beams % self.n_streams == 0 {
            n_beams / self.n_streams
        } else {
            n_beams / (self.n_streams - 1)
        };
        let mut stream_row_map: Vec<(u32, u32)> = Vec::with_capacity(self.n_streams);
        let mut beams = beam_row_map.iter();
        let mut last_row = 0u32;
        for stream in 0..self.n_streams {
            let mut handled: Vec<u32> = Vec::new();
            let mut range: Option<(u32, u32)> = None;
            for _ in 0..beams_per_stream {
                if let Some((&beam, &(first, last))) = beams.next() {
                    match &mut range {
                        None => range = Some((first, last)),
                        Some(r) => {
                            if r.1 + 1 != first {
                                return Err(TaskError::BeamsNotContiguous {
                                    beam,
                                    row: first as usize,
                                });
                            }
                            r.1 = last;
                        }
                    }
                    last_row = last;
                    handled.push(beam);
                }
            }
            let range = range.ok_or_else(|| {
                TaskError::Inconsistent(format!(
                    "not enough beams in the data to populate stream {stream}"
                ))
            })?;
            info!(
                "Stream {stream} will handle beams {handled:?}, rows from {} to {}, inclusive",
                range.0, range.1
            );
            stream_row_map.push(range);
        }
        if last_row as usize + 1 != chunk.n_row() {
            return Err(TaskError::Inconsistent(format!(
                "some rows seem to be missing after data partitioning: lastRow={last_row} \
                 nRow={}",
                chunk.n_row()
            )));
        }
        Ok(stream_row_map)
    }

    /// Root-side consistency check: the upstream data distribution must
    /// not change after the first cycle.
    fn check_cached_layout(&self, chunk: &VisChunk) -> Result<(), TaskError> {
        if chunk.n_row() != self.cached_beam.len() {
            return Err(TaskError::Inconsistent(
                "number of rows changed since the first iteration".to_string(),
            ));
        }
        for row in 0..chunk.n_row() {
            if chunk.beam1[row] != self.cached_beam[row]
                || chunk.beam2[row] != self.cached_beam[row]
                || chunk.antenna1[row] != self.cached_antenna1[row]
                || chunk.antenna2[row] != self.cached_antenna2[row]
            {
                return Err(TaskError::Inconsistent(format!(
                    "row layout mismatch for row {row} since the first iteration"
                )));
            }
        }
        Ok(())
    }

    /// Move one cycle's data: broadcast the row-independent fields,
    /// scatter the row-aligned vectors and both cubes, and rebuild every
    /// stream's chunk (the root's own included, trimmed to its range).
    fn scatter_cycle(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        let comm = Arc::clone(self.comm());
        let (first, last) = self.handled_rows.expect("initialised on the first cycle");
        let my_rows = (last - first + 1) as usize;

        // 1) Row-independent fields plus dimensions, one opaque message.
        let header = if comm.rank() == 0 {
            let own = chunk.as_ref().expect("root holds the input");
            let ri = wire::encode_row_independent(own);
            let ant = wire::encode_antenna_fields(own);
            let mut buf = Vec::with_capacity(16 + ri.len() + ant.len());
            let mut dims = [0u8; 16];
            LittleEndian::write_u32(&mut dims[0..4], own.n_channel() as u32);
            LittleEndian::write_u32(&mut dims[4..8], own.n_pol() as u32);
            LittleEndian::write_u32(&mut dims[8..12], own.n_antenna() as u32);
            LittleEndian::write_u32(&mut dims[12..16], ri.len() as u32);
            buf.extend_from_slice(&dims);
            buf.extend_from_slice(&ri);
            buf.extend_from_slice(&ant);
            comm.broadcast(0, Some(buf))?
        } else {
            comm.broadcast(0, None)?
        };
        if header.len() < 16 {
            return Err(TaskError::Inconsistent("scatter header".to_string()));
        }
        let n_channel = LittleEndian::read_u32(&header[0..4]) as usize;
        let n_pol = LittleEndian::read_u32(&header[4..8]) as usize;
        let n_antenna = LittleEndian::read_u32(&header[8..12]) as usize;
        let ri_len = LittleEndian::read_u32(&header[12..16]) as usize;

        // Every stream (root included) assembles a fresh chunk of its
        // own row count.
        let mut local = VisChunk::new(my_rows, n_channel, n_pol, n_antenna);
        wire::apply_row_independent(&mut local, &header[16..16 + ri_len])?;
        wire::apply_antenna_fields(&mut local, &header[16 + ri_len..])?;

        // 2) Row-aligned vectors.
        let row_parts = (comm.rank() == 0).then(|| {
            let own = chunk.as_ref().expect("root holds the input");
            self.row_counts
                .iter()
                .zip(&self.row_offsets)
                .map(|(&count, &offset)| wire::encode_row_block(own, offset, count))
                .collect()
        });
        let own_rows = comm.scatterv(0, row_parts)?;
        wire::apply_row_block(&mut local, &own_rows)?;

        // 3) The visibility cube, partitioned along the row axis.
        let vis_parts = (comm.rank() == 0).then(|| {
            let own = chunk.as_ref().expect("root holds the input");
            self.row_counts
                .iter()
                .zip(&self.row_offsets)
                .map(|(&count, &offset)| {
                    let mut samples = Vec::with_capacity(count * n_channel * n_pol * 2);
                    for row in offset..offset + count {
                        for chan in 0..n_channel {
                            for pol in 0..n_pol {
                                let v = own.visibility[(row, chan, pol)];
                                samples.push(v.re);
                                samples.push(v.im);
                            }
                        }
                    }
                    encode_f32s(&samples)
                })
                .collect()
        });
        let own_vis = decode_f32s(&comm.scatterv(0, vis_parts)?)?;
        if own_vis.len() != my_rows * n_channel * n_pol * 2 {
            return Err(TaskError::Inconsistent(
                "scattered visibility slab has the wrong size".to_string(),
            ));
        }
        let samples: Vec<c32> = own_vis
            .chunks_exact(2)
            .map(|pair| c32::new(pair[0], pair[1]))
            .collect();
        local.visibility = Array3::from_shape_vec((my_rows, n_channel, n_pol), samples)
            .expect("length checked above");

        // 4) The flag cube with the same partition.
        let flag_parts = (comm.rank() == 0).then(|| {
            let own = chunk.as_ref().expect("root holds the input");
            self.row_counts
                .iter()
                .zip(&self.row_offsets)
                .map(|(&count, &offset)| {
                    let mut flags = Vec::with_capacity(count * n_channel * n_pol);
                    for row in offset..offset + count {
                        for chan in 0..n_channel {
                            for pol in 0..n_pol {
                                flags.push(own.flag[(row, chan, pol)]);
                            }
                        }
                    }
                    encode_bools(&flags)
                })
                .collect()
        });
        let own_flags = decode_bools(&comm.scatterv(0, flag_parts)?);
        if own_flags.len() != my_rows * n_channel * n_pol {
            return Err(TaskError::Inconsistent(
                "scattered flag slab has the wrong size".to_string(),
            ));
        }
        local.flag = Array3::from_shape_vec((my_rows, n_channel, n_pol), own_flags)
            .expect("length checked above");

        // The root's chunk is replaced by its own trimmed share.
        *chunk = Some(local);
        Ok(())
    }
}

fn decode_range(bytes: &[u8]) -> Result<(u32, u32), TaskError> {
    let values = crate::comms::decode_u32s(bytes)?;
    if values.len() != 2 || values[1] < values[0] {
        return Err(TaskError::Inconsistent("row range exchange".to_string()));
    }
    if values[0] == u32::MAX {
        return Err(TaskError::Inconsistent(
            "upstream row partition failed".to_string(),
        ));
    }
    Ok((values[0], values[1]))
}

impl Task for BeamScatterTask {
    fn name(&self) -> &str {
        "BeamScatterTask"
    }

    /// Always active before the first iteration, then only for ranks
    /// carrying an output stream.
    fn is_always_active(&self) -> bool {
        self.comm.is_none() || self.stream_number >= 0
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        if self.comm.is_none() {
            self.stream_number = self.count_active_ranks(chunk.is_some())?;
            self.initialise_split(chunk)?;
        } else if self.stream_number == 0 {
            let own = chunk
                .as_ref()
                .ok_or(TaskError::UnexpectedIdleRank("BeamScatterTask"))?;
            self.check_cached_layout(own)?;
        }

        if self.stream_number >= 0 {
            self.scatter_cycle(chunk)?;
        } else {
            *chunk = None;
        }
        if let Some(c) = chunk {
            debug!("nRow={} after beam scatter", c.n_row());
        }
        Ok(())
    }
}
