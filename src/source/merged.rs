// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The source task: fusing the metadata and visibility streams.
//!
//! Per cycle the task acquires a metadata record, aligns the datagram
//! stream against the shared BAT time base, accumulates datagrams into a
//! chunk, cross-checks UVWs against the array layout and publishes the
//! result. Stream glitches are absorbed rather than escalated: a small
//! BAT mismatch fakes the metadata time and flags the cycle, a stale
//! datagram stream is drained, an empty one idles the rank.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, error, info, warn};
use ndarray::Array2;

use super::channel_manager::ChannelManager;
use super::error::SourceError;
use super::metadata::{TosMetadata, SCANID_IDLE, SCANID_OBS_COMPLETE};
use super::metadata_source::MetadataSource;
use super::scan_manager::ScanManager;
use super::vis_converter::VisConverter;
use super::vis_source::VisSource;
use super::Source;
use crate::chunk::VisChunk;
use crate::config::Configuration;
use crate::constants::{MAX_ANTENNA_UVW_NORM2, UVW_LENGTH_TOLERANCE};
use crate::coord::{
    azel_to_hadec, itrf_to_lat_lon, lst_rad, precess_to_j2000, DirectionFrame, RADec,
};
use crate::monitoring;
use crate::parset::Parset;
use crate::time::bat_to_epoch;

const TEN_SECONDS: Duration = Duration::from_secs(10);
const HUNDRED_MILLISECONDS: Duration = Duration::from_millis(100);

pub struct MergedSource {
    metadata_src: Box<dyn MetadataSource>,
    vis_src: Option<Box<dyn VisSource>>,
    converter: VisConverter,
    channel_manager: ChannelManager,
    scan_manager: ScanManager,
    shutdown: Arc<AtomicBool>,

    idle_stream: bool,
    bad_cycle: bool,
    vis: Option<Box<super::datagram::VisDatagram>>,
    last_timestamp: Option<u64>,

    beam_offsets_from_metadata: bool,
    beam_offsets_from_parset: bool,

    bad_uvw_cycle_counter: u32,
    max_bad_uvw_cycles: i32,

    /// ITRF positions, one row per antenna; used by the UVW length
    /// cross-check.
    array_layout: Vec<[f64; 3]>,
}

impl MergedSource {
    pub fn new(
        params: &Parset,
        config: &Configuration,
        metadata_src: Box<dyn MetadataSource>,
        vis_src: Option<Box<dyn VisSource>>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<MergedSource, SourceError> {
        assert_eq!(
            vis_src.is_some(),
            config.receiving_rank(),
            "receiving ranks get a visibility source, service ranks don't"
        );

        let max_bad_uvw_cycles = params.i32_or("baduvw_maxcycles", -1)?;
        match max_bad_uvw_cycles {
            i32::MIN..=-1 => debug!(
                "Ingest pipeline will try to flag samples with UVWs failing the length cross-check"
            ),
            0 => debug!("Ingest pipeline will abort if UVWs in metadata fail the length cross-check"),
            n => debug!(
                "Ingest pipeline will abort if UVWs in metadata fail the length cross-check for {n} cycles in a row"
            ),
        }

        let beam_offsets_origin = params.string_or("beamoffsets_origin", "metadata");
        let (beam_offsets_from_metadata, beam_offsets_from_parset) =
            match beam_offsets_origin.as_str() {
                "metadata" => {
                    debug!("Beam offsets will be taken from the metadata stream");
                    (true, false)
                }
                "parset" => {
                    debug!("Static beam offsets will be taken from the parset");
                    if !config.feed_info_defined() {
                        return Err(SourceError::Config(
                            crate::config::ConfigError::BadFeedConfig(
                                "required beam offset information is missing in the parset"
                                    .to_string(),
                            ),
                        ));
                    }
                    (false, true)
                }
                "none" => {
                    debug!("Source task will not load beam offsets");
                    (false, false)
                }
                other => {
                    return Err(SourceError::Config(
                        crate::config::ConfigError::BadFeedConfig(format!(
                            "unsupported beamoffsets_origin: {other}"
                        )),
                    ))
                }
            };

        let array_layout = config.antennas().iter().map(|a| a.position).collect();

        Ok(MergedSource {
            metadata_src,
            vis_src,
            converter: VisConverter::new(params, config)?,
            channel_manager: ChannelManager::new(),
            scan_manager: ScanManager::new(),
            shutdown,
            idle_stream: false,
            bad_cycle: false,
            vis: None,
            last_timestamp: None,
            beam_offsets_from_metadata,
            beam_offsets_from_parset,
            bad_uvw_cycle_counter: 0,
            max_bad_uvw_cycles,
            array_layout,
        })
    }

    fn check_interrupt(&self) -> Result<(), SourceError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(SourceError::Interrupted);
        }
        Ok(())
    }

    fn config(&self) -> &Configuration {
        self.converter.config()
    }

    /// Populate `self.vis` with the next datagram, absorbing BAT
    /// glitches. Returns true if the cycle must be skipped because the
    /// stream produced nothing within its retry budget.
    fn ensure_valid_vis(
        &mut self,
        metadata: &mut TosMetadata,
        max_no_data_retries: u32,
    ) -> Result<bool, SourceError> {
        let mode = self
            .config()
            .lookup_correlator_mode(&metadata.corr_mode)?
            .clone();
        let timeout = Duration::from_micros(mode.interval_us);

        let mut count = 0;
        while self.vis.is_none() && count < max_no_data_retries {
            self.vis = self
                .vis_src
                .as_mut()
                .expect("receiving rank has a vis source")
                .next(timeout);
            self.check_interrupt()?;
            match &self.vis {
                Some(vis) => {
                    // A hack to account for malformed BAT which can
                    // glitch a different way for different correlator
                    // cards.
                    if metadata.timestamp != vis.timestamp {
                        let mismatch = metadata.timestamp.abs_diff(vis.timestamp);
                        if mismatch < mode.interval_us / 2 {
                            error!(
                                "Detected BAT glitch between metadata and visibility stream on \
                                 card {}, mismatch = {} ms",
                                self.config().receiver_id() + 1,
                                mismatch as f64 / 1e3
                            );
                            debug!(
                                "    visibility stream: 0x{:x} mdata: 0x{:x} diff: 0x{mismatch:x}",
                                vis.timestamp, metadata.timestamp
                            );
                            debug!(
                                "    faking metadata timestamp to read {}",
                                bat_to_epoch(vis.timestamp)
                            );
                            metadata.timestamp = vis.timestamp;
                            self.bad_cycle = true;
                        }
                    }
                }
                None => {
                    debug!("Received no datagram after {} attempt(s)", count + 1);
                }
            }
            count += 1;
        }
        if self.vis.is_none() {
            if max_no_data_retries != 1 {
                return Err(SourceError::NoDataForStream {
                    receiver_id: self.config().receiver_id(),
                    retries: max_no_data_retries,
                });
            }
            // Special case: ignore this stream until data reappears.
            error!(
                "Stream {} has no data, most likely the correlator is not sending to this \
                 rank. Ignoring this data stream.",
                self.config().receiver_id()
            );
            self.idle_stream = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Acquire a metadata record for a real scan. IDLE cycles reset the
    /// retry budget and are tolerated indefinitely.
    fn next_metadata(&mut self) -> Result<TosMetadata, SourceError> {
        const MAX_NO_METADATA_RETRIES: i32 = 3;
        let mut metadata: Option<TosMetadata> = None;
        let mut count: i32 = 0;
        while metadata
            .as_ref()
            .map_or(true, |m| m.scan_id == SCANID_IDLE)
            && count < MAX_NO_METADATA_RETRIES
        {
            metadata = self.metadata_src.next(TEN_SECONDS);
            self.check_interrupt()?;
            if let Some(m) = &metadata {
                if m.scan_id < 0
                    && m.scan_id != SCANID_OBS_COMPLETE
                    && m.scan_id != SCANID_IDLE
                {
                    return Err(SourceError::InvalidScan(m.scan_id));
                }
                if m.scan_id == SCANID_IDLE {
                    debug!("Skipping this cycle, metadata indicates SCANID_IDLE");
                    count = -1;
                }
            }
            count += 1;
        }
        metadata.ok_or(SourceError::MetadataStreamCeased(
            MAX_NO_METADATA_RETRIES as u32,
        ))
    }

    /// Convert a direction to J2000 for a given antenna and epoch.
    fn convert_to_j2000(
        &self,
        time_mjd_s: f64,
        antenna: usize,
        dir: RADec,
        frame: DirectionFrame,
    ) -> RADec {
        match frame {
            DirectionFrame::J2000 => dir,
            DirectionFrame::AzEl => {
                // In the AzEl frame the record carries (az, el) in the
                // direction's (ra, dec) slots.
                let (lat, lon) = itrf_to_lat_lon(self.array_layout[antenna]);
                let hadec = azel_to_hadec(crate::coord::AzEl::new(dir.ra, dir.dec), lat);
                let apparent = RADec::from_hadec(&hadec, lst_rad(time_mjd_s, lon));
                RADec::from_cartesian(precess_to_j2000(time_mjd_s, apparent.to_cartesian()))
            }
        }
    }

    /// Build this cycle's chunk inside the converter from the metadata
    /// record: sizes and axes, per-antenna pointing, per-antenna flags,
    /// per-row UVWs with the 1 mm length cross-check.
    fn create_vis_chunk(&mut self, metadata: &TosMetadata) -> Result<(), SourceError> {
        let config = self.config().clone();
        let mode = config.lookup_correlator_mode(&metadata.corr_mode)?.clone();
        self.converter.init_vis_chunk(metadata.timestamp, &mode)?;

        let n_antenna = config.antennas().len();
        let receiver_id = config.receiver_id();
        let frequency = self.channel_manager.local_frequencies(
            receiver_id,
            metadata.centre_freq_hz - mode.chan_width_hz / 2.0 + mode.freq_offset_hz,
            mode.chan_width_hz,
            mode.n_chan,
        );

        let time_mjd_s = self.converter.chunk_mut().time;

        // Per-antenna fields and flags are derived before the chunk is
        // borrowed for writing.
        let mut target_pointing = Vec::with_capacity(n_antenna);
        let mut actual_pointing = Vec::with_capacity(n_antenna);
        let mut pol_angle = Vec::with_capacity(n_antenna);
        let mut azimuth = Vec::with_capacity(n_antenna);
        let mut elevation = Vec::with_capacity(n_antenna);
        let mut on_source = Vec::with_capacity(n_antenna);
        let mut flagged_antennas = Vec::new();
        // nAntenna x (3 x nBeam) scratch for per-antenna UVWs.
        let mut uvw_buffer: Option<Array2<f64>> = None;

        for (i, ant_cfg) in config.antennas().iter().enumerate() {
            let md_ant = metadata
                .antenna(&ant_cfg.name)
                .ok_or_else(|| SourceError::MetadataMissingAntenna(ant_cfg.name.clone()))?;
            target_pointing.push(self.convert_to_j2000(
                time_mjd_s,
                i,
                metadata.target_direction,
                metadata.direction_frame,
            ));
            actual_pointing.push(self.convert_to_j2000(
                time_mjd_s,
                i,
                md_ant.actual_radec,
                metadata.direction_frame,
            ));
            pol_angle.push(md_ant.actual_pol_angle);
            azimuth.push(md_ant.actual_az_deg);
            elevation.push(md_ant.actual_el_deg);
            on_source.push(md_ant.on_source);

            let flagged = metadata.flagged || md_ant.flagged || !md_ant.on_source;
            if flagged {
                flagged_antennas.push(i as u32);
                continue;
            }
            match &uvw_buffer {
                Some(buffer) => {
                    if buffer.ncols() != md_ant.uvw.len() {
                        return Err(SourceError::UvwShapeChanged(ant_cfg.name.clone()));
                    }
                }
                None => {
                    if md_ant.uvw.len() % 3 != 0 {
                        return Err(SourceError::UvwShapeNotTriples(md_ant.uvw.len()));
                    }
                    uvw_buffer = Some(Array2::zeros((n_antenna, md_ant.uvw.len())));
                }
            }
            let buffer = uvw_buffer.as_mut().expect("ensured above");
            for (col, &value) in md_ant.uvw.iter().enumerate() {
                if value.is_nan() {
                    return Err(SourceError::NanAntennaUvw(ant_cfg.name.clone()));
                }
                buffer[(i, col)] = value;
            }
            for beam in 0..md_ant.uvw.len() / 3 {
                let norm2: f64 = md_ant.uvw[beam * 3..(beam + 1) * 3]
                    .iter()
                    .map(|v| v * v)
                    .sum();
                if norm2 <= 1e-12 {
                    return Err(SourceError::JunkAntennaUvw {
                        antenna: ant_cfg.name.clone(),
                        beam: beam + 1,
                        reason: "zero vector, i.e. the Earth centre",
                    });
                }
                if norm2 >= MAX_ANTENNA_UVW_NORM2 {
                    return Err(SourceError::JunkAntennaUvw {
                        antenna: ant_cfg.name.clone(),
                        beam: beam + 1,
                        reason: "the antenna would lie way beyond the Earth's surface",
                    });
                }
            }
        }

        let scan_index = self.scan_manager.scan_index();
        {
            let chunk = self.converter.chunk_mut();
            chunk.scan = scan_index;
            chunk.target_name = metadata.target_name.clone();
            chunk.direction_frame = metadata.direction_frame;
            chunk.channel_width = mode.chan_width_hz;
            chunk.frequency = frequency;
            for row in 0..chunk.n_row() {
                chunk.phase_centre[row] = metadata.phase_direction;
            }
            chunk.target_pointing_centre = target_pointing;
            chunk.actual_pointing_centre = actual_pointing;
            chunk.actual_pol_angle = pol_angle;
            chunk.actual_azimuth = azimuth;
            chunk.actual_elevation = elevation;
            chunk.on_source_flag = on_source;
        }

        for ant in flagged_antennas {
            self.converter.flag_antenna(ant);
        }

        // Populate per-row UVWs by differencing the per-antenna vectors,
        // cross-checking each length against the array layout.
        let antenna_good: Vec<bool> = (0..n_antenna)
            .map(|a| self.converter.is_antenna_good(a as u32))
            .collect();
        let mut rows_with_bad_uvws: BTreeSet<usize> = BTreeSet::new();
        if let Some(buffer) = &uvw_buffer {
            let chunk = self.converter.chunk_mut();
            for row in 0..chunk.n_row() {
                let beam = chunk.beam1[row];
                if chunk.beam2[row] != beam {
                    return Err(SourceError::CrossBeamCorrelation(row));
                }
                let ant1 = chunk.antenna1[row] as usize;
                let ant2 = chunk.antenna2[row] as usize;
                if !(antenna_good[ant1] && antenna_good[ant2]) {
                    continue;
                }
                if (beam as usize + 1) * 3 > buffer.ncols() {
                    // Metadata carries fewer beams than the chunk holds;
                    // those rows keep zero UVWs and stay flagged.
                    continue;
                }
                let mut uvw_length2 = 0.0;
                let mut layout_length2 = 0.0;
                for coord in 0..3 {
                    let offset = beam as usize * 3 + coord;
                    let value = buffer[(ant1, offset)] - buffer[(ant2, offset)];
                    if value.is_nan() {
                        return Err(SourceError::NanBaselineUvw {
                            row,
                            ant1: ant1 as u32,
                            ant2: ant2 as u32,
                            coord,
                            beam,
                        });
                    }
                    chunk.uvw[row][coord] = value;
                    uvw_length2 += value * value;
                    let layout_diff =
                        self.array_layout[ant1][coord] - self.array_layout[ant2][coord];
                    layout_length2 += layout_diff * layout_diff;
                }
                if (uvw_length2.sqrt() - layout_length2.sqrt()).abs() >= UVW_LENGTH_TOLERANCE {
                    if self.max_bad_uvw_cycles >= 0
                        && self.bad_uvw_cycle_counter >= self.max_bad_uvw_cycles as u32
                    {
                        return Err(SourceError::BadUvw {
                            row,
                            ant1: ant1 as u32,
                            ant2: ant2 as u32,
                            beam,
                            uvw_length: uvw_length2.sqrt(),
                            layout_length: layout_length2.sqrt(),
                            cycles: self.bad_uvw_cycle_counter + 1,
                        });
                    }
                    rows_with_bad_uvws.insert(row);
                }
            }
        }
        if !rows_with_bad_uvws.is_empty() {
            self.bad_uvw_cycle_counter += 1;
            self.flag_due_to_bad_uvws(&rows_with_bad_uvws, metadata.timestamp);
        } else {
            self.bad_uvw_cycle_counter = 0;
        }

        if self.beam_offsets_from_parset {
            let offsets = config
                .feed()
                .expect("checked at construction")
                .fill_matrix();
            self.converter.chunk_mut().beam_offsets = offsets;
        }
        if self.beam_offsets_from_metadata {
            self.converter.chunk_mut().beam_offsets = metadata.beam_offsets.clone();
        }
        Ok(())
    }

    /// Flag and report rows that failed the UVW length cross-check.
    /// Antennas appearing only on bad rows are flagged wholesale; any
    /// surviving isolated bad rows are flagged individually.
    fn flag_due_to_bad_uvws(&mut self, rows_with_bad_uvws: &BTreeSet<usize>, timestamp: u64) {
        debug_assert!(!rows_with_bad_uvws.is_empty());
        let n_row = self.converter.chunk_mut().n_row();

        // Derive the set of antennas vouched for by a clean
        // cross-correlation row.
        let mut antennas: BTreeSet<u32> = BTreeSet::new();
        let mut good_antennas: BTreeSet<u32> = BTreeSet::new();
        {
            let chunk = self.converter.chunk_mut();
            for row in 0..n_row {
                let ant1 = chunk.antenna1[row];
                let ant2 = chunk.antenna2[row];
                antennas.insert(ant1);
                antennas.insert(ant2);
                if ant1 != ant2 && !rows_with_bad_uvws.contains(&row) {
                    good_antennas.insert(ant1);
                    good_antennas.insert(ant2);
                }
            }
        }
        // Restrict to antennas that were still good before this check.
        let previously_good: Vec<u32> = antennas
            .iter()
            .copied()
            .filter(|&a| self.converter.is_antenna_good(a))
            .collect();
        good_antennas.retain(|&a| self.converter.is_antenna_good(a));

        let newly_bad: Vec<u32> = previously_good
            .iter()
            .copied()
            .filter(|ant| !good_antennas.contains(ant))
            .collect();
        for &ant in &newly_bad {
            self.converter.flag_antenna(ant);
        }
        let list_of_bad_antennas = if newly_bad.is_empty() {
            "none".to_string()
        } else {
            newly_bad
                .iter()
                .map(|&ant| self.config().antennas()[ant as usize].name.as_str())
                .join(", ")
        };

        // Any bad rows whose antennas are both still good get flagged
        // individually.
        let mut explicitly_flagged_rows = 0;
        let antenna_good: Vec<bool> = {
            let n_antenna = self.config().antennas().len();
            (0..n_antenna)
                .map(|a| self.converter.is_antenna_good(a as u32))
                .collect()
        };
        {
            let chunk = self.converter.chunk_mut();
            for &row in rows_with_bad_uvws {
                let ant1 = chunk.antenna1[row] as usize;
                let ant2 = chunk.antenna2[row] as usize;
                if antenna_good[ant1] && antenna_good[ant2] {
                    explicitly_flagged_rows += 1;
                    chunk.flag_row(row);
                }
            }
        }

        let mut msg = format!(
            "Flagged the following antennas due to failed uvw vector length check: \
             {list_of_bad_antennas} (currently {} cycle(s) in a row).",
            self.bad_uvw_cycle_counter
        );
        if explicitly_flagged_rows != 0 {
            msg += &format!(
                " In addition, {explicitly_flagged_rows} row(s) were flagged which do not \
                 correspond to all baselines of some set of antennas."
            );
        }
        if self.config().receiver_id() == 0 {
            error!("{msg} Timestamp: {} or 0x{timestamp:x}", bat_to_epoch(timestamp));
        } else {
            info!("{msg} Timestamp: {} or 0x{timestamp:x}", bat_to_epoch(timestamp));
        }
    }
}

impl Source for MergedSource {
    fn next(&mut self) -> Result<Option<VisChunk>, SourceError> {
        let mut metadata = self.next_metadata()?;

        self.scan_manager.update(metadata.scan_id);
        if self.scan_manager.observation_complete() {
            info!("End-of-observation condition met");
            return Ok(None);
        }

        // Protect against producing chunks with the same timestamp.
        if self.last_timestamp == Some(metadata.timestamp) {
            return Err(SourceError::DuplicateTimestamp(metadata.timestamp));
        }
        self.last_timestamp = Some(metadata.timestamp);

        if !self.config().receiving_rank() {
            // Service rank: an empty chunk keeps the task chain turning.
            return Ok(Some(VisChunk::new(0, 0, 0, 0)));
        }

        self.bad_cycle = false;
        self.create_vis_chunk(&metadata)?;

        if self.idle_stream {
            let buffered = self
                .vis_src
                .as_ref()
                .expect("receiving rank has a vis source")
                .buffer_usage()
                .0;
            if buffered > 0 {
                warn!(
                    "Stream {} has some data, attempting to reactivate receiving",
                    self.config().receiver_id()
                );
                self.idle_stream = false;
            } else {
                return Ok(Some(self.converter.take_chunk()));
            }
        }

        // Get the next datagram if there isn't already one buffered.
        const MAX_NO_DATA_RETRIES: u32 = 1;
        if self.ensure_valid_vis(&mut metadata, MAX_NO_DATA_RETRIES)? {
            return Ok(Some(self.converter.take_chunk()));
        }

        // Align the two streams.
        let mut log_catchup = true;
        let mut last_catchup_vis_bat = 0u64;
        loop {
            let vis_timestamp = self.vis.as_ref().expect("datagram ensured above").timestamp;
            if metadata.timestamp == vis_timestamp {
                break;
            }
            if metadata.timestamp > vis_timestamp {
                // Datagrams are in the past; drain until they catch up.
                if !log_catchup && last_catchup_vis_bat != vis_timestamp {
                    log_catchup = true;
                }
                if log_catchup {
                    debug!(
                        "Reading extra datagrams to catch up for stream id={}, metadata time: \
                         {} visibility time: {}",
                        self.config().receiver_id(),
                        bat_to_epoch(metadata.timestamp),
                        bat_to_epoch(vis_timestamp)
                    );
                    log_catchup = false;
                    last_catchup_vis_bat = vis_timestamp;
                }
                self.vis = None;
                if self.ensure_valid_vis(&mut metadata, MAX_NO_DATA_RETRIES)? {
                    return Ok(Some(self.converter.take_chunk()));
                }
            }
            self.check_interrupt()?;
            let vis_timestamp = self.vis.as_ref().expect("datagram ensured above").timestamp;
            if metadata.timestamp < vis_timestamp {
                warn!(
                    "Visibility data stream {} is ahead ({}) of the metadata stream ({}), \
                     skipping the cycle for this card",
                    self.config().receiver_id(),
                    bat_to_epoch(vis_timestamp),
                    bat_to_epoch(metadata.timestamp)
                );
                return Ok(Some(self.converter.take_chunk()));
            }
        }

        // Streams are synced; accumulate datagrams into the chunk until
        // complete or until the stream goes quiet for this integration.
        let mut decoding_time = 0.0f64;
        while let Some(vis) = self.vis.take() {
            self.check_interrupt()?;
            if metadata.timestamp > vis.timestamp {
                warn!(
                    "Received a datagram from a past integration. This shouldn't happen. \
                     Stream id = {}",
                    self.config().receiver_id()
                );
                self.vis = self
                    .vis_src
                    .as_mut()
                    .expect("receiving rank has a vis source")
                    .next(HUNDRED_MILLISECONDS);
                continue;
            }
            if metadata.timestamp < vis.timestamp {
                // Keep for the next cycle.
                self.vis = Some(vis);
                break;
            }

            let started = Instant::now();
            self.converter.add(&vis);
            decoding_time += started.elapsed().as_secs_f64();

            if self.converter.got_all_expected_datagrams() {
                break;
            }
            self.vis = self
                .vis_src
                .as_mut()
                .expect("receiving rank has a vis source")
                .next(HUNDRED_MILLISECONDS);
        }

        debug!(
            "VisChunk built with {} of expected {} visibility datagrams ({} intentionally ignored)",
            self.converter.datagrams_count(),
            self.converter.datagrams_expected(),
            self.converter.datagrams_ignored()
        );

        let (buffered, capacity) = self
            .vis_src
            .as_ref()
            .expect("receiving rank has a vis source")
            .buffer_usage();
        let buffer_usage_percent = if capacity != 0 {
            buffered as f32 / capacity as f32 * 100.0
        } else {
            100.0
        };
        debug!("VisSource buffer has {buffered} datagrams ({buffer_usage_percent}% full)");
        debug!("Time it takes to unpack visibilities: {decoding_time} s");

        monitoring::update("PacketsBuffered", buffered as u32);
        monitoring::update("BufferUsagePercent", buffer_usage_percent);
        monitoring::update("VisCornerTurnDuration", decoding_time);

        let datagrams_lost = self.converter.datagrams_expected()
            - self.converter.datagrams_count()
            - self.converter.datagrams_ignored();
        monitoring::update("PacketsLostCount", datagrams_lost as i32);
        if self.converter.datagrams_expected() != 0 {
            monitoring::update(
                "PacketsLostPercent",
                datagrams_lost as f32 / self.converter.datagrams_expected() as f32 * 100.0,
            );
        }

        let mut chunk = self.converter.take_chunk();
        if self.bad_cycle {
            chunk.flag_all();
        }
        monitoring::update("ChunkFlaggedFraction", chunk.flagged_fraction());
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::Sender;
    use ndarray::Array2;

    use super::super::datagram::VisDatagram;
    use super::super::metadata::AntennaMetadata;
    use super::super::metadata_source::QueueMetadataSource;
    use super::super::vis_source::QueueVisSource;
    use super::*;
    use crate::chunk::c32;
    use crate::constants::CHANNELS_PER_SLICE;

    const BAT0: u64 = 5_000_000_000_000_000;
    const INTERVAL_US: u64 = 5_000_000;

    fn config() -> Configuration {
        let text = "antennas = [a, b]\n\
             antenna.ant.diameter = 12\n\
             antenna.ant.mount = equatorial\n\
             antenna.a.location.itrf = [-2556109.976, 5097388.7, -2848440.12]\n\
             antenna.b.location.itrf = [-2556087.396082, 5097423.589662, -2848396.867933]\n\
             baselinemap.baselineids = [1, 2, 3]\n\
             baselinemap.1 = [0, 0, XX]\n\
             baselinemap.2 = [1, 0, XX]\n\
             baselinemap.3 = [1, 1, XX]\n\
             correlator.modes = [standard]\n\
             correlator.mode.standard.chan_width = 18.518518kHz\n\
             correlator.mode.standard.n_chan = 54\n\
             correlator.mode.standard.stokes = [XX]\n\
             correlator.mode.standard.interval = 5000000\n";
        Configuration::new(Parset::from_str(text).unwrap(), 0, 1).unwrap()
    }

    fn baseline_length() -> f64 {
        let c = config();
        let a = c.antennas()[0].position;
        let b = c.antennas()[1].position;
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
    }

    fn metadata(scan_id: i32, timestamp: u64, uvw_scale: f64) -> TosMetadata {
        let length = baseline_length();
        TosMetadata {
            sbid: 1,
            scan_id,
            timestamp,
            corr_mode: "standard".into(),
            target_name: "test_field".into(),
            phase_direction: RADec::new_degrees(187.5, -45.0),
            target_direction: RADec::new_degrees(187.5, -45.0),
            direction_frame: DirectionFrame::J2000,
            centre_freq_hz: 1.0e9,
            flagged: false,
            antennas: vec![
                AntennaMetadata {
                    name: "a".into(),
                    actual_radec: RADec::new_degrees(187.5, -45.0),
                    actual_az_deg: 120.0,
                    actual_el_deg: 60.0,
                    actual_pol_angle: 0.0,
                    flagged: false,
                    on_source: true,
                    uvw: vec![length * uvw_scale, 10.0, 10.0],
                },
                AntennaMetadata {
                    name: "b".into(),
                    actual_radec: RADec::new_degrees(187.5, -45.0),
                    actual_az_deg: 120.0,
                    actual_el_deg: 60.0,
                    actual_pol_angle: 0.0,
                    flagged: false,
                    on_source: true,
                    uvw: vec![0.0, 10.0, 10.0],
                },
            ],
            beam_offsets: Array2::zeros((2, 0)),
        }
    }

    fn datagram(timestamp: u64, product: u32) -> Box<VisDatagram> {
        let mut dg = VisDatagram {
            timestamp,
            product,
            ..VisDatagram::default()
        };
        dg.vis = [c32::new(1.0, 0.0); CHANNELS_PER_SLICE];
        Box::new(dg)
    }

    struct Fixture {
        source: MergedSource,
        md_tx: Sender<TosMetadata>,
        vis_tx: Sender<Box<VisDatagram>>,
    }

    fn fixture(params: &str) -> Fixture {
        let (md_tx, md_src) = QueueMetadataSource::new(64);
        let (vis_tx, vis_src) = QueueVisSource::new(1024);
        let source = MergedSource::new(
            &Parset::from_str(params).unwrap(),
            &config(),
            Box::new(md_src),
            Some(Box::new(vis_src)),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        Fixture {
            source,
            md_tx,
            vis_tx,
        }
    }

    fn send_full_cycle(fx: &Fixture, timestamp: u64) {
        for product in 1..=3 {
            fx.vis_tx.send(datagram(timestamp, product)).unwrap();
        }
    }

    #[test]
    fn produces_aligned_chunk() {
        let fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx.send(metadata(0, BAT0, 1.0)).unwrap();
        send_full_cycle(&fx, BAT0);
        let mut fx = fx;
        let chunk = fx.source.next().unwrap().expect("a chunk");
        assert_eq!(chunk.n_row(), 3);
        assert_eq!(chunk.n_channel(), 54);
        assert_eq!(chunk.target_name, "test_field");
        // All three products arrived; nothing should be flagged on the
        // cross-correlation row and the data should be there.
        assert_eq!(chunk.visibility[(1, 0, 0)], c32::new(1.0, 0.0));
        assert!(!chunk.flag[(1, 0, 0)]);
        // UVW on the cross baseline matches the layout length to 1 mm.
        let uvw = chunk.uvw[1];
        let length = (uvw[0] * uvw[0] + uvw[1] * uvw[1] + uvw[2] * uvw[2]).sqrt();
        assert!((length - baseline_length()).abs() < 1e-3);
    }

    #[test]
    fn obs_complete_returns_none() {
        let mut fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx
            .send(metadata(SCANID_OBS_COMPLETE, BAT0, 1.0))
            .unwrap();
        assert!(fx.source.next().unwrap().is_none());
    }

    #[test]
    fn invalid_scan_is_fatal() {
        let mut fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx.send(metadata(-7, BAT0, 1.0)).unwrap();
        assert!(matches!(
            fx.source.next(),
            Err(SourceError::InvalidScan(-7))
        ));
    }

    #[test]
    fn idle_scan_is_skipped_then_real_scan_processed() {
        let fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx.send(metadata(SCANID_IDLE, BAT0, 1.0)).unwrap();
        fx.md_tx
            .send(metadata(2, BAT0 + INTERVAL_US, 1.0))
            .unwrap();
        send_full_cycle(&fx, BAT0 + INTERVAL_US);
        let mut fx = fx;
        let chunk = fx.source.next().unwrap().expect("a chunk");
        // The idle record is consumed without emitting anything; the
        // first real scan gets index 0.
        assert_eq!(chunk.scan, 0);
    }

    #[test]
    fn duplicate_timestamp_is_fatal() {
        let fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx.send(metadata(0, BAT0, 1.0)).unwrap();
        send_full_cycle(&fx, BAT0);
        fx.md_tx.send(metadata(0, BAT0, 1.0)).unwrap();
        let mut fx = fx;
        fx.source.next().unwrap().unwrap();
        assert!(matches!(
            fx.source.next(),
            Err(SourceError::DuplicateTimestamp(_))
        ));
    }

    #[test]
    fn bat_glitch_cheat_flags_whole_chunk() {
        let fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx.send(metadata(0, BAT0, 1.0)).unwrap();
        // Datagrams arrive with a BAT 1 ms off: less than half an
        // interval, so the cheat path engages.
        let glitched = BAT0 + 1_000;
        send_full_cycle(&fx, glitched);
        let mut fx = fx;
        let chunk = fx.source.next().unwrap().expect("a chunk");
        assert!(chunk.flag.iter().all(|&f| f), "whole chunk flagged");
        // Data still got deposited under the faked time base.
        assert_eq!(chunk.visibility[(0, 0, 0)], c32::new(1.0, 0.0));
    }

    #[test]
    fn stale_datagrams_are_drained() {
        let fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx
            .send(metadata(0, BAT0 + INTERVAL_US, 1.0))
            .unwrap();
        // A leftover cycle from the distant past, then the right one.
        send_full_cycle(&fx, BAT0 - 10 * INTERVAL_US);
        send_full_cycle(&fx, BAT0 + INTERVAL_US);
        let mut fx = fx;
        let chunk = fx.source.next().unwrap().expect("a chunk");
        assert_eq!(chunk.visibility[(0, 0, 0)], c32::new(1.0, 0.0));
        assert!(!chunk.flag[(2, 0, 0)]);
    }

    #[test]
    fn empty_stream_idles_without_crash() {
        let mut fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx.send(metadata(0, BAT0, 1.0)).unwrap();
        // No datagrams at all: the rank goes idle and emits an
        // all-flagged chunk.
        let chunk = fx.source.next().unwrap().expect("a chunk");
        assert!(chunk.flag.iter().all(|&f| f));
    }

    #[test]
    fn bad_uvw_zero_tolerance_is_fatal() {
        let mut fx = fixture("beamoffsets_origin = none\nbaduvw_maxcycles = 0\n");
        // Antenna UVWs inconsistent with the layout by a factor of two.
        fx.md_tx.send(metadata(0, BAT0, 2.0)).unwrap();
        send_full_cycle(&fx, BAT0);
        assert!(matches!(fx.source.next(), Err(SourceError::BadUvw { .. })));
    }

    #[test]
    fn bad_uvw_default_policy_flags_and_continues() {
        let fx = fixture("beamoffsets_origin = none\n");
        fx.md_tx.send(metadata(0, BAT0, 2.0)).unwrap();
        send_full_cycle(&fx, BAT0);
        let mut fx = fx;
        let chunk = fx.source.next().unwrap().expect("a chunk");
        // The only cross-correlation row failed the check, so both
        // antennas end up flagged and with them the whole chunk.
        assert!(chunk.flag.iter().all(|&f| f));
    }

    #[test]
    fn interrupt_during_metadata_wait() {
        let (_md_tx, md_src) = QueueMetadataSource::new(4);
        let (_vis_tx, vis_src) = QueueVisSource::new(4);
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut source = MergedSource::new(
            &Parset::from_str("beamoffsets_origin = none\n").unwrap(),
            &config(),
            Box::new(md_src),
            Some(Box::new(vis_src)),
            shutdown,
        )
        .unwrap();
        assert!(matches!(source.next(), Err(SourceError::Interrupted)));
    }
}
