// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Source task variant that fabricates metadata from the parset.
//!
//! Used for test and mock modes where no telescope metadata stream
//! exists: the datagram stream alone drives the cycle clock, and the
//! pointing/target information is static.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::channel_manager::ChannelManager;
use super::datagram::VisDatagram;
use super::error::SourceError;
use super::vis_converter::VisConverter;
use super::vis_source::VisSource;
use super::Source;
use crate::chunk::VisChunk;
use crate::comms::Communicator;
use crate::config::{Configuration, CorrelatorMode};
use crate::coord::{DirectionFrame, RADec};
use crate::monitoring;
use crate::parset::Parset;
use crate::time::bat_to_epoch;

const ONE_SECOND: Duration = Duration::from_secs(1);

pub struct NoMetadataSource {
    vis_src: Box<dyn VisSource>,
    converter: VisConverter,
    channel_manager: ChannelManager,
    shutdown: Arc<AtomicBool>,
    /// World communicator for cross-rank timestamp sync; `None` in the
    /// serial case.
    comm: Option<Arc<dyn Communicator>>,

    mode: CorrelatorMode,
    centre_freq_hz: f64,
    target_name: String,
    target_direction: RADec,

    vis: Option<Box<VisDatagram>>,
    last_timestamp: u64,
}

impl NoMetadataSource {
    pub fn new(
        params: &Parset,
        config: &Configuration,
        vis_src: Box<dyn VisSource>,
        comm: Option<Arc<dyn Communicator>>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<NoMetadataSource, SourceError> {
        let mode = config
            .lookup_correlator_mode(&params.string_or("correlator_mode", "standard"))?
            .clone();
        let centre_freq_hz =
            crate::config::parse_frequency_hz(&params.string("centre_freq")?)?;
        let target_name = params.string("target_name")?;
        let direction = params.f64_vector("target_direction")?;
        if direction.len() != 2 {
            return Err(SourceError::Config(
                crate::config::ConfigError::BadFeedConfig(
                    "target_direction must be [ra_deg, dec_deg]".to_string(),
                ),
            ));
        }
        Ok(NoMetadataSource {
            vis_src,
            converter: VisConverter::new(params, config)?,
            channel_manager: ChannelManager::new(),
            shutdown,
            comm,
            mode,
            centre_freq_hz,
            target_name,
            target_direction: RADec::new_degrees(direction[0], direction[1]),
            vis: None,
            last_timestamp: 0,
        })
    }

    fn check_interrupt(&self) -> Result<(), SourceError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(SourceError::Interrupted);
        }
        Ok(())
    }

    fn blocking_next_datagram(&mut self) -> Result<(), SourceError> {
        while self.vis.is_none() {
            self.vis = self.vis_src.next(ONE_SECOND);
            self.check_interrupt()?;
        }
        Ok(())
    }

    /// All ranks adopt the latest timestamp any of them has seen, so a
    /// card that missed an integration catches up instead of drifting a
    /// cycle behind its peers.
    fn synchronise_last_timestamp(&mut self) -> Result<(), SourceError> {
        let comm = match &self.comm {
            Some(comm) if comm.size() > 1 => Arc::clone(comm),
            _ => return Ok(()),
        };
        debug!("Synchronising last seen timestamp across all ranks");
        let gathered = comm.allgather(&self.last_timestamp.to_le_bytes())?;
        let newest = gathered
            .iter()
            .map(|bytes| {
                bytes
                    .as_slice()
                    .try_into()
                    .map(u64::from_le_bytes)
                    .map_err(|_| {
                        crate::comms::TransportError::Malformed(
                            "timestamp exchange".to_string(),
                        )
                    })
            })
            .collect::<Result<Vec<u64>, _>>()?
            .into_iter()
            .max()
            .unwrap_or(self.last_timestamp);
        if newest > self.last_timestamp {
            debug!(
                "Adjusting last seen timestamp forward by {} seconds to match other ranks",
                (newest - self.last_timestamp) as f64 / 1e6
            );
            self.last_timestamp = newest;
        }
        Ok(())
    }

    fn create_vis_chunk(&mut self, timestamp: u64) -> Result<(), SourceError> {
        let mode = self.mode.clone();
        self.converter.init_vis_chunk(timestamp, &mode)?;
        let receiver_id = self.converter.config().receiver_id();
        let frequency = self.channel_manager.local_frequencies(
            receiver_id,
            self.centre_freq_hz - mode.chan_width_hz / 2.0,
            mode.chan_width_hz,
            mode.n_chan,
        );
        let target_name = self.target_name.clone();
        let target = self.target_direction;

        let chunk = self.converter.chunk_mut();
        chunk.scan = 0;
        chunk.target_name = target_name;
        chunk.channel_width = mode.chan_width_hz;
        chunk.frequency = frequency;
        chunk.direction_frame = DirectionFrame::J2000;
        for row in 0..chunk.n_row() {
            chunk.phase_centre[row] = target;
        }
        // Static pointing: the field centre stands in for every beam and
        // every antenna.
        for ant in 0..chunk.n_antenna() {
            chunk.target_pointing_centre[ant] = target;
            chunk.actual_pointing_centre[ant] = target;
            chunk.actual_pol_angle[ant] = 0.0;
            chunk.on_source_flag[ant] = true;
        }
        Ok(())
    }
}

impl Source for NoMetadataSource {
    fn next(&mut self) -> Result<Option<VisChunk>, SourceError> {
        self.blocking_next_datagram()?;
        self.synchronise_last_timestamp()?;

        // Catch up: ignore datagrams at or before the last integration.
        let mut ignored_old = 0u32;
        while self.vis.as_ref().expect("ensured above").timestamp <= self.last_timestamp {
            ignored_old += 1;
            self.vis = None;
            self.blocking_next_datagram()?;
        }
        let current = self.vis.as_ref().expect("ensured above").timestamp;
        if ignored_old > 0 {
            debug!(
                "Catching up to time {}; ignored {ignored_old} successfully received datagrams",
                bat_to_epoch(current)
            );
        }
        if current == self.last_timestamp {
            return Err(SourceError::DuplicateTimestamp(current));
        }
        self.last_timestamp = current;

        self.create_vis_chunk(current)?;

        let timeout = Duration::from_micros(self.mode.interval_us * 2);
        while let Some(vis) = self.vis.take() {
            self.check_interrupt()?;
            if current > vis.timestamp {
                debug!("Received a datagram from a past integration; discarding");
                self.vis = self.vis_src.next(timeout);
                continue;
            }
            if current < vis.timestamp {
                self.vis = Some(vis);
                break;
            }
            self.converter.add(&vis);
            if self.converter.got_all_expected_datagrams() {
                break;
            }
            self.vis = self.vis_src.next(timeout);
            if self.vis.is_none() {
                debug!(
                    "Finishing ingesting chunk at {} due to timeout",
                    bat_to_epoch(current)
                );
            }
        }

        debug!(
            "VisChunk built with {} of expected {} visibility datagrams ({} ignored)",
            self.converter.datagrams_count(),
            self.converter.datagrams_expected(),
            self.converter.datagrams_ignored()
        );
        let (buffered, capacity) = self.vis_src.buffer_usage();
        monitoring::update("PacketsBuffered", buffered as u32);
        if capacity != 0 {
            monitoring::update(
                "BufferUsagePercent",
                buffered as f32 / capacity as f32 * 100.0,
            );
        }
        let lost = self.converter.datagrams_expected()
            - self.converter.datagrams_count()
            - self.converter.datagrams_ignored();
        monitoring::update("PacketsLostCount", lost as i32);

        Ok(Some(self.converter.take_chunk()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::vis_source::QueueVisSource;
    use super::*;
    use crate::chunk::c32;
    use crate::constants::CHANNELS_PER_SLICE;

    const BAT0: u64 = 4_000_000_000_000_000;
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

    fn params() -> Parset {
        Parset::from_str(
            "correlator_mode = standard\n\
             centre_freq = 939.5MHz\n\
             target_name = test_field\n\
             target_direction = [187.5, -45.0]\n",
        )
        .unwrap()
    }

    fn datagram(timestamp: u64, product: u32) -> Box<VisDatagram> {
        let mut dg = VisDatagram {
            timestamp,
            product,
            ..VisDatagram::default()
        };
        dg.vis = [c32::new(0.5, -0.5); CHANNELS_PER_SLICE];
        Box::new(dg)
    }

    #[test]
    fn fabricates_chunk_from_parset() {
        let (tx, vis_src) = QueueVisSource::new(64);
        let mut source = NoMetadataSource::new(
            &params(),
            &config(),
            Box::new(vis_src),
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        for product in 1..=3 {
            tx.send(datagram(BAT0, product)).unwrap();
        }
        let chunk = source.next().unwrap().expect("a chunk");
        assert_eq!(chunk.target_name, "test_field");
        assert_eq!(chunk.scan, 0);
        assert_eq!(chunk.n_row(), 3);
        assert!(chunk.on_source_flag.iter().all(|&f| f));
        assert_eq!(chunk.visibility[(0, 0, 0)], c32::new(0.5, -0.5));
        // Frequency axis is centred per the parset.
        assert!((chunk.frequency[0] - (939.5e6 - chunk.channel_width / 2.0)).abs() < 1e-3);
    }

    #[test]
    fn skips_stale_datagrams_between_cycles() {
        let (tx, vis_src) = QueueVisSource::new(64);
        let mut source = NoMetadataSource::new(
            &params(),
            &config(),
            Box::new(vis_src),
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        for product in 1..=3 {
            tx.send(datagram(BAT0, product)).unwrap();
        }
        source.next().unwrap().unwrap();
        // A straggler from the finished cycle, then the next cycle.
        tx.send(datagram(BAT0, 1)).unwrap();
        for product in 1..=3 {
            tx.send(datagram(BAT0 + INTERVAL_US, product)).unwrap();
        }
        let chunk = source.next().unwrap().expect("a chunk");
        assert!(!chunk.flag[(0, 0, 0)]);
    }
}
