// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The visibility corner turn: datagrams into the current chunk.
//!
//! Each datagram is mapped to a (row, channel range, polarisation) of the
//! chunk being accumulated. The row is a closed-form triangular function
//! of the two antennas and the beam, so the hot path does no dictionary
//! lookups; per-product descriptions are pre-expanded into a flat array
//! indexed by product id.

use std::collections::HashSet;

use log::{debug, warn};

use super::datagram::VisDatagram;
use super::error::SourceError;
use crate::chunk::VisChunk;
use crate::config::{Configuration, CorrelatorMode};
use crate::constants::{CHANNELS_PER_CARD, CHANNELS_PER_SLICE};
use crate::parset::Parset;
use crate::stokes::Stokes;
use crate::time::bat_to_mjd_seconds;

/// Map a hardware channel index within a card to its position on the
/// frequency-ordered axis. The correlator interleaves the four fine
/// filterbank outputs; this undoes that ordering. Cards with a
/// non-standard channel count pass indices through unchanged.
pub fn map_channel(channel_id: usize, n_chan: usize) -> usize {
    if n_chan == CHANNELS_PER_CARD {
        (channel_id % 4) * CHANNELS_PER_SLICE + channel_id / 4
    } else {
        channel_id
    }
}

pub struct VisConverter {
    config: Configuration,
    chunk: Option<VisChunk>,

    /// Per-id product description; `None` entries are unmapped ids.
    products: Vec<Option<(u32, u32, Stokes)>>,
    upper_triangle: bool,

    /// Beam id translation from the stream to the chunk; identity by
    /// default. `None` entries drop the beam.
    beam_map: Vec<Option<u32>>,
    max_n_beams: usize,
    beams_to_receive: usize,

    datagrams_expected: usize,
    datagrams_count: usize,
    datagrams_ignored: usize,
    n_duplicates: usize,
    received: HashSet<(u32, u32, u32, u32, u32, u32)>,

    antenna_good: Vec<bool>,
    stokes_warned: HashSet<Stokes>,
    /// Per-pol column of the chunk for each wire Stokes tag.
    pol_index: [Option<usize>; 4],
    n_baselines: usize,
    n_slices: usize,
}

impl VisConverter {
    pub fn new(params: &Parset, config: &Configuration) -> Result<VisConverter, SourceError> {
        let map = config.bmap();
        let mut products = vec![None; map.max_id() as usize + 1];
        for (id, desc) in map.iter() {
            if id >= 1 {
                products[id as usize] = Some(desc);
            }
        }

        let n_beams_cfg = config.feed().map(|f| f.n_feeds()).unwrap_or(1);
        let (beam_map, max_n_beams, beams_to_receive) = build_beam_map(params, n_beams_cfg)?;
        debug!(
            "Converter will receive {beams_to_receive} beam(s) and store {max_n_beams} beam(s)"
        );

        Ok(VisConverter {
            config: config.clone(),
            chunk: None,
            products,
            upper_triangle: map.is_upper_triangle(),
            beam_map,
            max_n_beams,
            beams_to_receive,
            datagrams_expected: 0,
            datagrams_count: 0,
            datagrams_ignored: 0,
            n_duplicates: 0,
            received: HashSet::new(),
            antenna_good: Vec::new(),
            stokes_warned: HashSet::new(),
            pol_index: [None; 4],
            n_baselines: 0,
            n_slices: 0,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn max_n_beams(&self) -> usize {
        self.max_n_beams
    }

    pub fn datagrams_expected(&self) -> usize {
        self.datagrams_expected
    }

    pub fn datagrams_count(&self) -> usize {
        self.datagrams_count
    }

    pub fn datagrams_ignored(&self) -> usize {
        self.datagrams_ignored
    }

    pub fn got_all_expected_datagrams(&self) -> bool {
        self.datagrams_count + self.datagrams_ignored == self.datagrams_expected
    }

    /// The chunk being accumulated. Panics if no chunk is initialised;
    /// callers initialise one per cycle before any access.
    pub fn chunk_mut(&mut self) -> &mut VisChunk {
        self.chunk.as_mut().expect("no VisChunk initialised")
    }

    /// Hand the finished chunk out, leaving the converter empty.
    pub fn take_chunk(&mut self) -> VisChunk {
        self.chunk.take().expect("no VisChunk initialised")
    }

    /// Mark an antenna bad for the remainder of this cycle. Samples on
    /// its baselines are still deposited but stay flagged.
    pub fn flag_antenna(&mut self, antenna: u32) {
        if let Some(slot) = self.antenna_good.get_mut(antenna as usize) {
            *slot = false;
        }
    }

    pub fn is_antenna_good(&self, antenna: u32) -> bool {
        self.antenna_good
            .get(antenna as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Start a new chunk for the integration at `timestamp`. Sizes all
    /// storage from the correlator mode and this rank's role, resets the
    /// duplicate-detection set and the counters, and lays out the rows
    /// beam-major with baselines in upper-triangle order inside each
    /// beam.
    pub fn init_vis_chunk(
        &mut self,
        timestamp: u64,
        mode: &CorrelatorMode,
    ) -> Result<(), SourceError> {
        let n_antenna = self.config.antennas().len();
        let n_chan = mode.n_chan;
        if n_chan % CHANNELS_PER_SLICE != 0 {
            return Err(SourceError::BadModeShape {
                mode: mode.name.clone(),
                n_chan,
                per_slice: CHANNELS_PER_SLICE,
            });
        }
        self.n_slices = n_chan / CHANNELS_PER_SLICE;
        self.n_baselines = n_antenna * (n_antenna + 1) / 2;
        let n_row = self.n_baselines * self.max_n_beams;
        let n_pol = mode.stokes.len();

        let mut chunk = VisChunk::new(n_row, n_chan, n_pol, n_antenna);
        chunk.time = bat_to_mjd_seconds(timestamp) + mode.interval_seconds() / 2.0;
        chunk.interval = mode.interval_seconds();
        chunk.stokes = mode.stokes.clone();

        let mut row = 0;
        for beam in 0..self.max_n_beams as u32 {
            for ant1 in 0..n_antenna as u32 {
                for ant2 in ant1..n_antenna as u32 {
                    chunk.antenna1[row] = ant1;
                    chunk.antenna2[row] = ant2;
                    chunk.beam1[row] = beam;
                    chunk.beam2[row] = beam;
                    row += 1;
                }
            }
        }
        debug_assert_eq!(row, n_row);

        self.pol_index = [None; 4];
        for (i, s) in mode.stokes.iter().enumerate() {
            self.pol_index[s.to_wire() as usize] = Some(i);
        }

        self.chunk = Some(chunk);
        self.datagrams_expected =
            self.products.iter().flatten().count() * self.beams_to_receive * self.n_slices;
        self.datagrams_count = 0;
        self.datagrams_ignored = 0;
        self.n_duplicates = 0;
        self.received.clear();
        self.antenna_good = vec![true; n_antenna];
        Ok(())
    }

    /// Row holding a baseline/beam product. `ant1 <= ant2` required; the
    /// layout is beam-major with an upper-triangle raster inside each
    /// beam, so `row = beam * nBaselines + T(ant1) + (ant2 - ant1)` where
    /// `T` is the partial sum of the shrinking per-antenna run lengths.
    fn calculate_row(&self, ant1: u32, ant2: u32, beam: u32) -> usize {
        debug_assert!(ant1 <= ant2);
        let n_ant = self.antenna_good.len() as u32;
        // Sum of the arithmetic series nAnt, nAnt-1, ... over ant1 terms.
        let preceding = ant1 * n_ant - ant1 * ant1.saturating_sub(1) / 2;
        beam as usize * self.n_baselines + (preceding + ant2 - ant1) as usize
    }

    /// Process one datagram, depositing its samples into the current
    /// chunk. Successfully received datagrams that cannot contribute
    /// (unmapped products, dropped beams, duplicates) count as ignored.
    pub fn add(&mut self, datagram: &VisDatagram) {
        if !self.received.insert(datagram.identity()) {
            self.n_duplicates += 1;
            if self.n_duplicates.is_power_of_two() {
                warn!(
                    "Duplicate datagram (beam={}, block={}, card={}, channel={}, slice={}, \
                     product={}); {} so far this cycle",
                    datagram.beam,
                    datagram.block,
                    datagram.card,
                    datagram.channel,
                    datagram.slice,
                    datagram.product,
                    self.n_duplicates
                );
            }
            self.datagrams_ignored += 1;
            return;
        }

        let beam = match self
            .beam_map
            .get(datagram.beam as usize)
            .copied()
            .flatten()
        {
            Some(beam) if (beam as usize) < self.max_n_beams => beam,
            _ => {
                self.datagrams_ignored += 1;
                return;
            }
        };

        let product = match self
            .products
            .get(datagram.product as usize)
            .copied()
            .flatten()
        {
            Some(p) => p,
            None => {
                self.datagrams_ignored += 1;
                return;
            }
        };
        let (ant1, ant2, stokes) = product;

        // Rows are stored upper-triangle; a lower-triangle product flips
        // onto the mirror row with conjugated samples and transposed
        // cross-pols. An all-upper-triangle map skips this entirely.
        let (row_ant1, row_ant2, stokes, conjugate) = if !self.upper_triangle && ant1 > ant2 {
            (ant2, ant1, stokes.transposed(), true)
        } else {
            (ant1, ant2, stokes, false)
        };

        let pol = match self.pol_index[stokes.to_wire() as usize] {
            Some(pol) => pol,
            None => {
                if self.stokes_warned.insert(stokes) {
                    warn!("Polarisation {stokes} is not mapped to the output; ignoring");
                }
                self.datagrams_ignored += 1;
                return;
            }
        };

        let n_chan = self
            .chunk
            .as_ref()
            .expect("no VisChunk initialised")
            .n_channel();
        let first = datagram.channel as usize;
        if first + CHANNELS_PER_SLICE > n_chan {
            self.datagrams_ignored += 1;
            return;
        }

        let row = self.calculate_row(row_ant1, row_ant2, beam);
        let antenna_flagged = !self.antenna_good[ant1 as usize] || !self.antenna_good[ant2 as usize];

        let chunk = self.chunk.as_mut().expect("no VisChunk initialised");
        debug_assert!(row < chunk.n_row());
        for (k, (&sample, &sample_flag)) in datagram.vis.iter().zip(&datagram.flags).enumerate() {
            let channel = map_channel(first + k, n_chan);
            let value = if conjugate { sample.conj() } else { sample };
            chunk.visibility[(row, channel, pol)] = value;
            chunk.flag[(row, channel, pol)] = antenna_flagged || sample_flag;
        }
        self.datagrams_count += 1;
    }
}

/// Parse the optional `beammap` parameter: comma-separated `in:out`
/// pairs, with `out = -1` dropping the beam. Returns the translation
/// table, the number of beams the chunk stores and the number of beams
/// expected in the stream.
fn build_beam_map(
    params: &Parset,
    n_beams_cfg: usize,
) -> Result<(Vec<Option<u32>>, usize, usize), SourceError> {
    match params.get_string("beammap") {
        None | Some("") => Ok((
            (0..n_beams_cfg as u32).map(Some).collect(),
            n_beams_cfg,
            n_beams_cfg,
        )),
        Some(mapping) => {
            let mut pairs = Vec::new();
            for entry in mapping.split(',') {
                let (input, output) = entry.split_once(':').ok_or_else(|| {
                    SourceError::Config(crate::config::ConfigError::BadFeedConfig(format!(
                        "malformed beammap entry '{entry}'"
                    )))
                })?;
                let input: usize = input.trim().parse().map_err(|_| {
                    SourceError::Config(crate::config::ConfigError::BadFeedConfig(format!(
                        "malformed beammap entry '{entry}'"
                    )))
                })?;
                let output: i64 = output.trim().parse().map_err(|_| {
                    SourceError::Config(crate::config::ConfigError::BadFeedConfig(format!(
                        "malformed beammap entry '{entry}'"
                    )))
                })?;
                pairs.push((input, output));
            }
            let table_len = pairs.iter().map(|&(i, _)| i + 1).max().unwrap_or(0);
            let mut table = vec![None; table_len];
            for &(input, output) in &pairs {
                table[input] = (output >= 0).then_some(output as u32);
            }
            let max_n_beams = pairs
                .iter()
                .filter_map(|&(_, o)| (o >= 0).then_some(o as usize + 1))
                .max()
                .unwrap_or(0);
            Ok((table, max_n_beams, pairs.len()))
        }
    }
}
