// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Terminal task appending chunks to a measurement set.
//!
//! One set of tables per active rank. The main table is a stream of
//! versioned records referencing rows of the FIELD and DATA_DESCRIPTION
//! sub-tables; scan, field and spectral-window changes open new rows in
//! the appropriate sub-tables, mirroring how a measurement set grows
//! during an observation. The on-disk layout is private to this sink;
//! readers share it through the versioned chunk encoding.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, info};

use super::{Task, TaskError};
use crate::chunk::wire;
use crate::chunk::VisChunk;
use crate::comms::Communicator;
use crate::config::Configuration;
use crate::coord::RADec;
use crate::monitoring;
use crate::parset::Parset;
use crate::stokes::Stokes;

pub struct MSSink {
    config: Configuration,
    world: Arc<dyn Communicator>,
    filename_template: String,
    pointing_table_enabled: bool,
    /// `None` until the first call establishes which ranks are active.
    stream_number: Option<i32>,
    writer: Option<MsWriter>,
    previous_scan_index: Option<u32>,
    field_row: usize,
    data_desc_row: usize,
    rows_written: u64,
}

impl MSSink {
    pub fn new(
        params: &Parset,
        config: &Configuration,
        world: Arc<dyn Communicator>,
    ) -> Result<MSSink, TaskError> {
        let filename_template = params.string_or("filename", "ingest_%w_%d_%t.ms");
        let pointing_table_enabled = params
            .bool_or("pointingtable.enable", false)
            .map_err(crate::config::ConfigError::from)?;
        Ok(MSSink {
            config: config.clone(),
            world,
            filename_template,
            pointing_table_enabled,
            stream_number: None,
            writer: None,
            previous_scan_index: None,
            field_row: 0,
            data_desc_row: 0,
            rows_written: 0,
        })
    }

    /// Substitute `%w` (rank), `%d` (date) and `%t` (time) in the file
    /// name. Date and time are taken on rank 0 and broadcast so that all
    /// ranks of one run name their files consistently.
    fn substitute_file_name(&self) -> Result<String, TaskError> {
        let stamp = if self.world.size() > 1 {
            let own = (self.world.rank() == 0).then(|| {
                let now = chrono::Local::now();
                now.format("%Y-%m-%d %H%M%S").to_string().into_bytes()
            });
            let bytes = self.world.broadcast(0, own)?;
            String::from_utf8(bytes)
                .map_err(|_| TaskError::Inconsistent("date broadcast".to_string()))?
        } else {
            chrono::Local::now().format("%Y-%m-%d %H%M%S").to_string()
        };
        let (date, time) = stamp
            .split_once(' ')
            .ok_or_else(|| TaskError::Inconsistent("date broadcast".to_string()))?;
        Ok(self
            .filename_template
            .replace("%w", &self.config.rank().to_string())
            .replace("%d", date)
            .replace("%t", time))
    }

    /// Active-rank discovery, run exactly once with world collectives.
    fn discover_stream(&mut self, is_active: bool) -> Result<(), TaskError> {
        let mut activity = vec![0i64; self.world.size()];
        if is_active {
            activity[self.world.rank()] = 1;
        }
        let activity = self.world.allreduce_sum(&activity)?;
        let stream = if is_active {
            activity[..self.world.rank()].iter().sum::<i64>() as i32
        } else {
            -1
        };
        self.stream_number = Some(stream);
        let name = self.substitute_file_name()?;
        if is_active {
            info!("This rank will write stream {stream} to '{name}'");
            self.writer = Some(MsWriter::create(Path::new(&name), &self.config)?);
        } else {
            debug!("This rank has no output stream; measurement set writing disabled");
        }
        Ok(())
    }
}

impl Task for MSSink {
    fn name(&self) -> &str {
        "MSSink"
    }

    /// True until the first call has established which ranks are active
    /// (the discovery uses world collectives), false for inactive ranks
    /// afterwards.
    fn is_always_active(&self) -> bool {
        self.stream_number.is_none() || self.writer.is_some()
    }

    fn process(&mut self, chunk: &mut Option<VisChunk>) -> Result<(), TaskError> {
        if self.stream_number.is_none() {
            self.discover_stream(chunk.is_some())?;
        }
        let (writer, chunk) = match (&mut self.writer, chunk.as_ref()) {
            (Some(writer), Some(chunk)) => (writer, chunk),
            (None, _) => return Ok(()),
            (Some(_), None) => return Err(TaskError::UnexpectedIdleRank("MSSink")),
        };

        // Scan changes may open new FIELD / DATA_DESCRIPTION rows.
        if self.previous_scan_index != Some(chunk.scan) {
            self.field_row = writer.find_or_add_field(chunk)?;
            self.data_desc_row = writer.find_or_add_data_desc(chunk)?;
            self.previous_scan_index = Some(chunk.scan);
            debug!(
                "Scan {}: field row {}, data description row {}",
                chunk.scan, self.field_row, self.data_desc_row
            );
        }
        writer.append_main_row(self.field_row, self.data_desc_row, chunk)?;
        if self.pointing_table_enabled {
            writer.append_pointing_rows(chunk)?;
        }
        self.rows_written += chunk.n_row() as u64;
        monitoring::update("MSRowsWritten", self.rows_written as f64);
        Ok(())
    }
}

/// The on-disk table set.
struct MsWriter {
    dir: PathBuf,
    main: BufWriter<fs::File>,
    pointing: Option<BufWriter<fs::File>>,
    fields: Vec<(String, RADec)>,
    spectral_windows: Vec<SpectralWindowRow>,
    polarisations: Vec<Vec<Stokes>>,
    data_descriptions: Vec<(usize, usize)>,
}

#[derive(PartialEq)]
struct SpectralWindowRow {
    n_chan: usize,
    start_freq_hz: f64,
    chan_width_hz: f64,
}

const MAIN_TABLE_MAGIC: &[u8; 4] = b"MSMT";
const MAIN_TABLE_VERSION: u32 = 1;

impl MsWriter {
    fn create(dir: &Path, config: &Configuration) -> Result<MsWriter, TaskError> {
        fs::create_dir_all(dir)?;
        let mut main = BufWriter::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("MAIN.tbl"))?,
        );
        main.write_all(MAIN_TABLE_MAGIC)?;
        main.write_u32::<LittleEndian>(MAIN_TABLE_VERSION)?;

        let mut writer = MsWriter {
            dir: dir.to_path_buf(),
            main,
            pointing: None,
            fields: Vec::new(),
            spectral_windows: Vec::new(),
            polarisations: Vec::new(),
            data_descriptions: Vec::new(),
        };
        writer.write_antenna_table(config)?;
        writer.write_feed_table(config)?;
        writer.write_observation_table(config)?;
        Ok(writer)
    }

    fn write_antenna_table(&mut self, config: &Configuration) -> Result<(), TaskError> {
        let mut file = BufWriter::new(fs::File::create(self.dir.join("ANTENNA.tbl"))?);
        file.write_u32::<LittleEndian>(config.antennas().len() as u32)?;
        for ant in config.antennas() {
            write_string(&mut file, &ant.name)?;
            write_string(&mut file, &ant.mount)?;
            file.write_f64::<LittleEndian>(ant.diameter)?;
            for coord in ant.position {
                file.write_f64::<LittleEndian>(coord)?;
            }
        }
        file.flush()?;
        Ok(())
    }

    fn write_feed_table(&mut self, config: &Configuration) -> Result<(), TaskError> {
        let mut file = BufWriter::new(fs::File::create(self.dir.join("FEED.tbl"))?);
        match config.feed() {
            Some(feeds) => {
                file.write_u32::<LittleEndian>(feeds.n_feeds() as u32)?;
                for feed in 0..feeds.n_feeds() {
                    let [x, y] = feeds.offset(feed);
                    file.write_f64::<LittleEndian>(x)?;
                    file.write_f64::<LittleEndian>(y)?;
                }
            }
            None => file.write_u32::<LittleEndian>(0)?,
        }
        file.flush()?;
        Ok(())
    }

    fn write_observation_table(&mut self, config: &Configuration) -> Result<(), TaskError> {
        let mut file = BufWriter::new(fs::File::create(self.dir.join("OBSERVATION.tbl"))?);
        write_string(&mut file, config.array_name())?;
        file.write_u32::<LittleEndian>(config.scheduling_block_id())?;
        file.flush()?;
        Ok(())
    }

    fn find_or_add_field(&mut self, chunk: &VisChunk) -> Result<usize, TaskError> {
        let direction = chunk
            .phase_centre
            .first()
            .copied()
            .unwrap_or(RADec::new(0.0, 0.0));
        let existing = self.fields.iter().position(|(name, dir)| {
            name == &chunk.target_name && dir.separation(&direction) < 1e-9
        });
        if let Some(row) = existing {
            return Ok(row);
        }
        self.fields.push((chunk.target_name.clone(), direction));
        self.rewrite_field_table()?;
        debug!("Opened FIELD row {} for '{}'", self.fields.len() - 1, chunk.target_name);
        Ok(self.fields.len() - 1)
    }

    fn find_or_add_data_desc(&mut self, chunk: &VisChunk) -> Result<usize, TaskError> {
        let spw = SpectralWindowRow {
            n_chan: chunk.n_channel(),
            start_freq_hz: chunk.frequency.first().copied().unwrap_or(0.0),
            chan_width_hz: chunk.channel_width,
        };
        let spw_id = match self.spectral_windows.iter().position(|row| {
            row.n_chan == spw.n_chan
                && (row.start_freq_hz - spw.start_freq_hz).abs() < 1.0
                && (row.chan_width_hz - spw.chan_width_hz).abs() < 1e-3
        }) {
            Some(id) => id,
            None => {
                self.spectral_windows.push(spw);
                self.spectral_windows.len() - 1
            }
        };
        let pol_id = match self
            .polarisations
            .iter()
            .position(|row| row == &chunk.stokes)
        {
            Some(id) => id,
            None => {
                self.polarisations.push(chunk.stokes.clone());
                self.polarisations.len() - 1
            }
        };
        let dd_id = match self
            .data_descriptions
            .iter()
            .position(|&row| row == (spw_id, pol_id))
        {
            Some(id) => id,
            None => {
                self.data_descriptions.push((spw_id, pol_id));
                self.rewrite_data_desc_tables()?;
                self.data_descriptions.len() - 1
            }
        };
        Ok(dd_id)
    }

    fn rewrite_field_table(&mut self) -> Result<(), TaskError> {
        let mut file = BufWriter::new(fs::File::create(self.dir.join("FIELD.tbl"))?);
        file.write_u32::<LittleEndian>(self.fields.len() as u32)?;
        for (name, dir) in &self.fields {
            write_string(&mut file, name)?;
            file.write_f64::<LittleEndian>(dir.ra)?;
            file.write_f64::<LittleEndian>(dir.dec)?;
        }
        file.flush()?;
        Ok(())
    }

    fn rewrite_data_desc_tables(&mut self) -> Result<(), TaskError> {
        let mut spw = BufWriter::new(fs::File::create(self.dir.join("SPECTRAL_WINDOW.tbl"))?);
        spw.write_u32::<LittleEndian>(self.spectral_windows.len() as u32)?;
        for row in &self.spectral_windows {
            spw.write_u32::<LittleEndian>(row.n_chan as u32)?;
            spw.write_f64::<LittleEndian>(row.start_freq_hz)?;
            spw.write_f64::<LittleEndian>(row.chan_width_hz)?;
        }
        spw.flush()?;

        let mut pol = BufWriter::new(fs::File::create(self.dir.join("POLARIZATION.tbl"))?);
        pol.write_u32::<LittleEndian>(self.polarisations.len() as u32)?;
        for row in &self.polarisations {
            pol.write_u32::<LittleEndian>(row.len() as u32)?;
            for s in row {
                pol.write_u8(s.to_wire())?;
            }
        }
        pol.flush()?;

        let mut dd = BufWriter::new(fs::File::create(self.dir.join("DATA_DESCRIPTION.tbl"))?);
        dd.write_u32::<LittleEndian>(self.data_descriptions.len() as u32)?;
        for &(spw_id, pol_id) in &self.data_descriptions {
            dd.write_u32::<LittleEndian>(spw_id as u32)?;
            dd.write_u32::<LittleEndian>(pol_id as u32)?;
        }
        dd.flush()?;
        Ok(())
    }

    fn append_main_row(
        &mut self,
        field_row: usize,
        data_desc_row: usize,
        chunk: &VisChunk,
    ) -> Result<(), TaskError> {
        let payload = wire::encode_chunk(chunk);
        self.main.write_u32::<LittleEndian>(field_row as u32)?;
        self.main.write_u32::<LittleEndian>(data_desc_row as u32)?;
        self.main.write_u64::<LittleEndian>(payload.len() as u64)?;
        self.main.write_all(&payload)?;
        self.main.flush()?;
        Ok(())
    }

    fn append_pointing_rows(&mut self, chunk: &VisChunk) -> Result<(), TaskError> {
        if self.pointing.is_none() {
            self.pointing = Some(BufWriter::new(
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.dir.join("POINTING.tbl"))?,
            ));
        }
        let file = self.pointing.as_mut().expect("created above");
        for ant in 0..chunk.n_antenna() {
            file.write_f64::<LittleEndian>(chunk.time)?;
            file.write_u32::<LittleEndian>(ant as u32)?;
            file.write_f64::<LittleEndian>(chunk.actual_pointing_centre[ant].ra)?;
            file.write_f64::<LittleEndian>(chunk.actual_pointing_centre[ant].dec)?;
            file.write_f64::<LittleEndian>(chunk.actual_azimuth[ant])?;
            file.write_f64::<LittleEndian>(chunk.actual_elevation[ant])?;
            file.write_f64::<LittleEndian>(chunk.actual_pol_angle[ant])?;
        }
        file.flush()?;
        Ok(())
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::LocalFabric;

    fn config() -> Configuration {
        let text = "array.name = test_array\n\
             sbid = 7432\n\
             antennas = [a, b]\n\
             antenna.ant.diameter = 12\n\
             antenna.ant.mount = equatorial\n\
             antenna.a.location.itrf = [-2556109.976, 5097388.7, -2848440.12]\n\
             antenna.b.location.itrf = [-2556087.396082, 5097423.589662, -2848396.867933]\n\
             baselinemap.baselineids = [1]\n\
             baselinemap.1 = [0, 0, XX]\n";
        Configuration::new(Parset::from_str(text).unwrap(), 0, 1).unwrap()
    }

    fn chunk(scan: u32, target: &str) -> VisChunk {
        let mut chunk = VisChunk::new(3, 8, 1, 2);
        chunk.scan = scan;
        chunk.target_name = target.to_string();
        chunk.time = 1000.0;
        chunk.stokes = vec![Stokes::XX];
        chunk.channel_width = 1e6;
        chunk.frequency = (0..8).map(|c| 1e9 + c as f64 * 1e6).collect();
        chunk.flag.fill(false);
        chunk
    }

    fn sink(dir: &Path) -> MSSink {
        let mut params = Parset::new();
        let template = dir.join("out_%w.ms");
        params.add("filename", template.to_str().unwrap());
        MSSink::new(&params, &config(), LocalFabric::solo()).unwrap()
    }

    #[test]
    fn writes_tables_and_main_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(dir.path());
        let mut holder = Some(chunk(0, "field_a"));
        sink.process(&mut holder).unwrap();

        let ms_dir = dir.path().join("out_0.ms");
        assert!(ms_dir.join("ANTENNA.tbl").exists());
        assert!(ms_dir.join("OBSERVATION.tbl").exists());
        assert!(ms_dir.join("FIELD.tbl").exists());
        assert!(ms_dir.join("SPECTRAL_WINDOW.tbl").exists());
        assert!(ms_dir.join("MAIN.tbl").exists());
        let main_size_1 = fs::metadata(ms_dir.join("MAIN.tbl")).unwrap().len();

        // A second cycle appends.
        let mut holder = Some(chunk(0, "field_a"));
        sink.process(&mut holder).unwrap();
        let main_size_2 = fs::metadata(ms_dir.join("MAIN.tbl")).unwrap().len();
        assert!(main_size_2 > main_size_1);
    }

    #[test]
    fn scan_change_opens_new_field_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(dir.path());
        for (scan, target) in [(0, "field_a"), (1, "field_b"), (2, "field_a")] {
            let mut holder = Some(chunk(scan, target));
            sink.process(&mut holder).unwrap();
        }
        let writer = sink.writer.as_ref().unwrap();
        // field_a is reused; only two FIELD rows exist.
        assert_eq!(writer.fields.len(), 2);
        assert_eq!(writer.spectral_windows.len(), 1);
        assert_eq!(writer.data_descriptions.len(), 1);
    }

    #[test]
    fn spectral_window_change_opens_new_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = sink(dir.path());
        let mut holder = Some(chunk(0, "field_a"));
        sink.process(&mut holder).unwrap();
        // Same field, different frequency setup on a new scan.
        let mut other = chunk(1, "field_a");
        other.frequency = (0..8).map(|c| 1.4e9 + c as f64 * 1e6).collect();
        let mut holder = Some(other);
        sink.process(&mut holder).unwrap();
        let writer = sink.writer.as_ref().unwrap();
        assert_eq!(writer.fields.len(), 1);
        assert_eq!(writer.spectral_windows.len(), 2);
        assert_eq!(writer.data_descriptions.len(), 2);
    }

    #[test]
    fn filename_substitution_expands_rank_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = Parset::new();
        let template = dir.path().join("ms_%w_%d_%t.ms");
        params.add("filename", template.to_str().unwrap());
        let mut sink = MSSink::new(&params, &config(), LocalFabric::solo()).unwrap();
        let mut holder = Some(chunk(0, "x"));
        sink.process(&mut holder).unwrap();
        let entries: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = &entries[0];
        assert!(name.starts_with("ms_0_20"), "{name}");
        assert!(!name.contains('%'), "{name}");
    }
}
