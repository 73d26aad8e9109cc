// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::config::ConfigError;
use crate::parset::Parset;
use crate::stokes::Stokes;

/// One named correlator observing mode. Immutable after construction.
#[derive(Clone, Debug)]
pub struct CorrelatorMode {
    pub name: String,
    /// Channel width \[Hz\]; signed.
    pub chan_width_hz: f64,
    pub n_chan: usize,
    pub stokes: Vec<Stokes>,
    /// Integration interval \[us\].
    pub interval_us: u64,
    /// Bulk frequency offset \[Hz\].
    pub freq_offset_hz: f64,
}

impl CorrelatorMode {
    /// Parse one mode from its `correlator.mode.<name>.` subset.
    pub fn from_parset(name: &str, parset: &Parset) -> Result<CorrelatorMode, ConfigError> {
        let chan_width_hz = parse_frequency_hz(&parset.string("chan_width")?)?;
        let n_chan = parset.u32("n_chan")? as usize;
        let stokes = parset
            .string_vector("stokes")?
            .iter()
            .map(|s| s.parse::<Stokes>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::BadStokes(e.to_string()))?;
        if stokes.is_empty() {
            return Err(ConfigError::BadStokes(format!(
                "Stokes vector is empty for mode '{name}'"
            )));
        }
        let interval_us = parset.u32("interval")? as u64;
        let freq_offset_hz = if parset.is_defined("freq_offset") {
            parse_frequency_hz(&parset.string("freq_offset")?)?
        } else {
            0.0
        };
        Ok(CorrelatorMode {
            name: name.to_string(),
            chan_width_hz,
            n_chan,
            stokes,
            interval_us,
            freq_offset_hz,
        })
    }

    /// Integration interval in seconds.
    pub fn interval_seconds(&self) -> f64 {
        self.interval_us as f64 / 1e6
    }
}

/// Parse a frequency quantity with an optional unit suffix (`Hz`, `kHz`,
/// `MHz`, `GHz`). A bare number is hertz.
pub fn parse_frequency_hz(raw: &str) -> Result<f64, ConfigError> {
    let text = raw.trim();
    let (number, scale) = if let Some(stripped) = text.strip_suffix("GHz") {
        (stripped, 1e9)
    } else if let Some(stripped) = text.strip_suffix("MHz") {
        (stripped, 1e6)
    } else if let Some(stripped) = text.strip_suffix("kHz") {
        (stripped, 1e3)
    } else if let Some(stripped) = text.strip_suffix("Hz") {
        (stripped, 1.0)
    } else {
        (text, 1.0)
    };
    number
        .trim()
        .parse::<f64>()
        .map(|v| v * scale)
        .map_err(|_| ConfigError::BadFrequency(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn parse_standard_mode() {
        let parset = Parset::from_str(
            "chan_width = 18.518518kHz\n\
             n_chan = 216\n\
             stokes = [XX, XY, YX, YY]\n\
             interval = 5000000\n\
             freq_offset = -1MHz\n",
        )
        .unwrap();
        let mode = CorrelatorMode::from_parset("standard", &parset).unwrap();
        assert_abs_diff_eq!(mode.chan_width_hz, 18_518.518, epsilon = 1e-6);
        assert_eq!(mode.n_chan, 216);
        assert_eq!(mode.stokes.len(), 4);
        assert_eq!(mode.interval_us, 5_000_000);
        assert_abs_diff_eq!(mode.freq_offset_hz, -1e6);
        assert_abs_diff_eq!(mode.interval_seconds(), 5.0);
    }

    #[test]
    fn empty_stokes_rejected() {
        let parset = Parset::from_str(
            "chan_width = 1000\n\
             n_chan = 16\n\
             stokes = []\n\
             interval = 5000000\n",
        )
        .unwrap();
        assert!(CorrelatorMode::from_parset("bad", &parset).is_err());
    }

    #[test]
    fn frequency_units() {
        assert_abs_diff_eq!(parse_frequency_hz("1.4GHz").unwrap(), 1.4e9);
        assert_abs_diff_eq!(parse_frequency_hz("1000").unwrap(), 1e3);
        assert_abs_diff_eq!(parse_frequency_hz("-18.5 kHz").unwrap(), -18_500.0);
        assert!(parse_frequency_hz("fast").is_err());
    }
}
