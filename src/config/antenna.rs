// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::config::ConfigError;
use crate::parset::Parset;

/// Static description of one dish.
#[derive(Clone, Debug)]
pub struct Antenna {
    pub name: String,
    /// ITRF position \[m\].
    pub position: [f64; 3],
    /// Dish diameter \[m\].
    pub diameter: f64,
    pub mount: String,
    /// Fixed instrumental delay \[ns\].
    pub delay_ns: f64,
}

impl Antenna {
    /// Build from `antenna.<name>.*` keys, with `antenna.ant.*` providing
    /// per-array defaults for everything except the position.
    pub fn from_parset(parset: &Parset, name: &str) -> Result<Antenna, ConfigError> {
        let prefix = format!("antenna.{name}.");
        let own = parset.subset(&prefix);
        let defaults = parset.subset("antenna.ant.");

        let position_key = "location.itrf";
        let position = if own.is_defined(position_key) {
            own.f64_vector(position_key)?
        } else if defaults.is_defined(position_key) {
            defaults.f64_vector(position_key)?
        } else {
            return Err(ConfigError::AntennaWithoutPosition(name.to_string()));
        };
        if position.len() != 3 {
            return Err(ConfigError::BadAntennaPosition {
                name: name.to_string(),
                len: position.len(),
            });
        }

        let lookup_f64 = |key: &str, fallback: f64| -> Result<f64, ConfigError> {
            if own.is_defined(key) {
                Ok(own.f64(key)?)
            } else {
                Ok(defaults.f64_or(key, fallback)?)
            }
        };
        let diameter = lookup_f64("diameter", 12.0)?;
        let delay_ns = lookup_f64("delay", 0.0)?;
        let mount = if own.is_defined("mount") {
            own.string("mount")?
        } else {
            defaults.string_or("mount", "equatorial")
        };

        Ok(Antenna {
            name: name.to_string(),
            position: [position[0], position[1], position[2]],
            diameter,
            mount,
            delay_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let parset = Parset::from_str(
            "antenna.ant.diameter = 12\n\
             antenna.ant.mount = equatorial\n\
             antenna.ak02.location.itrf = [-2556109.976, 5097388.700, -2848440.12]\n\
             antenna.ak04.location.itrf = [-2556087.396082, 5097423.589662, -2848396.867933]\n\
             antenna.ak04.diameter = 13.5\n",
        )
        .unwrap();
        let a2 = Antenna::from_parset(&parset, "ak02").unwrap();
        assert_eq!(a2.diameter, 12.0);
        assert_eq!(a2.mount, "equatorial");
        let a4 = Antenna::from_parset(&parset, "ak04").unwrap();
        assert_eq!(a4.diameter, 13.5);
        assert!((a4.position[0] + 2_556_087.396_082).abs() < 1e-6);
    }

    #[test]
    fn missing_position_is_fatal() {
        let parset = Parset::from_str("antenna.ant.diameter = 12\n").unwrap();
        assert!(matches!(
            Antenna::from_parset(&parset, "ak02"),
            Err(ConfigError::AntennaWithoutPosition(_))
        ));
    }
}
