// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A flat key/value "parset" configuration format.
//!
//! Keys are dotted paths (`correlator.mode.standard.n_chan`), values are
//! scalars or bracketed vectors (`[a, b, c]`). Lines starting with `#` are
//! comments. This is the only configuration format the pipeline reads; all
//! typed access goes through the getters here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParsetError {
    #[error("Malformed parset line {line}: '{text}'")]
    MalformedLine { line: usize, text: String },

    #[error("Value for key '{key}' is not a valid {expected}: '{value}'")]
    BadValue {
        key: String,
        expected: &'static str,
        value: String,
    },

    #[error("Required key '{0}' is not defined")]
    MissingKey(String),

    #[error("IO error reading parset: {0}")]
    Io(#[from] std::io::Error),
}

/// An immutable set of dotted-key parameters.
#[derive(Clone, Debug, Default)]
pub struct Parset {
    params: BTreeMap<String, String>,
}

impl Parset {
    pub fn new() -> Parset {
        Parset::default()
    }

    /// Parse from text. Later duplicate keys override earlier ones, which
    /// allows layering defaults under site files.
    pub fn from_str(text: &str) -> Result<Parset, ParsetError> {
        let mut params = BTreeMap::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ParsetError::MalformedLine {
                line: i + 1,
                text: raw.to_string(),
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ParsetError::MalformedLine {
                    line: i + 1,
                    text: raw.to_string(),
                });
            }
            params.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Parset { params })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Parset, ParsetError> {
        Self::from_str(&fs::read_to_string(path)?)
    }

    /// Used by tests and adapters that fabricate configurations.
    pub fn add(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn is_defined(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// A new parset containing only keys under `prefix`, with the prefix
    /// (including its trailing dot) stripped.
    pub fn subset(&self, prefix: &str) -> Parset {
        let params = self
            .params
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect();
        Parset { params }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn string(&self, key: &str) -> Result<String, ParsetError> {
        self.get_string(key)
            .map(|s| s.to_string())
            .ok_or_else(|| ParsetError::MissingKey(key.to_string()))
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key).unwrap_or(default).to_string()
    }

    fn parse<T: std::str::FromStr>(
        &self,
        key: &str,
        raw: &str,
        expected: &'static str,
    ) -> Result<T, ParsetError> {
        raw.trim().parse().map_err(|_| ParsetError::BadValue {
            key: key.to_string(),
            expected,
            value: raw.to_string(),
        })
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, ParsetError> {
        self.params
            .get(key)
            .map(|v| self.parse(key, v, "u32"))
            .transpose()
    }

    pub fn u32_or(&self, key: &str, default: u32) -> Result<u32, ParsetError> {
        Ok(self.get_u32(key)?.unwrap_or(default))
    }

    pub fn u32(&self, key: &str) -> Result<u32, ParsetError> {
        self.get_u32(key)?
            .ok_or_else(|| ParsetError::MissingKey(key.to_string()))
    }

    pub fn get_i32(&self, key: &str) -> Result<Option<i32>, ParsetError> {
        self.params
            .get(key)
            .map(|v| self.parse(key, v, "i32"))
            .transpose()
    }

    pub fn i32_or(&self, key: &str, default: i32) -> Result<i32, ParsetError> {
        Ok(self.get_i32(key)?.unwrap_or(default))
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, ParsetError> {
        self.params
            .get(key)
            .map(|v| self.parse(key, v, "f64"))
            .transpose()
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, ParsetError> {
        Ok(self.get_f64(key)?.unwrap_or(default))
    }

    pub fn f64(&self, key: &str) -> Result<f64, ParsetError> {
        self.get_f64(key)?
            .ok_or_else(|| ParsetError::MissingKey(key.to_string()))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ParsetError> {
        self.params
            .get(key)
            .map(|v| self.parse(key, v, "bool"))
            .transpose()
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ParsetError> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    fn vector_elements<'a>(
        &self,
        key: &str,
        raw: &'a str,
    ) -> Result<Vec<&'a str>, ParsetError> {
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| ParsetError::BadValue {
                key: key.to_string(),
                expected: "bracketed vector",
                value: raw.to_string(),
            })?;
        if inner.trim().is_empty() {
            return Ok(vec![]);
        }
        Ok(inner.split(',').map(|s| s.trim()).collect())
    }

    pub fn string_vector(&self, key: &str) -> Result<Vec<String>, ParsetError> {
        let raw = self
            .params
            .get(key)
            .ok_or_else(|| ParsetError::MissingKey(key.to_string()))?;
        Ok(self
            .vector_elements(key, raw)?
            .into_iter()
            .map(|s| s.to_string())
            .collect())
    }

    pub fn string_vector_or_empty(&self, key: &str) -> Result<Vec<String>, ParsetError> {
        if !self.is_defined(key) {
            return Ok(vec![]);
        }
        self.string_vector(key)
    }

    pub fn u32_vector_or_empty(&self, key: &str) -> Result<Vec<u32>, ParsetError> {
        self.typed_vector_or_empty(key, "u32 vector")
    }

    pub fn i32_vector(&self, key: &str) -> Result<Vec<i32>, ParsetError> {
        if !self.is_defined(key) {
            return Err(ParsetError::MissingKey(key.to_string()));
        }
        self.typed_vector_or_empty(key, "i32 vector")
    }

    pub fn f64_vector(&self, key: &str) -> Result<Vec<f64>, ParsetError> {
        if !self.is_defined(key) {
            return Err(ParsetError::MissingKey(key.to_string()));
        }
        self.typed_vector_or_empty(key, "f64 vector")
    }

    fn typed_vector_or_empty<T: std::str::FromStr>(
        &self,
        key: &str,
        expected: &'static str,
    ) -> Result<Vec<T>, ParsetError> {
        let raw = match self.params.get(key) {
            Some(raw) => raw,
            None => return Ok(vec![]),
        };
        self.vector_elements(key, raw)?
            .into_iter()
            .map(|s| {
                s.parse().map_err(|_| ParsetError::BadValue {
                    key: key.to_string(),
                    expected,
                    value: raw.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalars_and_comments() {
        let p = Parset::from_str(
            "# site file\n\
             array.name = test_array\n\
             sbid = 1234\n\
             tasks.MergedSource.params.baduvw_maxcycles = -1\n",
        )
        .unwrap();
        assert_eq!(p.get_string("array.name"), Some("test_array"));
        assert_eq!(p.u32("sbid").unwrap(), 1234);
        assert_eq!(
            p.i32_or("tasks.MergedSource.params.baduvw_maxcycles", 0)
                .unwrap(),
            -1
        );
        assert!(!p.is_defined("missing"));
    }

    #[test]
    fn parse_vectors() {
        let p = Parset::from_str(
            "antennas = [ant1, ant2, ant3]\n\
             antenna.ant1.location.itrf = [-2556084.669, 5097398.337, -2848424.133]\n\
             service_ranks = []\n",
        )
        .unwrap();
        assert_eq!(p.string_vector("antennas").unwrap().len(), 3);
        let itrf = p.f64_vector("antenna.ant1.location.itrf").unwrap();
        assert_eq!(itrf.len(), 3);
        assert!((itrf[1] - 5097398.337).abs() < 1e-6);
        assert!(p.u32_vector_or_empty("service_ranks").unwrap().is_empty());
    }

    #[test]
    fn subset_strips_prefix() {
        let p = Parset::from_str(
            "baselinemap.name = standard\n\
             baselinemap.antennaidx = [ak02, ak04]\n\
             correlator.modes = [standard]\n",
        )
        .unwrap();
        let sub = p.subset("baselinemap.");
        assert_eq!(sub.get_string("name"), Some("standard"));
        assert!(sub.is_defined("antennaidx"));
        assert!(!sub.is_defined("correlator.modes"));
    }

    #[test]
    fn malformed_line_rejected() {
        assert!(Parset::from_str("no equals sign here").is_err());
    }

    #[test]
    fn bad_value_reported_with_key() {
        let p = Parset::from_str("sbid = notanumber").unwrap();
        match p.u32("sbid") {
            Err(ParsetError::BadValue { key, .. }) => assert_eq!(key, "sbid"),
            other => panic!("expected BadValue, got {other:?}"),
        }
    }
}
