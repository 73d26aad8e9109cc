// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use ndarray::Array2;

use crate::config::ConfigError;
use crate::parset::Parset;

/// Static beam (feed) offsets from the `feeds.` parset section.
///
/// Offsets are tangent-plane angles in radians; `feeds.spacing` scales the
/// raw grid positions when present.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    offsets: Vec<[f64; 2]>,
}

impl FeedConfig {
    pub fn from_parset(parset: &Parset) -> Result<FeedConfig, ConfigError> {
        let n_feeds = parset.u32("n_feeds")? as usize;
        let spacing = parset.f64_or("spacing", 1.0)?;
        let mut offsets = Vec::with_capacity(n_feeds);
        for feed in 0..n_feeds {
            let key = format!("feed{feed}");
            let raw = parset.f64_vector(&key).map_err(|_| {
                ConfigError::BadFeedConfig(format!("feeds.{key} is missing or malformed"))
            })?;
            if raw.len() != 2 {
                return Err(ConfigError::BadFeedConfig(format!(
                    "feeds.{key} must have exactly two elements"
                )));
            }
            offsets.push([raw[0] * spacing, raw[1] * spacing]);
        }
        if offsets.is_empty() {
            return Err(ConfigError::BadFeedConfig(
                "feeds.n_feeds must be positive".to_string(),
            ));
        }
        Ok(FeedConfig { offsets })
    }

    pub fn n_feeds(&self) -> usize {
        self.offsets.len()
    }

    pub fn offset(&self, feed: usize) -> [f64; 2] {
        self.offsets[feed]
    }

    /// The `(2, n_beam)` matrix the chunk data model carries.
    pub fn fill_matrix(&self) -> Array2<f64> {
        let mut m = Array2::zeros((2, self.offsets.len()));
        for (i, off) in self.offsets.iter().enumerate() {
            m[(0, i)] = off[0];
            m[(1, i)] = off[1];
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn grid_with_spacing() {
        let parset = Parset::from_str(
            "n_feeds = 4\n\
             spacing = 0.015708\n\
             feed0 = [-0.5, -0.5]\n\
             feed1 = [0.5, -0.5]\n\
             feed2 = [-0.5, 0.5]\n\
             feed3 = [0.5, 0.5]\n",
        )
        .unwrap();
        let feeds = FeedConfig::from_parset(&parset).unwrap();
        assert_eq!(feeds.n_feeds(), 4);
        assert_abs_diff_eq!(feeds.offset(1)[0], 0.007854, epsilon = 1e-9);
        let m = feeds.fill_matrix();
        assert_eq!(m.dim(), (2, 4));
        assert_abs_diff_eq!(m[(1, 2)], 0.007854, epsilon = 1e-9);
    }

    #[test]
    fn missing_feed_entry_is_fatal() {
        let parset = Parset::from_str("n_feeds = 2\nfeed0 = [0, 0]\n").unwrap();
        assert!(FeedConfig::from_parset(&parset).is_err());
    }
}
