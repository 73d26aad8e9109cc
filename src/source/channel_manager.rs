// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-rank frequency axis bookkeeping.
//!
//! The correlator splits the band into equal channel blocks, one per
//! receiving rank. Given the frequency of the first channel of the whole
//! band, each rank derives its own contiguous axis from its receiver id.

#[derive(Clone, Debug, Default)]
pub struct ChannelManager;

impl ChannelManager {
    pub fn new() -> ChannelManager {
        ChannelManager
    }

    /// The local frequency axis of a receiving rank \[Hz\]. `start_freq_hz`
    /// is the centre of the first channel of the whole band;
    /// `chan_width_hz` may be negative for inverted spectra.
    pub fn local_frequencies(
        &self,
        receiver_id: i32,
        start_freq_hz: f64,
        chan_width_hz: f64,
        n_chan: usize,
    ) -> Vec<f64> {
        debug_assert!(receiver_id >= 0);
        let first = receiver_id as usize * n_chan;
        (0..n_chan)
            .map(|i| start_freq_hz + (first + i) as f64 * chan_width_hz)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn ranks_cover_adjacent_blocks() {
        let cm = ChannelManager::new();
        let width = 18_518.518;
        let f0 = cm.local_frequencies(0, 1.2e9, width, 216);
        let f1 = cm.local_frequencies(1, 1.2e9, width, 216);
        assert_eq!(f0.len(), 216);
        assert_abs_diff_eq!(f0[0], 1.2e9);
        // Rank 1 starts exactly one channel above rank 0's last channel.
        assert_abs_diff_eq!(f1[0] - f0[215], width, epsilon = 1e-6);
    }

    #[test]
    fn negative_width_descends() {
        let cm = ChannelManager::new();
        let f = cm.local_frequencies(0, 1.4e9, -1e6, 4);
        assert!(f[3] < f[0]);
        assert_abs_diff_eq!(f[0] - f[3], 3e6);
    }
}
